//! Error types for flagplane-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::VariantKind;

/// Errors from the reconciling store update.
///
/// A batch that produces one of these is rejected before any write.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A flag in the batch is structurally unusable (e.g. empty key).
    #[error("invalid flag '{key}': {reason}")]
    InvalidFlag { key: String, reason: String },

    /// `metadata.flagSetId` is present but is not a string.
    #[error("flag '{key}' has a non-string flagSetId")]
    InvalidFlagSetId { key: String },
}

/// Errors while parsing a source document into a flag batch.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A `$ref` in targeting names an evaluator the document does not define.
    #[error("flag '{flag}' references unknown evaluator '{name}'")]
    UnknownEvaluator { flag: String, name: String },

    /// `$ref` substitution nested deeper than the allowed bound (likely a cycle).
    #[error("flag '{flag}': evaluator references nest too deeply")]
    EvaluatorDepth { flag: String },

    #[error("invalid flag '{flag}': {reason}")]
    InvalidFlag { flag: String, reason: String },
}

/// Errors from default-variant resolution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("flag '{0}' not found")]
    FlagNotFound(String),

    #[error("flag '{0}' is disabled")]
    Disabled(String),

    #[error("flag '{key}' is of type {actual}, not {expected}")]
    TypeMismatch {
        key: String,
        expected: VariantKind,
        actual: VariantKind,
    },

    #[error("flag '{key}' has no variant named '{variant}'")]
    MissingVariant { key: String, variant: String },
}

impl ResolveError {
    /// Stable error code advertised to clients.
    pub fn code(&self) -> &'static str {
        match self {
            ResolveError::FlagNotFound(_) => "FLAG_NOT_FOUND",
            ResolveError::Disabled(_) => "FLAG_DISABLED",
            ResolveError::TypeMismatch { .. } => "TYPE_MISMATCH",
            ResolveError::MissingVariant { .. } => "GENERAL",
        }
    }
}

/// Errors loading the daemon configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// YAML parse error on load, with the offending path.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("source '{0}' is configured more than once")]
    DuplicateSource(String),
}
