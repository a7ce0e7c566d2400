//! Error types for flagplane-sync.

use thiserror::Error;

/// All errors that can arise from multiplexer operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Snapshot requested for a source that is not in the configured list.
    #[error("no flag watcher setup for source {0}")]
    UnknownSource(String),

    /// A snapshot could not be serialized; caches were left untouched.
    #[error("snapshot serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
