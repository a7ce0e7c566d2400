//! Default-variant resolution.
//!
//! Targeting rules belong to an external evaluator; this module answers
//! point reads with the flag's default variant and type-checks the result.

use serde::Serialize;

use crate::error::ResolveError;
use crate::store::FlagStore;
use crate::types::{Flag, VariantKind, VariantValue, SENTINEL_FLAG_SET};

/// Why a value was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reason {
    /// No targeting defined; the default variant is the only answer.
    Static,
    /// Targeting exists but was not evaluated here.
    Default,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    pub key: String,
    pub value: VariantValue,
    pub variant: String,
    pub reason: Reason,
}

/// Resolve `flag` to its default variant, optionally checking its kind.
pub fn resolve(flag: &Flag, expected: Option<VariantKind>) -> Result<Resolution, ResolveError> {
    if !flag.is_enabled() {
        return Err(ResolveError::Disabled(flag.key.clone()));
    }
    let value = flag
        .variants
        .get(&flag.default_variant)
        .cloned()
        .ok_or_else(|| ResolveError::MissingVariant {
            key: flag.key.clone(),
            variant: flag.default_variant.clone(),
        })?;

    if let Some(expected) = expected {
        let actual = value.kind();
        if actual != expected {
            return Err(ResolveError::TypeMismatch {
                key: flag.key.clone(),
                expected,
                actual,
            });
        }
    }

    let reason = if flag.targeting.is_some() {
        Reason::Default
    } else {
        Reason::Static
    };
    Ok(Resolution {
        key: flag.key.clone(),
        value,
        variant: flag.default_variant.clone(),
        reason,
    })
}

/// Look up `key` (in `flag_set`, or the sentinel scope) and resolve it.
pub fn resolve_from(
    store: &dyn FlagStore,
    key: &str,
    flag_set: Option<&str>,
    expected: Option<VariantKind>,
) -> Result<Resolution, ResolveError> {
    let flag = match flag_set {
        Some(set) if set != SENTINEL_FLAG_SET => store.get_for_flag_set(key, set),
        _ => store.get(key),
    }
    .ok_or_else(|| ResolveError::FlagNotFound(key.to_string()))?;
    resolve(&flag, expected)
}
