//! Domain types shared by the store, the multiplexer and the daemon.
//!
//! A [`Flag`] is serialized exactly as it appears in snapshots handed to
//! subscribers. `key` and `flag_set_id` are bookkeeping assigned by the
//! store and never serialized.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Flag-set scope for flags that carry no explicit `flagSetId`.
pub const SENTINEL_FLAG_SET: &str = "placeholder";

/// Metadata key that places a flag into an explicit flag-set.
pub const FLAG_SET_ID_KEY: &str = "flagSetId";

/// Free-form metadata attached to a flag or to a whole source.
pub type Metadata = BTreeMap<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Identity of a sync subscriber registered with the multiplexer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub String);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for SubscriptionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SubscriptionId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Variants
// ---------------------------------------------------------------------------

/// The kind of a variant value. All variants of one flag share a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariantKind {
    Boolean,
    Number,
    String,
    Object,
}

impl fmt::Display for VariantKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariantKind::Boolean => write!(f, "boolean"),
            VariantKind::Number => write!(f, "number"),
            VariantKind::String => write!(f, "string"),
            VariantKind::Object => write!(f, "object"),
        }
    }
}

impl std::str::FromStr for VariantKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "boolean" | "bool" => Ok(VariantKind::Boolean),
            "number" | "int" | "float" => Ok(VariantKind::Number),
            "string" => Ok(VariantKind::String),
            "object" => Ok(VariantKind::Object),
            other => Err(format!(
                "unknown variant kind '{other}' (expected boolean, number, string or object)"
            )),
        }
    }
}

/// A single variant value.
///
/// Untagged on the wire, so `{"on": true, "off": false}` deserializes into
/// two `Bool` values. Numbers keep their original representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VariantValue {
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Object(serde_json::Map<String, serde_json::Value>),
}

impl VariantValue {
    pub fn kind(&self) -> VariantKind {
        match self {
            VariantValue::Bool(_) => VariantKind::Boolean,
            VariantValue::Number(_) => VariantKind::Number,
            VariantValue::String(_) => VariantKind::String,
            VariantValue::Object(_) => VariantKind::Object,
        }
    }

}

impl From<bool> for VariantValue {
    fn from(b: bool) -> Self {
        VariantValue::Bool(b)
    }
}

impl From<&str> for VariantValue {
    fn from(s: &str) -> Self {
        VariantValue::String(s.to_owned())
    }
}

impl From<String> for VariantValue {
    fn from(s: String) -> Self {
        VariantValue::String(s)
    }
}

impl From<i64> for VariantValue {
    fn from(n: i64) -> Self {
        VariantValue::Number(n.into())
    }
}

// ---------------------------------------------------------------------------
// Flag
// ---------------------------------------------------------------------------

/// One evaluable configuration unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flag {
    /// Unique within a flag-set. Assigned by the store from the batch key.
    #[serde(skip)]
    pub key: String,
    /// Owning scope. Derived from `metadata.flagSetId` on write.
    #[serde(skip)]
    pub flag_set_id: String,
    pub state: String,
    pub default_variant: String,
    pub variants: BTreeMap<String, VariantValue>,
    /// Opaque rule payload for the external evaluator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targeting: Option<serde_json::Value>,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub selector: String,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl Flag {
    /// Shorthand for a flag with only state, variants and a default variant.
    pub fn new(
        state: impl Into<String>,
        default_variant: impl Into<String>,
        variants: impl IntoIterator<Item = (String, VariantValue)>,
    ) -> Self {
        Self {
            key: String::new(),
            flag_set_id: String::new(),
            state: state.into(),
            default_variant: default_variant.into(),
            variants: variants.into_iter().collect(),
            targeting: None,
            source: String::new(),
            selector: String::new(),
            metadata: Metadata::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.state.eq_ignore_ascii_case("ENABLED")
    }

    /// Kind shared by every variant, or `None` for an empty or mixed set.
    pub fn variant_kind(&self) -> Option<VariantKind> {
        let mut kinds = self.variants.values().map(VariantValue::kind);
        let first = kinds.next()?;
        kinds.all(|k| k == first).then_some(first)
    }

    /// Flag-set this flag belongs to according to its own metadata.
    ///
    /// A `flagSetId` that is present but not a string is rejected.
    pub fn flag_set_from_metadata(&self) -> Result<String, StoreError> {
        match self.metadata.get(FLAG_SET_ID_KEY) {
            None | Some(serde_json::Value::Null) => Ok(SENTINEL_FLAG_SET.to_owned()),
            Some(serde_json::Value::String(s)) if s.is_empty() => {
                Ok(SENTINEL_FLAG_SET.to_owned())
            }
            Some(serde_json::Value::String(s)) => Ok(s.clone()),
            Some(_) => Err(StoreError::InvalidFlagSetId {
                key: self.key.clone(),
            }),
        }
    }

    /// Has the observable content of this flag changed relative to `other`?
    ///
    /// Every field takes part, `source` and `selector` included: a flag that
    /// moves to another source with identical content still counts as changed.
    pub fn content_changed(&self, other: &Flag) -> bool {
        self != other
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Kind of change observed for one flag key during an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationType {
    Create,
    Update,
    Delete,
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationType::Create => write!(f, "create"),
            NotificationType::Update => write!(f, "update"),
            NotificationType::Delete => write!(f, "delete"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub source: String,
}

/// Changes produced by one update, keyed by flag key.
pub type Notifications = BTreeMap<String, Notification>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
