//! Source documents: the raw `{flags, metadata, $evaluators}` files that
//! producers turn into a full-replacement batch for the store.
//!
//! ```json
//! {
//!   "metadata": { "flagSetId": "checkout" },
//!   "$evaluators": { "emailWithFaas": { "ends_with": [{ "var": "email" }, "@faas.com"] } },
//!   "flags": {
//!     "new-welcome": {
//!       "state": "ENABLED",
//!       "variants": { "on": true, "off": false },
//!       "defaultVariant": "off",
//!       "targeting": { "if": [{ "$ref": "emailWithFaas" }, "on", null] }
//!     }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::error::DocumentError;
use crate::store::FlagMap;
use crate::types::{Flag, Metadata, FLAG_SET_ID_KEY};

/// `$ref` chains deeper than this are treated as cycles.
const MAX_REF_DEPTH: usize = 32;

/// On-disk encoding of a source document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Json,
    Yaml,
}

impl DocumentFormat {
    /// `.yaml` / `.yml` are YAML; everything else is read as JSON.
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("yaml") | Some("yml") => DocumentFormat::Yaml,
            _ => DocumentFormat::Json,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    #[serde(default)]
    flags: BTreeMap<String, Flag>,
    #[serde(default)]
    metadata: Metadata,
    #[serde(default, rename = "$evaluators")]
    evaluators: BTreeMap<String, Value>,
}

/// A parsed, validated source document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlagDocument {
    pub flags: FlagMap,
    pub metadata: Metadata,
}

impl FlagDocument {
    pub fn parse(content: &str, format: DocumentFormat) -> Result<Self, DocumentError> {
        let raw: RawDocument = match format {
            DocumentFormat::Json => serde_json::from_str(content)?,
            DocumentFormat::Yaml => serde_yaml::from_str(content)?,
        };
        raw.into_document()
    }

    pub fn parse_json(content: &str) -> Result<Self, DocumentError> {
        Self::parse(content, DocumentFormat::Json)
    }
}

impl RawDocument {
    fn into_document(self) -> Result<FlagDocument, DocumentError> {
        let inherited_flag_set = self.metadata.get(FLAG_SET_ID_KEY).cloned();

        let mut flags = FlagMap::new();
        for (key, mut flag) in self.flags {
            validate(&key, &flag)?;

            if let Some(targeting) = flag.targeting.take() {
                let resolved = resolve_refs(&key, targeting, &self.evaluators, 0)?;
                flag.targeting = match resolved {
                    Value::Object(ref map) if map.is_empty() => None,
                    Value::Null => None,
                    other => Some(other),
                };
            }

            if let Some(flag_set) = &inherited_flag_set {
                flag.metadata
                    .entry(FLAG_SET_ID_KEY.to_string())
                    .or_insert_with(|| flag_set.clone());
            }
            flags.insert(key, flag);
        }

        Ok(FlagDocument {
            flags,
            metadata: self.metadata,
        })
    }
}

fn validate(key: &str, flag: &Flag) -> Result<(), DocumentError> {
    let invalid = |reason: String| DocumentError::InvalidFlag {
        flag: key.to_string(),
        reason,
    };
    if flag.variants.is_empty() {
        return Err(invalid("no variants defined".to_string()));
    }
    if !flag.variants.contains_key(&flag.default_variant) {
        return Err(invalid(format!(
            "default variant '{}' is not one of its variants",
            flag.default_variant
        )));
    }
    if flag.variant_kind().is_none() {
        return Err(invalid("variants must all share one type".to_string()));
    }
    Ok(())
}

/// Replace every `{"$ref": "<name>"}` object with the named evaluator.
///
/// `depth` counts followed references only.
fn resolve_refs(
    flag: &str,
    value: Value,
    evaluators: &BTreeMap<String, Value>,
    depth: usize,
) -> Result<Value, DocumentError> {
    if depth > MAX_REF_DEPTH {
        return Err(DocumentError::EvaluatorDepth {
            flag: flag.to_string(),
        });
    }
    match value {
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(Value::String(name)) = map.get("$ref") {
                    let target = evaluators.get(name).cloned().ok_or_else(|| {
                        DocumentError::UnknownEvaluator {
                            flag: flag.to_string(),
                            name: name.clone(),
                        }
                    })?;
                    return resolve_refs(flag, target, evaluators, depth + 1);
                }
            }
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k, resolve_refs(flag, v, evaluators, depth)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => items
            .into_iter()
            .map(|v| resolve_refs(flag, v, evaluators, depth))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VariantValue;
    use serde_json::json;

    #[test]
    fn refs_are_substituted_from_evaluators() {
        let doc = FlagDocument::parse_json(
            r#"{
              "$evaluators": {"isFaas": {"ends_with": [{"var": "email"}, "@faas.com"]}},
              "flags": {
                "new-welcome": {
                  "state": "ENABLED",
                  "variants": {"on": true, "off": false},
                  "defaultVariant": "off",
                  "targeting": {"if": [{"$ref": "isFaas"}, "on", null]}
                }
              }
            }"#,
        )
        .expect("parse");
        assert_eq!(
            doc.flags["new-welcome"].targeting,
            Some(json!({"if": [{"ends_with": [{"var": "email"}, "@faas.com"]}, "on", null]}))
        );
    }

    #[test]
    fn unknown_ref_is_an_error() {
        let err = FlagDocument::parse_json(
            r#"{"flags": {"f": {"state": "ENABLED", "variants": {"a": 1}, "defaultVariant": "a",
                "targeting": {"$ref": "missing"}}}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, DocumentError::UnknownEvaluator { ref name, .. } if name == "missing"));
    }

    #[test]
    fn self_referencing_evaluator_is_bounded() {
        let err = FlagDocument::parse_json(
            r#"{"$evaluators": {"loop": {"$ref": "loop"}},
                "flags": {"f": {"state": "ENABLED", "variants": {"a": 1}, "defaultVariant": "a",
                "targeting": {"$ref": "loop"}}}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, DocumentError::EvaluatorDepth { .. }));
    }

    #[test]
    fn empty_targeting_is_dropped() {
        let doc = FlagDocument::parse_json(
            r#"{"flags": {"f": {"state": "ENABLED", "variants": {"a": "x"}, "defaultVariant": "a",
                "targeting": {}}}}"#,
        )
        .expect("parse");
        assert!(doc.flags["f"].targeting.is_none());
    }

    #[test]
    fn document_flag_set_is_inherited_unless_overridden() {
        let doc = FlagDocument::parse_json(
            r#"{"metadata": {"flagSetId": "checkout", "version": "1"},
                "flags": {
                  "a": {"state": "ENABLED", "variants": {"on": true}, "defaultVariant": "on"},
                  "b": {"state": "ENABLED", "variants": {"on": true}, "defaultVariant": "on",
                        "metadata": {"flagSetId": "billing"}}
                }}"#,
        )
        .expect("parse");
        assert_eq!(doc.flags["a"].metadata[FLAG_SET_ID_KEY], json!("checkout"));
        assert_eq!(doc.flags["b"].metadata[FLAG_SET_ID_KEY], json!("billing"));
        assert_eq!(doc.metadata["version"], json!("1"));
    }

    #[test]
    fn default_variant_must_exist() {
        let err = FlagDocument::parse_json(
            r#"{"flags": {"f": {"state": "ENABLED", "variants": {"on": true}, "defaultVariant": "off"}}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, DocumentError::InvalidFlag { .. }));
    }

    #[test]
    fn mixed_variant_types_are_rejected() {
        let err = FlagDocument::parse_json(
            r#"{"flags": {"f": {"state": "ENABLED", "variants": {"on": true, "n": 2}, "defaultVariant": "on"}}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, DocumentError::InvalidFlag { .. }));
    }

    #[test]
    fn yaml_documents_parse() {
        let doc = FlagDocument::parse(
            "flags:\n  color:\n    state: ENABLED\n    defaultVariant: red\n    variants:\n      red: \"#CC0000\"\n      blue: \"#0000CC\"\n",
            DocumentFormat::Yaml,
        )
        .expect("parse yaml");
        assert_eq!(doc.flags["color"].variants["red"], VariantValue::from("#CC0000"));
    }

    #[test]
    fn format_follows_extension() {
        assert_eq!(DocumentFormat::from_path(Path::new("a/flags.yaml")), DocumentFormat::Yaml);
        assert_eq!(DocumentFormat::from_path(Path::new("a/flags.YML")), DocumentFormat::Yaml);
        assert_eq!(DocumentFormat::from_path(Path::new("a/flags.json")), DocumentFormat::Json);
        assert_eq!(DocumentFormat::from_path(Path::new("a/flags")), DocumentFormat::Json);
    }
}
