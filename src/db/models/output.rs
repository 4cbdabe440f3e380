//! Generated-file references attached to history entries.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const KIND_OUTPUT: &str = "output";
pub const KIND_TEMP: &str = "temp";
pub const KIND_INPUT: &str = "input";

/// A generated file linked to an entry. Identity within an entry is the
/// `(filename, subfolder, kind)` tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputRecord {
    pub filename: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subfolder: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
}

/// Why a host output payload was dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OutputRejection {
    #[error("output payload must be a filename string or an object")]
    UnsupportedShape,
    #[error("output payload has no filename")]
    MissingFilename,
    #[error("output filename is empty")]
    EmptyFilename,
    #[error("output field `{0}` is not a string")]
    NonStringField(&'static str),
}

impl OutputRecord {
    pub fn new(
        filename: impl Into<String>,
        subfolder: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            filename: filename.into(),
            subfolder: subfolder.into(),
            kind: kind.into(),
        }
    }

    /// Parse one host payload: a bare filename string, or an object with
    /// `filename` and optional `subfolder` and `type` (alias `kind`).
    pub fn from_payload(payload: &Value) -> Result<Self, OutputRejection> {
        match payload {
            Value::String(name) => {
                let filename = name.trim();
                if filename.is_empty() {
                    return Err(OutputRejection::EmptyFilename);
                }
                Ok(Self::new(filename, "", ""))
            }
            Value::Object(fields) => {
                let filename = string_field(fields, "filename")?
                    .ok_or(OutputRejection::MissingFilename)?;
                if filename.is_empty() {
                    return Err(OutputRejection::EmptyFilename);
                }
                let subfolder = string_field(fields, "subfolder")?.unwrap_or_default();
                let kind = match string_field(fields, "type")? {
                    Some(kind) if !kind.is_empty() => kind,
                    _ => string_field(fields, "kind")?.unwrap_or_default(),
                };
                Ok(Self::new(filename, subfolder, kind))
            }
            _ => Err(OutputRejection::UnsupportedShape),
        }
    }

    pub fn is_saved(&self) -> bool {
        self.kind == KIND_OUTPUT
    }

    pub fn is_preview(&self) -> bool {
        self.kind == KIND_TEMP
    }
}

fn string_field(
    fields: &Map<String, Value>,
    key: &'static str,
) -> Result<Option<String>, OutputRejection> {
    match fields.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.trim().to_string())),
        Some(_) => Err(OutputRejection::NonStringField(key)),
    }
}

/// Parse every payload, dropping the ones that do not describe a file.
pub fn normalize_outputs(payloads: &[Value]) -> Vec<OutputRecord> {
    payloads
        .iter()
        .filter_map(|payload| match OutputRecord::from_payload(payload) {
            Ok(record) => Some(record),
            Err(reason) => {
                log::debug!("dropping output payload {payload}: {reason}");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bare_string_is_a_filename() {
        let record = OutputRecord::from_payload(&json!("  cat.png ")).unwrap();
        assert_eq!(record, OutputRecord::new("cat.png", "", ""));
    }

    #[test]
    fn object_fields_are_read() {
        let record = OutputRecord::from_payload(&json!({
            "filename": "cat.png",
            "subfolder": "animals",
            "type": "output"
        }))
        .unwrap();
        assert_eq!(record, OutputRecord::new("cat.png", "animals", "output"));
        assert!(record.is_saved());
    }

    #[test]
    fn kind_is_an_alias_for_type() {
        let record = OutputRecord::from_payload(&json!({
            "filename": "preview.png",
            "subfolder": null,
            "kind": "temp"
        }))
        .unwrap();
        assert_eq!(record.kind, "temp");
        assert!(record.is_preview());
    }

    #[test]
    fn rejections_carry_a_reason() {
        assert_eq!(
            OutputRecord::from_payload(&json!("   ")),
            Err(OutputRejection::EmptyFilename)
        );
        assert_eq!(
            OutputRecord::from_payload(&json!({"subfolder": "x"})),
            Err(OutputRejection::MissingFilename)
        );
        assert_eq!(
            OutputRecord::from_payload(&json!({"filename": 12})),
            Err(OutputRejection::NonStringField("filename"))
        );
        assert_eq!(
            OutputRecord::from_payload(&json!(["a.png"])),
            Err(OutputRejection::UnsupportedShape)
        );
    }

    #[test]
    fn normalize_keeps_only_valid_payloads() {
        let records = normalize_outputs(&[
            json!("a.png"),
            json!(null),
            json!({"filename": ""}),
            json!({"filename": "b.png", "type": "temp"}),
        ]);
        assert_eq!(
            records,
            vec![
                OutputRecord::new("a.png", "", ""),
                OutputRecord::new("b.png", "", "temp"),
            ]
        );
    }

    #[test]
    fn empty_fields_are_omitted_when_serialized() {
        let value = serde_json::to_value(OutputRecord::new("a.png", "", "output")).unwrap();
        assert_eq!(value, json!({"filename": "a.png", "type": "output"}));
    }
}
