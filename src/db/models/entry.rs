//! History entry model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::OutputRecord;

/// Open, string-keyed metadata map. Keys are kept sorted, so serialization
/// does not depend on insertion order.
pub type Metadata = serde_json::Map<String, Value>;

/// One deduplicated prompt with the files generated from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub prompt: String,
    pub metadata: Metadata,
    #[serde(default)]
    pub files: Vec<OutputRecord>,
}

/// Accept an object, or a list of `[key, value]` pairs; anything else is empty.
pub fn normalize_metadata(raw: Value) -> Metadata {
    match raw {
        Value::Object(map) => map,
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::Array(pair) if pair.len() == 2 => {
                    let mut pair = pair.into_iter();
                    match (pair.next(), pair.next()) {
                        (Some(Value::String(key)), Some(value)) => Some((key, value)),
                        _ => None,
                    }
                }
                _ => None,
            })
            .collect(),
        _ => Metadata::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn objects_pass_through() {
        let metadata = normalize_metadata(json!({"seed": 1}));
        assert_eq!(metadata["seed"], json!(1));
    }

    #[test]
    fn pair_lists_become_maps() {
        let metadata = normalize_metadata(json!([["seed", 7], ["bad"], [3, "x"], ["cfg", 6.5]]));
        assert_eq!(metadata.len(), 2);
        assert_eq!(metadata["seed"], json!(7));
        assert_eq!(metadata["cfg"], json!(6.5));
    }

    #[test]
    fn other_shapes_are_empty() {
        assert!(normalize_metadata(json!("text")).is_empty());
        assert!(normalize_metadata(Value::Null).is_empty());
    }
}
