use std::collections::HashSet;

use serde_json::Value;

use crate::db::OutputRecord;

/// Node type whose runs are recorded into history.
pub const RECORDER_CLASS_TYPE: &str = "PromptHistoryInput";
/// Input carrying the recorded prompt text on a recorder node.
pub const RECORDER_TEXT_INPUT: &str = "prompt";

const OUTPUT_KEYS: &[&str] = &["images", "files"];

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::log_debug;

/// Files listed under `outputs.<node>.images` / `outputs.<node>.files`,
/// without duplicates. Malformed sections are skipped.
pub fn extract_outputs(result: &Value) -> Vec<OutputRecord> {
    let Some(outputs) = result.get("outputs").and_then(Value::as_object) else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    let mut collected = Vec::new();
    for (node_id, node_outputs) in outputs {
        for key in OUTPUT_KEYS {
            let Some(items) = node_outputs.get(*key).and_then(Value::as_array) else {
                continue;
            };
            for item in items {
                match OutputRecord::from_payload(item) {
                    Ok(record) => {
                        if seen.insert(record.clone()) {
                            collected.push(record);
                        }
                    }
                    Err(reason) => {
                        log_debug!("skipping {key} item from node {node_id}: {reason}");
                    }
                }
            }
        }
    }
    collected
}

/// When a saved output exists, preview outputs are dropped.
pub fn prefer_saved_outputs(records: Vec<OutputRecord>) -> Vec<OutputRecord> {
    if !records.iter().any(OutputRecord::is_saved) {
        return records;
    }
    records
        .into_iter()
        .filter(|record| !record.is_preview())
        .collect()
}

/// Prompt texts typed into recorder nodes of a request graph.
pub fn extract_prompt_texts(request: &Value) -> Vec<String> {
    let Some(nodes) = request.as_object() else {
        return Vec::new();
    };
    nodes
        .values()
        .filter(|node| {
            node.get("class_type").and_then(Value::as_str) == Some(RECORDER_CLASS_TYPE)
        })
        .filter_map(|node| {
            node.get("inputs")?
                .get(RECORDER_TEXT_INPUT)?
                .as_str()
                .filter(|text| !text.is_empty())
                .map(str::to_string)
        })
        .collect()
}

/// The request graph stored alongside a history item (`prompt[2]`).
pub fn request_payload(history_item: &Value) -> Option<&Value> {
    history_item
        .get("prompt")
        .and_then(Value::as_array)
        .and_then(|prompt| prompt.get(2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn collects_images_and_files_across_nodes() {
        let result = json!({
            "outputs": {
                "9": {"images": [
                    {"filename": "a.png", "subfolder": "", "type": "output"},
                    {"filename": "a.png", "subfolder": "", "type": "output"}
                ]},
                "12": {"files": ["clip.mp4", {"subfolder": "x"}], "text": ["ignored"]},
                "13": "not an object"
            }
        });

        let outputs = extract_outputs(&result);
        assert_eq!(
            outputs,
            vec![
                OutputRecord::new("clip.mp4", "", ""),
                OutputRecord::new("a.png", "", "output"),
            ]
        );
    }

    #[test]
    fn missing_outputs_section_is_empty() {
        assert!(extract_outputs(&json!({})).is_empty());
        assert!(extract_outputs(&json!({"outputs": []})).is_empty());
    }

    #[test]
    fn previews_dropped_only_when_saved_output_exists() {
        let mixed = vec![
            OutputRecord::new("x.png", "", "output"),
            OutputRecord::new("y.png", "", "temp"),
        ];
        assert_eq!(
            prefer_saved_outputs(mixed),
            vec![OutputRecord::new("x.png", "", "output")]
        );

        let previews_only = vec![OutputRecord::new("y.png", "", "temp")];
        assert_eq!(prefer_saved_outputs(previews_only.clone()), previews_only);
    }

    #[test]
    fn prompt_texts_come_from_recorder_nodes_only() {
        let request = json!({
            "1": {"class_type": "PromptHistoryInput", "inputs": {"prompt": "a cat"}},
            "2": {"class_type": "CLIPTextEncode", "inputs": {"text": "a dog"}},
            "3": {"class_type": "PromptHistoryInput", "inputs": {"prompt": ""}},
            "4": {"class_type": "PromptHistoryInput", "inputs": {"prompt": ["5", 0]}}
        });
        assert_eq!(extract_prompt_texts(&request), vec!["a cat"]);
    }

    #[test]
    fn request_payload_is_third_prompt_element() {
        let item = json!({"prompt": [3, "job-1", {"1": {}}, {}, ["9"]]});
        assert_eq!(request_payload(&item), Some(&json!({"1": {}})));
        assert_eq!(request_payload(&json!({"prompt": [3, "job-1"]})), None);
    }
}
