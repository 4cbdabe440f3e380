//! Generation parameters read out of a request graph
//! (`{node_id: {"class_type": ..., "inputs": {...}}}`).

use serde_json::{Number, Value};

use crate::db::Metadata;

const CHECKPOINT_LOADERS: &[&str] = &["CheckpointLoader", "CheckpointLoaderSimple", "Checkpoint Loader"];
const SAMPLERS: &[&str] = &["KSampler", "KSamplerAdvanced"];

pub fn extract_generation_params(request: &Value) -> Metadata {
    let mut params = Metadata::new();
    let Some(nodes) = request.as_object() else {
        return params;
    };

    for node in nodes.values() {
        let Some(class_type) = node.get("class_type").and_then(Value::as_str) else {
            continue;
        };
        let Some(inputs) = node.get("inputs").and_then(Value::as_object) else {
            continue;
        };

        if CHECKPOINT_LOADERS.contains(&class_type) {
            set_string(&mut params, "model", inputs.get("ckpt_name"));
        } else if SAMPLERS.contains(&class_type) {
            match inputs.get("seed") {
                Some(Value::Number(seed)) => {
                    params.insert("seed".into(), Value::Number(seed.clone()));
                }
                Some(Value::String(seed)) if !seed.is_empty() => {
                    params.insert("seed".into(), Value::String(seed.clone()));
                }
                _ => {}
            }
            set_number(&mut params, "steps", inputs.get("steps"));
            set_number(&mut params, "cfg", inputs.get("cfg"));
            set_string(&mut params, "sampler", inputs.get("sampler_name"));
            set_string(&mut params, "scheduler", inputs.get("scheduler"));
            if let Some(denoise) = inputs.get("denoise").and_then(number) {
                if denoise.as_f64() != Some(1.0) {
                    params.insert("denoise".into(), Value::Number(denoise.clone()));
                }
            }
        } else if class_type == "EmptyLatentImage" {
            set_number(&mut params, "width", inputs.get("width"));
            set_number(&mut params, "height", inputs.get("height"));
            set_number(&mut params, "batch_size", inputs.get("batch_size"));
        }
    }

    params
}

fn number(value: &Value) -> Option<&Number> {
    match value {
        Value::Number(n) => Some(n),
        _ => None,
    }
}

fn set_number(params: &mut Metadata, key: &str, value: Option<&Value>) {
    if let Some(n) = value.and_then(number) {
        params.insert(key.to_string(), Value::Number(n.clone()));
    }
}

fn set_string(params: &mut Metadata, key: &str, value: Option<&Value>) {
    if let Some(text) = value.and_then(Value::as_str).filter(|text| !text.is_empty()) {
        params.insert(key.to_string(), Value::String(text.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_common_sampler_settings() {
        let request = json!({
            "4": {"class_type": "CheckpointLoaderSimple", "inputs": {"ckpt_name": "sdxl.safetensors"}},
            "3": {"class_type": "KSampler", "inputs": {
                "seed": 42, "steps": 30, "cfg": 7.0,
                "sampler_name": "euler", "scheduler": "normal", "denoise": 1.0,
                "model": ["4", 0]
            }},
            "5": {"class_type": "EmptyLatentImage", "inputs": {"width": 1024, "height": 768, "batch_size": 1}}
        });

        let params = extract_generation_params(&request);
        assert_eq!(params["model"], json!("sdxl.safetensors"));
        assert_eq!(params["seed"], json!(42));
        assert_eq!(params["steps"], json!(30));
        assert_eq!(params["sampler"], json!("euler"));
        assert_eq!(params["width"], json!(1024));
        assert!(!params.contains_key("denoise"));
    }

    #[test]
    fn partial_denoise_is_kept() {
        let request = json!({
            "1": {"class_type": "KSamplerAdvanced", "inputs": {"denoise": 0.6, "steps": ["7", 0]}}
        });

        let params = extract_generation_params(&request);
        assert_eq!(params["denoise"], json!(0.6));
        assert!(!params.contains_key("steps"));
    }

    #[test]
    fn non_graph_requests_yield_nothing() {
        assert!(extract_generation_params(&json!([1, 2])).is_empty());
        assert!(extract_generation_params(&json!({"1": "node"})).is_empty());
    }
}
