//! Links a finished job to its history entries and stores what it produced.

pub mod extract;
pub mod params;

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;

use crate::{
    db::{helpers::distinct_ids, Database, Metadata, OutputRecord},
    host::{NotificationSink, OutputMetadataReader},
    registry::CorrelationRegistry,
};

pub use extract::{extract_outputs, extract_prompt_texts, prefer_saved_outputs, request_payload};
pub use params::extract_generation_params;

/// Event pushed to clients after a job's outputs were stored.
pub const OUTPUTS_EVENT: &str = "prompt-history-updated";
/// Metadata key holding the request graph that produced an entry's outputs.
pub const REQUEST_METADATA_KEY: &str = "comfyui_prompt";

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionPolicy {
    /// Drop `temp` outputs when the job also saved `output` files.
    pub prefer_saved_outputs: bool,
    /// Store the request graph and the parameters read from it in entry metadata.
    pub record_request_payload: bool,
}

impl Default for CompletionPolicy {
    fn default() -> Self {
        Self {
            prefer_saved_outputs: true,
            record_request_payload: false,
        }
    }
}

/// What a completion resolved to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletionOutcome {
    pub job_id: String,
    pub entry_ids: Vec<String>,
    pub files: Vec<OutputRecord>,
}

/// Receives each newly finished job from the watcher.
pub trait CompletionListener: Send + Sync {
    fn job_completed(&self, job_id: &str, result: &Value, request: Option<&Value>) -> Result<()>;
}

pub struct CompletionHandler {
    db: Database,
    registry: Arc<CorrelationRegistry>,
    sink: Arc<dyn NotificationSink>,
    reader: Option<Arc<dyn OutputMetadataReader>>,
    policy: CompletionPolicy,
}

impl CompletionHandler {
    pub fn new(
        db: Database,
        registry: Arc<CorrelationRegistry>,
        sink: Arc<dyn NotificationSink>,
        policy: CompletionPolicy,
    ) -> Self {
        Self {
            db,
            registry,
            sink,
            reader: None,
            policy,
        }
    }

    pub fn with_metadata_reader(mut self, reader: Arc<dyn OutputMetadataReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    /// Process one finished job. Returns `None` when no entry is linked to it.
    pub fn handle(
        &self,
        job_id: &str,
        result: &Value,
        request: Option<&Value>,
    ) -> Result<Option<CompletionOutcome>> {
        // Registry first: it must never be held together with the store.
        let entry_ids = self.resolve_entry_ids(job_id, request)?;
        if entry_ids.is_empty() {
            log_debug!("job {job_id} has no recorded prompts");
            return Ok(None);
        }

        let mut files = extract_outputs(result);
        if self.policy.prefer_saved_outputs {
            files = prefer_saved_outputs(files);
        }

        if !files.is_empty() {
            self.db.add_output_records(&entry_ids, files.clone())?;
        }
        self.merge_metadata(&entry_ids, &files, request)?;
        self.db.touch_entries(&entry_ids)?;

        let outcome = CompletionOutcome {
            job_id: job_id.to_string(),
            entry_ids,
            files,
        };
        self.notify(&outcome);
        Ok(Some(outcome))
    }

    fn resolve_entry_ids(&self, job_id: &str, request: Option<&Value>) -> Result<Vec<String>> {
        let tracked = self.registry.consume(Some(job_id));
        if !tracked.is_empty() {
            return Ok(distinct_ids(&tracked));
        }

        let Some(request) = request else {
            return Ok(Vec::new());
        };
        let prompts = extract_prompt_texts(request);
        if prompts.is_empty() {
            return Ok(Vec::new());
        }
        let resolved = self.db.find_entry_ids_for_prompts(&prompts)?;
        // Keep the order prompts appear in the request.
        let ids: Vec<&str> = prompts
            .iter()
            .filter_map(|prompt| resolved.get(prompt).map(String::as_str))
            .collect();
        Ok(distinct_ids(&ids))
    }

    fn merge_metadata(
        &self,
        entry_ids: &[String],
        files: &[OutputRecord],
        request: Option<&Value>,
    ) -> Result<()> {
        let mut read_back = Metadata::new();
        if let Some(reader) = &self.reader {
            for file in files {
                read_back.extend(reader.read(file));
            }
        }

        let mut defaults = Metadata::new();
        if self.policy.record_request_payload {
            if let Some(request) = request {
                defaults.insert(REQUEST_METADATA_KEY.to_string(), request.clone());
                defaults.extend(extract_generation_params(request));
            }
        }

        if read_back.is_empty() && defaults.is_empty() {
            return Ok(());
        }
        for entry_id in entry_ids {
            if !read_back.is_empty() {
                self.db.update_metadata(entry_id, read_back.clone())?;
            }
            if !defaults.is_empty() {
                self.db.fill_metadata(entry_id, defaults.clone())?;
            }
        }
        Ok(())
    }

    fn notify(&self, outcome: &CompletionOutcome) {
        let payload = match serde_json::to_value(outcome) {
            Ok(payload) => payload,
            Err(err) => {
                log_warn!("failed to encode {OUTPUTS_EVENT} for job {}: {err}", outcome.job_id);
                return;
            }
        };
        if let Err(err) = self.sink.send(OUTPUTS_EVENT, &payload) {
            log_warn!("failed to deliver {OUTPUTS_EVENT} for job {}: {err:?}", outcome.job_id);
        }
    }
}

impl CompletionListener for CompletionHandler {
    fn job_completed(&self, job_id: &str, result: &Value, request: Option<&Value>) -> Result<()> {
        self.handle(job_id, result, request).map(|_| ())
    }
}
