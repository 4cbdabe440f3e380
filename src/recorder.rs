//! The record-prompt step invoked while a job runs.

use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;

use crate::{
    db::{normalize_metadata, Database, HistoryEntry},
    host::ExecutionContext,
    registry::CorrelationRegistry,
};

/// Metadata key stamped with the id of the recorder node.
pub const NODE_METADATA_KEY: &str = "_prompt_history_node";

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedPrompt {
    pub entry: HistoryEntry,
    pub created: bool,
}

#[derive(Clone)]
pub struct PromptRecorder {
    db: Database,
    registry: Arc<CorrelationRegistry>,
}

impl PromptRecorder {
    pub fn new(db: Database, registry: Arc<CorrelationRegistry>) -> Self {
        Self { db, registry }
    }

    /// Store `prompt` (deduplicated), refresh it when it already existed and
    /// link it to the running job so the job's outputs can find it later.
    pub fn record(
        &self,
        prompt: &str,
        metadata: Value,
        context: &ExecutionContext,
    ) -> Result<RecordedPrompt> {
        let mut metadata = normalize_metadata(metadata);
        if let Some(node_id) = context.node_id.as_deref() {
            metadata
                .entry(NODE_METADATA_KEY)
                .or_insert_with(|| Value::String(node_id.to_string()));
        }

        let (mut entry, created) = self.db.ensure_entry(prompt, metadata)?;
        if !created {
            self.db.touch_entries(&[entry.id.as_str()])?;
            if let Some(refreshed) = self.db.get_entry(&entry.id)? {
                entry = refreshed;
            }
        }
        self.registry.register(context.job_id.as_deref(), &entry.id);

        Ok(RecordedPrompt { entry, created })
    }
}
