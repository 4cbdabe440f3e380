//! Interfaces the execution host provides to the history core.

use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;

use crate::db::{Metadata, OutputRecord};

/// Read access to the host's completion history.
pub trait HistorySource: Send + Sync {
    /// The most recent `max_items` completions, as a JSON object mapping job id
    /// to `{ "prompt": [number, job_id, request, ...], "outputs": {...} }`.
    fn history(&self, max_items: usize) -> Result<Value>;
}

/// Hands out a [`HistorySource`] once the host is up.
pub trait HistoryProvider: Send + Sync {
    fn acquire(&self) -> Option<Arc<dyn HistorySource>>;
}

/// Fire-and-forget channel to connected clients.
pub trait NotificationSink: Send + Sync {
    fn send(&self, event: &str, payload: &Value) -> Result<()>;
}

/// Reads generation parameters embedded in a produced file.
pub trait OutputMetadataReader: Send + Sync {
    fn read(&self, output: &OutputRecord) -> Metadata;
}

/// What the host knows about the job executing a record-prompt call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionContext {
    pub job_id: Option<String>,
    pub node_id: Option<String>,
}

impl ExecutionContext {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            node_id: None,
        }
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }
}

/// Sink that drops every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl NotificationSink for NullSink {
    fn send(&self, _event: &str, _payload: &Value) -> Result<()> {
        Ok(())
    }
}
