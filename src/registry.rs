//! In-memory link between a running job and the entries it recorded.
//!
//! Buckets for jobs that never complete are never reclaimed; job ids are not
//! reused, so growth is bounded by job volume.

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

#[derive(Debug, Default)]
pub struct CorrelationRegistry {
    buckets: Mutex<HashMap<String, Vec<String>>>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember that `entry_id` was recorded while `job_id` ran.
    pub fn register(&self, job_id: Option<&str>, entry_id: &str) {
        let Some(job_id) = job_id.filter(|id| !id.is_empty()) else {
            return;
        };
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        buckets
            .entry(job_id.to_string())
            .or_default()
            .push(entry_id.to_string());
    }

    /// Remove and return the entries recorded for `job_id`. A second call for
    /// the same job returns nothing.
    pub fn consume(&self, job_id: Option<&str>) -> Vec<String> {
        let Some(job_id) = job_id.filter(|id| !id.is_empty()) else {
            return Vec::new();
        };
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        buckets.remove(job_id).unwrap_or_default()
    }

    pub fn pending_jobs(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
