use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::PathBuf,
    sync::{PoisonError, RwLock},
    time::Duration,
};

use crate::{completion::CompletionPolicy, db::StoreLimits, watcher::WatcherConfig};

/// Overrides `storage_dir` when set.
pub const STORAGE_DIR_ENV: &str = "PROMPT_HISTORY_DIR";
pub const DATABASE_FILE_NAME: &str = "prompt_history.db";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub storage_dir: PathBuf,
    pub poll_interval_ms: u64,
    pub history_window: usize,
    pub prefer_saved_outputs: bool,
    pub record_request_payload: bool,
    pub list_default_limit: usize,
    pub list_max_limit: usize,
    pub fallback_lookup_limit: usize,
}

impl Default for Settings {
    fn default() -> Self {
        let limits = StoreLimits::default();
        let watcher = WatcherConfig::default();
        let policy = CompletionPolicy::default();
        Self {
            storage_dir: PathBuf::from("data"),
            poll_interval_ms: watcher.poll_interval.as_millis() as u64,
            history_window: watcher.history_window,
            prefer_saved_outputs: policy.prefer_saved_outputs,
            record_request_payload: policy.record_request_payload,
            list_default_limit: limits.list_default,
            list_max_limit: limits.list_max,
            fallback_lookup_limit: limits.fallback_lookup,
        }
    }
}

impl Settings {
    pub fn database_path(&self) -> PathBuf {
        self.storage_dir.join(DATABASE_FILE_NAME)
    }

    pub fn store_limits(&self) -> StoreLimits {
        StoreLimits {
            list_default: self.list_default_limit.max(1),
            list_max: self.list_max_limit.max(1),
            fallback_lookup: self.fallback_lookup_limit,
        }
    }

    pub fn watcher_config(&self) -> WatcherConfig {
        WatcherConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            history_window: self.history_window.max(1),
        }
    }

    pub fn completion_policy(&self) -> CompletionPolicy {
        CompletionPolicy {
            prefer_saved_outputs: self.prefer_saved_outputs,
            record_request_payload: self.record_request_payload,
        }
    }

    fn with_storage_override(mut self, storage_dir: Option<String>) -> Self {
        if let Some(dir) = storage_dir.filter(|dir| !dir.trim().is_empty()) {
            self.storage_dir = PathBuf::from(dir.trim());
        }
        self
    }
}

/// Settings persisted as JSON next to the application data.
pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<Settings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                log::warn!(
                    "Ignoring unreadable settings in {}: {err}",
                    path.display()
                );
                Settings::default()
            })
        } else {
            Settings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    /// Current settings with the environment override applied.
    pub fn current(&self) -> Settings {
        let stored = self
            .data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        stored.with_storage_override(std::env::var(STORAGE_DIR_ENV).ok())
    }

    pub fn update(&self, settings: Settings) -> Result<()> {
        let mut guard = self.data.write().unwrap_or_else(PoisonError::into_inner);
        self.persist(&settings)?;
        *guard = settings;
        Ok(())
    }

    fn persist(&self, data: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create settings directory {}", parent.display())
            })?;
        }
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("settings.json")).unwrap();
        let settings = store.data.read().unwrap().clone();

        assert_eq!(settings, Settings::default());
        assert_eq!(settings.watcher_config().poll_interval, Duration::from_millis(500));
        assert_eq!(settings.watcher_config().history_window, 512);
        assert!(settings.completion_policy().prefer_saved_outputs);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"poll_interval_ms": 250, "prefer_saved_outputs": false}"#).unwrap();

        let store = SettingsStore::new(path).unwrap();
        let settings = store.data.read().unwrap().clone();
        assert_eq!(settings.poll_interval_ms, 250);
        assert!(!settings.prefer_saved_outputs);
        assert_eq!(settings.list_max_limit, 1000);
    }

    #[test]
    fn corrupt_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();

        let store = SettingsStore::new(path).unwrap();
        assert_eq!(*store.data.read().unwrap(), Settings::default());
    }

    #[test]
    fn update_persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let store = SettingsStore::new(path.clone()).unwrap();

        let settings = Settings {
            history_window: 64,
            ..Settings::default()
        };
        store.update(settings.clone()).unwrap();

        let reloaded = SettingsStore::new(path).unwrap();
        assert_eq!(*reloaded.data.read().unwrap(), settings);
    }

    #[test]
    fn storage_override_replaces_directory() {
        let settings = Settings::default().with_storage_override(Some("/tmp/history".into()));
        assert_eq!(settings.database_path(), PathBuf::from("/tmp/history/prompt_history.db"));

        let untouched = Settings::default().with_storage_override(Some("  ".into()));
        assert_eq!(untouched.storage_dir, PathBuf::from("data"));
    }
}
