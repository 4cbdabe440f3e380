//! Prompt history for graph-execution hosts: records prompts as they run,
//! deduplicates them, and links each finished job's output files back to the
//! prompts that produced them.

pub mod completion;
pub mod db;
pub mod host;
pub mod recorder;
pub mod registry;
pub mod settings;
pub mod utils;
pub mod watcher;

use std::sync::Arc;

use anyhow::Result;
use log::info;

pub use completion::{CompletionHandler, CompletionOutcome, CompletionPolicy};
pub use db::{Database, HistoryEntry, Metadata, OutputRecord};
pub use host::{
    ExecutionContext, HistoryProvider, HistorySource, NotificationSink, NullSink,
    OutputMetadataReader,
};
pub use recorder::{PromptRecorder, RecordedPrompt};
pub use registry::CorrelationRegistry;
pub use settings::{Settings, SettingsStore};
pub use utils::init_logging;
pub use watcher::{HistoryWatcher, WatcherConfig};

/// What the host hands to the history core at startup.
pub struct HostBindings {
    pub provider: Arc<dyn HistoryProvider>,
    pub sink: Arc<dyn NotificationSink>,
    pub metadata_reader: Option<Arc<dyn OutputMetadataReader>>,
}

impl HostBindings {
    pub fn new(provider: Arc<dyn HistoryProvider>, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            provider,
            sink,
            metadata_reader: None,
        }
    }
}

/// The wired-up history core. The process entry point owns it; dropping it
/// stops the watcher and closes the database once the last clone is gone.
pub struct PromptHistory {
    db: Database,
    registry: Arc<CorrelationRegistry>,
    recorder: PromptRecorder,
    handler: Arc<CompletionHandler>,
    watcher: HistoryWatcher,
}

impl PromptHistory {
    /// Open the store described by `settings` and start watching the host.
    pub fn open(settings: &Settings, host: HostBindings) -> Result<Self> {
        let db = Database::open_with(
            settings.database_path(),
            Arc::new(db::SystemClock),
            settings.store_limits(),
        )?;
        let history = Self::assemble(db, settings, host);
        history.watcher.start()?;
        info!("Prompt history started ({})", history.db.path().display());
        Ok(history)
    }

    /// Wire the components around an existing store without starting the watcher.
    pub fn assemble(db: Database, settings: &Settings, host: HostBindings) -> Self {
        let registry = Arc::new(CorrelationRegistry::new());
        let recorder = PromptRecorder::new(db.clone(), Arc::clone(&registry));

        let mut handler = CompletionHandler::new(
            db.clone(),
            Arc::clone(&registry),
            host.sink,
            settings.completion_policy(),
        );
        if let Some(reader) = host.metadata_reader {
            handler = handler.with_metadata_reader(reader);
        }
        let handler = Arc::new(handler);

        let watcher = HistoryWatcher::new(
            host.provider,
            handler.clone(),
            settings.watcher_config(),
        );

        Self {
            db,
            registry,
            recorder,
            handler,
            watcher,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn registry(&self) -> &Arc<CorrelationRegistry> {
        &self.registry
    }

    pub fn recorder(&self) -> &PromptRecorder {
        &self.recorder
    }

    pub fn completion_handler(&self) -> &Arc<CompletionHandler> {
        &self.handler
    }

    pub fn watcher(&self) -> &HistoryWatcher {
        &self.watcher
    }

    pub fn shutdown(&self) {
        self.watcher.stop();
    }
}
