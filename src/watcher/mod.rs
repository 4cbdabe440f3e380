pub mod loop_worker;

use std::{
    sync::{mpsc, Arc, Mutex, PoisonError},
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{Context, Result};
use log::{error, info};

use crate::{completion::CompletionListener, host::HistoryProvider};

pub use loop_worker::{watch_loop, PollOutcome, WatchState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatcherConfig {
    pub poll_interval: Duration,
    pub history_window: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            history_window: 512,
        }
    }
}

struct RunningWatcher {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Owns the background thread that polls completion history.
pub struct HistoryWatcher {
    provider: Arc<dyn HistoryProvider>,
    listener: Arc<dyn CompletionListener>,
    config: WatcherConfig,
    running: Mutex<Option<RunningWatcher>>,
}

impl HistoryWatcher {
    pub fn new(
        provider: Arc<dyn HistoryProvider>,
        listener: Arc<dyn CompletionListener>,
        config: WatcherConfig,
    ) -> Self {
        Self {
            provider,
            listener,
            config,
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> WatcherConfig {
        self.config
    }

    /// Spawn the polling thread. Returns `false` if one is already running.
    pub fn start(&self) -> Result<bool> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = running.as_ref() {
            if !current.handle.is_finished() {
                return Ok(false);
            }
        }

        let (stop_tx, stop_rx) = mpsc::channel();
        let provider = Arc::clone(&self.provider);
        let listener = Arc::clone(&self.listener);
        let WatcherConfig {
            poll_interval,
            history_window,
        } = self.config;

        let handle = thread::Builder::new()
            .name("prompt-history-watcher".into())
            .spawn(move || watch_loop(provider, listener, poll_interval, history_window, stop_rx))
            .context("failed to spawn history watcher thread")?;

        *running = Some(RunningWatcher { stop_tx, handle });
        Ok(true)
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|current| !current.handle.is_finished())
            .unwrap_or(false)
    }

    /// Signal the thread and wait for it. The signal is observed between polls.
    pub fn stop(&self) {
        let current = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(RunningWatcher { stop_tx, handle }) = current else {
            return;
        };

        // A send error means the loop already exited.
        let _ = stop_tx.send(());
        if let Err(join_err) = handle.join() {
            error!("history watcher thread panicked: {join_err:?}");
        } else {
            info!("history watcher stopped");
        }
    }
}

impl Drop for HistoryWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HistorySource;
    use anyhow::Result;
    use serde_json::{json, Value};
    use std::time::Instant;

    struct OneJob;

    impl HistorySource for OneJob {
        fn history(&self, _max_items: usize) -> Result<Value> {
            Ok(json!({"job-1": {"prompt": [0, "job-1", {}], "outputs": {}}}))
        }
    }

    struct Ready;

    impl HistoryProvider for Ready {
        fn acquire(&self) -> Option<Arc<dyn HistorySource>> {
            Some(Arc::new(OneJob))
        }
    }

    #[derive(Default)]
    struct Counter {
        calls: Mutex<usize>,
    }

    impl CompletionListener for Counter {
        fn job_completed(&self, _job_id: &str, _result: &Value, _request: Option<&Value>) -> Result<()> {
            *self.calls.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn fast_config() -> WatcherConfig {
        WatcherConfig {
            poll_interval: Duration::from_millis(10),
            history_window: 16,
        }
    }

    #[test]
    fn start_is_idempotent_and_stop_joins() {
        let counter = Arc::new(Counter::default());
        let watcher = HistoryWatcher::new(Arc::new(Ready), counter.clone(), fast_config());

        assert!(watcher.start().unwrap());
        assert!(!watcher.start().unwrap());
        assert!(watcher.is_running());

        let deadline = Instant::now() + Duration::from_secs(5);
        while *counter.calls.lock().unwrap() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        // Give the loop a few more polls to prove the job is not redispatched.
        thread::sleep(Duration::from_millis(50));

        watcher.stop();
        assert!(!watcher.is_running());
        assert_eq!(*counter.calls.lock().unwrap(), 1);
    }

    #[test]
    fn restart_after_stop() {
        let watcher = HistoryWatcher::new(
            Arc::new(Ready),
            Arc::new(Counter::default()),
            fast_config(),
        );
        assert!(watcher.start().unwrap());
        watcher.stop();
        assert!(watcher.start().unwrap());
        watcher.stop();
    }
}
