use std::{
    collections::HashSet,
    panic::{self, AssertUnwindSafe},
    sync::{mpsc, Arc},
    time::Duration,
};

use anyhow::anyhow;

use crate::{
    completion::{request_payload, CompletionListener},
    host::{HistoryProvider, HistorySource},
};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

/// Result of a single poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The host has no history source yet.
    SourceUnavailable,
    /// Reading history failed; the source handle was dropped.
    SourceLost,
    /// History came back in an unexpected shape; nothing was done.
    Malformed,
    /// `handled` new jobs were dispatched out of a `window`-sized slice.
    Polled { handled: usize, window: usize },
}

/// State carried between polls: the jobs already dispatched and the cached
/// history source.
#[derive(Default)]
pub struct WatchState {
    processed: HashSet<String>,
    source: Option<Arc<dyn HistorySource>>,
}

impl WatchState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> &HashSet<String> {
        &self.processed
    }

    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }

    /// Dispatch every job in the current window that was not dispatched
    /// before, then forget ids that left the window.
    pub fn poll_once(
        &mut self,
        provider: &dyn HistoryProvider,
        listener: &dyn CompletionListener,
        window: usize,
    ) -> PollOutcome {
        let source = match &self.source {
            Some(source) => Arc::clone(source),
            None => match provider.acquire() {
                Some(source) => {
                    log_info!("history source acquired");
                    self.source = Some(Arc::clone(&source));
                    source
                }
                None => {
                    log_debug!("history source not ready yet");
                    return PollOutcome::SourceUnavailable;
                }
            },
        };

        let fetched = panic::catch_unwind(AssertUnwindSafe(|| source.history(window)))
            .unwrap_or_else(|_| Err(anyhow!("history source panicked")));
        let history = match fetched {
            Ok(history) => history,
            Err(err) => {
                log_error!("reading completion history failed, re-acquiring: {err:?}");
                self.source = None;
                return PollOutcome::SourceLost;
            }
        };
        let Some(items) = history.as_object() else {
            log_debug!("completion history is not an object; skipping this cycle");
            return PollOutcome::Malformed;
        };

        let mut window_ids = HashSet::with_capacity(items.len());
        let mut handled = 0;
        for (job_id, item) in items {
            window_ids.insert(job_id.clone());
            if self.processed.contains(job_id) {
                continue;
            }

            let request = request_payload(item);
            let dispatched = panic::catch_unwind(AssertUnwindSafe(|| {
                listener.job_completed(job_id, item, request)
            }))
            .unwrap_or_else(|_| Err(anyhow!("completion handler panicked")));
            if let Err(err) = dispatched {
                log_error!("failed to process completed job {job_id}: {err:?}");
            }

            // Marked even on failure so one bad job cannot be retried forever.
            self.processed.insert(job_id.clone());
            handled += 1;
        }

        self.processed.retain(|id| window_ids.contains(id));
        PollOutcome::Polled {
            handled,
            window: window_ids.len(),
        }
    }
}

/// Poll until a stop signal arrives or the stop sender is dropped.
pub fn watch_loop(
    provider: Arc<dyn HistoryProvider>,
    listener: Arc<dyn CompletionListener>,
    poll_interval: Duration,
    history_window: usize,
    stop_rx: mpsc::Receiver<()>,
) {
    let mut state = WatchState::new();
    log_info!(
        "history watcher started (interval {}ms, window {history_window})",
        poll_interval.as_millis()
    );

    loop {
        if let PollOutcome::Polled { handled, .. } =
            state.poll_once(provider.as_ref(), listener.as_ref(), history_window)
        {
            if handled > 0 {
                log_debug!("dispatched {handled} completed job(s)");
            }
        }

        match stop_rx.recv_timeout(poll_interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Ok(()) => break,
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                log_warn!("history watcher lost its controller");
                break;
            }
        }
    }

    log_info!("history watcher shutting down");
}
