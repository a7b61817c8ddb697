//! Quiet-period timer that coalesces bursts of changes into one action.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// Runs a future once no new schedule has arrived for `quiet`.
///
/// Each [`schedule`](Self::schedule) aborts the pending timer and starts a
/// new one. When a timer fires its future is spawned on its own task, so a
/// later schedule or cancel never interrupts work that already started.
#[derive(Debug)]
pub struct Debouncer {
    quiet: Duration,
    pending: Option<JoinHandle<()>>,
}

impl Debouncer {
    pub fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            pending: None,
        }
    }

    pub fn quiet(&self) -> Duration {
        self.quiet
    }

    /// Whether a timer is armed and has not fired yet.
    pub fn is_pending(&self) -> bool {
        self.pending.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Arm the timer for `action`, replacing any pending one.
    ///
    /// Returns `true` when a pending timer was reset.
    pub fn schedule<F>(&mut self, action: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let reset = self.cancel();
        let quiet = self.quiet;
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(quiet).await;
            tokio::spawn(action);
        }));
        reset
    }

    /// Disarm the timer. Returns `true` if one was pending.
    pub fn cancel(&mut self) -> bool {
        match self.pending.take() {
            Some(task) if !task.is_finished() => {
                task.abort();
                true
            }
            _ => false,
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}
