//! Self re-arming timer chains.
//!
//! A chain is either Idle or Armed. When armed, a task sleeps for the
//! chain's delay, runs one tick to completion, and only then sleeps again,
//! so ticks of one chain never overlap. Stopping cancels the pending sleep
//! immediately; a tick already in flight runs to completion, sees the
//! cancelled token, and does not re-arm. A chain restarted while that tick
//! is still running waits for it before its own first sleep.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

enum ChainState {
    /// `draining` is the task of the last armed period, possibly still
    /// finishing a tick.
    Idle { draining: Option<JoinHandle<()>> },
    Armed {
        cancel: CancellationToken,
        task: JoinHandle<()>,
    },
}

/// One timer-driven chain of ticks.
pub(crate) struct TimerChain {
    name: &'static str,
    delay: Duration,
    state: Mutex<ChainState>,
}

impl TimerChain {
    pub(crate) fn new(name: &'static str, delay: Duration) -> Self {
        Self {
            name,
            delay,
            state: Mutex::new(ChainState::Idle { draining: None }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Arm the chain. Returns false, and does nothing, if already armed.
    ///
    /// `tick` receives the chain's token so it can tell whether the chain
    /// was stopped while it was running.
    pub(crate) fn start<F, Fut>(&self, tick: F) -> bool
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.lock();
        let draining = match &mut *state {
            ChainState::Armed { .. } => return false,
            ChainState::Idle { draining } => draining.take().filter(|task| !task.is_finished()),
        };

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let delay = self.delay;
        let name = self.name;
        let task = tokio::spawn(async move {
            // Awaited even if this chain is stopped meanwhile, so a later
            // restart that waits on this task also waits on the old tick.
            if let Some(previous) = draining {
                let _ = previous.await;
            }
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                tick(token.clone()).await;
                if token.is_cancelled() {
                    break;
                }
            }
            debug!(chain = name, "timer chain ended");
        });

        *state = ChainState::Armed { cancel, task };
        true
    }

    /// Disarm the chain. Returns false if it was already idle.
    pub(crate) fn stop(&self) -> bool {
        let mut state = self.lock();
        match &*state {
            ChainState::Armed { cancel, .. } => cancel.cancel(),
            ChainState::Idle { .. } => return false,
        }
        // The task finishes any tick in flight on its own; the handle is kept
        // so the next start can wait for it.
        if let ChainState::Armed { task, .. } =
            std::mem::replace(&mut *state, ChainState::Idle { draining: None })
        {
            *state = ChainState::Idle {
                draining: Some(task),
            };
        }
        true
    }

    pub(crate) fn is_armed(&self) -> bool {
        match &*self.lock() {
            ChainState::Armed { task, .. } => !task.is_finished(),
            ChainState::Idle { .. } => false,
        }
    }
}

impl Drop for TimerChain {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Counts consecutive lock conflicts for one chain.
///
/// Conflicts up to the limit are absorbed and retried on the next tick; the
/// one after that is reported and the count starts over.
pub(crate) struct ConflictBudget {
    limit: u32,
    seen: AtomicU32,
}

impl ConflictBudget {
    pub(crate) fn new(limit: u32) -> Self {
        Self {
            limit,
            seen: AtomicU32::new(0),
        }
    }

    /// Record a conflict. True if it is absorbed, false if it must be
    /// reported (the count is reset in that case).
    pub(crate) fn absorb(&self) -> bool {
        let seen = self.seen.fetch_add(1, Ordering::SeqCst);
        if seen < self.limit {
            true
        } else {
            self.seen.store(0, Ordering::SeqCst);
            false
        }
    }

    pub(crate) fn reset(&self) {
        self.seen.store(0, Ordering::SeqCst);
    }

    pub(crate) fn limit(&self) -> u32 {
        self.limit
    }

    #[cfg(test)]
    fn seen(&self) -> u32 {
        self.seen.load(Ordering::SeqCst)
    }
}
