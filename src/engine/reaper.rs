//! Lease reaper: returns claims with a stale heartbeat to the pool.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use super::chain::ConflictBudget;
use crate::error::Error;
use crate::event::{EventSender, ListenerEvent};
use crate::model::OwnerToken;
use crate::store::RecordStore;
use crate::telemetry::metrics;
use crate::telemetry::spans::{record_outcome, tick_span};

/// What one reap tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapOutcome {
    /// This many expired claims were released (possibly zero).
    Reaped(u64),
    /// A lock conflict was absorbed; the next tick retries.
    Conflict,
    /// An error was delivered as an `Error` event.
    Failed,
}

pub(crate) struct LeaseReaper {
    store: Arc<dyn RecordStore>,
    owner: OwnerToken,
    table: String,
    lifetime: Duration,
    conflicts: ConflictBudget,
    events: EventSender,
}

impl LeaseReaper {
    pub(crate) fn new(
        store: Arc<dyn RecordStore>,
        owner: OwnerToken,
        table: String,
        lifetime: Duration,
        deadlock_limit: u32,
        events: EventSender,
    ) -> Self {
        Self {
            store,
            owner,
            table,
            lifetime,
            conflicts: ConflictBudget::new(deadlock_limit),
            events,
        }
    }

    pub(crate) async fn tick(&self, cancel: &CancellationToken) -> ReapOutcome {
        let span = tick_span("reap", &self.table, &self.owner);
        async {
            let outcome = self.reap_once(cancel).await;
            let label = match outcome {
                ReapOutcome::Reaped(0) => "idle",
                ReapOutcome::Reaped(_) => "reaped",
                ReapOutcome::Conflict => "deadlock",
                ReapOutcome::Failed => "error",
            };
            record_outcome(&tracing::Span::current(), label);
            outcome
        }
        .instrument(span)
        .await
    }

    async fn reap_once(&self, cancel: &CancellationToken) -> ReapOutcome {
        match self.store.reap_expired(self.lifetime).await {
            Ok(reaped) => {
                self.conflicts.reset();
                if reaped > 0 {
                    metrics::leases_reaped().add(reaped, &[]);
                    info!(reaped, "released expired claims");
                }
                ReapOutcome::Reaped(reaped)
            }
            Err(Error::Deadlock(msg)) => {
                metrics::deadlocks().add(1, &[KeyValue::new("operation", "reap")]);
                if self.conflicts.absorb() {
                    debug!(error = %msg, "reap hit a lock conflict, retrying next tick");
                    return ReapOutcome::Conflict;
                }
                self.report(
                    cancel,
                    Error::DeadlockLimitExceeded {
                        operation: "reap",
                        limit: self.conflicts.limit(),
                        source: Box::new(Error::Deadlock(msg)),
                    },
                );
                ReapOutcome::Failed
            }
            Err(e) => {
                self.report(cancel, e);
                ReapOutcome::Failed
            }
        }
    }

    fn report(&self, cancel: &CancellationToken, err: Error) {
        if cancel.is_cancelled() {
            warn!(error = %err, "reap failed after stop");
            return;
        }
        error!(error = %err, "reap failed");
        if self.events.send(ListenerEvent::Error(err)).is_err() {
            debug!("event receiver dropped, error not delivered");
        }
    }
}
