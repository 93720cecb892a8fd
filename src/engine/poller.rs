//! Claim poller: one claim attempt per tick.

use std::sync::Arc;

use opentelemetry::KeyValue;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use super::chain::ConflictBudget;
use super::wrapped::WrappedMessage;
use crate::error::Error;
use crate::event::{EventSender, ListenerEvent};
use crate::model::{MessageHash, OwnerToken, TopicFilter};
use crate::store::RecordStore;
use crate::telemetry::metrics;
use crate::telemetry::spans::{record_outcome, tick_span};

/// What one poll tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// A record was claimed and delivered as a `Data` event.
    Claimed(MessageHash),
    /// Nothing matched the topic filter.
    Empty,
    /// A lock conflict was absorbed; the next tick retries.
    Conflict,
    /// A claim completed after the chain was stopped and was given back.
    Released(MessageHash),
    /// An error was delivered as an `Error` event.
    Failed,
}

pub(crate) struct ClaimPoller {
    store: Arc<dyn RecordStore>,
    owner: OwnerToken,
    topics: TopicFilter,
    table: String,
    conflicts: ConflictBudget,
    events: EventSender,
}

impl ClaimPoller {
    pub(crate) fn new(
        store: Arc<dyn RecordStore>,
        owner: OwnerToken,
        topics: TopicFilter,
        table: String,
        deadlock_limit: u32,
        events: EventSender,
    ) -> Self {
        Self {
            store,
            owner,
            topics,
            table,
            conflicts: ConflictBudget::new(deadlock_limit),
            events,
        }
    }

    /// Run one claim attempt. `cancel` is the chain's token; a claim that
    /// completes after it fired is released rather than delivered.
    pub(crate) async fn tick(&self, cancel: &CancellationToken) -> PollOutcome {
        let span = tick_span("poll", &self.table, &self.owner);
        async {
            let outcome = self.claim_once(cancel).await;
            let label = match &outcome {
                PollOutcome::Claimed(_) => "claimed",
                PollOutcome::Empty => "empty",
                PollOutcome::Conflict => "deadlock",
                PollOutcome::Released(_) => "released",
                PollOutcome::Failed => "error",
            };
            metrics::claims().add(1, &[KeyValue::new("result", label)]);
            record_outcome(&tracing::Span::current(), label);
            outcome
        }
        .instrument(span)
        .await
    }

    async fn claim_once(&self, cancel: &CancellationToken) -> PollOutcome {
        let claimed = match self.store.claim_next(&self.topics, &self.owner).await {
            Ok(claimed) => {
                self.conflicts.reset();
                claimed
            }
            Err(Error::Deadlock(msg)) => {
                metrics::deadlocks().add(1, &[KeyValue::new("operation", "claim")]);
                if self.conflicts.absorb() {
                    debug!(error = %msg, "claim hit a lock conflict, retrying next tick");
                    return PollOutcome::Conflict;
                }
                self.report(
                    cancel,
                    Error::DeadlockLimitExceeded {
                        operation: "claim",
                        limit: self.conflicts.limit(),
                        source: Box::new(Error::Deadlock(msg)),
                    },
                );
                return PollOutcome::Failed;
            }
            Err(e) => {
                self.report(cancel, e);
                return PollOutcome::Failed;
            }
        };

        let Some(record) = claimed else {
            return PollOutcome::Empty;
        };
        let hash = record.hash.clone();

        if cancel.is_cancelled() {
            self.give_back(&hash).await;
            return PollOutcome::Released(hash);
        }

        info!(hash = %hash, topic = ?record.topic, "claimed record");
        let message = WrappedMessage::new(record, self.owner.clone(), Arc::clone(&self.store));
        if self.events.send(ListenerEvent::Data(message)).is_err() {
            warn!(hash = %hash, "event receiver dropped, releasing claim");
            self.give_back(&hash).await;
            return PollOutcome::Released(hash);
        }
        PollOutcome::Claimed(hash)
    }

    async fn give_back(&self, hash: &MessageHash) {
        match self.store.release(hash, &self.owner).await {
            Ok(_) => debug!(hash = %hash, "released claim taken after stop"),
            Err(e) => warn!(hash = %hash, error = %e, "failed to release claim, lease will expire"),
        }
    }

    fn report(&self, cancel: &CancellationToken, err: Error) {
        if cancel.is_cancelled() {
            warn!(error = %err, "claim failed after stop");
            return;
        }
        error!(error = %err, "claim failed");
        if self.events.send(ListenerEvent::Error(err)).is_err() {
            debug!("event receiver dropped, error not delivered");
        }
    }
}
