//! Producer side: deduplicating insert.
//!
//! A message's identity is its content hash. Sending a message that is
//! already queued and unclaimed is a no-op; sending one that is currently
//! claimed marks it requeued so it runs once more after the current claim.

use std::sync::Arc;

use opentelemetry::KeyValue;
use tracing::{Instrument, debug, info};

use crate::error::{Error, Result};
use crate::model::{MessageHash, NewRecord};
use crate::store::RecordStore;
use crate::telemetry::metrics;
use crate::telemetry::spans::{record_outcome, record_span};

/// How a successful `send` landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// A new record was inserted.
    Created(MessageHash),
    /// The record existed and was in flight; it is now flagged requeued.
    Requeued(MessageHash),
}

impl SendOutcome {
    pub fn hash(&self) -> &MessageHash {
        match self {
            SendOutcome::Created(h) | SendOutcome::Requeued(h) => h,
        }
    }
}

/// Inserts records into one store. Needs no listener.
#[derive(Clone)]
pub struct Enqueuer {
    store: Arc<dyn RecordStore>,
    cycle_limit: u32,
}

impl Enqueuer {
    /// `cycle_limit` bounds insert/mark-requeued rounds per send.
    pub fn new(store: Arc<dyn RecordStore>, cycle_limit: u32) -> Self {
        Self { store, cycle_limit }
    }

    /// Enqueue `message` under `topic`.
    ///
    /// Each round tries an insert; on a duplicate key it tries to flag the
    /// existing record requeued, which only applies while the record is
    /// claimed. If that matches nothing the record is either unclaimed
    /// (already pending) or was just deleted, so the insert is retried.
    ///
    /// # Errors
    ///
    /// `SendExhausted` once `cycle_limit` rounds pass without an insert or
    /// a requeue applying; any non-duplicate store error immediately.
    pub async fn send(&self, message: &str, topic: Option<&str>) -> Result<SendOutcome> {
        let record = NewRecord::new(message, topic);
        let span = record_span("send", record.hash());

        async {
            let result = self.send_record(&record).await;
            let label = match &result {
                Ok(SendOutcome::Created(_)) => "created",
                Ok(SendOutcome::Requeued(_)) => "requeued",
                Err(Error::SendExhausted { .. }) => "exhausted",
                Err(_) => "error",
            };
            metrics::messages_sent().add(1, &[KeyValue::new("result", label)]);
            record_outcome(&tracing::Span::current(), label);
            result
        }
        .instrument(span)
        .await
    }

    async fn send_record(&self, record: &NewRecord) -> Result<SendOutcome> {
        let mut attempts = 0;
        while attempts < self.cycle_limit {
            attempts += 1;

            match self.store.insert(record).await {
                Ok(()) => {
                    info!(topic = ?record.topic(), "message queued");
                    return Ok(SendOutcome::Created(record.hash().clone()));
                }
                Err(Error::DuplicateKey(_)) => {}
                Err(e) => return Err(e),
            }

            if self.store.mark_requeued(record.hash()).await? > 0 {
                info!(topic = ?record.topic(), "message in flight, flagged for requeue");
                return Ok(SendOutcome::Requeued(record.hash().clone()));
            }

            debug!(attempt = attempts, "record exists but is not claimed, retrying insert");
        }

        Err(Error::SendExhausted { attempts })
    }
}
