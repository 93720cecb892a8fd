//! The handle a consumer gets for a claimed record.
//!
//! Every store call made through it is fenced on the listener's owner token,
//! so a handle whose lease was reaped and re-claimed elsewhere can no longer
//! change the record.

use std::fmt;
use std::sync::Arc;

use opentelemetry::KeyValue;
use tracing::{Instrument, debug, warn};

use crate::error::Result;
use crate::model::{MessageHash, OwnerToken, QueueRecord};
use crate::store::RecordStore;
use crate::telemetry::metrics;
use crate::telemetry::spans::{record_outcome, record_span};

/// How `remove` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// The record was deleted.
    Removed,
    /// Delete did not apply (requeued, or it failed); the claim was
    /// released so the record is processed again.
    Released,
    /// Neither delete nor release applied: this listener no longer owns
    /// the record.
    NotOwner,
}

/// A claimed record plus the owner-fenced operations on it.
pub struct WrappedMessage {
    record: QueueRecord,
    owner: OwnerToken,
    store: Arc<dyn RecordStore>,
}

impl WrappedMessage {
    pub(crate) fn new(record: QueueRecord, owner: OwnerToken, store: Arc<dyn RecordStore>) -> Self {
        Self {
            record,
            owner,
            store,
        }
    }

    pub fn hash(&self) -> &MessageHash {
        &self.record.hash
    }

    pub fn message(&self) -> &str {
        &self.record.message
    }

    pub fn topic(&self) -> Option<&str> {
        self.record.topic.as_deref()
    }

    /// The record as it was at claim time.
    pub fn record(&self) -> &QueueRecord {
        &self.record
    }

    pub fn owner(&self) -> &OwnerToken {
        &self.owner
    }

    /// Extend the lease. Returns false if this listener no longer owns the
    /// record, in which case nothing changed.
    pub async fn heartbeat(&self) -> Result<bool> {
        let span = record_span("heartbeat", self.hash());
        async {
            let rows = self.store.heartbeat(self.hash(), &self.owner).await;
            self.fenced_result("heartbeat", rows)
        }
        .instrument(span)
        .await
    }

    /// Give the record back to the pool without processing it.
    pub async fn requeue(self) -> Result<bool> {
        let span = record_span("requeue", self.hash());
        async {
            let rows = self.store.release(self.hash(), &self.owner).await;
            self.fenced_result("requeue", rows)
        }
        .instrument(span)
        .await
    }

    /// Delete the record after successful processing.
    ///
    /// If the record was requeued while claimed, or the delete fails, the
    /// claim is released instead so the record runs again.
    pub async fn remove(self) -> Result<RemoveOutcome> {
        let span = record_span("remove", self.hash());
        async {
            let counter = metrics::handler_operations();
            let op = KeyValue::new("operation", "remove");

            match self.store.remove(self.hash(), &self.owner).await {
                Ok(rows) if rows > 0 => {
                    counter.add(1, &[op, KeyValue::new("result", "ok")]);
                    record_outcome(&tracing::Span::current(), "removed");
                    return Ok(RemoveOutcome::Removed);
                }
                Ok(_) => debug!("delete matched no row, releasing claim instead"),
                Err(e) => warn!(error = %e, "delete failed, releasing claim instead"),
            }

            match self.store.release(self.hash(), &self.owner).await {
                Ok(rows) if rows > 0 => {
                    counter.add(1, &[op, KeyValue::new("result", "fallback")]);
                    record_outcome(&tracing::Span::current(), "released");
                    Ok(RemoveOutcome::Released)
                }
                Ok(_) => {
                    counter.add(1, &[op, KeyValue::new("result", "fenced")]);
                    record_outcome(&tracing::Span::current(), "not_owner");
                    warn!(owner = %self.owner, "remove affected no row, claim was lost");
                    Ok(RemoveOutcome::NotOwner)
                }
                Err(e) => {
                    counter.add(1, &[op, KeyValue::new("result", "error")]);
                    record_outcome(&tracing::Span::current(), "error");
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    fn fenced_result(&self, operation: &'static str, rows: Result<u64>) -> Result<bool> {
        let counter = metrics::handler_operations();
        let op = KeyValue::new("operation", operation);
        let span = tracing::Span::current();

        match rows {
            Ok(rows) if rows > 0 => {
                counter.add(1, &[op, KeyValue::new("result", "ok")]);
                record_outcome(&span, "ok");
                Ok(true)
            }
            Ok(_) => {
                counter.add(1, &[op, KeyValue::new("result", "fenced")]);
                record_outcome(&span, "not_owner");
                warn!(owner = %self.owner, "{operation} affected no row, claim was lost");
                Ok(false)
            }
            Err(e) => {
                counter.add(1, &[op, KeyValue::new("result", "error")]);
                record_outcome(&span, "error");
                Err(e)
            }
        }
    }
}

impl fmt::Debug for WrappedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrappedMessage")
            .field("hash", &self.record.hash)
            .field("topic", &self.record.topic)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}
