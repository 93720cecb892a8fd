//! Record store seam.
//!
//! Every statement the queue issues against its table is one method here.
//! Implementations own the connection lifecycle; the engine only holds an
//! `Arc<dyn RecordStore>`.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{MessageHash, NewRecord, OwnerToken, QueueRecord, TopicFilter};

/// Persistence operations for one queue table.
///
/// Mutations that take an `owner` must include `owner = <token>` in their
/// condition, so a listener that lost its lease changes nothing. They return
/// the number of rows affected.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert an unclaimed record stamped with the current time.
    ///
    /// Fails with `Error::DuplicateKey` if the hash already exists.
    async fn insert(&self, record: &NewRecord) -> Result<()>;

    /// Flag an in-flight record for one more pass: `requeued = true` where
    /// the hash matches and the record is being processed.
    async fn mark_requeued(&self, hash: &MessageHash) -> Result<u64>;

    /// Atomically claim one unclaimed record matching `topics`.
    ///
    /// Runs as a single transaction: a row-locked select, the claiming
    /// update (`is_processing`, `owner`, fresh heartbeat), commit. Any
    /// failure rolls back. Lock conflicts surface as `Error::Deadlock`.
    async fn claim_next(
        &self,
        topics: &TopicFilter,
        owner: &OwnerToken,
    ) -> Result<Option<QueueRecord>>;

    /// Advance the heartbeat of a record this owner is processing.
    async fn heartbeat(&self, hash: &MessageHash, owner: &OwnerToken) -> Result<u64>;

    /// Give the claim back: unowned, not processing, requeue flag cleared.
    async fn release(&self, hash: &MessageHash, owner: &OwnerToken) -> Result<u64>;

    /// Delete a finished record, unless it was flagged for requeue.
    async fn remove(&self, hash: &MessageHash, owner: &OwnerToken) -> Result<u64>;

    /// Release every claim whose heartbeat is older than `lifetime`.
    async fn reap_expired(&self, lifetime: Duration) -> Result<u64>;

    /// Look up one record.
    async fn get(&self, hash: &MessageHash) -> Result<Option<QueueRecord>>;

    /// List records, most recent heartbeat first.
    async fn list(&self, limit: i64) -> Result<Vec<QueueRecord>>;

    /// End the session. Further calls fail.
    async fn disconnect(&self) -> Result<()>;
}
