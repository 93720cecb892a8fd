//! In-process record store.
//!
//! Same semantics as the Postgres store, with a single mutex standing in for
//! row locks: every operation, including the claim, is atomic with respect
//! to every other. Used by tests and for running a listener without a
//! database. Supports a skewable clock and injected failures.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::RecordStore;
use crate::error::{Error, Result};
use crate::model::{MessageHash, NewRecord, OwnerToken, QueueRecord, TopicFilter};

/// Which store operation an injected failure applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePoint {
    Insert,
    MarkRequeued,
    Claim,
    Heartbeat,
    Release,
    Remove,
    Reap,
}

/// What an injected failure looks like to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    /// Reported as `Error::Deadlock`.
    Deadlock,
    /// Reported as `Error::Storage`.
    Storage,
}

#[derive(Default)]
struct MemoryState {
    records: BTreeMap<MessageHash, QueueRecord>,
    skew: chrono::Duration,
    failures: VecDeque<(FailurePoint, InjectedFailure)>,
    disconnected: bool,
}

impl MemoryState {
    fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.skew
    }

    fn check_connected(&self) -> Result<()> {
        if self.disconnected {
            Err(Error::Storage(sqlx::Error::PoolClosed))
        } else {
            Ok(())
        }
    }

    /// Fail if disconnected, or if a failure was queued for `point`.
    fn check(&mut self, point: FailurePoint) -> Result<()> {
        self.check_connected()?;
        let Some((_, failure)) = self
            .failures
            .iter()
            .position(|(p, _)| *p == point)
            .and_then(|idx| self.failures.remove(idx))
        else {
            return Ok(());
        };
        Err(match failure {
            InjectedFailure::Deadlock => {
                Error::Deadlock(format!("injected deadlock during {point:?}"))
            }
            InjectedFailure::Storage => {
                Error::Storage(sqlx::Error::Protocol(format!("injected failure during {point:?}")))
            }
        })
    }
}

/// Mutex-backed `RecordStore`.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Move the store's clock forward. Heartbeats written afterwards use the
    /// skewed time, and lease expiry is judged against it.
    pub fn advance_clock(&self, by: Duration) {
        let mut state = self.lock();
        state.skew += chrono::Duration::from_std(by).unwrap_or_default();
    }

    /// Make the next call of `point` fail. Failures queue in order.
    pub fn inject_failure(&self, point: FailurePoint, failure: InjectedFailure) {
        self.lock().failures.push_back((point, failure));
    }

    /// Number of records currently stored.
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    /// Copy of one record, without going through the async trait.
    pub fn snapshot(&self, hash: &MessageHash) -> Option<QueueRecord> {
        self.lock().records.get(hash).cloned()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert(&self, record: &NewRecord) -> Result<()> {
        let mut state = self.lock();
        state.check(FailurePoint::Insert)?;
        if state.records.contains_key(record.hash()) {
            return Err(Error::DuplicateKey(record.hash().to_string()));
        }
        let now = state.now();
        state.records.insert(
            record.hash().clone(),
            QueueRecord {
                hash: record.hash().clone(),
                message: record.message().to_string(),
                topic: record.topic().map(str::to_string),
                is_processing: false,
                owner: None,
                heartbeat_date: now,
                requeued: false,
            },
        );
        Ok(())
    }

    async fn mark_requeued(&self, hash: &MessageHash) -> Result<u64> {
        let mut state = self.lock();
        state.check(FailurePoint::MarkRequeued)?;
        Ok(match state.records.get_mut(hash) {
            Some(record) if record.is_processing => {
                record.requeued = true;
                1
            }
            _ => 0,
        })
    }

    async fn claim_next(
        &self,
        topics: &TopicFilter,
        owner: &OwnerToken,
    ) -> Result<Option<QueueRecord>> {
        let mut state = self.lock();
        state.check(FailurePoint::Claim)?;
        let now = state.now();
        let candidate = state
            .records
            .values_mut()
            .find(|r| !r.is_processing && topics.matches(r.topic.as_deref()));

        Ok(candidate.map(|record| {
            record.is_processing = true;
            record.owner = Some(owner.clone());
            record.heartbeat_date = now;
            record.clone()
        }))
    }

    async fn heartbeat(&self, hash: &MessageHash, owner: &OwnerToken) -> Result<u64> {
        let mut state = self.lock();
        state.check(FailurePoint::Heartbeat)?;
        let now = state.now();
        Ok(match state.records.get_mut(hash) {
            Some(record) if record.is_owned_by(owner) => {
                record.heartbeat_date = now;
                1
            }
            _ => 0,
        })
    }

    async fn release(&self, hash: &MessageHash, owner: &OwnerToken) -> Result<u64> {
        let mut state = self.lock();
        state.check(FailurePoint::Release)?;
        Ok(match state.records.get_mut(hash) {
            Some(record) if record.owner.as_ref() == Some(owner) => {
                record.owner = None;
                record.is_processing = false;
                record.requeued = false;
                1
            }
            _ => 0,
        })
    }

    async fn remove(&self, hash: &MessageHash, owner: &OwnerToken) -> Result<u64> {
        let mut state = self.lock();
        state.check(FailurePoint::Remove)?;
        let removable = state
            .records
            .get(hash)
            .is_some_and(|r| !r.requeued && r.owner.as_ref() == Some(owner));
        if removable {
            state.records.remove(hash);
            Ok(1)
        } else {
            Ok(0)
        }
    }

    async fn reap_expired(&self, lifetime: Duration) -> Result<u64> {
        let mut state = self.lock();
        state.check(FailurePoint::Reap)?;
        let Some(cutoff) = chrono::Duration::from_std(lifetime)
            .ok()
            .and_then(|lifetime| state.now().checked_sub_signed(lifetime))
        else {
            return Ok(0);
        };
        let mut reaped = 0;
        for record in state.records.values_mut() {
            if record.is_processing && record.heartbeat_date < cutoff {
                record.is_processing = false;
                record.owner = None;
                record.requeued = false;
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    async fn get(&self, hash: &MessageHash) -> Result<Option<QueueRecord>> {
        let state = self.lock();
        state.check_connected()?;
        Ok(state.records.get(hash).cloned())
    }

    async fn list(&self, limit: i64) -> Result<Vec<QueueRecord>> {
        let state = self.lock();
        state.check_connected()?;
        let mut records: Vec<_> = state.records.values().cloned().collect();
        records.sort_by(|a, b| b.heartbeat_date.cmp(&a.heartbeat_date));
        records.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(records)
    }

    async fn disconnect(&self) -> Result<()> {
        self.lock().disconnected = true;
        Ok(())
    }
}
