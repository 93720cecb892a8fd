//! Queue record statements and the `RecordStore` implementation for `Db`.
//!
//! Statement text is built once per table at connect time; every call only
//! binds parameters.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgConnection;
use tracing::warn;

use super::Db;
use crate::error::Result;
use crate::model::{MessageHash, NewRecord, OwnerToken, QueueRecord, TopicFilter};
use crate::store::RecordStore;

/// Unclaimed rows considered per claim attempt. The final pick is random
/// within this sample, which keeps `ORDER BY random()` off the full table.
const CANDIDATE_SAMPLE: i64 = 32;

const COLUMNS: &str = "hash, message, topic, is_processing, owner, heartbeat_date, requeued";

/// Parameterized statements for one table.
pub(crate) struct Statements {
    insert: String,
    mark_requeued: String,
    select_candidate: String,
    claim: String,
    heartbeat: String,
    release: String,
    remove: String,
    reap: String,
    get: String,
    list: String,
}

impl Statements {
    pub(crate) fn for_table(t: &str) -> Self {
        Self {
            insert: format!(
                "INSERT INTO {t} (hash, message, topic, heartbeat_date) VALUES ($1, $2, $3, now())"
            ),
            mark_requeued: format!(
                "UPDATE {t} SET requeued = TRUE WHERE hash = $1 AND is_processing = TRUE"
            ),
            // Rows locked by a concurrent claim are skipped, not waited on;
            // the claim step stays atomic either way.
            select_candidate: format!(
                "SELECT hash FROM {t}
                 WHERE hash IN (
                     SELECT hash FROM {t}
                     WHERE is_processing = FALSE AND (topic = ANY($1) OR topic IS NULL)
                     LIMIT $2
                 )
                 AND is_processing = FALSE
                 ORDER BY random()
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED"
            ),
            claim: format!(
                "UPDATE {t} SET is_processing = TRUE, owner = $1, heartbeat_date = now()
                 WHERE hash = $2
                 RETURNING {COLUMNS}"
            ),
            heartbeat: format!(
                "UPDATE {t} SET heartbeat_date = now()
                 WHERE hash = $1 AND is_processing = TRUE AND owner = $2"
            ),
            release: format!(
                "UPDATE {t} SET owner = NULL, is_processing = FALSE, requeued = FALSE
                 WHERE hash = $1 AND owner = $2"
            ),
            remove: format!("DELETE FROM {t} WHERE hash = $1 AND requeued = FALSE AND owner = $2"),
            reap: format!(
                "UPDATE {t} SET is_processing = FALSE, owner = NULL, requeued = FALSE
                 WHERE is_processing = TRUE
                 AND heartbeat_date < now() - make_interval(secs => $1)"
            ),
            get: format!("SELECT {COLUMNS} FROM {t} WHERE hash = $1"),
            list: format!("SELECT {COLUMNS} FROM {t} ORDER BY heartbeat_date DESC LIMIT $1"),
        }
    }
}

#[async_trait]
impl RecordStore for Db {
    async fn insert(&self, record: &NewRecord) -> Result<()> {
        sqlx::query(&self.sql.insert)
            .bind(record.hash().as_str())
            .bind(record.message())
            .bind(record.topic())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_requeued(&self, hash: &MessageHash) -> Result<u64> {
        let rows = sqlx::query(&self.sql.mark_requeued)
            .bind(hash.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(rows)
    }

    async fn claim_next(
        &self,
        topics: &TopicFilter,
        owner: &OwnerToken,
    ) -> Result<Option<QueueRecord>> {
        let mut tx = self.pool.begin().await?;

        match claim_in(&mut *tx, &self.sql, topics, owner).await {
            Ok(claimed) => {
                tx.commit().await?;
                Ok(claimed)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "rollback after failed claim also failed");
                }
                Err(e)
            }
        }
    }

    async fn heartbeat(&self, hash: &MessageHash, owner: &OwnerToken) -> Result<u64> {
        let rows = sqlx::query(&self.sql.heartbeat)
            .bind(hash.as_str())
            .bind(owner.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(rows)
    }

    async fn release(&self, hash: &MessageHash, owner: &OwnerToken) -> Result<u64> {
        let rows = sqlx::query(&self.sql.release)
            .bind(hash.as_str())
            .bind(owner.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(rows)
    }

    async fn remove(&self, hash: &MessageHash, owner: &OwnerToken) -> Result<u64> {
        let rows = sqlx::query(&self.sql.remove)
            .bind(hash.as_str())
            .bind(owner.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(rows)
    }

    async fn reap_expired(&self, lifetime: Duration) -> Result<u64> {
        let rows = sqlx::query(&self.sql.reap)
            .bind(lifetime.as_secs_f64())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(rows)
    }

    async fn get(&self, hash: &MessageHash) -> Result<Option<QueueRecord>> {
        let row: Option<RecordRow> = sqlx::query_as(&self.sql.get)
            .bind(hash.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(RecordRow::into_record))
    }

    async fn list(&self, limit: i64) -> Result<Vec<QueueRecord>> {
        let rows: Vec<RecordRow> = sqlx::query_as(&self.sql.list)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(RecordRow::into_record).collect())
    }

    async fn disconnect(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

/// Select-for-update then claim, on the transaction's connection.
async fn claim_in(
    conn: &mut PgConnection,
    sql: &Statements,
    topics: &TopicFilter,
    owner: &OwnerToken,
) -> Result<Option<QueueRecord>> {
    let candidate: Option<(String,)> = sqlx::query_as(&sql.select_candidate)
        .bind(topics.as_slice())
        .bind(CANDIDATE_SAMPLE)
        .fetch_optional(&mut *conn)
        .await?;

    let Some((hash,)) = candidate else {
        return Ok(None);
    };

    let row: RecordRow = sqlx::query_as(&sql.claim)
        .bind(owner.as_str())
        .bind(&hash)
        .fetch_one(&mut *conn)
        .await?;

    Ok(Some(row.into_record()))
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct RecordRow {
    hash: String,
    message: String,
    topic: Option<String>,
    is_processing: bool,
    owner: Option<String>,
    heartbeat_date: chrono::DateTime<chrono::Utc>,
    requeued: bool,
}

impl RecordRow {
    fn into_record(self) -> QueueRecord {
        QueueRecord {
            hash: MessageHash::from_hex(self.hash),
            message: self.message,
            topic: self.topic,
            is_processing: self.is_processing,
            owner: self.owner.map(OwnerToken::from_raw),
            heartbeat_date: self.heartbeat_date,
            requeued: self.requeued,
        }
    }
}
