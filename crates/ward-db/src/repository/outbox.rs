//! # Outbox Repository
//!
//! The durable write-ahead log of locally-applied mutations.
//!
//! ## The Outbox Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Outbox Lifecycle                                     │
//! │                                                                         │
//! │  Orchestrator (optimistic apply done)                                  │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  add(mutation)  ──►  INSERT status='pending', retry_count=0            │
//! │       │              (durability boundary: nothing is "attempted"      │
//! │       │               before this returns Ok)                          │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │            Push worker / flush loop                             │   │
//! │  │                                                                 │   │
//! │  │  get_pending()   ordered by enqueued_at, then insertion order  │   │
//! │  │  ok        → update_status(id, 'synced')                       │   │
//! │  │  transient → increment_retry(id), record_error(id, msg)        │   │
//! │  │  fatal     → update_status(id, 'failed_fatal')                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  clear_synced(max_age)                                                 │
//! │  • synced        → deleted immediately                                 │
//! │  • failed_fatal  → deleted once failed for longer than max_age         │
//! │  • pending       → NEVER deleted                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use crate::repository::now_millis;
use ward_core::{Mutation, MutationStatus, OutboxStats, Payload, OUTBOX_RETENTION_HOURS};

const TABLE: &str = "outbox";

// =============================================================================
// Row Mapping
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct OutboxRow {
    id: String,
    collection: String,
    operation: String,
    doc_id: String,
    payload: String,
    enqueued_at: i64,
    status: String,
    retry_count: i64,
    last_error: Option<String>,
    updated_at: i64,
}

fn millis_to_datetime(ms: i64) -> DbResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| DbError::corrupt(TABLE, format!("timestamp out of range: {ms}")))
}

impl TryFrom<OutboxRow> for Mutation {
    type Error = DbError;

    fn try_from(row: OutboxRow) -> DbResult<Self> {
        let payload: Payload = serde_json::from_str(&row.payload)
            .map_err(|e| DbError::corrupt(TABLE, format!("payload of {}: {e}", row.id)))?;

        Ok(Mutation {
            collection: row.collection.parse()?,
            operation: row.operation.parse()?,
            status: row.status.parse()?,
            doc_id: row.doc_id,
            payload,
            enqueued_at: millis_to_datetime(row.enqueued_at)?,
            retry_count: u32::try_from(row.retry_count)
                .map_err(|e| DbError::corrupt(TABLE, e))?,
            last_error: row.last_error,
            updated_at: millis_to_datetime(row.updated_at)?,
            id: row.id,
        })
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, collection, operation, doc_id, payload,
           enqueued_at, status, retry_count, last_error, updated_at
    FROM outbox
"#;

// =============================================================================
// Repository
// =============================================================================

/// Repository for outbox (WAL) operations.
#[derive(Debug, Clone)]
pub struct OutboxRepository {
    pool: SqlitePool,
}

impl OutboxRepository {
    /// Creates a new OutboxRepository.
    pub fn new(pool: SqlitePool) -> Self {
        OutboxRepository { pool }
    }

    /// Persists a mutation.
    ///
    /// The stored entry always starts as `pending` with a zero retry count,
    /// whatever the passed value says. Returns the entry as stored.
    pub async fn add(&self, mutation: &Mutation) -> DbResult<Mutation> {
        let now = now_millis();
        let payload = serde_json::to_string(&mutation.payload)?;

        debug!(
            id = %mutation.id,
            collection = %mutation.collection,
            operation = %mutation.operation,
            doc_id = %mutation.doc_id,
            "Appending to outbox"
        );

        sqlx::query(
            r#"
            INSERT INTO outbox (
                id, collection, operation, doc_id, payload,
                enqueued_at, status, retry_count, last_error, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 0, NULL, ?7)
            "#,
        )
        .bind(&mutation.id)
        .bind(mutation.collection.as_str())
        .bind(mutation.operation.as_str())
        .bind(&mutation.doc_id)
        .bind(&payload)
        .bind(mutation.enqueued_at.timestamp_millis())
        .bind(now)
        .execute(&self.pool)
        .await?;

        let mut stored = mutation.clone();
        stored.status = MutationStatus::Pending;
        stored.retry_count = 0;
        stored.last_error = None;
        stored.updated_at = millis_to_datetime(now)?;
        Ok(stored)
    }

    /// Fetches a single entry.
    pub async fn get(&self, id: &str) -> DbResult<Option<Mutation>> {
        let row: Option<OutboxRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Mutation::try_from).transpose()
    }

    /// Returns all pending entries, oldest first.
    ///
    /// Served by `idx_outbox_status`; ties on the enqueue timestamp fall back
    /// to insertion order.
    pub async fn get_pending(&self) -> DbResult<Vec<Mutation>> {
        let rows: Vec<OutboxRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE status = 'pending' ORDER BY enqueued_at ASC, rowid ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Mutation::try_from).collect()
    }

    /// Sets an entry's status. Idempotent.
    ///
    /// Returns false if no entry with this id exists.
    pub async fn update_status(&self, id: &str, status: MutationStatus) -> DbResult<bool> {
        let result = sqlx::query("UPDATE outbox SET status = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(id)
            .bind(status.as_str())
            .bind(now_millis())
            .execute(&self.pool)
            .await?;

        debug!(id = %id, status = %status, "Outbox status updated");
        Ok(result.rows_affected() > 0)
    }

    /// Increments an entry's retry count and returns the new value.
    pub async fn increment_retry(&self, id: &str) -> DbResult<u32> {
        let count: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE outbox SET retry_count = retry_count + 1, updated_at = ?2
            WHERE id = ?1
            RETURNING retry_count
            "#,
        )
        .bind(id)
        .bind(now_millis())
        .fetch_optional(&self.pool)
        .await?;

        let count = count.ok_or_else(|| DbError::not_found("Outbox entry", id))?;
        u32::try_from(count).map_err(|e| DbError::corrupt(TABLE, e))
    }

    /// Stores the last delivery error for an entry.
    pub async fn record_error(&self, id: &str, message: &str) -> DbResult<()> {
        sqlx::query("UPDATE outbox SET last_error = ?2 WHERE id = ?1")
            .bind(id)
            .bind(message)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Returns true if an older pending entry targets the same document.
    ///
    /// "Older" follows the same order as [`get_pending`](Self::get_pending).
    pub async fn has_pending_before(&self, mutation: &Mutation) -> DbResult<bool> {
        let exists: i64 = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM outbox o
                WHERE o.collection = ?1
                  AND o.doc_id = ?2
                  AND o.status = 'pending'
                  AND o.id != ?3
                  AND (
                      o.enqueued_at < ?4
                      OR (o.enqueued_at = ?4 AND o.rowid < COALESCE(
                          (SELECT rowid FROM outbox WHERE id = ?3),
                          9223372036854775807
                      ))
                  )
            )
            "#,
        )
        .bind(mutation.collection.as_str())
        .bind(&mutation.doc_id)
        .bind(&mutation.id)
        .bind(mutation.enqueued_at.timestamp_millis())
        .fetch_one(&self.pool)
        .await?;

        Ok(exists != 0)
    }

    /// Prunes terminal entries.
    ///
    /// - every `synced` entry is deleted
    /// - `failed_fatal` entries whose last transition is older than `max_age`
    ///   are deleted, however long they waited while pending
    /// - `pending` entries are never deleted
    ///
    /// Returns the number of deleted entries.
    pub async fn clear_synced(&self, max_age: Duration) -> DbResult<u64> {
        let cutoff = (Utc::now() - max_age).timestamp_millis();

        let result = sqlx::query(
            r#"
            DELETE FROM outbox
            WHERE status = 'synced'
               OR (status != 'pending' AND updated_at < ?1)
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            info!(deleted, "Outbox cleanup removed terminal entries");
        }
        Ok(deleted)
    }

    /// Runs [`clear_synced`](Self::clear_synced) with the default retention window.
    pub async fn auto_cleanup(&self) -> DbResult<u64> {
        self.clear_synced(Duration::hours(OUTBOX_RETENTION_HOURS))
            .await
    }

    /// Returns entry counts by status.
    pub async fn get_stats(&self) -> DbResult<OutboxStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM outbox GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = OutboxStats::default();
        for (status, count) in rows {
            let count = u64::try_from(count).map_err(|e| DbError::corrupt(TABLE, e))?;
            match status.parse::<MutationStatus>()? {
                MutationStatus::Pending => stats.pending = count,
                MutationStatus::Synced => stats.synced = count,
                MutationStatus::FailedFatal => stats.failed_fatal = count,
            }
        }
        Ok(stats)
    }

    /// Counts pending entries.
    pub async fn count_pending(&self) -> DbResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox WHERE status = 'pending'")
            .fetch_one(&self.pool)
            .await?;
        u64::try_from(count).map_err(|e| DbError::corrupt(TABLE, e))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use serde_json::json;
    use ward_core::{Collection, MutationOp};

    async fn repo() -> OutboxRepository {
        Database::new(DbConfig::in_memory()).await.unwrap().outbox()
    }

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn task_update(doc_id: &str) -> Mutation {
        Mutation::new(
            Collection::Tasks,
            MutationOp::Update,
            doc_id,
            payload(json!({"completed": true})),
        )
    }

    #[tokio::test]
    async fn test_add_forces_pending() {
        let repo = repo().await;
        let mut m = task_update("t-1");
        m.status = MutationStatus::Synced;
        m.retry_count = 7;

        let stored = repo.add(&m).await.unwrap();
        assert_eq!(stored.status, MutationStatus::Pending);
        assert_eq!(stored.retry_count, 0);

        let fetched = repo.get(&m.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, MutationStatus::Pending);
        assert_eq!(fetched.retry_count, 0);
        assert_eq!(fetched.payload, m.payload);
        assert_eq!(fetched.enqueued_at, m.enqueued_at);
        assert_eq!(fetched.doc_id, "t-1");
    }

    #[tokio::test]
    async fn test_duplicate_id_is_rejected() {
        let repo = repo().await;
        let m = task_update("t-1");
        repo.add(&m).await.unwrap();
        assert!(matches!(
            repo.add(&m).await,
            Err(DbError::UniqueViolation { .. })
        ));
    }

    #[tokio::test]
    async fn test_get_pending_orders_by_enqueue_time() {
        let repo = repo().await;
        let base = Utc::now();
        let later = task_update("t-1").enqueued_at(base + Duration::seconds(5));
        let earlier = task_update("t-2").enqueued_at(base);
        let same_as_later = task_update("t-3").enqueued_at(base + Duration::seconds(5));

        repo.add(&later).await.unwrap();
        repo.add(&earlier).await.unwrap();
        repo.add(&same_as_later).await.unwrap();

        let pending = repo.get_pending().await.unwrap();
        let ids: Vec<_> = pending.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec![earlier.id.as_str(), later.id.as_str(), same_as_later.id.as_str()]);
    }

    #[tokio::test]
    async fn test_update_status_is_idempotent() {
        let repo = repo().await;
        let m = task_update("t-1");
        repo.add(&m).await.unwrap();

        assert!(repo.update_status(&m.id, MutationStatus::Synced).await.unwrap());
        assert!(repo.update_status(&m.id, MutationStatus::Synced).await.unwrap());
        assert!(!repo.update_status("missing", MutationStatus::Synced).await.unwrap());

        assert!(repo.get_pending().await.unwrap().is_empty());
        assert_eq!(repo.get_stats().await.unwrap().synced, 1);
    }

    #[tokio::test]
    async fn test_increment_retry_and_error() {
        let repo = repo().await;
        let m = task_update("t-1");
        repo.add(&m).await.unwrap();

        assert_eq!(repo.increment_retry(&m.id).await.unwrap(), 1);
        assert_eq!(repo.increment_retry(&m.id).await.unwrap(), 2);
        repo.record_error(&m.id, "unavailable").await.unwrap();

        let fetched = repo.get(&m.id).await.unwrap().unwrap();
        assert_eq!(fetched.retry_count, 2);
        assert_eq!(fetched.last_error.as_deref(), Some("unavailable"));
        assert!(fetched.is_pending());

        assert!(matches!(
            repo.increment_retry("missing").await,
            Err(DbError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_has_pending_before() {
        let repo = repo().await;
        let base = Utc::now();
        let first = task_update("t-1").enqueued_at(base);
        let second = task_update("t-1").enqueued_at(base + Duration::milliseconds(10));
        let other_doc = task_update("t-2").enqueued_at(base + Duration::milliseconds(20));

        repo.add(&first).await.unwrap();
        repo.add(&second).await.unwrap();
        repo.add(&other_doc).await.unwrap();

        assert!(!repo.has_pending_before(&first).await.unwrap());
        assert!(repo.has_pending_before(&second).await.unwrap());
        assert!(!repo.has_pending_before(&other_doc).await.unwrap());

        repo.update_status(&first.id, MutationStatus::Synced).await.unwrap();
        assert!(!repo.has_pending_before(&second).await.unwrap());
    }

    #[tokio::test]
    async fn test_has_pending_before_same_millisecond_uses_insertion_order() {
        let repo = repo().await;
        let at = Utc::now();
        let first = task_update("t-1").enqueued_at(at);
        let second = task_update("t-1").enqueued_at(at);

        repo.add(&first).await.unwrap();
        repo.add(&second).await.unwrap();

        assert!(!repo.has_pending_before(&first).await.unwrap());
        assert!(repo.has_pending_before(&second).await.unwrap());
    }

    async fn backdate(repo: &OutboxRepository, id: &str, at: DateTime<Utc>) {
        sqlx::query("UPDATE outbox SET updated_at = ?2 WHERE id = ?1")
            .bind(id)
            .bind(at.timestamp_millis())
            .execute(&repo.pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_never_deletes_pending() {
        let repo = repo().await;
        let ancient = Utc::now() - Duration::days(30);

        let old_pending = task_update("t-1").enqueued_at(ancient);
        let old_failed = task_update("t-2").enqueued_at(ancient);
        let fresh_failed = task_update("t-3");
        let fresh_synced = task_update("t-4");

        for m in [&old_pending, &old_failed, &fresh_failed, &fresh_synced] {
            repo.add(m).await.unwrap();
        }
        repo.update_status(&old_failed.id, MutationStatus::FailedFatal).await.unwrap();
        repo.update_status(&fresh_failed.id, MutationStatus::FailedFatal).await.unwrap();
        repo.update_status(&fresh_synced.id, MutationStatus::Synced).await.unwrap();
        backdate(&repo, &old_pending.id, ancient).await;
        backdate(&repo, &old_failed.id, ancient).await;

        let deleted = repo.auto_cleanup().await.unwrap();
        assert_eq!(deleted, 2);

        assert!(repo.get(&old_pending.id).await.unwrap().is_some());
        assert!(repo.get(&fresh_failed.id).await.unwrap().is_some());
        assert!(repo.get(&old_failed.id).await.unwrap().is_none());
        assert!(repo.get(&fresh_synced.id).await.unwrap().is_none());

        let stats = repo.get_stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.failed_fatal, 1);
        assert_eq!(stats.synced, 0);
        assert_eq!(stats.total(), 2);
    }

    #[tokio::test]
    async fn test_retention_counts_from_failure_not_enqueue() {
        let repo = repo().await;
        // waited offline for two days, then demoted just now
        let late = task_update("t-1").enqueued_at(Utc::now() - Duration::hours(48));
        repo.add(&late).await.unwrap();
        repo.update_status(&late.id, MutationStatus::FailedFatal).await.unwrap();

        assert_eq!(repo.auto_cleanup().await.unwrap(), 0);
        assert!(repo.get(&late.id).await.unwrap().is_some());

        backdate(&repo, &late.id, Utc::now() - Duration::hours(25)).await;
        assert_eq!(repo.auto_cleanup().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stats_empty() {
        let repo = repo().await;
        assert_eq!(repo.get_stats().await.unwrap(), OutboxStats::default());
        assert_eq!(repo.count_pending().await.unwrap(), 0);
    }
}
