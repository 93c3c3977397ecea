//! # Record Cache Repository
//!
//! Durable mirror of the last server snapshot per collection.
//!
//! Inbound listeners write each snapshot here with
//! [`replace_collection`](RecordCacheRepository::replace_collection); at
//! startup the app reads it back to hydrate the store before any network
//! traffic. Records are kept in the order they were last written.

use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{DbError, DbResult};
use crate::repository::now_millis;
use ward_core::{Collection, Record};

const TABLE: &str = "records";

#[derive(Debug, sqlx::FromRow)]
struct RecordRow {
    id: String,
    data: String,
}

impl TryFrom<RecordRow> for Record {
    type Error = DbError;

    fn try_from(row: RecordRow) -> DbResult<Self> {
        let mut record: Record = serde_json::from_str(&row.data)
            .map_err(|e| DbError::corrupt(TABLE, format!("record {}: {e}", row.id)))?;
        record.id = row.id;
        Ok(record)
    }
}

/// Repository for the local record cache.
#[derive(Debug, Clone)]
pub struct RecordCacheRepository {
    pool: SqlitePool,
}

impl RecordCacheRepository {
    /// Creates a new RecordCacheRepository.
    pub fn new(pool: SqlitePool) -> Self {
        RecordCacheRepository { pool }
    }

    /// Fetches one cached record.
    pub async fn get(&self, collection: Collection, id: &str) -> DbResult<Option<Record>> {
        let row: Option<RecordRow> =
            sqlx::query_as("SELECT id, data FROM records WHERE collection = ?1 AND id = ?2")
                .bind(collection.as_str())
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(Record::try_from).transpose()
    }

    /// Returns every cached record of a collection.
    pub async fn get_all(&self, collection: Collection) -> DbResult<Vec<Record>> {
        let rows: Vec<RecordRow> =
            sqlx::query_as("SELECT id, data FROM records WHERE collection = ?1 ORDER BY rowid")
                .bind(collection.as_str())
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(Record::try_from).collect()
    }

    /// Inserts or replaces a cached record.
    pub async fn put(&self, collection: Collection, record: &Record) -> DbResult<()> {
        let data = serde_json::to_string(record)?;

        sqlx::query(
            r#"
            INSERT INTO records (collection, id, unit_id, data, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (collection, id) DO UPDATE SET
                unit_id = excluded.unit_id,
                data = excluded.data,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(collection.as_str())
        .bind(&record.id)
        .bind(record.unit_id.as_deref())
        .bind(&data)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Removes a cached record. Returns false if it wasn't cached.
    pub async fn delete(&self, collection: Collection, id: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM records WHERE collection = ?1 AND id = ?2")
            .bind(collection.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Removes every cached record of a collection.
    pub async fn clear(&self, collection: Collection) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM records WHERE collection = ?1")
            .bind(collection.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Replaces a collection's cache with a server snapshot, atomically.
    pub async fn replace_collection(
        &self,
        collection: Collection,
        records: &[Record],
    ) -> DbResult<()> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM records WHERE collection = ?1")
            .bind(collection.as_str())
            .execute(&mut *tx)
            .await?;

        for record in records {
            let data = serde_json::to_string(record)?;
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO records (collection, id, unit_id, data, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
            )
            .bind(collection.as_str())
            .bind(&record.id)
            .bind(record.unit_id.as_deref())
            .bind(&data)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!(
            collection = %collection,
            count = records.len(),
            "Record cache replaced"
        );
        Ok(())
    }

    /// Counts cached records of a collection.
    pub async fn count(&self, collection: Collection) -> DbResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records WHERE collection = ?1")
            .bind(collection.as_str())
            .fetch_one(&self.pool)
            .await?;
        u64::try_from(count).map_err(|e| DbError::corrupt(TABLE, e))
    }
}
