//! Persistence of host records.
//!
//! [`SqliteStore`] is used when a database is configured, [`MemoryStore`] otherwise.

use alloc::collections::BTreeMap;
use core::str::FromStr as _;
use std::{
    path::Path,
    sync::{Mutex, PoisonError},
};

use chrono::Utc;
use futures::future::BoxFuture;
use hostwatch_common::HostRecord;
use sqlx::{
    Row as _, SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum StoreError {
    #[error("Database query failed")]
    Sqlx(#[from] sqlx::Error),
    #[error("Database migration failed")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("Stored host record is not valid JSON")]
    Serde(#[from] serde_json::Error),
    #[error("Only hosts with a uuid can be persisted")]
    MissingUuid,
}

/// Durable storage for host records, keyed by uuid.
pub trait HostStore: Send + Sync {
    fn load_all(&self) -> BoxFuture<'_, Result<Vec<HostRecord>, StoreError>>;

    /// Insert or replace the record with the same uuid.
    fn upsert<'future_life>(
        &'future_life self,
        record: &'future_life HostRecord,
    ) -> BoxFuture<'future_life, Result<(), StoreError>>;

    /// Deleting an unknown uuid is not an error.
    fn delete<'future_life>(
        &'future_life self,
        uuid: &'future_life str,
    ) -> BoxFuture<'future_life, Result<(), StoreError>>;
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and apply migrations.
    ///
    /// `:memory:` opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let pool = if path == Path::new(":memory:") {
            // Every connection to :memory: is its own database, so keep exactly one alive.
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?)
                .await?
        } else {
            let options = SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal);
            SqlitePoolOptions::new().connect_with(options).await?
        };
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }
}

impl HostStore for SqliteStore {
    fn load_all(&self) -> BoxFuture<'_, Result<Vec<HostRecord>, StoreError>> {
        Box::pin(async move {
            let rows = sqlx::query("SELECT record FROM hosts ORDER BY uuid")
                .fetch_all(&self.pool)
                .await?;
            rows.iter()
                .map(|row| -> Result<HostRecord, StoreError> {
                    let json: String = row.try_get("record")?;
                    Ok(serde_json::from_str(&json)?)
                })
                .collect()
        })
    }

    fn upsert<'future_life>(
        &'future_life self,
        record: &'future_life HostRecord,
    ) -> BoxFuture<'future_life, Result<(), StoreError>> {
        Box::pin(async move {
            let uuid = record.uuid.as_deref().ok_or(StoreError::MissingUuid)?;
            let json = serde_json::to_string(record)?;
            sqlx::query(
                "INSERT INTO hosts (uuid, name, record, updated_at) VALUES (?, ?, ?, ?) \
                 ON CONFLICT(uuid) DO UPDATE SET \
                 name = excluded.name, record = excluded.record, updated_at = excluded.updated_at",
            )
            .bind(uuid)
            .bind(&record.name)
            .bind(json)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn delete<'future_life>(
        &'future_life self,
        uuid: &'future_life str,
    ) -> BoxFuture<'future_life, Result<(), StoreError>> {
        Box::pin(async move {
            sqlx::query("DELETE FROM hosts WHERE uuid = ?")
                .bind(uuid)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
    }
}

/// Keeps records for the lifetime of the process only.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<String, HostRecord>>,
}

impl HostStore for MemoryStore {
    fn load_all(&self) -> BoxFuture<'_, Result<Vec<HostRecord>, StoreError>> {
        let records = self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        Box::pin(async move { Ok(records) })
    }

    fn upsert<'future_life>(
        &'future_life self,
        record: &'future_life HostRecord,
    ) -> BoxFuture<'future_life, Result<(), StoreError>> {
        let result = record
            .uuid
            .clone()
            .ok_or(StoreError::MissingUuid)
            .map(|uuid| {
                self.records
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(uuid, record.clone());
            });
        Box::pin(async move { result })
    }

    fn delete<'future_life>(
        &'future_life self,
        uuid: &'future_life str,
    ) -> BoxFuture<'future_life, Result<(), StoreError>> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(uuid);
        Box::pin(async move { Ok(()) })
    }
}
