// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::debug;

use super::{EntityStore, QueryFilter, StoredRecord};
use crate::error::{Result, StoreError};

type Row = (String, String, String, String, DateTime<Utc>, String);

/// SQLite-backed entity store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a store from an existing pool. The schema must already exist;
    /// see [`SqliteStore::ensure_schema`].
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a store from a file path.
    ///
    /// Creates parent directories and the database file if needed, connects
    /// and applies the schema.
    ///
    /// ```ignore
    /// let store = SqliteStore::from_path(".data/fuzzfleet.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        let store = Self { pool };
        store.ensure_schema().await?;

        debug!(path = %path.display(), "SQLite entity store ready");
        Ok(store)
    }

    /// Connect to a private in-memory database. Intended for tests.
    pub async fn in_memory() -> Result<Self> {
        // A single connection keeps every query on the same in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Create the entity table if it does not exist.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(include_str!("../../migrations/schema.sql"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn from_row(row: Row) -> Result<StoredRecord> {
    let (table, partition_key, row_key, etag, updated_at, body) = row;
    Ok(StoredRecord {
        table,
        partition_key,
        row_key,
        etag: Some(etag),
        timestamp: Some(updated_at),
        body: serde_json::from_str(&body)?,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait::async_trait]
impl EntityStore for SqliteStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn get(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<StoredRecord>> {
        let row = sqlx::query_as::<_, Row>(
            r#"
            SELECT table_name, partition_key, row_key, etag, updated_at, body
            FROM entities
            WHERE table_name = ? AND partition_key = ? AND row_key = ?
            "#,
        )
        .bind(table)
        .bind(partition_key)
        .bind(row_key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(from_row).transpose()
    }

    async fn query(&self, table: &str, filter: &QueryFilter) -> Result<Vec<StoredRecord>> {
        // Partition narrowing happens in SQL; body conditions are evaluated
        // on the decoded JSON.
        let rows = match &filter.partition_key {
            Some(pk) => {
                sqlx::query_as::<_, Row>(
                    r#"
                    SELECT table_name, partition_key, row_key, etag, updated_at, body
                    FROM entities
                    WHERE table_name = ? AND partition_key = ?
                    ORDER BY partition_key, row_key
                    "#,
                )
                .bind(table)
                .bind(pk)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Row>(
                    r#"
                    SELECT table_name, partition_key, row_key, etag, updated_at, body
                    FROM entities
                    WHERE table_name = ?
                    ORDER BY partition_key, row_key
                    "#,
                )
                .bind(table)
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut records = Vec::new();
        for row in rows {
            let record = from_row(row)?;
            if filter.matches(&record) {
                records.push(record);
                if filter.limit.is_some_and(|limit| records.len() >= limit) {
                    break;
                }
            }
        }
        Ok(records)
    }

    async fn insert(&self, record: StoredRecord) -> Result<StoredRecord> {
        let stored = record.stamped(Utc::now());
        let body = serde_json::to_string(&stored.body)?;

        let result = sqlx::query(
            r#"
            INSERT INTO entities (table_name, partition_key, row_key, etag, updated_at, body)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&stored.table)
        .bind(&stored.partition_key)
        .bind(&stored.row_key)
        .bind(&stored.etag)
        .bind(stored.timestamp)
        .bind(body)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(stored),
            Err(e) if is_unique_violation(&e) => Err(StoreError::already_exists(
                &stored.table,
                &stored.partition_key,
                &stored.row_key,
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn replace(&self, record: StoredRecord) -> Result<StoredRecord> {
        let expected = record.etag.clone();
        let stored = record.stamped(Utc::now());
        let body = serde_json::to_string(&stored.body)?;

        match expected {
            Some(expected) => {
                let result = sqlx::query(
                    r#"
                    UPDATE entities
                    SET etag = ?, updated_at = ?, body = ?
                    WHERE table_name = ? AND partition_key = ? AND row_key = ? AND etag = ?
                    "#,
                )
                .bind(&stored.etag)
                .bind(stored.timestamp)
                .bind(body)
                .bind(&stored.table)
                .bind(&stored.partition_key)
                .bind(&stored.row_key)
                .bind(expected)
                .execute(&self.pool)
                .await?;

                if result.rows_affected() == 0 {
                    return Err(StoreError::conflict(
                        &stored.table,
                        &stored.partition_key,
                        &stored.row_key,
                    ));
                }
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO entities (table_name, partition_key, row_key, etag, updated_at, body)
                    VALUES (?, ?, ?, ?, ?, ?)
                    ON CONFLICT (table_name, partition_key, row_key)
                    DO UPDATE SET etag = excluded.etag,
                                  updated_at = excluded.updated_at,
                                  body = excluded.body
                    "#,
                )
                .bind(&stored.table)
                .bind(&stored.partition_key)
                .bind(&stored.row_key)
                .bind(&stored.etag)
                .bind(stored.timestamp)
                .bind(body)
                .execute(&self.pool)
                .await?;
            }
        }

        Ok(stored)
    }

    async fn delete(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        etag: Option<&str>,
    ) -> Result<bool> {
        let Some(expected) = etag else {
            let result = sqlx::query(
                r#"
                DELETE FROM entities
                WHERE table_name = ? AND partition_key = ? AND row_key = ?
                "#,
            )
            .bind(table)
            .bind(partition_key)
            .bind(row_key)
            .execute(&self.pool)
            .await?;
            return Ok(result.rows_affected() > 0);
        };

        let result = sqlx::query(
            r#"
            DELETE FROM entities
            WHERE table_name = ? AND partition_key = ? AND row_key = ? AND etag = ?
            "#,
        )
        .bind(table)
        .bind(partition_key)
        .bind(row_key)
        .bind(expected)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        // Nothing deleted: either the row is gone or its etag moved on.
        match self.get(table, partition_key, row_key).await? {
            Some(_) => Err(StoreError::conflict(table, partition_key, row_key)),
            None => Ok(false),
        }
    }
}
