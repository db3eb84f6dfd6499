// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for fuzzfleet-store.
//!
//! This module defines the raw record abstraction and backend implementations.
//! Records are addressed by `(table, partition_key, row_key)` and carry an
//! etag that changes on every write.

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryStore;
pub use self::sqlite::SqliteStore;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::Result;

/// A stored record as seen by the persistence layer.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    /// Logical table (one per entity type).
    pub table: String,
    /// Partition key.
    pub partition_key: String,
    /// Row key, unique within the partition.
    pub row_key: String,
    /// Version tag. `None` on records that were never written.
    pub etag: Option<String>,
    /// Time of the last successful write.
    pub timestamp: Option<DateTime<Utc>>,
    /// Entity body as a JSON object.
    pub body: Value,
}

impl StoredRecord {
    /// Create an unsaved record.
    pub fn new(
        table: impl Into<String>,
        partition_key: impl Into<String>,
        row_key: impl Into<String>,
        body: Value,
    ) -> Self {
        Self {
            table: table.into(),
            partition_key: partition_key.into(),
            row_key: row_key.into(),
            etag: None,
            timestamp: None,
            body,
        }
    }

    /// Stamp a fresh etag and timestamp, as done by every backend on write.
    pub(crate) fn stamped(mut self, now: DateTime<Utc>) -> Self {
        self.etag = Some(uuid::Uuid::new_v4().to_string());
        self.timestamp = Some(now);
        self
    }
}

/// Filter for [`EntityStore::query`].
///
/// All conditions are combined with AND; the values of a single `field_in`
/// condition are combined with OR.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    /// Restrict to one partition.
    pub partition_key: Option<String>,
    /// `(field, allowed values)` pairs matched against top-level body fields.
    pub field_in: Vec<(String, Vec<Value>)>,
    /// Only records last written strictly before this instant.
    pub updated_before: Option<DateTime<Utc>>,
    /// Only records last written strictly after this instant.
    pub updated_after: Option<DateTime<Utc>>,
    /// Maximum number of records to return.
    pub limit: Option<usize>,
}

impl QueryFilter {
    /// An empty filter matching every record of a table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the query to a single partition.
    pub fn partition(mut self, partition_key: impl Into<String>) -> Self {
        self.partition_key = Some(partition_key.into());
        self
    }

    /// Require `field` to equal one of `values`.
    ///
    /// An empty value list matches nothing.
    pub fn field_in<I, V>(mut self, field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.field_in
            .push((field.into(), values.into_iter().map(Into::into).collect()));
        self
    }

    /// Require `field` to equal `value`.
    pub fn field_eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.field_in(field, [value.into()])
    }

    /// Only records written before `instant`.
    pub fn updated_before(mut self, instant: DateTime<Utc>) -> Self {
        self.updated_before = Some(instant);
        self
    }

    /// Only records written after `instant`.
    pub fn updated_after(mut self, instant: DateTime<Utc>) -> Self {
        self.updated_after = Some(instant);
        self
    }

    /// Cap the number of returned records.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Check whether a record satisfies every condition except `limit`.
    pub fn matches(&self, record: &StoredRecord) -> bool {
        if let Some(pk) = &self.partition_key
            && pk != &record.partition_key
        {
            return false;
        }

        if let Some(before) = self.updated_before {
            match record.timestamp {
                Some(ts) if ts < before => {}
                _ => return false,
            }
        }

        if let Some(after) = self.updated_after {
            match record.timestamp {
                Some(ts) if ts > after => {}
                _ => return false,
            }
        }

        self.field_in.iter().all(|(field, values)| {
            let actual = record.body.get(field).unwrap_or(&Value::Null);
            values.iter().any(|v| v == actual)
        })
    }
}

/// Raw persistence backend.
///
/// Implementations must make `insert`, `replace` and `delete` atomic with
/// respect to the etag check so that two writers racing on the same record
/// cannot both succeed.
#[async_trait::async_trait]
pub trait EntityStore: Send + Sync {
    /// Backend name for logging.
    fn backend_name(&self) -> &'static str;

    /// Fetch a single record.
    async fn get(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<StoredRecord>>;

    /// Fetch every record of `table` matching `filter`, ordered by key.
    async fn query(&self, table: &str, filter: &QueryFilter) -> Result<Vec<StoredRecord>>;

    /// Insert a new record, failing with `AlreadyExists` if the key is taken.
    async fn insert(&self, record: StoredRecord) -> Result<StoredRecord>;

    /// Replace a record.
    ///
    /// With an etag this is a compare-and-swap that fails with
    /// `ConcurrencyConflict` when the stored etag differs or the record is
    /// gone. Without an etag the record is upserted.
    async fn replace(&self, record: StoredRecord) -> Result<StoredRecord>;

    /// Delete a record. Returns `false` when nothing was stored under the key.
    async fn delete(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        etag: Option<&str>,
    ) -> Result<bool>;
}
