// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory persistence implementation.
//!
//! Used by tests and by the orchestrator binary when no database path is
//! configured. State is lost when the process exits.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;

use super::{EntityStore, QueryFilter, StoredRecord};
use crate::error::{Result, StoreError};

type Key = (String, String, String);

/// In-memory store backed by an ordered map.
#[derive(Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<BTreeMap<Key, StoredRecord>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records across all tables.
    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    /// True when nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    /// Overwrite the timestamp of a stored record.
    ///
    /// Lets tests age records without waiting; the etag is left untouched.
    pub async fn backdate(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        timestamp: chrono::DateTime<Utc>,
    ) -> Result<()> {
        let mut records = self.records.lock().await;
        let key = key(table, partition_key, row_key);
        let record = records
            .get_mut(&key)
            .ok_or_else(|| StoreError::not_found(table, partition_key, row_key))?;
        record.timestamp = Some(timestamp);
        Ok(())
    }
}

fn key(table: &str, partition_key: &str, row_key: &str) -> Key {
    (
        table.to_string(),
        partition_key.to_string(),
        row_key.to_string(),
    )
}

#[async_trait::async_trait]
impl EntityStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn get(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<StoredRecord>> {
        let records = self.records.lock().await;
        Ok(records.get(&key(table, partition_key, row_key)).cloned())
    }

    async fn query(&self, table: &str, filter: &QueryFilter) -> Result<Vec<StoredRecord>> {
        let records = self.records.lock().await;
        let matching = records
            .iter()
            .filter(|((t, _, _), _)| t == table)
            .map(|(_, record)| record)
            .filter(|record| filter.matches(record))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(matching)
    }

    async fn insert(&self, record: StoredRecord) -> Result<StoredRecord> {
        let mut records = self.records.lock().await;
        let key = key(&record.table, &record.partition_key, &record.row_key);
        if records.contains_key(&key) {
            return Err(StoreError::already_exists(
                &record.table,
                &record.partition_key,
                &record.row_key,
            ));
        }

        let stored = record.stamped(Utc::now());
        records.insert(key, stored.clone());
        Ok(stored)
    }

    async fn replace(&self, record: StoredRecord) -> Result<StoredRecord> {
        let mut records = self.records.lock().await;
        let key = key(&record.table, &record.partition_key, &record.row_key);

        if let Some(expected) = &record.etag {
            match records.get(&key) {
                Some(existing) if existing.etag.as_ref() == Some(expected) => {}
                _ => {
                    return Err(StoreError::conflict(
                        &record.table,
                        &record.partition_key,
                        &record.row_key,
                    ));
                }
            }
        }

        let stored = record.stamped(Utc::now());
        records.insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        etag: Option<&str>,
    ) -> Result<bool> {
        let mut records = self.records.lock().await;
        let key = key(table, partition_key, row_key);

        let Some(existing) = records.get(&key) else {
            return Ok(false);
        };

        if let Some(expected) = etag
            && existing.etag.as_deref() != Some(expected)
        {
            return Err(StoreError::conflict(table, partition_key, row_key));
        }

        records.remove(&key);
        Ok(true)
    }
}
