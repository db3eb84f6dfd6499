// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed entity layer over [`EntityStore`].
//!
//! Entities are plain serde structs. Their storage metadata (etag and last
//! write time) lives in an [`EntityMeta`] field that is skipped by serde and
//! filled in by [`Store`] on every read and write.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Result, StoreError};
use crate::persistence::{EntityStore, QueryFilter, StoredRecord};

/// Storage metadata attached to an entity value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityMeta {
    /// Etag of the version this value was read from or written as.
    pub etag: Option<String>,
    /// Last write time of that version.
    pub timestamp: Option<DateTime<Utc>>,
}

impl EntityMeta {
    /// True when the value has never been persisted.
    pub fn is_new(&self) -> bool {
        self.etag.is_none()
    }
}

/// A value that can be stored in the entity store.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Logical table name.
    const TABLE: &'static str;

    /// Partition key of this value.
    fn partition_key(&self) -> String;

    /// Row key of this value.
    fn row_key(&self) -> String;

    /// Storage metadata.
    fn meta(&self) -> &EntityMeta;

    /// Mutable storage metadata.
    fn meta_mut(&mut self) -> &mut EntityMeta;
}

/// Typed handle over a shared [`EntityStore`] backend.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn EntityStore>,
}

impl Store {
    /// Wrap a backend.
    pub fn new(backend: Arc<dyn EntityStore>) -> Self {
        Self { backend }
    }

    /// The raw backend.
    pub fn backend(&self) -> &Arc<dyn EntityStore> {
        &self.backend
    }

    /// Fetch an entity by key.
    pub async fn get<E: Entity>(&self, partition_key: &str, row_key: &str) -> Result<Option<E>> {
        self.backend
            .get(E::TABLE, partition_key, row_key)
            .await?
            .map(decode)
            .transpose()
    }

    /// Fetch an entity by key, failing with `NotFound` if missing.
    pub async fn require<E: Entity>(&self, partition_key: &str, row_key: &str) -> Result<E> {
        self.get(partition_key, row_key)
            .await?
            .ok_or_else(|| StoreError::not_found(E::TABLE, partition_key, row_key))
    }

    /// Query entities of one type.
    pub async fn query<E: Entity>(&self, filter: &QueryFilter) -> Result<Vec<E>> {
        self.backend
            .query(E::TABLE, filter)
            .await?
            .into_iter()
            .map(decode)
            .collect()
    }

    /// Query entities of one type and return the first match.
    pub async fn query_one<E: Entity>(&self, filter: &QueryFilter) -> Result<Option<E>> {
        let mut filter = filter.clone();
        filter.limit = Some(1);
        Ok(self.query(&filter).await?.into_iter().next())
    }

    /// Insert a new entity. Fails with `AlreadyExists` if the key is taken.
    pub async fn insert<E: Entity>(&self, entity: E) -> Result<E> {
        let stored = self.backend.insert(encode(&entity, None)?).await?;
        Ok(with_meta(entity, &stored))
    }

    /// Write an entity back.
    ///
    /// If the value was read from the store this is a compare-and-swap on its
    /// etag and fails with `ConcurrencyConflict` when another writer got there
    /// first. New values are upserted.
    pub async fn replace<E: Entity>(&self, entity: E) -> Result<E> {
        let etag = entity.meta().etag.clone();
        let stored = self.backend.replace(encode(&entity, etag)?).await?;
        Ok(with_meta(entity, &stored))
    }

    /// Write an entity unconditionally, ignoring its etag.
    pub async fn upsert<E: Entity>(&self, entity: E) -> Result<E> {
        let stored = self.backend.replace(encode(&entity, None)?).await?;
        Ok(with_meta(entity, &stored))
    }

    /// Delete an entity, checking its etag when it has one.
    ///
    /// Returns `false` if the record was already gone.
    pub async fn delete<E: Entity>(&self, entity: &E) -> Result<bool> {
        self.backend
            .delete(
                E::TABLE,
                &entity.partition_key(),
                &entity.row_key(),
                entity.meta().etag.as_deref(),
            )
            .await
    }

    /// Delete by key without an etag check.
    pub async fn delete_key<E: Entity>(&self, partition_key: &str, row_key: &str) -> Result<bool> {
        self.backend
            .delete(E::TABLE, partition_key, row_key, None)
            .await
    }
}

fn encode<E: Entity>(entity: &E, etag: Option<String>) -> Result<StoredRecord> {
    let mut record = StoredRecord::new(
        E::TABLE,
        entity.partition_key(),
        entity.row_key(),
        serde_json::to_value(entity)?,
    );
    record.etag = etag;
    Ok(record)
}

fn decode<E: Entity>(record: StoredRecord) -> Result<E> {
    let mut entity: E = serde_json::from_value(record.body)?;
    *entity.meta_mut() = EntityMeta {
        etag: record.etag,
        timestamp: record.timestamp,
    };
    Ok(entity)
}

fn with_meta<E: Entity>(mut entity: E, stored: &StoredRecord) -> E {
    *entity.meta_mut() = EntityMeta {
        etag: stored.etag.clone(),
        timestamp: stored.timestamp,
    };
    entity
}
