// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persisted copies of emitted domain events.

use chrono::{DateTime, Utc};
use fuzzfleet_store::{Entity, EntityMeta};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One emitted event. Removed by the retention worker once old enough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLogEntry {
    /// Event kind, e.g. `job_stopped`.
    pub event_type: String,
    /// Unique id.
    pub event_id: Uuid,
    /// Event body.
    pub body: serde_json::Value,
    /// When the event was emitted.
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    meta: EntityMeta,
}

impl EventLogEntry {
    /// Create an entry for an event body.
    pub fn new(event_type: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            event_id: Uuid::new_v4(),
            body,
            created_at: Utc::now(),
            meta: EntityMeta::default(),
        }
    }
}

impl Entity for EventLogEntry {
    const TABLE: &'static str = "EventLog";

    fn partition_key(&self) -> String {
        self.event_type.clone()
    }

    fn row_key(&self) -> String {
        self.event_id.to_string()
    }

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}
