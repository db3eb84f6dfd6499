// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain events and the sinks they are delivered to.
//!
//! Events are fire-and-forget: a sink that fails to deliver logs the failure
//! and never propagates it back into a state transition.

use std::sync::Arc;

use async_trait::async_trait;
use fuzzfleet_store::Store;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{ErrorInfo, EventLogEntry, JobConfig, JobTaskInfo, TaskConfig, UserInfo};
use crate::states::{NodeState, ScalesetState, TaskState, VmState};

/// Something observable happened to an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum DomainEvent {
    /// A job was created.
    JobCreated {
        /// Job.
        job_id: Uuid,
        /// Configuration.
        config: JobConfig,
        /// Requesting user.
        user_info: Option<UserInfo>,
    },
    /// Every task of a job stopped.
    JobStopped {
        /// Job.
        job_id: Uuid,
        /// Configuration.
        config: JobConfig,
        /// One entry per task.
        task_info: Vec<JobTaskInfo>,
    },
    /// A task was created.
    TaskCreated {
        /// Job.
        job_id: Uuid,
        /// Task.
        task_id: Uuid,
        /// Configuration.
        config: TaskConfig,
        /// Requesting user.
        user_info: Option<UserInfo>,
    },
    /// A task changed state.
    TaskStateUpdated {
        /// Job.
        job_id: Uuid,
        /// Task.
        task_id: Uuid,
        /// New state.
        state: TaskState,
        /// Expiry, if set.
        end_time: Option<chrono::DateTime<chrono::Utc>>,
    },
    /// A task stopped without error.
    TaskStopped {
        /// Job.
        job_id: Uuid,
        /// Task.
        task_id: Uuid,
    },
    /// A task stopped with an error.
    TaskFailed {
        /// Job.
        job_id: Uuid,
        /// Task.
        task_id: Uuid,
        /// Failure.
        error: ErrorInfo,
    },
    /// A node record was created.
    NodeCreated {
        /// Node.
        machine_id: Uuid,
        /// Pool.
        pool_name: String,
        /// Scaleset.
        scaleset_id: Option<Uuid>,
    },
    /// A node record was deleted.
    NodeDeleted {
        /// Node.
        machine_id: Uuid,
        /// Pool.
        pool_name: String,
        /// Scaleset.
        scaleset_id: Option<Uuid>,
    },
    /// A node changed state.
    NodeStateUpdated {
        /// Node.
        machine_id: Uuid,
        /// Pool.
        pool_name: String,
        /// Scaleset.
        scaleset_id: Option<Uuid>,
        /// New state.
        state: NodeState,
    },
    /// A scaleset was created.
    ScalesetCreated {
        /// Scaleset.
        scaleset_id: Uuid,
        /// Pool.
        pool_name: String,
        /// VM size.
        vm_sku: String,
        /// Image.
        image: String,
        /// Region.
        region: String,
        /// Size.
        size: u32,
    },
    /// A scaleset could not be created.
    ScalesetFailed {
        /// Scaleset.
        scaleset_id: Uuid,
        /// Pool.
        pool_name: String,
        /// Failure.
        error: ErrorInfo,
    },
    /// A scaleset changed state.
    ScalesetStateUpdated {
        /// Scaleset.
        scaleset_id: Uuid,
        /// Pool.
        pool_name: String,
        /// New state.
        state: ScalesetState,
    },
    /// A scaleset was asked to change size.
    ScalesetResizeScheduled {
        /// Scaleset.
        scaleset_id: Uuid,
        /// Pool.
        pool_name: String,
        /// New size.
        size: u32,
    },
    /// A scaleset record was deleted.
    ScalesetDeleted {
        /// Scaleset.
        scaleset_id: Uuid,
        /// Pool.
        pool_name: String,
    },
    /// A pool was created.
    PoolCreated {
        /// Pool.
        pool_name: String,
        /// Operating system.
        os: crate::models::Os,
        /// Managed pool.
        managed: bool,
    },
    /// A pool was deleted.
    PoolDeleted {
        /// Pool.
        pool_name: String,
    },
    /// A proxy was created.
    ProxyCreated {
        /// Region.
        region: String,
    },
    /// A proxy was deleted.
    ProxyDeleted {
        /// Region.
        region: String,
    },
    /// A proxy failed.
    ProxyFailed {
        /// Region.
        region: String,
        /// Failure.
        error: ErrorInfo,
    },
    /// A proxy changed state.
    ProxyStateUpdated {
        /// Region.
        region: String,
        /// New state.
        state: VmState,
    },
}

impl DomainEvent {
    /// Stable name of the event kind.
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::JobCreated { .. } => "job_created",
            DomainEvent::JobStopped { .. } => "job_stopped",
            DomainEvent::TaskCreated { .. } => "task_created",
            DomainEvent::TaskStateUpdated { .. } => "task_state_updated",
            DomainEvent::TaskStopped { .. } => "task_stopped",
            DomainEvent::TaskFailed { .. } => "task_failed",
            DomainEvent::NodeCreated { .. } => "node_created",
            DomainEvent::NodeDeleted { .. } => "node_deleted",
            DomainEvent::NodeStateUpdated { .. } => "node_state_updated",
            DomainEvent::ScalesetCreated { .. } => "scaleset_created",
            DomainEvent::ScalesetFailed { .. } => "scaleset_failed",
            DomainEvent::ScalesetStateUpdated { .. } => "scaleset_state_updated",
            DomainEvent::ScalesetResizeScheduled { .. } => "scaleset_resize_scheduled",
            DomainEvent::ScalesetDeleted { .. } => "scaleset_deleted",
            DomainEvent::PoolCreated { .. } => "pool_created",
            DomainEvent::PoolDeleted { .. } => "pool_deleted",
            DomainEvent::ProxyCreated { .. } => "proxy_created",
            DomainEvent::ProxyDeleted { .. } => "proxy_deleted",
            DomainEvent::ProxyFailed { .. } => "proxy_failed",
            DomainEvent::ProxyStateUpdated { .. } => "proxy_state_updated",
        }
    }
}

/// Destination for domain events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver an event. Must not fail the caller.
    async fn send(&self, event: DomainEvent);
}

/// Logs every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn send(&self, event: DomainEvent) {
        match serde_json::to_string(&event) {
            Ok(body) => info!(event_type = event.event_type(), %body, "Domain event"),
            Err(e) => warn!(event_type = event.event_type(), error = %e, "Failed to encode event"),
        }
    }
}

/// Collects events in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryEventSink {
    events: Arc<Mutex<Vec<DomainEvent>>>,
}

impl MemoryEventSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event received so far.
    pub async fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().await.clone()
    }

    /// Events of one kind.
    pub async fn events_of(&self, event_type: &str) -> Vec<DomainEvent> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn send(&self, event: DomainEvent) {
        self.events.lock().await.push(event);
    }
}

/// Persists each event as an [`EventLogEntry`] and forwards it.
pub struct StoredEventSink {
    store: Store,
    inner: Arc<dyn EventSink>,
}

impl StoredEventSink {
    /// Wrap `inner`, logging every event into `store` first.
    pub fn new(store: Store, inner: Arc<dyn EventSink>) -> Self {
        Self { store, inner }
    }
}

#[async_trait]
impl EventSink for StoredEventSink {
    async fn send(&self, event: DomainEvent) {
        match serde_json::to_value(&event) {
            Ok(body) => {
                let entry = EventLogEntry::new(event.event_type(), body);
                if let Err(e) = self.store.insert(entry).await {
                    warn!(event_type = event.event_type(), error = %e, "Failed to persist event");
                }
            }
            Err(e) => warn!(event_type = event.event_type(), error = %e, "Failed to encode event"),
        }
        self.inner.send(event).await;
    }
}
