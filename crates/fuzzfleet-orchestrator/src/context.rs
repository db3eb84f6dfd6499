// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared handles passed to every operation.

use std::sync::Arc;

use fuzzfleet_store::Store;

use crate::cloud::CloudProviders;
use crate::config::Config;
use crate::events::{DomainEvent, EventSink};
use crate::queue::QueueProvider;
use crate::shrink_queue::ShrinkQueue;

/// Everything a state transition may touch.
///
/// Cheap to clone; all members are shared handles. No entity state is kept
/// here, coordination happens through the store and the cloud.
#[derive(Clone)]
pub struct OrchestratorContext {
    /// Entity store.
    pub store: Store,
    /// Cloud capabilities.
    pub cloud: CloudProviders,
    /// Queue backend.
    pub queue: Arc<dyn QueueProvider>,
    /// Event sink.
    pub events: Arc<dyn EventSink>,
    /// Configuration.
    pub config: Arc<Config>,
}

impl OrchestratorContext {
    /// Assemble a context.
    pub fn new(
        store: Store,
        cloud: CloudProviders,
        queue: Arc<dyn QueueProvider>,
        events: Arc<dyn EventSink>,
        config: Config,
    ) -> Self {
        Self {
            store,
            cloud,
            queue,
            events,
            config: Arc::new(config),
        }
    }

    /// Emit a domain event.
    pub async fn send_event(&self, event: DomainEvent) {
        self.events.send(event).await;
    }

    /// Shrink queue of a scaleset.
    pub fn scaleset_shrink_queue(&self, scaleset_id: uuid::Uuid) -> ShrinkQueue {
        ShrinkQueue::for_scaleset(scaleset_id, self.queue.clone())
    }

    /// Shrink queue of a pool.
    pub fn pool_shrink_queue(&self, pool_id: uuid::Uuid) -> ShrinkQueue {
        ShrinkQueue::for_pool(pool_id, self.queue.clone())
    }
}
