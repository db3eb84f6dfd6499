// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for fuzzfleet-orchestrator.
//!
//! [`OrchestratorRuntime`] runs the reconcile and retention workers inside an
//! existing tokio application.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use fuzzfleet_orchestrator::cloud::SimulatedCloud;
//! use fuzzfleet_orchestrator::config::Config;
//! use fuzzfleet_orchestrator::events::TracingEventSink;
//! use fuzzfleet_orchestrator::queue::MemoryQueue;
//! use fuzzfleet_orchestrator::runtime::OrchestratorRuntime;
//! use fuzzfleet_store::{MemoryStore, Store};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = OrchestratorRuntime::builder()
//!         .store(Store::new(Arc::new(MemoryStore::new())))
//!         .cloud(SimulatedCloud::new().providers())
//!         .queue(Arc::new(MemoryQueue::new()))
//!         .events(Arc::new(TracingEventSink))
//!         .config(Config::from_env()?)
//!         .build()?
//!         .start();
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fuzzfleet_store::Store;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::cloud::CloudProviders;
use crate::config::Config;
use crate::context::OrchestratorContext;
use crate::events::EventSink;
use crate::queue::QueueProvider;
use crate::workers::{ReconcileWorker, ReconcileWorkerConfig, RetentionWorker, RetentionWorkerConfig};

/// Builder for [`OrchestratorRuntime`].
#[derive(Default)]
pub struct OrchestratorRuntimeBuilder {
    store: Option<Store>,
    cloud: Option<CloudProviders>,
    queue: Option<Arc<dyn QueueProvider>>,
    events: Option<Arc<dyn EventSink>>,
    config: Option<Config>,
    reconcile_interval: Option<Duration>,
    retention_config: Option<RetentionWorkerConfig>,
}

impl OrchestratorRuntimeBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the entity store (required).
    pub fn store(mut self, store: Store) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the cloud providers (required).
    pub fn cloud(mut self, cloud: CloudProviders) -> Self {
        self.cloud = Some(cloud);
        self
    }

    /// Set the queue backend (required).
    pub fn queue(mut self, queue: Arc<dyn QueueProvider>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Set the event sink (required).
    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Set the configuration.
    ///
    /// Default: [`Config::default()`]
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Override the reconciliation period.
    ///
    /// Default: `Config::reconcile_interval` (30 seconds)
    pub fn reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = Some(interval);
        self
    }

    /// Override the retention worker configuration.
    ///
    /// Default: derived from `Config::retention_enabled` and
    /// `Config::retention_interval` (enabled, daily)
    pub fn retention_config(mut self, config: RetentionWorkerConfig) -> Self {
        self.retention_config = Some(config);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<OrchestratorRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let cloud = self
            .cloud
            .ok_or_else(|| anyhow::anyhow!("cloud is required"))?;
        let queue = self
            .queue
            .ok_or_else(|| anyhow::anyhow!("queue is required"))?;
        let events = self
            .events
            .ok_or_else(|| anyhow::anyhow!("events is required"))?;
        let config = self.config.unwrap_or_default();

        let reconcile_config = ReconcileWorkerConfig {
            poll_interval: self.reconcile_interval.unwrap_or(config.reconcile_interval),
        };
        let retention_config = self.retention_config.unwrap_or(RetentionWorkerConfig {
            enabled: config.retention_enabled,
            poll_interval: config.retention_interval,
        });

        Ok(OrchestratorRuntimeConfig {
            ctx: OrchestratorContext::new(store, cloud, queue, events, config),
            reconcile_config,
            retention_config,
        })
    }
}

/// Configuration for an [`OrchestratorRuntime`].
pub struct OrchestratorRuntimeConfig {
    ctx: OrchestratorContext,
    reconcile_config: ReconcileWorkerConfig,
    retention_config: RetentionWorkerConfig,
}

impl OrchestratorRuntimeConfig {
    /// Context shared by the workers.
    pub fn context(&self) -> &OrchestratorContext {
        &self.ctx
    }

    /// Start the runtime, spawning the worker tasks.
    pub fn start(self) -> OrchestratorRuntime {
        info!(
            reconcile_interval_secs = self.reconcile_config.poll_interval.as_secs(),
            retention_enabled = self.retention_config.enabled,
            node_disposal_strategy = ?self.ctx.config.node_disposal_strategy,
            "Starting OrchestratorRuntime"
        );

        let reconcile_worker = ReconcileWorker::new(self.ctx.clone(), self.reconcile_config);
        let reconcile_shutdown = reconcile_worker.shutdown_handle();
        let reconcile_handle = tokio::spawn(async move {
            reconcile_worker.run().await;
        });

        let retention_worker = RetentionWorker::new(self.ctx.clone(), self.retention_config);
        let retention_shutdown = retention_worker.shutdown_handle();
        let retention_handle = tokio::spawn(async move {
            retention_worker.run().await;
        });

        OrchestratorRuntime {
            ctx: self.ctx,
            reconcile_handle,
            reconcile_shutdown,
            retention_handle,
            retention_shutdown,
        }
    }
}

/// A running orchestrator.
pub struct OrchestratorRuntime {
    ctx: OrchestratorContext,
    reconcile_handle: JoinHandle<()>,
    reconcile_shutdown: Arc<Notify>,
    retention_handle: JoinHandle<()>,
    retention_shutdown: Arc<Notify>,
}

impl OrchestratorRuntime {
    /// Create a new runtime builder.
    pub fn builder() -> OrchestratorRuntimeBuilder {
        OrchestratorRuntimeBuilder::new()
    }

    /// Context shared by the workers, for agent and admin entrypoints.
    pub fn context(&self) -> &OrchestratorContext {
        &self.ctx
    }

    /// Signal the workers to stop and wait for them.
    pub async fn shutdown(self) -> Result<()> {
        info!("Shutting down OrchestratorRuntime");

        self.reconcile_shutdown.notify_one();
        self.retention_shutdown.notify_one();

        if let Err(e) = self.reconcile_handle.await {
            error!("Reconcile worker task panicked: {}", e);
        }
        if let Err(e) = self.retention_handle.await {
            error!("Retention worker task panicked: {}", e);
        }

        info!("OrchestratorRuntime stopped");
        Ok(())
    }

    /// True while the reconcile worker is running.
    pub fn is_running(&self) -> bool {
        !self.reconcile_handle.is_finished()
    }
}
