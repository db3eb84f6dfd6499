// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fuzzfleet Orchestrator - Control Plane Server
//!
//! Runs the reconciliation and retention workers against:
//! - the entity store (SQLite, or memory when no path is configured)
//! - the in-process simulated cloud
//! - in-memory work and shrink queues

use std::sync::Arc;

use tracing::{info, warn};

use fuzzfleet_orchestrator::cloud::SimulatedCloud;
use fuzzfleet_orchestrator::config::Config;
use fuzzfleet_orchestrator::events::{StoredEventSink, TracingEventSink};
use fuzzfleet_orchestrator::queue::MemoryQueue;
use fuzzfleet_orchestrator::runtime::OrchestratorRuntime;
use fuzzfleet_store::{EntityStore, MemoryStore, SqliteStore, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fuzzfleet_orchestrator=info,fuzzfleet_store=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        service_version = %config.service_version,
        base_region = %config.base_region,
        "Starting Fuzzfleet Orchestrator"
    );

    let backend: Arc<dyn EntityStore> = match &config.database_path {
        Some(path) => {
            let store = SqliteStore::from_path(path).await?;
            info!(path = %path.display(), "Connected to database");
            Arc::new(store)
        }
        None => {
            warn!("FUZZFLEET_DATABASE_PATH not set, entities are kept in memory");
            Arc::new(MemoryStore::new())
        }
    };
    let store = Store::new(backend);

    let cloud = SimulatedCloud::new();
    let events = Arc::new(StoredEventSink::new(store.clone(), Arc::new(TracingEventSink)));

    let runtime = OrchestratorRuntime::builder()
        .store(store)
        .cloud(cloud.providers())
        .queue(Arc::new(MemoryQueue::new()))
        .events(events)
        .config(config)
        .build()?
        .start();

    info!("Orchestrator ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Fuzzfleet Orchestrator shut down");

    Ok(())
}
