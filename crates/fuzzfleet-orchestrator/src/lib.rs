// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fuzzfleet Orchestrator - Fuzzing Control Plane
//!
//! This crate drives the lifecycle of everything a distributed fuzzing
//! service runs: pools of nodes, VM scalesets, jobs and their tasks, per-region
//! proxies and crash reproduction VMs. All coordination state lives in the
//! entity store and the cloud; the orchestrator itself keeps nothing between
//! passes.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐        ┌──────────────────────────┐
//! │     Agents on nodes      │        │   Administrative callers │
//! │ register, events, polls  │        │ pools, scalesets, jobs   │
//! └────────────┬─────────────┘        └────────────┬─────────────┘
//!              │ agent_events / scheduler          │ admin
//!              ▼                                   ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 operations (state machines)                     │
//! │  Node  Task  Job  Scaleset  Pool  Proxy  Repro  + shrink queue  │
//! └─────────────────────────────────────────────────────────────────┘
//!              ▲                    │                    │
//!              │ periodic passes    │ entities (CAS)     │ cloud / queues
//!   ┌──────────┴──────────┐         ▼                    ▼
//!   │ workers: reconcile, │  ┌──────────────┐  ┌──────────────────────┐
//!   │ retention           │  │ fuzzfleet-   │  │ VMSS, autoscale,     │
//!   └─────────────────────┘  │ store        │  │ network, VM, queues  │
//!                            └──────────────┘  └──────────────────────┘
//! ```
//!
//! # State Machines
//!
//! | Entity | Needs work | Available |
//! |--------|------------|-----------|
//! | Node | `done`, `shutdown`, `halt` | `free`, `ready` |
//! | Task | `init`, `stopping` | every state before `stopping` |
//! | Job | `init`, `stopping` | `init`, `enabled` |
//! | Scaleset | `init`, `setup`, `resize`, `shutdown`, `halt` | `resize`, `running` |
//! | Pool | `init`, `shutdown`, `halt` | `init`, `running` |
//! | Proxy / Repro | `init`, `extensions_launch`, `stopping` | every state before `stopping` |
//!
//! Transitions are inherent methods on the models (see [`operations`]). Each
//! consumes the entity, writes it back with an etag check and returns the new
//! version. A lost race surfaces as [`Error::UnableToUpdate`] and is retried
//! by the next reconciliation pass.
//!
//! # Configuration
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `FUZZFLEET_DATABASE_PATH` | unset (memory) | SQLite file for the entity store |
//! | `FUZZFLEET_NODE_DISPOSAL_STRATEGY` | `scale_in` | `scale_in` or `decommission` |
//! | `FUZZFLEET_RECONCILE_INTERVAL_SECS` | `30` | Reconciliation period |
//! | `FUZZFLEET_RETENTION_ENABLED` | `true` | Run the retention worker |
//! | `FUZZFLEET_RETENTION_INTERVAL_SECS` | `86400` | Retention period |
//! | `FUZZFLEET_SERVICE_VERSION` | crate version | Version agents must run |
//! | `FUZZFLEET_BASE_REGION` | `eastus` | Fallback region |
//!
//! # Modules
//!
//! - [`states`]: Lifecycle enums and their state sets
//! - [`models`]: Entity records
//! - [`operations`]: State machine transitions
//! - [`agent_events`]: Agent registration, events, commands and heartbeats
//! - [`scheduler`]: Work set scheduling and agent work polling
//! - [`autoscale`]: Pool autoscaling
//! - [`admin`]: Validated administrative requests
//! - [`workers`]: Reconcile and retention workers
//! - [`runtime`]: Embeddable runtime
//!
//! [`Error::UnableToUpdate`]: error::Error::UnableToUpdate

#![deny(missing_docs)]

/// Validated administrative requests.
pub mod admin;

/// Agent-facing entry points.
pub mod agent_events;

/// Pool autoscaling.
pub mod autoscale;

/// Cloud capability interfaces and the simulated cloud.
pub mod cloud;

/// Configuration loaded from environment variables.
pub mod config;

/// Shared handles passed to every operation.
pub mod context;

/// Error types for orchestrator operations.
pub mod error;

/// Domain events and sinks.
pub mod events;

/// Entity records.
pub mod models;

/// State machine transitions for every entity.
pub mod operations;

/// Queue provider interface and in-memory backend.
pub mod queue;

/// Embeddable runtime.
pub mod runtime;

/// Task scheduling.
pub mod scheduler;

/// Consume-once shrink credits.
pub mod shrink_queue;

/// Lifecycle states and state sets.
pub mod states;

/// Periodic background workers.
pub mod workers;

pub use context::OrchestratorContext;
pub use error::{Error, Result};
pub use runtime::OrchestratorRuntime;
