// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fuzzfleet Store - Entity Persistence
//!
//! This crate provides the storage layer used by the fuzzfleet control plane.
//! Every entity (nodes, tasks, jobs, scalesets, ...) is stored as a JSON body
//! addressed by a partition key and a row key, and every write produces a new
//! etag so that concurrent writers can detect lost updates.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                fuzzfleet-orchestrator                        │
//! │       (state machines, scheduler, agent ingestion)           │
//! └─────────────────────────────────────────────────────────────┘
//!                               │  typed entities
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Store  (entity.rs)                           │
//! │     get / query / insert / replace (CAS) / delete            │
//! └─────────────────────────────────────────────────────────────┘
//!                               │  StoredRecord
//!                               ▼
//! ┌───────────────────────────┐     ┌───────────────────────────┐
//! │        MemoryStore        │     │        SqliteStore        │
//! │   (tests, ephemeral)      │     │  (entities table, sqlx)   │
//! └───────────────────────────┘     └───────────────────────────┘
//! ```
//!
//! # Write Semantics
//!
//! | Operation | Key exists | Key missing |
//! |-----------|------------|-------------|
//! | `insert` | `AlreadyExists` | written |
//! | `replace` with etag | CAS; `ConcurrencyConflict` on mismatch | `ConcurrencyConflict` |
//! | `replace` without etag | overwritten | written |
//! | `delete` with etag | CAS; `ConcurrencyConflict` on mismatch | `false` |
//! | `delete` without etag | removed | `false` |
//!
//! # Modules
//!
//! - [`entity`]: Typed [`Entity`] trait and [`Store`] wrapper
//! - [`error`]: Error types
//! - [`persistence`]: Raw record trait and backends

#![deny(missing_docs)]

/// Typed entity layer.
pub mod entity;

/// Error types for store operations.
pub mod error;

/// Raw record persistence trait and backends (memory, SQLite).
pub mod persistence;

pub use entity::{Entity, EntityMeta, Store};
pub use error::{Result, StoreError};
pub use persistence::{EntityStore, MemoryStore, QueryFilter, SqliteStore, StoredRecord};
