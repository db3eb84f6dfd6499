// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Periodic background workers.

pub mod reconcile;
pub mod retention;

pub use reconcile::{ReconcileWorker, ReconcileWorkerConfig, reconcile};
pub use retention::{RetentionStats, RetentionWorker, RetentionWorkerConfig, apply_retention};
