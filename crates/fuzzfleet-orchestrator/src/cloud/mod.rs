// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cloud capability interfaces and the in-process simulated cloud.

pub mod simulated;
mod traits;

pub use simulated::SimulatedCloud;
pub use traits::*;
