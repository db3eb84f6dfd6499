// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle operations for every entity.
//!
//! Operations are inherent methods on the model types. They take the entity by
//! value, apply one transition, write it back through [`fuzzfleet_store::Store`]
//! and return the stored version, so exactly one call frame owns the current
//! value at any time. A store conflict surfaces as
//! [`Error::UnableToUpdate`](crate::error::Error::UnableToUpdate) and is left
//! for the next reconciliation pass.

pub mod job;
pub mod node;
pub mod pool;
pub mod proxy;
pub mod repro;
pub mod scaleset;
pub mod task;

use std::fmt::Display;

use async_trait::async_trait;
use fuzzfleet_store::Entity;
use tracing::debug;

use crate::context::OrchestratorContext;
use crate::error::Result;

/// Upper bound on transitions applied to one entity per pass.
pub const MAX_STATE_UPDATES: usize = 5;

/// An entity driven by the reconciliation loop.
#[async_trait]
pub trait StateMachine: Entity + Sized {
    /// Lifecycle state type.
    type State: Copy + PartialEq + Display + Send + Sync;

    /// Current state.
    fn state(&self) -> Self::State;

    /// True when the current state requires a transition.
    fn needs_work(&self) -> bool;

    /// Apply the transition for the current state.
    ///
    /// Returns `None` once the entity has been deleted.
    async fn process_state_update(self, ctx: &OrchestratorContext) -> Result<Option<Self>>;
}

/// Drive an entity while its state keeps changing and still needs work.
pub async fn process_state_updates<E: StateMachine>(
    ctx: &OrchestratorContext,
    mut entity: E,
) -> Result<Option<E>> {
    for _ in 0..MAX_STATE_UPDATES {
        if !entity.needs_work() {
            break;
        }

        let before = entity.state();
        match entity.process_state_update(ctx).await? {
            Some(next) => {
                let changed = next.state() != before;
                entity = next;
                if !changed {
                    break;
                }
            }
            None => {
                debug!(table = E::TABLE, "Entity deleted during state processing");
                return Ok(None);
            }
        }
    }

    Ok(Some(entity))
}
