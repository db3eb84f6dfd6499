// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pool lifecycle operations.

use async_trait::async_trait;
use fuzzfleet_store::QueryFilter;
use tracing::{debug, info};
use uuid::Uuid;

use super::StateMachine;
use crate::context::OrchestratorContext;
use crate::error::{Error, Result};
use crate::events::DomainEvent;
use crate::models::{Architecture, AutoScaleConfig, Node, Os, Pool, Scaleset, WorkSet};
use crate::states::{PoolState, ScalesetState};

impl Pool {
    /// Create a pool in the `init` state. Names are unique.
    pub async fn create(
        ctx: &OrchestratorContext,
        name: &str,
        os: Os,
        arch: Architecture,
        managed: bool,
        client_id: Option<Uuid>,
        autoscale: Option<AutoScaleConfig>,
    ) -> Result<Pool> {
        if Self::get_by_name(ctx, name).await?.is_some() {
            return Err(Error::InvalidRequest(format!("pool with that name already exists: {name}")));
        }

        let pool = ctx
            .store
            .insert(Pool::new(name, os, arch, managed, client_id, autoscale))
            .await?;
        info!(pool_name = %pool.name, pool_id = %pool.pool_id, managed, "Pool created");

        ctx.send_event(DomainEvent::PoolCreated {
            pool_name: pool.name.clone(),
            os: pool.os,
            managed: pool.managed,
        })
        .await;
        Ok(pool)
    }

    /// Look a pool up by name. `None` unless exactly one matches.
    pub async fn get_by_name(ctx: &OrchestratorContext, name: &str) -> Result<Option<Pool>> {
        let mut pools: Vec<Pool> = ctx
            .store
            .query(&QueryFilter::new().partition(name))
            .await?;
        if pools.len() != 1 {
            return Ok(None);
        }
        Ok(pools.pop())
    }

    /// Look a pool up by id.
    pub async fn get_by_id(ctx: &OrchestratorContext, pool_id: Uuid) -> Result<Option<Pool>> {
        Ok(ctx
            .store
            .query_one(&QueryFilter::new().field_eq("pool_id", pool_id.to_string()))
            .await?)
    }

    /// Pools in any of `states` (or any state).
    pub async fn search_states(ctx: &OrchestratorContext, states: &[PoolState]) -> Result<Vec<Pool>> {
        let mut filter = QueryFilter::new();
        if !states.is_empty() {
            filter = filter.field_in("state", states.iter().copied());
        }
        Ok(ctx.store.query(&filter).await?)
    }

    /// Write the pool back.
    pub async fn save(self, ctx: &OrchestratorContext) -> Result<Pool> {
        Ok(ctx.store.replace(self).await?)
    }

    /// Create the work and shrink queues and start accepting work.
    pub async fn init(mut self, ctx: &OrchestratorContext) -> Result<Pool> {
        ctx.queue.create_queue(&self.work_queue_name()).await?;
        ctx.pool_shrink_queue(self.pool_id).create().await?;

        info!(pool_name = %self.name, "Pool running");
        self.state = PoolState::Running;
        self.save(ctx).await
    }

    /// Request a shutdown, or an immediate halt with `now`.
    pub async fn set_shutdown(mut self, ctx: &OrchestratorContext, now: bool) -> Result<Pool> {
        if matches!(self.state, PoolState::Halt | PoolState::Shutdown) {
            return Ok(self);
        }

        self.state = if now { PoolState::Halt } else { PoolState::Shutdown };
        info!(pool_name = %self.name, state = %self.state, "Pool shutdown requested");
        self.save(ctx).await
    }

    /// Let nodes finish their current work, then delete the pool.
    pub async fn shutdown(self, ctx: &OrchestratorContext) -> Result<Option<Pool>> {
        let scalesets = Scaleset::search_by_pool(ctx, &self.name).await?;
        let nodes = Node::search_by_pool(ctx, &self.name).await?;

        if scalesets.is_empty() && nodes.is_empty() {
            info!(pool_name = %self.name, "Pool stopped, deleting");
            self.delete(ctx).await?;
            return Ok(None);
        }

        for scaleset in scalesets {
            scaleset.set_shutdown(ctx, false).await?;
        }
        for node in nodes {
            if !node.delete_requested {
                node.set_shutdown(ctx).await?;
            }
        }
        Ok(Some(self))
    }

    /// Halt every scaleset and node, then delete the pool.
    pub async fn halt(self, ctx: &OrchestratorContext) -> Result<Option<Pool>> {
        let scalesets = Scaleset::search_by_pool(ctx, &self.name).await?;
        let nodes = Node::search_by_pool(ctx, &self.name).await?;

        if scalesets.is_empty() && nodes.is_empty() {
            info!(pool_name = %self.name, "Pool halted, deleting");
            self.delete(ctx).await?;
            return Ok(None);
        }

        for scaleset in scalesets {
            scaleset.set_state(ctx, ScalesetState::Halt).await?;
        }
        for node in nodes {
            node.set_halt(ctx).await?;
        }
        Ok(Some(self))
    }

    async fn delete(self, ctx: &OrchestratorContext) -> Result<()> {
        ctx.queue.delete_queue(&self.work_queue_name()).await?;
        ctx.pool_shrink_queue(self.pool_id).delete().await?;
        ctx.store.delete(&self).await?;

        ctx.send_event(DomainEvent::PoolDeleted {
            pool_name: self.name.clone(),
        })
        .await;
        Ok(())
    }

    /// Post a work set to the pool queue.
    ///
    /// Returns `false` when the pool no longer takes work.
    pub async fn schedule_workset(&self, ctx: &OrchestratorContext, work_set: &WorkSet) -> Result<bool> {
        if matches!(self.state, PoolState::Shutdown | PoolState::Halt) {
            debug!(pool_name = %self.name, "Pool is shutting down, not scheduling");
            return Ok(false);
        }

        let message = serde_json::to_string(work_set)?;
        ctx.queue
            .send_message(&self.work_queue_name(), message)
            .await?;
        Ok(true)
    }

    /// Pending work sets, oldest first.
    pub async fn peek_work_queue(&self, ctx: &OrchestratorContext, max: usize) -> Result<Vec<WorkSet>> {
        // the queue only exists once the pool is initialized
        if self.state == PoolState::Init {
            return Ok(Vec::new());
        }

        ctx.queue
            .peek_messages(&self.work_queue_name(), max)
            .await?
            .iter()
            .map(|raw| serde_json::from_str(raw).map_err(Error::from))
            .collect()
    }
}

#[async_trait]
impl StateMachine for Pool {
    type State = PoolState;

    fn state(&self) -> PoolState {
        self.state
    }

    fn needs_work(&self) -> bool {
        self.state.needs_work()
    }

    async fn process_state_update(self, ctx: &OrchestratorContext) -> Result<Option<Self>> {
        match self.state {
            PoolState::Init => self.init(ctx).await.map(Some),
            PoolState::Shutdown => self.shutdown(ctx).await,
            PoolState::Halt => self.halt(ctx).await,
            PoolState::Running => Ok(Some(self)),
        }
    }
}
