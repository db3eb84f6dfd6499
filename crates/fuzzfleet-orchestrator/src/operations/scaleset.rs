// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scaleset state machine.
//!
//! A scaleset reconciles the nodes recorded in the store against the instances
//! the cloud reports for the matching VM scaleset.
//!
//! | State | Transition |
//! |-------|------------|
//! | `init` | create the shrink queue, wait for the pool, validate the image OS |
//! | `setup` | network, VM scaleset, autoscale, identity, then `running` |
//! | `resize` | grow, shrink through the shrink queue, or wait for nodes to check in |
//! | `shutdown` | drain nodes under a scale-in only autoscale profile |
//! | `halt` | delete nodes, the VM scaleset and finally the record |
//!
//! `halt` is terminal: [`Scaleset::set_state`] ignores every request once it
//! has been reached.

use std::collections::HashSet;

use async_trait::async_trait;
use fuzzfleet_store::QueryFilter;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::StateMachine;
use crate::cloud::{AutoscaleProfile, ProvisioningState, VmssInfo, VmssSpec, fuzz_extensions};
use crate::config::NodeDisposalStrategy;
use crate::context::OrchestratorContext;
use crate::error::{Error, Result};
use crate::events::DomainEvent;
use crate::models::{
    ErrorCode, ErrorInfo, NewScaleset, Node, Pool, Scaleset, ScalesetNodeState,
};
use crate::states::{PoolState, ScalesetState};

impl Scaleset {
    /// Store a new scaleset in the `init` state.
    pub async fn create(ctx: &OrchestratorContext, params: NewScaleset) -> Result<Scaleset> {
        let scaleset = ctx.store.insert(Scaleset::new(params)).await?;
        info!(
            scaleset_id = %scaleset.scaleset_id,
            pool_name = %scaleset.pool_name,
            size = scaleset.size,
            "Scaleset created"
        );

        ctx.send_event(DomainEvent::ScalesetCreated {
            scaleset_id: scaleset.scaleset_id,
            pool_name: scaleset.pool_name.clone(),
            vm_sku: scaleset.vm_sku.clone(),
            image: scaleset.image.clone(),
            region: scaleset.region.clone(),
            size: scaleset.size,
        })
        .await;
        Ok(scaleset)
    }

    /// Look a scaleset up by id across all pools.
    pub async fn get_by_id(ctx: &OrchestratorContext, scaleset_id: Uuid) -> Result<Option<Scaleset>> {
        Ok(ctx
            .store
            .query_one(&QueryFilter::new().field_eq("scaleset_id", scaleset_id.to_string()))
            .await?)
    }

    /// Scalesets of a pool.
    pub async fn search_by_pool(ctx: &OrchestratorContext, pool_name: &str) -> Result<Vec<Scaleset>> {
        Ok(ctx
            .store
            .query(&QueryFilter::new().partition(pool_name))
            .await?)
    }

    /// Scalesets in any of `states` (or any state).
    pub async fn search_states(
        ctx: &OrchestratorContext,
        states: &[ScalesetState],
    ) -> Result<Vec<Scaleset>> {
        let mut filter = QueryFilter::new();
        if !states.is_empty() {
            filter = filter.field_in("state", states.iter().copied());
        }
        Ok(ctx.store.query(&filter).await?)
    }

    /// Write the scaleset back.
    pub async fn save(self, ctx: &OrchestratorContext) -> Result<Scaleset> {
        Ok(ctx.store.replace(self).await?)
    }

    /// Move to `state`.
    ///
    /// No-op when the state is unchanged or the scaleset has halted.
    pub async fn set_state(mut self, ctx: &OrchestratorContext, state: ScalesetState) -> Result<Scaleset> {
        if self.state == state {
            return Ok(self);
        }
        if self.state == ScalesetState::Halt {
            debug!(scaleset_id = %self.scaleset_id, requested = %state, "Scaleset halted, ignoring state change");
            return Ok(self);
        }

        self.state = state;
        let scaleset = self.save(ctx).await?;
        ctx.send_event(DomainEvent::ScalesetStateUpdated {
            scaleset_id: scaleset.scaleset_id,
            pool_name: scaleset.pool_name.clone(),
            state,
        })
        .await;
        Ok(scaleset)
    }

    /// Record a creation failure. The first error wins.
    pub async fn set_failed(mut self, ctx: &OrchestratorContext, error: ErrorInfo) -> Result<Scaleset> {
        if self.error.is_some() {
            return Ok(self);
        }

        warn!(scaleset_id = %self.scaleset_id, error = %error, "Scaleset failed");
        self.error = Some(error.clone());
        let scaleset = self.set_state(ctx, ScalesetState::CreationFailed).await?;

        ctx.send_event(DomainEvent::ScalesetFailed {
            scaleset_id: scaleset.scaleset_id,
            pool_name: scaleset.pool_name.clone(),
            error,
        })
        .await;
        Ok(scaleset)
    }

    /// Request a new size, clamped to the image's maximum.
    ///
    /// Running scalesets move to `resize`.
    pub async fn set_size(mut self, ctx: &OrchestratorContext, size: u32) -> Result<Scaleset> {
        let size = size.min(self.max_size());
        let changed = self.size != size;
        self.size = size;

        if !changed || !self.state.available() {
            return self.save(ctx).await;
        }

        info!(scaleset_id = %self.scaleset_id, size, "Scaleset resize scheduled");
        let scaleset = if self.state == ScalesetState::Resize {
            self.save(ctx).await?
        } else {
            self.set_state(ctx, ScalesetState::Resize).await?
        };

        ctx.send_event(DomainEvent::ScalesetResizeScheduled {
            scaleset_id: scaleset.scaleset_id,
            pool_name: scaleset.pool_name.clone(),
            size,
        })
        .await;
        Ok(scaleset)
    }

    /// Create the shrink queue and validate the owning pool.
    pub async fn init(self, ctx: &OrchestratorContext) -> Result<Scaleset> {
        info!(scaleset_id = %self.scaleset_id, "Scaleset init");
        ctx.scaleset_shrink_queue(self.scaleset_id).create().await?;

        // the pool may have been deleted while the scaleset was being added
        let Some(pool) = Pool::get_by_name(ctx, &self.pool_name).await? else {
            let error = ErrorInfo::new(
                ErrorCode::UnableToFind,
                format!("unable to find pool: {}", self.pool_name),
            );
            return self.set_failed(ctx, error).await;
        };

        match pool.state {
            PoolState::Init => {
                info!(pool_name = %self.pool_name, scaleset_id = %self.scaleset_id, "Waiting for pool");
                Ok(self)
            }
            PoolState::Running => {
                let image_os = match ctx.cloud.vmss.get_image_os(&self.region, &self.image).await {
                    Ok(Some(os)) => os,
                    Ok(None) => {
                        let error = ErrorInfo::new(
                            ErrorCode::InvalidRequest,
                            format!("unable to determine os of image: {}", self.image),
                        );
                        return self.set_failed(ctx, error).await;
                    }
                    Err(e) => {
                        let error = ErrorInfo::new(ErrorCode::InvalidRequest, e.to_string());
                        return self.set_failed(ctx, error).await;
                    }
                };

                if image_os != pool.os {
                    let error = ErrorInfo::new(
                        ErrorCode::InvalidRequest,
                        format!("invalid os (got: {image_os} needed: {})", pool.os),
                    );
                    return self.set_failed(ctx, error).await;
                }
                self.set_state(ctx, ScalesetState::Setup).await
            }
            _ => self.set_state(ctx, ScalesetState::Setup).await,
        }
    }

    /// Bring up the network and the VM scaleset.
    ///
    /// Each cloud side effect is persisted before the next one so a crash in
    /// between resumes from the right step.
    pub async fn setup(mut self, ctx: &OrchestratorContext) -> Result<Scaleset> {
        info!(scaleset_id = %self.scaleset_id, "Scaleset setup");

        let network_id = match ctx.cloud.network.get_network_id(&self.region).await? {
            Some(id) => id,
            None => {
                info!(region = %self.region, scaleset_id = %self.scaleset_id, "Creating network");
                if let Err(e) = ctx.cloud.network.create_network(&self.region).await {
                    let error = ErrorInfo::new(ErrorCode::UnableToCreate, e.to_string());
                    return self.set_failed(ctx, error).await;
                }
                return self.save(ctx).await;
            }
        };

        let Some(auth) = self.auth.clone() else {
            let error = ErrorInfo::new(ErrorCode::UnableToCreate, "missing required auth");
            return self.set_failed(ctx, error).await;
        };

        match ctx.cloud.vmss.get_vmss(self.scaleset_id).await? {
            None => {
                let Some(pool) = Pool::get_by_name(ctx, &self.pool_name).await? else {
                    let error = ErrorInfo::new(
                        ErrorCode::UnableToFind,
                        format!("unable to find pool: {}", self.pool_name),
                    );
                    return self.set_failed(ctx, error).await;
                };

                info!(scaleset_id = %self.scaleset_id, size = self.size, "Creating VM scaleset");
                let spec = VmssSpec {
                    region: self.region.clone(),
                    scaleset_id: self.scaleset_id,
                    vm_sku: self.vm_sku.clone(),
                    count: self.size,
                    image: self.image.clone(),
                    network_id,
                    spot_instances: self.spot_instances,
                    ephemeral_os_disks: self.ephemeral_os_disks,
                    extensions: fuzz_extensions(&pool, &self),
                    auth,
                    tags: self.tags.clone(),
                };
                if let Err(e) = ctx.cloud.vmss.create_vmss(spec).await {
                    let error = ErrorInfo::new(ErrorCode::VmCreateFailed, e.to_string());
                    return self.set_failed(ctx, error).await;
                }
            }
            Some(info) if info.provisioning_state == ProvisioningState::Creating => {
                info!(scaleset_id = %self.scaleset_id, "Waiting on VM scaleset creation");
                // identity may not be assigned yet, retried on the next pass
                if let Err(error) = self.try_set_identity(&info) {
                    debug!(scaleset_id = %self.scaleset_id, error = %error, "Scaleset identity not assigned yet");
                }
            }
            Some(info) if info.provisioning_state == ProvisioningState::Failed => {
                let error = ErrorInfo::new(ErrorCode::VmCreateFailed, "VM scaleset provisioning failed");
                return self.set_failed(ctx, error).await;
            }
            Some(info) => {
                info!(scaleset_id = %self.scaleset_id, "VM scaleset running");

                let profile = AutoscaleProfile::default_for(self.size, self.max_size());
                if let Err(e) = ctx
                    .cloud
                    .autoscale
                    .create_or_update_autoscale_profile(self.scaleset_id, profile)
                    .await
                {
                    if e.is_transient() {
                        info!(scaleset_id = %self.scaleset_id, "Autoscale update in progress, retrying later");
                        return self.save(ctx).await;
                    }
                    let error = ErrorInfo::new(ErrorCode::UnableToCreate, e.to_string());
                    return self.set_failed(ctx, error).await;
                }

                if let Err(error) = self.try_set_identity(&info) {
                    return self.set_failed(ctx, error).await;
                }
                return self.set_state(ctx, ScalesetState::Running).await;
            }
        }

        self.save(ctx).await
    }

    /// Capture the managed identity of the VM scaleset.
    pub fn try_set_identity(&mut self, info: &VmssInfo) -> std::result::Result<(), ErrorInfo> {
        if self.client_object_id.is_some() {
            return Ok(());
        }

        match info.principal_id {
            Some(principal_id) => {
                self.client_object_id = Some(principal_id);
                Ok(())
            }
            None => Err(ErrorInfo::new(
                ErrorCode::VmCreateFailed,
                "The scaleset is expected to have exactly 1 user assigned identity",
            )),
        }
    }

    /// Bring the cloud size in line with the requested size.
    ///
    /// This is the only path from `resize` back to `running`, and it is only
    /// taken once as many nodes have checked in as were requested.
    pub async fn resize(mut self, ctx: &OrchestratorContext) -> Result<Scaleset> {
        if self.state != ScalesetState::Resize {
            return Ok(self);
        }

        info!(scaleset_id = %self.scaleset_id, size = self.size, "Scaleset resize");

        let shrink_queue = ctx.scaleset_shrink_queue(self.scaleset_id);
        shrink_queue.clear().await?;

        self.size = self.size.min(self.max_size());

        let Some(actual) = ctx.cloud.vmss.get_vmss_size(self.scaleset_id).await? else {
            // the VM scaleset was removed behind our back
            info!(scaleset_id = %self.scaleset_id, "VM scaleset is unavailable");
            return self.set_shutdown(ctx, true).await;
        };

        if actual == self.size {
            let node_count = Node::search_states(ctx, Some(self.scaleset_id), &[])
                .await?
                .len();
            if node_count == self.size as usize {
                info!(scaleset_id = %self.scaleset_id, "Resize finished");
                return self.set_state(ctx, ScalesetState::Running).await;
            }
            info!(
                scaleset_id = %self.scaleset_id,
                checked_in = node_count,
                size = self.size,
                "Resize finished, waiting for nodes to check in"
            );
        } else if self.size > actual {
            match ctx.cloud.vmss.resize_vmss(self.scaleset_id, self.size).await {
                Ok(()) => {}
                Err(e) if e.is_transient() => {
                    info!(scaleset_id = %self.scaleset_id, "VM scaleset is mid-operation already");
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            let to_remove = actual - self.size;
            info!(scaleset_id = %self.scaleset_id, to_remove, "Shrinking scaleset");
            for _ in 0..to_remove {
                shrink_queue.add_entry().await?;
            }
            for node in Node::search_states(ctx, Some(self.scaleset_id), &[]).await? {
                node.send_stop_if_free(ctx).await?;
            }
        }

        self.save(ctx).await
    }

    /// Request a shutdown, or an immediate halt with `now`.
    pub async fn set_shutdown(self, ctx: &OrchestratorContext, now: bool) -> Result<Scaleset> {
        if matches!(self.state, ScalesetState::Halt | ScalesetState::Shutdown) {
            return Ok(self);
        }

        info!(scaleset_id = %self.scaleset_id, now, "Scaleset set_shutdown");
        let state = if now {
            ScalesetState::Halt
        } else {
            ScalesetState::Shutdown
        };
        self.set_state(ctx, state).await
    }

    /// Drain the scaleset.
    ///
    /// Nodes get a delete request and the autoscale profile is limited to
    /// scale-in, with a floor at the number of still protected instances, so
    /// the autoscaler removes idle instances until none are left.
    pub async fn shutdown(self, ctx: &OrchestratorContext) -> Result<Option<Scaleset>> {
        let Some(size) = ctx.cloud.vmss.get_vmss_size(self.scaleset_id).await? else {
            info!(scaleset_id = %self.scaleset_id, "Scaleset shutdown: VM scaleset already deleted");
            return self.halt(ctx).await;
        };

        info!(scaleset_id = %self.scaleset_id, size, "Scaleset shutdown");
        for node in Node::search_states(ctx, Some(self.scaleset_id), &[]).await? {
            if !node.delete_requested {
                node.set_shutdown(ctx).await?;
            }
        }

        let protected = ctx
            .cloud
            .vmss
            .list_protected_instances(self.scaleset_id)
            .await?
            .len() as u32;
        let profile = AutoscaleProfile::scale_in_only(protected, size);
        if let Err(e) = ctx
            .cloud
            .autoscale
            .create_or_update_autoscale_profile(self.scaleset_id, profile)
            .await
        {
            warn!(scaleset_id = %self.scaleset_id, error = %e, "Unable to limit autoscale to scale-in");
        }

        if size == 0 {
            return self.halt(ctx).await;
        }
        Ok(Some(self))
    }

    /// Delete the nodes, the VM scaleset and finally the record.
    ///
    /// Returns `None` once the record is gone. A pending cloud deletion leaves
    /// the scaleset in place to be retried.
    pub async fn halt(self, ctx: &OrchestratorContext) -> Result<Option<Scaleset>> {
        ctx.scaleset_shrink_queue(self.scaleset_id).delete().await?;

        for node in Node::search_states(ctx, Some(self.scaleset_id), &[]).await? {
            info!(scaleset_id = %self.scaleset_id, machine_id = %node.machine_id, "Deleting node");
            node.delete(ctx).await?;
        }

        info!(scaleset_id = %self.scaleset_id, "Scaleset delete starting");
        if !ctx.cloud.vmss.delete_vmss(self.scaleset_id).await? {
            debug!(scaleset_id = %self.scaleset_id, "VM scaleset deletion pending");
            return self.save(ctx).await.map(Some);
        }

        info!(scaleset_id = %self.scaleset_id, "Scaleset deleted");
        ctx.store.delete(&self).await?;
        ctx.send_event(DomainEvent::ScalesetDeleted {
            scaleset_id: self.scaleset_id,
            pool_name: self.pool_name.clone(),
        })
        .await;
        Ok(None)
    }

    /// Reconcile the nodes in the store with the cloud instances and dispose
    /// of nodes waiting for a reset.
    ///
    /// Returns the scaleset (`None` if it was deleted) and whether anything
    /// was changed in the cloud.
    pub async fn cleanup_nodes(self, ctx: &OrchestratorContext) -> Result<(Option<Scaleset>, bool)> {
        if self.state == ScalesetState::Halt {
            info!(scaleset_id = %self.scaleset_id, "Halting scaleset");
            return Ok((self.halt(ctx).await?, true));
        }

        Node::reimage_long_lived_nodes(ctx, self.scaleset_id).await?;

        // the cloud is the ground truth for which nodes exist
        let cloud_nodes = ctx.cloud.vmss.list_instance_ids(self.scaleset_id).await?;
        let nodes = Node::search_states(ctx, Some(self.scaleset_id), &[]).await?;

        let mut existing = Vec::new();
        for node in nodes {
            if cloud_nodes.contains_key(&node.machine_id) {
                existing.push(node);
            } else {
                info!(scaleset_id = %self.scaleset_id, machine_id = %node.machine_id, "Node no longer in scaleset");
                node.delete(ctx).await?;
            }
        }

        // instances that never checked in still get a record, so dead node
        // detection eventually reimages them
        let known: HashSet<Uuid> = existing.iter().map(|n| n.machine_id).collect();
        for machine_id in cloud_nodes.keys().filter(|id| !known.contains(id)) {
            info!(scaleset_id = %self.scaleset_id, machine_id = %machine_id, "Adding missing cloud node");
            let placeholder = Node::new(
                self.pool_name.clone(),
                *machine_id,
                Some(self.scaleset_id),
                ctx.config.service_version.clone(),
            );
            match Node::create(ctx, placeholder).await {
                Ok(_) => {}
                Err(e) if e.is_already_exists() => {
                    debug!(machine_id = %machine_id, "Node checked in concurrently");
                }
                Err(e) => return Err(e),
            }
        }

        let shrink_queue = ctx.scaleset_shrink_queue(self.scaleset_id);
        let pool_shrink_queue = match Pool::get_by_name(ctx, &self.pool_name).await? {
            Some(pool) => Some(ctx.pool_shrink_queue(pool.pool_id)),
            None => None,
        };

        let mut to_delete = Vec::new();
        let mut to_reimage = Vec::new();
        for node in existing.into_iter().filter(|n| n.state.ready_for_reset()) {
            if node.delete_requested {
                to_delete.push(node);
                continue;
            }

            let should_shrink = shrink_queue.should_shrink().await?
                || match &pool_shrink_queue {
                    Some(queue) => queue.should_shrink().await?,
                    None => false,
                };
            if should_shrink {
                to_delete.push(node.set_halt(ctx).await?);
            } else {
                to_reimage.push(node);
            }
        }

        let dead_nodes = Node::get_dead_nodes(ctx, self.scaleset_id).await?;
        if !dead_nodes.is_empty() {
            let ids: Vec<String> = dead_nodes.iter().map(|n| n.machine_id.to_string()).collect();
            info!(
                scaleset_id = %self.scaleset_id,
                nodes = %ids.join(","),
                "Reimaging nodes with expired heartbeats"
            );
        }
        for node in dead_nodes {
            let queued = to_reimage
                .iter()
                .chain(to_delete.iter())
                .any(|n| n.machine_id == node.machine_id);
            if queued {
                continue;
            }
            let error = ErrorInfo::new(
                ErrorCode::TaskFailed,
                format!("node heartbeat expired. machine_id:{}", node.machine_id),
            );
            node.mark_tasks_stopped_early(ctx, Some(error)).await?;
            to_reimage.push(node);
        }

        let to_delete = self.without_debug_nodes(to_delete, "deleting");
        let to_reimage = self.without_debug_nodes(to_reimage, "reimaging");
        let pending = !to_delete.is_empty() || !to_reimage.is_empty();

        let modified = match self.dispose(ctx, to_delete, to_reimage).await {
            Ok(modified) => modified,
            Err(Error::Cloud(e)) if e.is_transient() => {
                info!(scaleset_id = %self.scaleset_id, "Scaleset update already in progress");
                pending
            }
            Err(e) => return Err(e),
        };

        Ok((Some(self), modified))
    }

    fn without_debug_nodes(&self, nodes: Vec<Node>, action: &str) -> Vec<Node> {
        nodes
            .into_iter()
            .filter(|node| {
                if node.debug_keep_node {
                    warn!(
                        scaleset_id = %self.scaleset_id,
                        machine_id = %node.machine_id,
                        "Not {} manually overridden node",
                        action
                    );
                }
                !node.debug_keep_node
            })
            .collect()
    }

    /// Apply the disposal strategy. Returns true when the cloud was changed.
    ///
    /// Decommissioned nodes keep their records until the autoscaler removes
    /// the instance, so only a release of protection still held counts.
    async fn dispose(
        &self,
        ctx: &OrchestratorContext,
        to_delete: Vec<Node>,
        to_reimage: Vec<Node>,
    ) -> Result<bool> {
        match ctx.config.node_disposal_strategy {
            NodeDisposalStrategy::ScaleIn => {
                let modified = !to_delete.is_empty() || !to_reimage.is_empty();
                self.delete_nodes(ctx, to_delete).await?;
                self.reimage_nodes(ctx, to_reimage).await?;
                Ok(modified)
            }
            NodeDisposalStrategy::Decommission => {
                let protected: HashSet<Uuid> = ctx
                    .cloud
                    .vmss
                    .list_protected_instances(self.scaleset_id)
                    .await?
                    .into_iter()
                    .collect();

                let mut released = false;
                for node in to_delete.iter().chain(to_reimage.iter()) {
                    if !protected.contains(&node.machine_id) {
                        debug!(machine_id = %node.machine_id, "Node already decommissioned");
                        continue;
                    }
                    node.release_scale_in_protection(ctx).await?;
                    released = true;
                }
                Ok(released)
            }
        }
    }

    async fn delete_nodes(&self, ctx: &OrchestratorContext, nodes: Vec<Node>) -> Result<()> {
        if nodes.is_empty() {
            return Ok(());
        }
        if self.state == ScalesetState::Halt {
            info!(scaleset_id = %self.scaleset_id, "Scaleset halting, ignoring node deletion");
            return Ok(());
        }

        let machine_ids: Vec<Uuid> = nodes.iter().map(|n| n.machine_id).collect();
        info!(scaleset_id = %self.scaleset_id, count = machine_ids.len(), "Deleting nodes");
        ctx.cloud
            .vmss
            .delete_nodes(self.scaleset_id, &machine_ids)
            .await?;

        for node in nodes {
            node.release_scale_in_protection(ctx).await?;
            node.delete(ctx).await?;
        }
        Ok(())
    }

    async fn reimage_nodes(&self, ctx: &OrchestratorContext, nodes: Vec<Node>) -> Result<()> {
        if nodes.is_empty() {
            return Ok(());
        }
        match self.state {
            ScalesetState::Shutdown => {
                info!(scaleset_id = %self.scaleset_id, "Scaleset shutting down, deleting rather than reimaging nodes");
                return self.delete_nodes(ctx, nodes).await;
            }
            ScalesetState::Halt => {
                info!(scaleset_id = %self.scaleset_id, "Scaleset halting, ignoring node reimage");
                return Ok(());
            }
            _ => {}
        }

        let machine_ids: Vec<Uuid> = nodes.iter().map(|n| n.machine_id).collect();
        info!(scaleset_id = %self.scaleset_id, count = machine_ids.len(), "Reimaging nodes");
        ctx.cloud
            .vmss
            .reimage_nodes(self.scaleset_id, &machine_ids)
            .await?;

        // the agent registers again once the reimage completes
        for node in nodes {
            node.release_scale_in_protection(ctx).await?;
            node.delete(ctx).await?;
        }
        Ok(())
    }

    /// Adopt the cloud's size for a running scaleset.
    ///
    /// Autoscale and manual operator changes in the cloud always win.
    pub async fn sync_scaleset_size(mut self, ctx: &OrchestratorContext) -> Result<Scaleset> {
        if self.state != ScalesetState::Running {
            return Ok(self);
        }

        match ctx.cloud.vmss.get_vmss_size(self.scaleset_id).await? {
            Some(size) if size != self.size => {
                info!(
                    scaleset_id = %self.scaleset_id,
                    stored = self.size,
                    cloud = size,
                    "Adopting cloud scaleset size"
                );
                self.size = size;
                self.save(ctx).await
            }
            _ => Ok(self),
        }
    }

    /// Push the current extension set when a config update was requested.
    pub async fn update_configs(mut self, ctx: &OrchestratorContext) -> Result<Scaleset> {
        if self.state == ScalesetState::Halt {
            info!(scaleset_id = %self.scaleset_id, "Not updating configs, scaleset is set to be deleted");
            return Ok(self);
        }
        if !self.needs_config_update {
            debug!(scaleset_id = %self.scaleset_id, "Config update not needed");
            return Ok(self);
        }

        info!(scaleset_id = %self.scaleset_id, "Updating scaleset configs");
        let Some(pool) = Pool::get_by_name(ctx, &self.pool_name).await? else {
            error!(pool_name = %self.pool_name, scaleset_id = %self.scaleset_id, "Unable to find pool during config update");
            let error = ErrorInfo::new(
                ErrorCode::UnableToFind,
                format!("unable to find pool: {}", self.pool_name),
            );
            return self.set_failed(ctx, error).await;
        };

        let extensions = fuzz_extensions(&pool, &self);
        match ctx
            .cloud
            .vmss
            .update_extensions(self.scaleset_id, extensions)
            .await
        {
            Ok(()) => {
                self.needs_config_update = false;
                self.save(ctx).await
            }
            Err(e) if e.is_transient() => {
                info!(scaleset_id = %self.scaleset_id, "Unable to update configs, update already in progress");
                Ok(self)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fill in the per-instance view joining cloud instances with node states.
    pub async fn update_nodes(mut self, ctx: &OrchestratorContext) -> Result<Scaleset> {
        // instances are only listed once the VM scaleset is being set up
        if self.state == ScalesetState::Init {
            return Ok(self);
        }

        let nodes = Node::search_states(ctx, Some(self.scaleset_id), &[]).await?;
        let cloud_nodes = ctx.cloud.vmss.list_instance_ids(self.scaleset_id).await?;

        let mut view: Vec<ScalesetNodeState> = cloud_nodes
            .into_iter()
            .map(|(machine_id, instance_id)| ScalesetNodeState {
                machine_id,
                instance_id,
                state: nodes
                    .iter()
                    .find(|n| n.machine_id == machine_id)
                    .map(|n| n.state),
            })
            .collect();
        view.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        self.nodes = view;
        Ok(self)
    }
}

#[async_trait]
impl StateMachine for Scaleset {
    type State = ScalesetState;

    fn state(&self) -> ScalesetState {
        self.state
    }

    fn needs_work(&self) -> bool {
        self.state.needs_work()
    }

    async fn process_state_update(self, ctx: &OrchestratorContext) -> Result<Option<Self>> {
        match self.state {
            ScalesetState::Init => self.init(ctx).await.map(Some),
            ScalesetState::Setup => self.setup(ctx).await.map(Some),
            ScalesetState::Resize => self.resize(ctx).await.map(Some),
            ScalesetState::Shutdown => self.shutdown(ctx).await,
            ScalesetState::Halt => self.halt(ctx).await,
            ScalesetState::Running | ScalesetState::CreationFailed => Ok(Some(self)),
        }
    }
}
