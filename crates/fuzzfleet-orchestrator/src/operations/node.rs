// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node lifecycle operations.
//!
//! Reimage and delete requests are sticky intents on the node record. They are
//! consumed by the scaleset cleanup pass once the agent reports a reset state
//! (`done`, `shutdown` or `halt`).

use async_trait::async_trait;
use chrono::{Duration, Utc};
use fuzzfleet_store::{Entity, QueryFilter};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::StateMachine;
use crate::cloud::CloudError;
use crate::context::OrchestratorContext;
use crate::error::{Error, Result};
use crate::events::DomainEvent;
use crate::models::{
    ErrorCode, ErrorInfo, Node, NodeAssignment, NodeCommand, NodeMessage, NodeTasks, Pool,
    ProxyForward, Scaleset, Task,
};
use crate::states::NodeState;

/// Nodes without a heartbeat for this long are considered dead.
pub const NODE_EXPIRATION_HOURS: i64 = 1;

/// Scaleset nodes older than this are reimaged to pick up OS patches.
pub const NODE_REIMAGE_DAYS: i64 = 7;

/// Oldest agent version that understands `stop_if_free`.
const STOP_IF_FREE_MIN_VERSION: (u64, u64, u64) = (2, 16, 1);

/// Outdated nodes handled per pass.
const MAX_OUTDATED_PER_PASS: usize = 500;

/// Parse `major.minor.patch`, ignoring any pre-release or build suffix.
pub(crate) fn parse_version(version: &str) -> Option<(u64, u64, u64)> {
    let core = version.split(['-', '+']).next()?;
    let mut parts = core.split('.').map(|p| p.parse::<u64>().ok());
    let major = parts.next()??;
    let minor = parts.next().unwrap_or(Some(0))?;
    let patch = parts.next().unwrap_or(Some(0))?;
    Some((major, minor, patch))
}

/// True when `version` is at least `minimum`. Unparseable versions never are.
pub(crate) fn is_minimum_version(version: &str, minimum: (u64, u64, u64)) -> bool {
    parse_version(version).is_some_and(|v| v >= minimum)
}

fn search_filter(scaleset_id: Option<Uuid>, states: &[NodeState]) -> QueryFilter {
    let mut filter = QueryFilter::new();
    if let Some(id) = scaleset_id {
        filter = filter.field_eq("scaleset_id", id.to_string());
    }
    if !states.is_empty() {
        filter = filter.field_in("state", states.iter().copied());
    }
    filter
}

impl Node {
    /// Store a new node without overwriting an existing record.
    ///
    /// `node-created` is only emitted when the record was actually written.
    pub async fn create(ctx: &OrchestratorContext, node: Node) -> Result<Node> {
        let node = ctx.store.insert(node).await?;
        ctx.send_event(DomainEvent::NodeCreated {
            machine_id: node.machine_id,
            pool_name: node.pool_name.clone(),
            scaleset_id: node.scaleset_id,
        })
        .await;
        Ok(node)
    }

    /// Look a node up by machine id across all pools.
    pub async fn get_by_machine_id(
        ctx: &OrchestratorContext,
        machine_id: Uuid,
    ) -> Result<Option<Node>> {
        let mut nodes: Vec<Node> = ctx
            .store
            .query(&QueryFilter::new().field_eq("machine_id", machine_id.to_string()))
            .await?;
        if nodes.len() != 1 {
            if nodes.len() > 1 {
                warn!(machine_id = %machine_id, count = nodes.len(), "Machine id registered in several pools");
            }
            return Ok(None);
        }
        Ok(nodes.pop())
    }

    /// Nodes of a scaleset (or all nodes) in any of `states` (or any state).
    pub async fn search_states(
        ctx: &OrchestratorContext,
        scaleset_id: Option<Uuid>,
        states: &[NodeState],
    ) -> Result<Vec<Node>> {
        Ok(ctx.store.query(&search_filter(scaleset_id, states)).await?)
    }

    /// Nodes belonging to a pool.
    pub async fn search_by_pool(ctx: &OrchestratorContext, pool_name: &str) -> Result<Vec<Node>> {
        Ok(ctx
            .store
            .query(&QueryFilter::new().partition(pool_name))
            .await?)
    }

    /// Write the node back.
    pub async fn save(self, ctx: &OrchestratorContext) -> Result<Node> {
        Ok(ctx.store.replace(self).await?)
    }

    /// Move to `state`, emitting `node-state-updated` when it changed.
    pub async fn set_state(mut self, ctx: &OrchestratorContext, state: NodeState) -> Result<Node> {
        let changed = self.state != state;
        self.state = state;
        let node = self.save(ctx).await?;
        if changed {
            ctx.send_event(DomainEvent::NodeStateUpdated {
                machine_id: node.machine_id,
                pool_name: node.pool_name.clone(),
                scaleset_id: node.scaleset_id,
                state,
            })
            .await;
        }
        Ok(node)
    }

    /// Queue a command for the agent.
    pub async fn send_message(&self, ctx: &OrchestratorContext, command: NodeCommand) -> Result<()> {
        ctx.store
            .insert(NodeMessage::new(self.machine_id, command))
            .await?;
        Ok(())
    }

    /// Ask the agent to stop once it is idle, when it understands the command.
    pub async fn send_stop_if_free(&self, ctx: &OrchestratorContext) -> Result<()> {
        if is_minimum_version(&self.version, STOP_IF_FREE_MIN_VERSION) {
            self.send_message(ctx, NodeCommand::StopIfFree).await?;
        }
        Ok(())
    }

    /// Request a reimage. With `done`, also move the node to `done` unless it
    /// is already waiting for a reset.
    pub async fn to_reimage(mut self, ctx: &OrchestratorContext, done: bool) -> Result<Node> {
        if done && !self.state.ready_for_reset() {
            self.state = NodeState::Done;
        }

        if !self.reimage_requested && !self.delete_requested {
            info!(machine_id = %self.machine_id, "Setting reimage_requested");
            self.reimage_requested = true;
        }

        // a node about to be reimaged must not pick up new work
        self.send_stop_if_free(ctx).await?;
        self.save(ctx).await
    }

    /// Request a reimage and tell the agent to stop.
    pub async fn stop(self, ctx: &OrchestratorContext, done: bool) -> Result<Node> {
        let node = self.to_reimage(ctx, done).await?;
        node.send_message(ctx, NodeCommand::Stop).await?;
        Ok(node)
    }

    /// Let the node finish its current work, then delete it.
    pub async fn set_shutdown(mut self, ctx: &OrchestratorContext) -> Result<Node> {
        info!(machine_id = %self.machine_id, "Setting delete_requested");
        self.delete_requested = true;
        let node = self.save(ctx).await?;
        node.send_stop_if_free(ctx).await?;
        Ok(node)
    }

    /// Stop everything on the node and mark it for deletion.
    pub async fn set_halt(mut self, ctx: &OrchestratorContext) -> Result<Node> {
        info!(machine_id = %self.machine_id, "Setting halt");
        self.delete_requested = true;
        let node = self.stop(ctx, true).await?;
        node.set_state(ctx, NodeState::Halt).await
    }

    /// Tell every node running `task_id` to stop it, and stop nodes that have
    /// nothing else left to do.
    pub async fn stop_task(ctx: &OrchestratorContext, task_id: Uuid) -> Result<()> {
        for node in NodeTasks::get_nodes_by_task_id(ctx, task_id).await? {
            node.send_message(ctx, NodeCommand::StopTask { task_id })
                .await?;

            let machine_id = node.machine_id;
            let (_, stopped) = node.stop_if_complete(ctx).await?;
            if !stopped {
                info!(
                    task_id = %task_id,
                    machine_id = %machine_id,
                    "Stopped task on node, not reimaging due to other tasks"
                );
            }
        }
        Ok(())
    }

    /// Stop the node when every task it is associated with is shutting down.
    ///
    /// Associations pointing at missing tasks are ignored.
    pub async fn stop_if_complete(self, ctx: &OrchestratorContext) -> Result<(Node, bool)> {
        for entry in NodeTasks::get_by_machine_id(ctx, self.machine_id).await? {
            if let Some(task) = Task::get_by_task_id(ctx, entry.task_id).await?
                && !task.state.shutting_down()
            {
                return Ok((self, false));
            }
        }

        info!(machine_id = %self.machine_id, "Stopping busy node with all tasks complete");
        let node = self.stop(ctx, true).await?;
        Ok((node, true))
    }

    /// Fail every task associated with the node and drop the associations.
    pub async fn mark_tasks_stopped_early(
        &self,
        ctx: &OrchestratorContext,
        error: Option<ErrorInfo>,
    ) -> Result<()> {
        let error = error.unwrap_or_else(|| {
            ErrorInfo::new(
                ErrorCode::TaskFailed,
                format!(
                    "node reimaged during task execution. machine_id:{}",
                    self.machine_id
                ),
            )
        });

        for entry in NodeTasks::get_by_machine_id(ctx, self.machine_id).await? {
            if let Some(task) = Task::get_by_task_id(ctx, entry.task_id).await? {
                task.mark_failed(ctx, error.clone()).await?;
            }
            if !self.debug_keep_node {
                ctx.store.delete(&entry).await?;
            }
        }
        Ok(())
    }

    /// Consume one shrink credit of the node's scaleset.
    pub async fn could_shrink_scaleset(&self, ctx: &OrchestratorContext) -> Result<bool> {
        match self.scaleset_id {
            Some(id) => Ok(ctx.scaleset_shrink_queue(id).should_shrink().await?),
            None => Ok(false),
        }
    }

    /// True when the agent runs a different version than the service.
    pub fn is_outdated(&self, ctx: &OrchestratorContext) -> bool {
        self.version != ctx.config.service_version
    }

    /// True for scaleset nodes whose record has not changed for a week.
    pub fn is_too_old(&self) -> bool {
        let cutoff = Utc::now() - Duration::days(NODE_REIMAGE_DAYS);
        self.scaleset_id.is_some() && self.meta().timestamp.is_some_and(|ts| ts < cutoff)
    }

    /// Decide whether the node may receive a new work set.
    ///
    /// Nodes that should not take work because they are outdated, too old or
    /// flagged for reset are stopped on the way. A node that consumes a shrink
    /// credit is halted.
    pub async fn can_process_new_work(self, ctx: &OrchestratorContext) -> Result<(Node, bool)> {
        let machine_id = self.machine_id;

        if self.is_outdated(ctx) {
            info!(
                machine_id = %machine_id,
                agent_version = %self.version,
                service_version = %ctx.config.service_version,
                "Agent and service versions differ, stopping node"
            );
            return Ok((self.stop(ctx, true).await?, false));
        }

        if self.is_too_old() {
            info!(machine_id = %machine_id, "Node is too old, stopping");
            return Ok((self.stop(ctx, true).await?, false));
        }

        if !self.state.can_process_new_work() {
            debug!(machine_id = %machine_id, state = %self.state, "Node not in a state for new work");
            return Ok((self, false));
        }

        if self.delete_requested || self.reimage_requested {
            info!(
                machine_id = %machine_id,
                delete_requested = self.delete_requested,
                reimage_requested = self.reimage_requested,
                "Node is set for reset, stopping"
            );
            return Ok((self.stop(ctx, true).await?, false));
        }

        if self.could_shrink_scaleset(ctx).await? {
            info!(machine_id = %machine_id, "Node scheduled to shrink");
            return Ok((self.set_halt(ctx).await?, false));
        }

        if let Some(scaleset_id) = self.scaleset_id {
            match Scaleset::get_by_id(ctx, scaleset_id).await? {
                None => {
                    info!(scaleset_id = %scaleset_id, machine_id = %machine_id, "Invalid scaleset for node");
                    return Ok((self, false));
                }
                Some(scaleset) if !scaleset.state.available() => {
                    info!(
                        scaleset_id = %scaleset_id,
                        machine_id = %machine_id,
                        state = %scaleset.state,
                        "Scaleset not available for work"
                    );
                    return Ok((self, false));
                }
                Some(_) => {}
            }
        }

        match Pool::get_by_name(ctx, &self.pool_name).await? {
            None => {
                info!(pool_name = %self.pool_name, machine_id = %machine_id, "Invalid pool for node");
                Ok((self, false))
            }
            Some(pool) if !pool.state.available() => {
                info!(pool_name = %self.pool_name, machine_id = %machine_id, "Pool not available for work");
                Ok((self, false))
            }
            Some(_) => Ok((self, true)),
        }
    }

    async fn update_scale_in_protection(&self, ctx: &OrchestratorContext, protect: bool) -> Result<()> {
        let Some(scaleset_id) = self.scaleset_id else {
            return Ok(());
        };

        match ctx
            .cloud
            .vmss
            .update_scale_in_protection(scaleset_id, self.machine_id, protect)
            .await
        {
            Ok(()) => Ok(()),
            Err(CloudError::NotFound(message)) => {
                debug!(
                    machine_id = %self.machine_id,
                    scaleset_id = %scaleset_id,
                    message = %message,
                    "Instance gone, scale-in protection unchanged"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Keep the cloud autoscaler from removing this instance.
    pub async fn acquire_scale_in_protection(&self, ctx: &OrchestratorContext) -> Result<()> {
        self.update_scale_in_protection(ctx, true).await
    }

    /// Allow the cloud autoscaler to remove this instance.
    pub async fn release_scale_in_protection(&self, ctx: &OrchestratorContext) -> Result<()> {
        self.update_scale_in_protection(ctx, false).await
    }

    /// Authorize an SSH key on a scaleset node.
    pub async fn add_ssh_public_key(&self, ctx: &OrchestratorContext, public_key: &str) -> Result<()> {
        if self.scaleset_id.is_none() {
            return Err(Error::InvalidRequest(
                "only able to add ssh keys to scaleset nodes".to_string(),
            ));
        }

        let mut public_key = public_key.to_string();
        if !public_key.ends_with('\n') {
            public_key.push('\n');
        }
        self.send_message(ctx, NodeCommand::AddSshKey { public_key })
            .await
    }

    /// Nodes of a scaleset without a heartbeat in the last hour.
    ///
    /// Nodes that never sent one are judged by their creation time.
    pub async fn get_dead_nodes(ctx: &OrchestratorContext, scaleset_id: Uuid) -> Result<Vec<Node>> {
        let cutoff = Utc::now() - Duration::hours(NODE_EXPIRATION_HOURS);
        Ok(Self::search_states(ctx, Some(scaleset_id), &[])
            .await?
            .into_iter()
            .filter(|node| node.heartbeat.unwrap_or(node.created_at) < cutoff)
            .collect())
    }

    /// Reimage scaleset nodes that have been around for a week.
    ///
    /// This keeps nodes on `latest` images reasonably patched without
    /// interrupting running work, and also drops any debug hold.
    pub async fn reimage_long_lived_nodes(ctx: &OrchestratorContext, scaleset_id: Uuid) -> Result<()> {
        let cutoff = Utc::now() - Duration::days(NODE_REIMAGE_DAYS);
        let filter = search_filter(Some(scaleset_id), &[])
            .field_eq("reimage_requested", false)
            .field_eq("delete_requested", false)
            .updated_before(cutoff);

        for mut node in ctx.store.query::<Node>(&filter).await? {
            if node.debug_keep_node {
                info!(
                    scaleset_id = %scaleset_id,
                    machine_id = %node.machine_id,
                    "Removing debug_keep_node for expired node"
                );
                node.debug_keep_node = false;
            }
            node.to_reimage(ctx, false).await?;
        }
        Ok(())
    }

    /// Reimage nodes whose agent version differs from the service version.
    pub async fn mark_outdated_nodes(ctx: &OrchestratorContext) -> Result<()> {
        let filter = QueryFilter::new()
            .field_eq("reimage_requested", false)
            .field_eq("delete_requested", false);

        let outdated: Vec<Node> = ctx
            .store
            .query::<Node>(&filter)
            .await?
            .into_iter()
            .filter(|node| node.is_outdated(ctx))
            .take(MAX_OUTDATED_PER_PASS)
            .collect();

        for node in outdated {
            info!(
                machine_id = %node.machine_id,
                node_version = %node.version,
                service_version = %ctx.config.service_version,
                "Node is outdated"
            );
            let machine_id = node.machine_id;
            let done = node.version == "1.0.0";
            if let Err(e) = node.to_reimage(ctx, done).await {
                e.log_entity_failure("node", machine_id);
            }
        }
        Ok(())
    }

    /// Stop busy nodes whose tasks have all finished.
    ///
    /// Concurrent `stop_task` calls can leave such nodes behind.
    pub async fn cleanup_busy_nodes_without_work(ctx: &OrchestratorContext) -> Result<()> {
        for node in Self::search_states(ctx, None, &[NodeState::Busy]).await? {
            let machine_id = node.machine_id;
            if let Err(e) = node.stop_if_complete(ctx).await {
                e.log_entity_failure("node", machine_id);
            }
        }
        Ok(())
    }

    /// Queued commands for a node, oldest first.
    pub async fn get_messages(ctx: &OrchestratorContext, machine_id: Uuid) -> Result<Vec<NodeMessage>> {
        Ok(ctx
            .store
            .query(&QueryFilter::new().partition(machine_id.to_string()))
            .await?)
    }

    /// Drop every queued command for a node.
    pub async fn clear_messages(ctx: &OrchestratorContext, machine_id: Uuid) -> Result<()> {
        debug!(machine_id = %machine_id, "Clearing messages for node");
        for message in Self::get_messages(ctx, machine_id).await? {
            ctx.store.delete(&message).await?;
        }
        Ok(())
    }

    /// Remove the node and everything hanging off it.
    pub async fn delete(self, ctx: &OrchestratorContext) -> Result<()> {
        self.mark_tasks_stopped_early(ctx, None).await?;
        NodeTasks::clear_by_machine_id(ctx, self.machine_id).await?;
        Self::clear_messages(ctx, self.machine_id).await?;
        if let Some(scaleset_id) = self.scaleset_id {
            ProxyForward::remove_forwards(ctx, Some(scaleset_id), Some(self.machine_id)).await?;
        }

        ctx.store.delete(&self).await?;
        ctx.send_event(DomainEvent::NodeDeleted {
            machine_id: self.machine_id,
            pool_name: self.pool_name.clone(),
            scaleset_id: self.scaleset_id,
        })
        .await;
        Ok(())
    }
}

#[async_trait]
impl StateMachine for Node {
    type State = NodeState;

    fn state(&self) -> NodeState {
        self.state
    }

    fn needs_work(&self) -> bool {
        self.state.needs_work()
    }

    async fn process_state_update(self, ctx: &OrchestratorContext) -> Result<Option<Self>> {
        if !self.state.ready_for_reset() || self.debug_keep_node {
            return Ok(Some(self));
        }

        // scaleset nodes are reimaged or deleted by the scaleset cleanup pass
        let orphaned = match self.scaleset_id {
            None => true,
            Some(id) => Scaleset::get_by_id(ctx, id).await?.is_none(),
        };
        if !orphaned {
            return Ok(Some(self));
        }

        info!(
            machine_id = %self.machine_id,
            state = %self.state,
            "Deleting node without a live scaleset"
        );
        self.delete(ctx).await?;
        Ok(None)
    }
}

impl NodeTasks {
    /// Associations of a node.
    pub async fn get_by_machine_id(ctx: &OrchestratorContext, machine_id: Uuid) -> Result<Vec<NodeTasks>> {
        Ok(ctx
            .store
            .query(&QueryFilter::new().partition(machine_id.to_string()))
            .await?)
    }

    /// Associations of a task.
    pub async fn get_by_task_id(ctx: &OrchestratorContext, task_id: Uuid) -> Result<Vec<NodeTasks>> {
        Ok(ctx
            .store
            .query(&QueryFilter::new().field_eq("task_id", task_id.to_string()))
            .await?)
    }

    /// Nodes currently associated with a task.
    pub async fn get_nodes_by_task_id(ctx: &OrchestratorContext, task_id: Uuid) -> Result<Vec<Node>> {
        let mut nodes = Vec::new();
        for entry in Self::get_by_task_id(ctx, task_id).await? {
            if let Some(node) = Node::get_by_machine_id(ctx, entry.machine_id).await? {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    /// Assignment view of a task's nodes.
    pub async fn get_node_assignments(
        ctx: &OrchestratorContext,
        task_id: Uuid,
    ) -> Result<Vec<NodeAssignment>> {
        let mut assignments = Vec::new();
        for entry in Self::get_by_task_id(ctx, task_id).await? {
            if let Some(node) = Node::get_by_machine_id(ctx, entry.machine_id).await? {
                assignments.push(NodeAssignment {
                    node_id: node.machine_id,
                    scaleset_id: node.scaleset_id,
                    state: entry.state,
                });
            }
        }
        Ok(assignments)
    }

    /// Drop every association of a node.
    pub async fn clear_by_machine_id(ctx: &OrchestratorContext, machine_id: Uuid) -> Result<()> {
        debug!(machine_id = %machine_id, "Clearing tasks for node");
        for entry in Self::get_by_machine_id(ctx, machine_id).await? {
            ctx.store.delete(&entry).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("2.16.1"), Some((2, 16, 1)));
        assert_eq!(parse_version("3.0.0-dev+abc"), Some((3, 0, 0)));
        assert_eq!(parse_version("2"), Some((2, 0, 0)));
        assert_eq!(parse_version("unknown"), None);
    }

    #[test]
    fn test_stop_if_free_version_gate() {
        assert!(is_minimum_version("2.16.1", STOP_IF_FREE_MIN_VERSION));
        assert!(is_minimum_version("2.20.0", STOP_IF_FREE_MIN_VERSION));
        assert!(!is_minimum_version("2.16.0", STOP_IF_FREE_MIN_VERSION));
        assert!(!is_minimum_version("1.0.0", STOP_IF_FREE_MIN_VERSION));
        assert!(!is_minimum_version("garbage", STOP_IF_FREE_MIN_VERSION));
    }
}
