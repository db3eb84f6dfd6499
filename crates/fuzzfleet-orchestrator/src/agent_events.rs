// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent-facing entry points.
//!
//! Agents register, poll for commands, send heartbeats and report events.
//! Events are a closed set of variants decoded from an explicit tag and
//! dispatched with an exhaustive match:
//!
//! ```text
//! NodeEventEnvelope { machine_id, event }
//!   event = { "state_update": { state, data? } }
//!         | { "worker_event": { "running": { task_id } } }
//!         | { "worker_event": { "done": { task_id, exit_status, stdout, stderr } } }
//! ```
//!
//! Unknown nodes and tasks are rejected with an invalid-request error that the
//! caller surfaces to the agent; nothing here is retried internally.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::context::OrchestratorContext;
use crate::error::{Error, Result};
use crate::models::{
    ErrorCode, ErrorInfo, Node, NodeCommandEnvelope, NodeMessage, NodeTasks, Pool, Task,
    TaskDebugFlag, TaskEvent,
};
use crate::states::{NodeState, NodeTaskState, TaskState};

/// Worker output kept on failures and audit records, in characters.
pub const MAX_OUTPUT_CHARS: usize = 4096;

/// An event reported by the agent on `machine_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEventEnvelope {
    /// Reporting node.
    pub machine_id: Uuid,
    /// The event.
    pub event: NodeEvent,
}

/// Kinds of agent events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeEvent {
    /// The node changed state.
    StateUpdate(NodeStateUpdate),
    /// A task on the node changed state.
    WorkerEvent(WorkerEvent),
}

/// Node state change, with optional details for `setting_up` and `done`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStateUpdate {
    /// New state.
    pub state: NodeState,
    /// Details for the new state.
    #[serde(default)]
    pub data: Option<NodeStateData>,
}

/// State specific details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStateData {
    /// Tasks being set up.
    SettingUp {
        /// Tasks.
        tasks: Vec<Uuid>,
    },
    /// Why the node is done.
    Done {
        /// Failure description, if any.
        #[serde(default)]
        error: Option<String>,
        /// Output of the failing script.
        #[serde(default)]
        script_output: Option<String>,
    },
}

/// Task progress on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerEvent {
    /// The task started.
    Running {
        /// Task.
        task_id: Uuid,
    },
    /// The task exited.
    Done {
        /// Task.
        task_id: Uuid,
        /// How it exited.
        exit_status: ExitStatus,
        /// Captured stdout.
        #[serde(default)]
        stdout: String,
        /// Captured stderr.
        #[serde(default)]
        stderr: String,
    },
}

/// Process exit status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    /// Exit code.
    #[serde(default)]
    pub code: Option<i32>,
    /// Terminating signal.
    #[serde(default)]
    pub signal: Option<i32>,
    /// Exited successfully.
    pub success: bool,
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: Option<i32>| v.map_or_else(|| "none".to_string(), |v| v.to_string());
        write!(
            f,
            "code={} signal={} success={}",
            show(self.code),
            show(self.signal),
            self.success
        )
    }
}

/// Keep the last `max` characters of `text`.
pub fn truncate_tail(text: &str, max: usize) -> String {
    let len = text.chars().count();
    if len <= max {
        return text.to_string();
    }
    text.chars().skip(len - max).collect()
}

async fn get_node(ctx: &OrchestratorContext, machine_id: Uuid) -> Result<Node> {
    Node::get_by_machine_id(ctx, machine_id)
        .await?
        .ok_or_else(|| Error::InvalidRequest(format!("unable to find node: {machine_id}")))
}

async fn get_task(ctx: &OrchestratorContext, task_id: Uuid) -> Result<Task> {
    Task::get_by_task_id(ctx, task_id)
        .await?
        .ok_or_else(|| Error::InvalidRequest(format!("unable to find task: {task_id}")))
}

/// Apply an agent event.
pub async fn process_node_event(ctx: &OrchestratorContext, envelope: NodeEventEnvelope) -> Result<()> {
    match envelope.event {
        NodeEvent::StateUpdate(update) => on_state_update(ctx, envelope.machine_id, update).await,
        NodeEvent::WorkerEvent(event) => on_worker_event(ctx, envelope.machine_id, event).await,
    }
}

/// Apply a node state change.
pub async fn on_state_update(
    ctx: &OrchestratorContext,
    machine_id: Uuid,
    update: NodeStateUpdate,
) -> Result<()> {
    let node = get_node(ctx, machine_id).await?;
    let state = update.state;

    match state {
        NodeState::Free => {
            if node.reimage_requested || node.delete_requested {
                info!(machine_id = %machine_id, "Stopping free node with reset flags");
                node.stop(ctx, false).await?;
                return Ok(());
            }
            if node.could_shrink_scaleset(ctx).await? {
                info!(machine_id = %machine_id, "Stopping free node to resize scaleset");
                node.set_halt(ctx).await?;
                return Ok(());
            }
        }
        NodeState::Init => {
            if node.delete_requested {
                info!(machine_id = %machine_id, "Stopping node (init and delete_requested)");
                node.stop(ctx, false).await?;
                return Ok(());
            }

            // agents only report init once, right after a successful reimage
            let mut node = node;
            node.reimage_requested = false;
            node.initialized_at = Some(Utc::now());
            node.set_state(ctx, state).await?;
            return Ok(());
        }
        _ => {}
    }

    info!(machine_id = %machine_id, from = %node.state, to = %state, "Node state update");
    let node = node.set_state(ctx, state).await?;

    match (state, update.data) {
        (NodeState::Free, _) => {
            info!(machine_id = %machine_id, "Node now available for work");
        }
        (NodeState::SettingUp, Some(NodeStateData::SettingUp { tasks })) => {
            if tasks.is_empty() {
                return Err(Error::InvalidRequest(format!(
                    "setup without tasks. machine_id: {machine_id}"
                )));
            }

            for task_id in tasks {
                let task = get_task(ctx, task_id).await?;
                info!(machine_id = %machine_id, job_id = %task.job_id, task_id = %task_id, "Node starting task");

                // with more than one VM another node may already have moved
                // the task further, which is kept
                if !matches!(task.state, TaskState::Running | TaskState::SettingUp) {
                    let task = task.set_state(ctx, TaskState::SettingUp).await?;
                    task.on_start(ctx).await?;
                }

                ctx.store
                    .upsert(NodeTasks::new(machine_id, task_id, NodeTaskState::SettingUp))
                    .await?;
            }
        }
        (NodeState::Done, data) => {
            let error = match data {
                Some(NodeStateData::Done {
                    error: Some(message),
                    script_output,
                }) => {
                    error!(machine_id = %machine_id, error = %message, "Node done with error");
                    let mut errors = vec![message];
                    errors.extend(script_output.map(|out| truncate_tail(&out, MAX_OUTPUT_CHARS)));
                    Some(ErrorInfo {
                        code: ErrorCode::TaskFailed,
                        errors,
                    })
                }
                _ => None,
            };

            // tasks still running on a node that reports done were cut short
            node.mark_tasks_stopped_early(ctx, error).await?;
            node.to_reimage(ctx, true).await?;
        }
        (_, None) => {}
        (_, Some(_)) => {
            return Err(Error::InvalidRequest(format!(
                "event data does not match state {state}. machine_id: {machine_id}"
            )));
        }
    }
    Ok(())
}

/// Apply a worker event.
pub async fn on_worker_event(ctx: &OrchestratorContext, machine_id: Uuid, event: WorkerEvent) -> Result<()> {
    match event {
        WorkerEvent::Running { task_id } => on_worker_running(ctx, machine_id, task_id).await,
        WorkerEvent::Done {
            task_id,
            exit_status,
            stdout,
            stderr,
        } => on_worker_done(ctx, machine_id, task_id, exit_status, stdout, stderr).await,
    }
}

async fn on_worker_running(ctx: &OrchestratorContext, machine_id: Uuid, task_id: Uuid) -> Result<()> {
    let task = get_task(ctx, task_id).await?;
    let node = get_node(ctx, machine_id).await?;

    // nodes waiting for a reset ignore further progress reports
    if !node.state.ready_for_reset() {
        node.set_state(ctx, NodeState::Busy).await?;
    }

    ctx.store
        .upsert(NodeTasks::new(machine_id, task_id, NodeTaskState::Running))
        .await?;

    if task.state.shutting_down() {
        info!(
            machine_id = %machine_id,
            job_id = %task.job_id,
            task_id = %task_id,
            state = %task.state,
            "Ignoring task start from node"
        );
        return Ok(());
    }

    info!(machine_id = %machine_id, job_id = %task.job_id, task_id = %task_id, "Task started on node");
    let task = task.set_state(ctx, TaskState::Running).await?;
    task.on_start(ctx).await?;

    let event = WorkerEvent::Running { task_id };
    ctx.store
        .insert(TaskEvent::new(task_id, machine_id, serde_json::to_value(&event)?))
        .await?;
    Ok(())
}

async fn on_worker_done(
    ctx: &OrchestratorContext,
    machine_id: Uuid,
    task_id: Uuid,
    exit_status: ExitStatus,
    stdout: String,
    stderr: String,
) -> Result<()> {
    let task = get_task(ctx, task_id).await?;
    let mut node = get_node(ctx, machine_id).await?;

    let stdout = truncate_tail(&stdout, MAX_OUTPUT_CHARS);
    let stderr = truncate_tail(&stderr, MAX_OUTPUT_CHARS);

    if exit_status.success {
        info!(job_id = %task.job_id, task_id = %task_id, status = %exit_status, "Task done");
        if task.config.has_debug_flag(TaskDebugFlag::KeepNodeOnCompletion) {
            node.debug_keep_node = true;
        }
        task.mark_stopping(ctx).await?;
    } else {
        error!(job_id = %task.job_id, task_id = %task_id, status = %exit_status, "Task failed");
        if task.config.has_debug_flag(TaskDebugFlag::KeepNodeOnFailure)
            || task.config.has_debug_flag(TaskDebugFlag::KeepNodeOnCompletion)
        {
            node.debug_keep_node = true;
        }
        let error = ErrorInfo {
            code: ErrorCode::TaskFailed,
            errors: vec![
                format!("task failed. exit_status:{exit_status}"),
                stdout.clone(),
                stderr.clone(),
            ],
        };
        task.mark_failed(ctx, error).await?;
    }

    node.to_reimage(ctx, true).await?;

    let event = WorkerEvent::Done {
        task_id,
        exit_status,
        stdout,
        stderr,
    };
    ctx.store
        .insert(TaskEvent::new(task_id, machine_id, serde_json::to_value(&event)?))
        .await?;
    Ok(())
}

/// Registration request sent by an agent on boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRegistration {
    /// Node.
    pub machine_id: Uuid,
    /// Pool the agent was configured for.
    pub pool_name: String,
    /// Scaleset the node belongs to, if any.
    #[serde(default)]
    pub scaleset_id: Option<Uuid>,
    /// Agent version.
    pub version: String,
}

/// Register a node, or refresh the record of a reimaged one.
///
/// Commands queued before the reimage are dropped.
pub async fn register(ctx: &OrchestratorContext, request: AgentRegistration) -> Result<Node> {
    let Some(pool) = Pool::get_by_name(ctx, &request.pool_name).await? else {
        return Err(Error::UnableToFind(format!(
            "unable to find pool: {}",
            request.pool_name
        )));
    };

    match Node::get_by_machine_id(ctx, request.machine_id).await? {
        Some(mut node) => {
            info!(machine_id = %node.machine_id, version = %request.version, "Node registered again");
            node.version = request.version;
            node.pool_id = Some(pool.pool_id);
            node.reimage_requested = false;
            if request.scaleset_id.is_some() {
                node.scaleset_id = request.scaleset_id;
            }
            Node::clear_messages(ctx, node.machine_id).await?;
            node.set_state(ctx, NodeState::Init).await
        }
        None => {
            let mut node = Node::new(
                pool.name.clone(),
                request.machine_id,
                request.scaleset_id,
                request.version,
            );
            node.pool_id = Some(pool.pool_id);
            info!(machine_id = %node.machine_id, pool_name = %pool.name, "Node registered");
            Node::create(ctx, node).await
        }
    }
}

/// Oldest queued command for a node.
pub async fn next_command(ctx: &OrchestratorContext, machine_id: Uuid) -> Result<Option<NodeCommandEnvelope>> {
    Ok(Node::get_messages(ctx, machine_id)
        .await?
        .into_iter()
        .next()
        .map(|message: NodeMessage| NodeCommandEnvelope {
            message_id: message.message_id,
            command: message.message,
        }))
}

/// Drop a command the agent has processed.
pub async fn ack_command(ctx: &OrchestratorContext, machine_id: Uuid, message_id: &str) -> Result<()> {
    ctx.store
        .delete_key::<NodeMessage>(&machine_id.to_string(), message_id)
        .await?;
    Ok(())
}

/// Record a node heartbeat.
pub async fn on_node_heartbeat(ctx: &OrchestratorContext, machine_id: Uuid) -> Result<()> {
    let mut node = get_node(ctx, machine_id).await?;
    node.heartbeat = Some(Utc::now());
    node.save(ctx).await?;
    Ok(())
}

/// Record a task heartbeat.
pub async fn on_task_heartbeat(ctx: &OrchestratorContext, task_id: Uuid) -> Result<()> {
    let mut task = get_task(ctx, task_id).await?;
    task.heartbeat = Some(Utc::now());
    task.save(ctx).await?;
    Ok(())
}
