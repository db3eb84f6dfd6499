// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker nodes, their task associations and queued agent commands.

use chrono::{DateTime, Utc};
use fuzzfleet_store::{Entity, EntityMeta};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::states::{NodeState, NodeTaskState};

/// A worker VM running the fuzzing agent.
///
/// Keyed by `(pool_name, machine_id)`; machine ids are unique across pools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Pool the node belongs to.
    pub pool_name: String,
    /// Pool id, when known.
    #[serde(default)]
    pub pool_id: Option<Uuid>,
    /// Machine id reported by the agent.
    pub machine_id: Uuid,
    /// Current lifecycle state.
    pub state: NodeState,
    /// Owning scaleset. `None` for unmanaged nodes.
    #[serde(default)]
    pub scaleset_id: Option<Uuid>,
    /// Last agent heartbeat.
    #[serde(default)]
    pub heartbeat: Option<DateTime<Utc>>,
    /// Agent version.
    pub version: String,
    /// Sticky intent: reimage once the node reaches a reset state.
    #[serde(default)]
    pub reimage_requested: bool,
    /// Sticky intent: delete once the node reaches a reset state.
    #[serde(default)]
    pub delete_requested: bool,
    /// Keep the VM for debugging; overrides all automatic cleanup.
    #[serde(default)]
    pub debug_keep_node: bool,
    /// When the agent last reported `init`.
    #[serde(default)]
    pub initialized_at: Option<DateTime<Utc>>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    meta: EntityMeta,
}

impl Node {
    /// A fresh node record in the `init` state.
    pub fn new(
        pool_name: impl Into<String>,
        machine_id: Uuid,
        scaleset_id: Option<Uuid>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            pool_name: pool_name.into(),
            pool_id: None,
            machine_id,
            state: NodeState::Init,
            scaleset_id,
            heartbeat: None,
            version: version.into(),
            reimage_requested: false,
            delete_requested: false,
            debug_keep_node: false,
            initialized_at: None,
            created_at: Utc::now(),
            meta: EntityMeta::default(),
        }
    }
}

impl Entity for Node {
    const TABLE: &'static str = "Node";

    fn partition_key(&self) -> String {
        self.pool_name.clone()
    }

    fn row_key(&self) -> String {
        self.machine_id.to_string()
    }

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}

/// Association of a task with a node running it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTasks {
    /// Node.
    pub machine_id: Uuid,
    /// Task.
    pub task_id: Uuid,
    /// Progress of the task on this node.
    pub state: NodeTaskState,
    #[serde(skip)]
    meta: EntityMeta,
}

impl NodeTasks {
    /// Create an association.
    pub fn new(machine_id: Uuid, task_id: Uuid, state: NodeTaskState) -> Self {
        Self {
            machine_id,
            task_id,
            state,
            meta: EntityMeta::default(),
        }
    }
}

impl Entity for NodeTasks {
    const TABLE: &'static str = "NodeTasks";

    fn partition_key(&self) -> String {
        self.machine_id.to_string()
    }

    fn row_key(&self) -> String {
        self.task_id.to_string()
    }

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}

/// Command queued for an agent to pick up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeCommand {
    /// Stop everything and wait to be reset.
    Stop,
    /// Stop one task.
    StopTask {
        /// Task to stop.
        task_id: Uuid,
    },
    /// Stop once idle.
    StopIfFree,
    /// Authorize an SSH key.
    AddSshKey {
        /// Key to add, newline terminated.
        public_key: String,
    },
}

/// A queued [`NodeCommand`].
///
/// Message ids sort in creation order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMessage {
    /// Target node.
    pub machine_id: Uuid,
    /// Ordered message id.
    pub message_id: String,
    /// The command.
    pub message: NodeCommand,
    #[serde(skip)]
    meta: EntityMeta,
}

impl NodeMessage {
    /// Create a message with a fresh, time ordered id.
    pub fn new(machine_id: Uuid, message: NodeCommand) -> Self {
        let micros = Utc::now().timestamp_micros().max(0);
        Self {
            machine_id,
            message_id: format!("{:016x}-{}", micros, Uuid::new_v4().simple()),
            message,
            meta: EntityMeta::default(),
        }
    }
}

impl Entity for NodeMessage {
    const TABLE: &'static str = "NodeMessage";

    fn partition_key(&self) -> String {
        self.machine_id.to_string()
    }

    fn row_key(&self) -> String {
        self.message_id.clone()
    }

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}

/// Command handed to an agent together with its id for acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCommandEnvelope {
    /// Id to pass back to `ack_command`.
    pub message_id: String,
    /// The command.
    pub command: NodeCommand,
}
