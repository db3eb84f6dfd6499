// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Work sets handed from the scheduler to agents through pool queues.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::TaskType;

/// One task to run on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    /// Job.
    pub job_id: Uuid,
    /// Task.
    pub task_id: Uuid,
    /// Kind of task.
    pub task_type: TaskType,
    /// Serialized task configuration.
    pub config: String,
}

/// Tasks a single node runs together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkSet {
    /// Reboot after setup.
    pub reboot: bool,
    /// Container with setup files shared by every unit.
    #[serde(default)]
    pub setup_container: Option<String>,
    /// Setup script is present.
    pub script: bool,
    /// Tasks.
    pub work_units: Vec<WorkUnit>,
}
