// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fuzzing tasks and their configuration.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use fuzzfleet_store::{Entity, EntityMeta};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::common::{Authentication, ErrorInfo, Os, UserInfo};
use crate::states::{NodeTaskState, TaskState};

/// Kind of work a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// libFuzzer fuzzing.
    LibfuzzerFuzz,
    /// libFuzzer coverage collection.
    LibfuzzerCoverage,
    /// libFuzzer crash triage.
    LibfuzzerCrashReport,
    /// libFuzzer corpus minimisation.
    LibfuzzerMerge,
    /// Generic crash analysis.
    GenericAnalysis,
    /// Supervised third-party fuzzer.
    GenericSupervisor,
    /// Generic corpus minimisation.
    GenericMerge,
    /// Generator based fuzzing.
    GenericGenerator,
    /// Generic crash triage.
    GenericCrashReport,
}

/// Flags that keep a node around after its task ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskDebugFlag {
    /// Keep the node when the task fails.
    KeepNodeOnFailure,
    /// Keep the node whenever the task ends.
    KeepNodeOnCompletion,
}

/// Role of a container attached to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerType {
    /// Target binaries and setup scripts.
    Setup,
    /// Seed inputs.
    Inputs,
    /// Read-only inputs.
    ReadonlyInputs,
    /// Crashing inputs.
    Crashes,
    /// Crash reports.
    Reports,
    /// Coverage data.
    Coverage,
}

/// A storage container used by a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskContainer {
    /// Role of the container.
    #[serde(rename = "type")]
    pub container_type: ContainerType,
    /// Container name.
    pub name: String,
}

/// What the task runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDetails {
    /// Kind of task.
    #[serde(rename = "type")]
    pub task_type: TaskType,
    /// Maximum run time in hours.
    pub duration: u64,
    /// Binary under test.
    pub target_exe: String,
    /// Reboot the node after running setup.
    #[serde(default)]
    pub reboot_after_setup: Option<bool>,
}

/// Run the task on dedicated VMs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskVm {
    /// Region.
    pub region: String,
    /// VM size.
    pub sku: String,
    /// Image.
    pub image: String,
    /// Number of VMs.
    #[serde(default = "default_count")]
    pub count: u32,
    /// Use spot instances.
    #[serde(default)]
    pub spot_instances: bool,
    /// Reboot the node after running setup.
    #[serde(default)]
    pub reboot_after_setup: Option<bool>,
}

/// Run the task on nodes of an existing pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskPool {
    /// Number of nodes.
    pub count: u32,
    /// Pool name.
    pub pool_name: String,
}

fn default_count() -> u32 {
    1
}

/// Full task configuration as submitted by the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Owning job.
    pub job_id: Uuid,
    /// Tasks that must have started before this one is scheduled.
    #[serde(default)]
    pub prereq_tasks: Vec<Uuid>,
    /// What to run.
    pub task: TaskDetails,
    /// Dedicated VMs.
    #[serde(default)]
    pub vm: Option<TaskVm>,
    /// Pool placement.
    #[serde(default)]
    pub pool: Option<TaskPool>,
    /// Containers.
    #[serde(default)]
    pub containers: Vec<TaskContainer>,
    /// Free-form tags.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Debug flags.
    #[serde(default)]
    pub debug: Vec<TaskDebugFlag>,
    /// Allow sharing a node with other tasks of the same job.
    #[serde(default)]
    pub colocate: Option<bool>,
}

impl TaskConfig {
    /// Name of the setup container, if any.
    pub fn setup_container(&self) -> Option<&str> {
        self.containers
            .iter()
            .find(|c| c.container_type == ContainerType::Setup)
            .map(|c| c.name.as_str())
    }

    /// True when the given debug flag is set.
    pub fn has_debug_flag(&self, flag: TaskDebugFlag) -> bool {
        self.debug.contains(&flag)
    }
}

/// Node a task has been assigned to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAssignment {
    /// Node.
    pub node_id: Uuid,
    /// Node's scaleset.
    pub scaleset_id: Option<Uuid>,
    /// Progress on that node.
    pub state: NodeTaskState,
}

/// Entry of a task's event timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEventSummary {
    /// When the event was recorded.
    pub timestamp: Option<DateTime<Utc>>,
    /// Event body.
    pub event_data: serde_json::Value,
}

/// A fuzzing task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Owning job.
    pub job_id: Uuid,
    /// Task id.
    pub task_id: Uuid,
    /// Current lifecycle state.
    pub state: TaskState,
    /// Operating system the task runs on.
    pub os: Os,
    /// Configuration.
    pub config: TaskConfig,
    /// Why the task failed, if it did.
    #[serde(default)]
    pub error: Option<ErrorInfo>,
    /// Credentials for debugging access.
    #[serde(default)]
    pub auth: Option<Authentication>,
    /// Last heartbeat from any node running it.
    #[serde(default)]
    pub heartbeat: Option<DateTime<Utc>>,
    /// Expiry, set once the task starts.
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Requesting user.
    #[serde(default)]
    pub user_info: Option<UserInfo>,
    /// Timeline, filled on demand.
    #[serde(skip)]
    pub events: Vec<TaskEventSummary>,
    /// Node assignments, filled on demand.
    #[serde(skip)]
    pub nodes: Vec<NodeAssignment>,
    #[serde(skip)]
    meta: EntityMeta,
}

impl Task {
    /// A fresh task in the `init` state.
    pub fn new(job_id: Uuid, os: Os, config: TaskConfig, user_info: Option<UserInfo>) -> Self {
        Self {
            job_id,
            task_id: Uuid::new_v4(),
            state: TaskState::Init,
            os,
            config,
            error: None,
            auth: Some(Authentication::generate()),
            heartbeat: None,
            end_time: None,
            user_info,
            events: Vec::new(),
            nodes: Vec::new(),
            meta: EntityMeta::default(),
        }
    }
}

impl Entity for Task {
    const TABLE: &'static str = "Task";

    fn partition_key(&self) -> String {
        self.job_id.to_string()
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

/// Audit record of a worker event for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Task.
    pub task_id: Uuid,
    /// Reporting node.
    pub machine_id: Uuid,
    /// Unique id of this record.
    pub event_id: Uuid,
    /// Event body as received (with output truncated).
    pub event_data: serde_json::Value,
    #[serde(skip)]
    meta: EntityMeta,
}

impl TaskEvent {
    /// Create a record.
    pub fn new(task_id: Uuid, machine_id: Uuid, event_data: serde_json::Value) -> Self {
        Self {
            task_id,
            machine_id,
            event_id: Uuid::new_v4(),
            event_data,
            meta: EntityMeta::default(),
        }
    }
}

impl Entity for TaskEvent {
    const TABLE: &'static str = "TaskEvent";

    fn partition_key(&self) -> String {
        self.task_id.to_string()
    }

    fn row_key(&self) -> String {
        self.event_id.to_string()
    }

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}
