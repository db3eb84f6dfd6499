// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Entity records and the value types they carry.
//!
//! Every entity implements [`fuzzfleet_store::Entity`]; lifecycle logic lives
//! in [`crate::operations`].

pub mod common;
pub mod event_log;
pub mod job;
pub mod node;
pub mod pool;
pub mod proxy;
pub mod repro;
pub mod scaleset;
pub mod task;
pub mod work;

pub use common::{Architecture, Authentication, ErrorCode, ErrorInfo, Os, UserInfo};
pub use event_log::EventLogEntry;
pub use job::{Job, JobConfig, JobTaskInfo};
pub use node::{Node, NodeCommand, NodeCommandEnvelope, NodeMessage, NodeTasks};
pub use pool::{AutoScaleConfig, Pool};
pub use proxy::{Proxy, ProxyForward};
pub use repro::{Repro, ReproConfig};
pub use scaleset::{NewScaleset, Scaleset, ScalesetNodeState};
pub use task::{
    ContainerType, NodeAssignment, Task, TaskConfig, TaskContainer, TaskDebugFlag, TaskDetails,
    TaskEvent, TaskEventSummary, TaskPool, TaskType, TaskVm,
};
pub use work::{WorkSet, WorkUnit};
