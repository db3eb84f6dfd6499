// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Jobs group tasks under a shared lifetime.

use chrono::{DateTime, Utc};
use fuzzfleet_store::{Entity, EntityMeta};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::common::{ErrorInfo, UserInfo};
use super::task::TaskType;
use crate::states::JobState;

/// Longest allowed job duration in hours.
pub const MAX_JOB_DURATION_HOURS: u64 = 7 * 24;

/// User supplied job description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Project name.
    pub project: String,
    /// Target name.
    pub name: String,
    /// Build identifier.
    pub build: String,
    /// Lifetime in hours once the first task starts (1..=168).
    pub duration: u64,
}

/// Per-task summary carried by the job-stopped event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTaskInfo {
    /// Task.
    pub task_id: Uuid,
    /// Kind of task.
    pub task_type: TaskType,
    /// Error the task ended with, if any.
    #[serde(default)]
    pub error: Option<ErrorInfo>,
}

/// A fuzzing job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Job id.
    pub job_id: Uuid,
    /// Current lifecycle state.
    pub state: JobState,
    /// Configuration.
    pub config: JobConfig,
    /// Why the job failed, if it did.
    #[serde(default)]
    pub error: Option<ErrorInfo>,
    /// Expiry, set when the first task starts.
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Requesting user.
    #[serde(default)]
    pub user_info: Option<UserInfo>,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// Task summaries, filled on demand.
    #[serde(skip)]
    pub task_info: Vec<JobTaskInfo>,
    #[serde(skip)]
    meta: EntityMeta,
}

impl Job {
    /// A fresh job in the `init` state.
    pub fn new(config: JobConfig, user_info: Option<UserInfo>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            state: JobState::Init,
            config,
            error: None,
            end_time: None,
            user_info,
            created_at: Utc::now(),
            task_info: Vec::new(),
            meta: EntityMeta::default(),
        }
    }
}

impl Entity for Job {
    const TABLE: &'static str = "Job";

    fn partition_key(&self) -> String {
        self.job_id.to_string()
    }

    fn row_key(&self) -> String {
        self.job_id.to_string()
    }

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}
