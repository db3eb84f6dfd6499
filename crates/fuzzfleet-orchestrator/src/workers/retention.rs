// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker enforcing data retention.
//!
//! Records last written between [`SEARCH_EXTENT_DAYS`] and
//! [`RETENTION_WINDOW_DAYS`] ago lose their user principal name:
//! - stopped jobs
//! - stopped tasks
//! - repros in any state
//!
//! Event log rows older than the retention window are deleted.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fuzzfleet_store::QueryFilter;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::context::OrchestratorContext;
use crate::error::Result;
use crate::models::{EventLogEntry, Job, Repro, Task, UserInfo};
use crate::states::{JobState, TaskState};

/// Age after which personal data is removed.
pub const RETENTION_WINDOW_DAYS: i64 = 18 * 30;

/// Oldest records still searched for personal data.
pub const SEARCH_EXTENT_DAYS: i64 = 20 * 30;

/// Configuration for the retention worker.
#[derive(Debug, Clone)]
pub struct RetentionWorkerConfig {
    /// Whether retention is enabled.
    pub enabled: bool,
    /// How often to run.
    pub poll_interval: Duration,
}

impl Default for RetentionWorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_secs(24 * 3600), // daily
        }
    }
}

/// What one retention pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionStats {
    /// Jobs scrubbed.
    pub jobs: usize,
    /// Tasks scrubbed.
    pub tasks: usize,
    /// Repros scrubbed.
    pub repros: usize,
    /// Event log rows deleted.
    pub events_deleted: usize,
}

/// Background worker that applies the retention policy.
pub struct RetentionWorker {
    ctx: OrchestratorContext,
    config: RetentionWorkerConfig,
    shutdown: Arc<Notify>,
}

impl RetentionWorker {
    /// Create a new retention worker.
    pub fn new(ctx: OrchestratorContext, config: RetentionWorkerConfig) -> Self {
        Self {
            ctx,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the worker loop until the shutdown signal is received.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Retention worker disabled");
            return;
        }

        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            retention_days = RETENTION_WINDOW_DAYS,
            "Retention worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Retention worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = apply_retention(&self.ctx).await {
                        error!(error = %e, "Failed to apply retention policy");
                    }
                }
            }
        }

        info!("Retention worker stopped");
    }
}

fn scrub(user_info: &mut Option<UserInfo>) -> bool {
    match user_info {
        Some(info) if info.upn.is_some() => {
            info.upn = None;
            true
        }
        _ => false,
    }
}

/// Run one retention pass.
pub async fn apply_retention(ctx: &OrchestratorContext) -> Result<RetentionStats> {
    let now = Utc::now();
    let window = now - chrono::Duration::days(RETENTION_WINDOW_DAYS);
    let extent = now - chrono::Duration::days(SEARCH_EXTENT_DAYS);
    let in_window = QueryFilter::new().updated_after(extent).updated_before(window);

    let mut stats = RetentionStats::default();

    let jobs: Vec<Job> = ctx
        .store
        .query(&in_window.clone().field_eq("state", JobState::Stopped))
        .await?;
    for mut job in jobs {
        if scrub(&mut job.user_info) {
            debug!(job_id = %job.job_id, "Scrubbing job user info");
            ctx.store.replace(job).await?;
            stats.jobs += 1;
        }
    }

    let tasks: Vec<Task> = ctx
        .store
        .query(&in_window.clone().field_eq("state", TaskState::Stopped))
        .await?;
    for mut task in tasks {
        if scrub(&mut task.user_info) {
            debug!(task_id = %task.task_id, "Scrubbing task user info");
            ctx.store.replace(task).await?;
            stats.tasks += 1;
        }
    }

    let repros: Vec<Repro> = ctx.store.query(&in_window).await?;
    for mut repro in repros {
        if scrub(&mut repro.user_info) {
            debug!(vm_id = %repro.vm_id, "Scrubbing repro user info");
            ctx.store.replace(repro).await?;
            stats.repros += 1;
        }
    }

    let events: Vec<EventLogEntry> = ctx
        .store
        .query(&QueryFilter::new().updated_before(window))
        .await?;
    for entry in events {
        if ctx.store.delete(&entry).await? {
            stats.events_deleted += 1;
        }
    }

    if stats != RetentionStats::default() {
        info!(
            jobs = stats.jobs,
            tasks = stats.tasks,
            repros = stats.repros,
            events_deleted = stats.events_deleted,
            "Retention pass completed"
        );
    } else {
        debug!("Retention pass completed, nothing to do");
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrub_removes_upn_only() {
        let mut info = Some(UserInfo {
            application_id: None,
            object_id: Some(uuid::Uuid::nil()),
            upn: Some("user@example.com".to_string()),
        });
        assert!(scrub(&mut info));
        let info = info.unwrap();
        assert!(info.upn.is_none());
        assert_eq!(info.object_id, Some(uuid::Uuid::nil()));
    }

    #[test]
    fn test_scrub_without_upn_is_noop() {
        assert!(!scrub(&mut None));
        assert!(!scrub(&mut Some(UserInfo::default())));
    }
}
