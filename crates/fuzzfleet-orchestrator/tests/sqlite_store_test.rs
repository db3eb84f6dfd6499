// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orchestrator operations against a file-backed SQLite entity store.

mod common;

use std::sync::Arc;

use common::{VERSION, job_config, task_config};
use fuzzfleet_store::{SqliteStore, Store};
use tempfile::TempDir;
use uuid::Uuid;

use fuzzfleet_orchestrator::OrchestratorContext;
use fuzzfleet_orchestrator::agent_events::{self, AgentRegistration};
use fuzzfleet_orchestrator::cloud::SimulatedCloud;
use fuzzfleet_orchestrator::config::Config;
use fuzzfleet_orchestrator::events::MemoryEventSink;
use fuzzfleet_orchestrator::models::{Architecture, Job, Node, Os, Pool, Task};
use fuzzfleet_orchestrator::operations::process_state_updates;
use fuzzfleet_orchestrator::queue::MemoryQueue;
use fuzzfleet_orchestrator::scheduler;
use fuzzfleet_orchestrator::states::{JobState, PoolState, TaskState};

async fn context(dir: &TempDir) -> OrchestratorContext {
    let store = SqliteStore::from_path(dir.path().join("fuzzfleet.db"))
        .await
        .expect("Failed to open SQLite store");
    OrchestratorContext::new(
        Store::new(Arc::new(store)),
        SimulatedCloud::new().providers(),
        Arc::new(MemoryQueue::new()),
        Arc::new(MemoryEventSink::new()),
        Config {
            service_version: VERSION.to_string(),
            ..Config::default()
        },
    )
}

#[tokio::test]
async fn test_entities_survive_reopen() {
    let dir = TempDir::new().unwrap();

    let (job_id, task_id) = {
        let ctx = context(&dir).await;
        let pool = Pool::create(&ctx, "linux", Os::Linux, Architecture::X86_64, false, None, None)
            .await
            .unwrap();
        process_state_updates(&ctx, pool).await.unwrap();

        let job = Job::create(&ctx, job_config(), None).await.unwrap();
        let job = process_state_updates(&ctx, job).await.unwrap().unwrap();
        let task = Task::create(&ctx, task_config(job.job_id, "linux", 1), None)
            .await
            .unwrap();
        let task = process_state_updates(&ctx, task).await.unwrap().unwrap();
        assert_eq!(scheduler::schedule_tasks(&ctx).await.unwrap(), 1);
        (job.job_id, task.task_id)
    };

    let ctx = context(&dir).await;
    let pool = Pool::get_by_name(&ctx, "linux").await.unwrap().unwrap();
    assert_eq!(pool.state, PoolState::Running);
    let job = Job::get(&ctx, job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Enabled);
    let task = Task::get_by_task_id(&ctx, task_id).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Scheduled);
    assert_eq!(
        Task::search_states(&ctx, Some(job_id), &[TaskState::Scheduled])
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn test_stale_write_is_rejected() {
    let dir = TempDir::new().unwrap();
    let ctx = context(&dir).await;
    let pool = Pool::create(&ctx, "linux", Os::Linux, Architecture::X86_64, false, None, None)
        .await
        .unwrap();
    process_state_updates(&ctx, pool).await.unwrap();

    let machine_id = Uuid::new_v4();
    agent_events::register(
        &ctx,
        AgentRegistration {
            machine_id,
            pool_name: "linux".to_string(),
            scaleset_id: None,
            version: VERSION.to_string(),
        },
    )
    .await
    .unwrap();

    let first = Node::get_by_machine_id(&ctx, machine_id).await.unwrap().unwrap();
    let mut second = first.clone();

    first.to_reimage(&ctx, false).await.unwrap();

    second.debug_keep_node = true;
    let err = second.save(&ctx).await.unwrap_err();
    assert!(err.is_conflict());

    let node = Node::get_by_machine_id(&ctx, machine_id).await.unwrap().unwrap();
    assert!(node.reimage_requested);
    assert!(!node.debug_keep_node);
}
