// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for agent registration, commands, heartbeats and node events.

mod common;

use std::time::Duration;

use common::{TestContext, VERSION};
use fuzzfleet_store::QueryFilter;
use uuid::Uuid;

use fuzzfleet_orchestrator::Error;
use fuzzfleet_orchestrator::agent_events::{
    self, AgentRegistration, ExitStatus, MAX_OUTPUT_CHARS, NodeEvent, NodeEventEnvelope,
    NodeStateData, WorkerEvent,
};
use fuzzfleet_orchestrator::models::{Node, NodeCommand, NodeTasks, Task, TaskDebugFlag, TaskEvent};
use fuzzfleet_orchestrator::scheduler;
use fuzzfleet_orchestrator::states::{NodeState, NodeTaskState, TaskState};

async fn worker_event(tc: &TestContext, machine_id: Uuid, event: WorkerEvent) {
    agent_events::process_node_event(
        &tc.ctx,
        NodeEventEnvelope {
            machine_id,
            event: NodeEvent::WorkerEvent(event),
        },
    )
    .await
    .expect("Failed to process worker event");
}

async fn setting_up(tc: &TestContext, machine_id: Uuid, task_id: Uuid) {
    tc.send_state(
        machine_id,
        NodeState::SettingUp,
        Some(NodeStateData::SettingUp {
            tasks: vec![task_id],
        }),
    )
    .await
    .expect("Failed to report setting_up");
}

fn failed() -> ExitStatus {
    ExitStatus {
        code: Some(1),
        signal: None,
        success: false,
    }
}

#[tokio::test]
async fn test_register_requires_known_pool() {
    let tc = TestContext::new();
    let err = agent_events::register(
        &tc.ctx,
        AgentRegistration {
            machine_id: Uuid::new_v4(),
            pool_name: "missing".to_string(),
            scaleset_id: None,
            version: VERSION.to_string(),
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::UnableToFind(_)));
}

#[tokio::test]
async fn test_register_creates_node() {
    let tc = TestContext::new();
    let pool = tc.running_pool("linux", false).await;
    let machine_id = Uuid::new_v4();

    let node = agent_events::register(
        &tc.ctx,
        AgentRegistration {
            machine_id,
            pool_name: pool.name.clone(),
            scaleset_id: None,
            version: VERSION.to_string(),
        },
    )
    .await
    .unwrap();

    assert_eq!(node.state, NodeState::Init);
    assert_eq!(node.pool_id, Some(pool.pool_id));
    assert_eq!(tc.event_count("node_created").await, 1);
}

#[tokio::test]
async fn test_register_again_clears_commands_and_reimage_flag() {
    let tc = TestContext::new();
    let pool = tc.running_pool("linux", false).await;
    let node = tc.free_node(&pool.name, None).await;
    let node = node.stop(&tc.ctx, true).await.unwrap();
    assert!(node.reimage_requested);
    assert!(agent_events::next_command(&tc.ctx, node.machine_id)
        .await
        .unwrap()
        .is_some());

    let node = agent_events::register(
        &tc.ctx,
        AgentRegistration {
            machine_id: node.machine_id,
            pool_name: pool.name.clone(),
            scaleset_id: None,
            version: VERSION.to_string(),
        },
    )
    .await
    .unwrap();

    assert_eq!(node.state, NodeState::Init);
    assert!(!node.reimage_requested);
    assert!(agent_events::next_command(&tc.ctx, node.machine_id)
        .await
        .unwrap()
        .is_none());
    assert_eq!(tc.event_count("node_created").await, 1);
}

#[tokio::test]
async fn test_commands_are_delivered_in_order_until_acked() {
    let tc = TestContext::new();
    let pool = tc.running_pool("linux", false).await;
    let node = tc.free_node(&pool.name, None).await;

    let task_id = Uuid::new_v4();
    node.send_message(&tc.ctx, NodeCommand::StopTask { task_id })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(2)).await;
    node.send_message(&tc.ctx, NodeCommand::Stop).await.unwrap();

    let first = agent_events::next_command(&tc.ctx, node.machine_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.command, NodeCommand::StopTask { task_id });

    // not acked yet, so it is handed out again
    let again = agent_events::next_command(&tc.ctx, node.machine_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.message_id, first.message_id);

    agent_events::ack_command(&tc.ctx, node.machine_id, &first.message_id)
        .await
        .unwrap();
    let second = agent_events::next_command(&tc.ctx, node.machine_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.command, NodeCommand::Stop);

    agent_events::ack_command(&tc.ctx, node.machine_id, &second.message_id)
        .await
        .unwrap();
    assert!(agent_events::next_command(&tc.ctx, node.machine_id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_heartbeats_are_recorded() {
    let tc = TestContext::new();
    let pool = tc.running_pool("linux", false).await;
    let job = tc.enabled_job().await;
    let task = tc.waiting_task(job.job_id, &pool.name, 1).await;
    let node = tc.free_node(&pool.name, None).await;
    assert!(node.heartbeat.is_none());

    agent_events::on_node_heartbeat(&tc.ctx, node.machine_id)
        .await
        .unwrap();
    agent_events::on_task_heartbeat(&tc.ctx, task.task_id)
        .await
        .unwrap();

    assert!(tc.node(node.machine_id).await.unwrap().heartbeat.is_some());
    assert!(tc.task(task.task_id).await.heartbeat.is_some());

    let err = agent_events::on_node_heartbeat(&tc.ctx, Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));
}

#[tokio::test]
async fn test_events_from_unknown_node_are_rejected() {
    let tc = TestContext::new();
    let err = tc
        .send_state(Uuid::new_v4(), NodeState::Free, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));
}

#[tokio::test]
async fn test_setting_up_requires_tasks() {
    let tc = TestContext::new();
    let pool = tc.running_pool("linux", false).await;
    let node = tc.free_node(&pool.name, None).await;

    let err = tc
        .send_state(
            node.machine_id,
            NodeState::SettingUp,
            Some(NodeStateData::SettingUp { tasks: Vec::new() }),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));

    let err = tc
        .send_state(
            node.machine_id,
            NodeState::SettingUp,
            Some(NodeStateData::SettingUp {
                tasks: vec![Uuid::new_v4()],
            }),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));
}

#[tokio::test]
async fn test_mismatched_state_data_is_rejected() {
    let tc = TestContext::new();
    let pool = tc.running_pool("linux", false).await;
    let node = tc.free_node(&pool.name, None).await;

    let err = tc
        .send_state(
            node.machine_id,
            NodeState::Busy,
            Some(NodeStateData::Done {
                error: None,
                script_output: None,
            }),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));
}

#[tokio::test]
async fn test_free_node_with_reset_flag_is_stopped() {
    let tc = TestContext::new();
    let pool = tc.running_pool("linux", false).await;
    let node = tc.free_node(&pool.name, None).await;

    let mut node = tc.node(node.machine_id).await.unwrap();
    node.delete_requested = true;
    let node = node.save(&tc.ctx).await.unwrap();

    tc.send_state(node.machine_id, NodeState::Free, None)
        .await
        .unwrap();

    let commands: Vec<NodeCommand> = Node::get_messages(&tc.ctx, node.machine_id)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.message)
        .collect();
    assert!(commands.contains(&NodeCommand::Stop));
    assert!(commands.contains(&NodeCommand::StopIfFree));
}

#[tokio::test]
async fn test_init_after_reimage_clears_flag() {
    let tc = TestContext::new();
    let pool = tc.running_pool("linux", false).await;
    let node = tc.free_node(&pool.name, None).await;
    node.clone().to_reimage(&tc.ctx, true).await.unwrap();

    tc.send_state(node.machine_id, NodeState::Init, None)
        .await
        .unwrap();

    let node = tc.node(node.machine_id).await.unwrap();
    assert_eq!(node.state, NodeState::Init);
    assert!(!node.reimage_requested);
    assert!(node.initialized_at.is_some());
}

#[tokio::test]
async fn test_second_node_setting_up_does_not_downgrade_running_task() {
    let tc = TestContext::new();
    let pool = tc.running_pool("linux", false).await;
    let job = tc.enabled_job().await;
    let task = tc.waiting_task(job.job_id, &pool.name, 2).await;
    let first = tc.free_node(&pool.name, None).await;
    let second = tc.free_node(&pool.name, None).await;

    setting_up(&tc, first.machine_id, task.task_id).await;
    assert_eq!(tc.task(task.task_id).await.state, TaskState::SettingUp);

    worker_event(&tc, first.machine_id, WorkerEvent::Running { task_id: task.task_id }).await;
    assert_eq!(tc.task(task.task_id).await.state, TaskState::Running);

    setting_up(&tc, second.machine_id, task.task_id).await;
    assert_eq!(tc.task(task.task_id).await.state, TaskState::Running);

    let assignments = NodeTasks::get_by_task_id(&tc.ctx, task.task_id)
        .await
        .unwrap();
    assert_eq!(assignments.len(), 2);
    let second_entry = assignments
        .iter()
        .find(|a| a.machine_id == second.machine_id)
        .unwrap();
    assert_eq!(second_entry.state, NodeTaskState::SettingUp);
}

#[tokio::test]
async fn test_worker_output_is_truncated() {
    let tc = TestContext::new();
    let pool = tc.running_pool("linux", false).await;
    let job = tc.enabled_job().await;
    let task = tc.waiting_task(job.job_id, &pool.name, 1).await;
    let node = tc.free_node(&pool.name, None).await;
    worker_event(&tc, node.machine_id, WorkerEvent::Running { task_id: task.task_id }).await;

    let stdout = format!("{}stdout-tail", "o".repeat(6000));
    let stderr = format!("{}stderr-tail", "e".repeat(4100));
    worker_event(
        &tc,
        node.machine_id,
        WorkerEvent::Done {
            task_id: task.task_id,
            exit_status: failed(),
            stdout,
            stderr,
        },
    )
    .await;

    let task = tc.task(task.task_id).await;
    assert_eq!(task.state, TaskState::Stopping);
    let errors = task.error.unwrap().errors;
    assert_eq!(errors.len(), 3);
    assert_eq!(errors[1].chars().count(), MAX_OUTPUT_CHARS);
    assert!(errors[1].ends_with("stdout-tail"));
    assert_eq!(errors[2].chars().count(), MAX_OUTPUT_CHARS);
    assert!(errors[2].ends_with("stderr-tail"));

    let records: Vec<TaskEvent> = tc
        .ctx
        .store
        .query(&QueryFilter::new().partition(task.task_id.to_string()))
        .await
        .unwrap();
    assert_eq!(records.len(), 2);
    let done = records
        .iter()
        .find_map(|r| r.event_data.get("done"))
        .expect("done event recorded");
    assert_eq!(
        done["stdout"].as_str().unwrap().chars().count(),
        MAX_OUTPUT_CHARS
    );
    assert_eq!(
        done["stderr"].as_str().unwrap().chars().count(),
        MAX_OUTPUT_CHARS
    );

    let node = tc.node(node.machine_id).await.unwrap();
    assert_eq!(node.state, NodeState::Done);
    assert!(node.reimage_requested);
}

#[tokio::test]
async fn test_keep_node_on_failure_sets_debug_hold() {
    let tc = TestContext::new();
    let pool = tc.running_pool("linux", false).await;
    let job = tc.enabled_job().await;
    let mut config = common::task_config(job.job_id, &pool.name, 1);
    config.debug.push(TaskDebugFlag::KeepNodeOnFailure);
    let task = Task::create(&tc.ctx, config, None)
        .await
        .unwrap();
    let node = tc.free_node(&pool.name, None).await;

    worker_event(
        &tc,
        node.machine_id,
        WorkerEvent::Done {
            task_id: task.task_id,
            exit_status: failed(),
            stdout: String::new(),
            stderr: String::new(),
        },
    )
    .await;

    assert!(tc.node(node.machine_id).await.unwrap().debug_keep_node);
}

#[tokio::test]
async fn test_done_with_error_fails_running_tasks() {
    let tc = TestContext::new();
    let pool = tc.running_pool("linux", false).await;
    let job = tc.enabled_job().await;
    let task = tc.waiting_task(job.job_id, &pool.name, 1).await;
    let node = tc.free_node(&pool.name, None).await;
    setting_up(&tc, node.machine_id, task.task_id).await;

    tc.send_state(
        node.machine_id,
        NodeState::Done,
        Some(NodeStateData::Done {
            error: Some("setup script failed".to_string()),
            script_output: Some("x".repeat(5000)),
        }),
    )
    .await
    .unwrap();

    let task = tc.task(task.task_id).await;
    assert_eq!(task.state, TaskState::Stopping);
    let errors = task.error.unwrap().errors;
    assert_eq!(errors[0], "setup script failed");
    assert_eq!(errors[1].chars().count(), MAX_OUTPUT_CHARS);

    assert!(NodeTasks::get_by_machine_id(&tc.ctx, node.machine_id)
        .await
        .unwrap()
        .is_empty());
    let node = tc.node(node.machine_id).await.unwrap();
    assert_eq!(node.state, NodeState::Done);
    assert!(node.reimage_requested);
}

#[tokio::test]
async fn test_can_schedule_rejects_stopped_and_unknown_work() {
    let tc = TestContext::new();
    let pool = tc.running_pool("linux", false).await;
    let job = tc.enabled_job().await;
    let task = tc.waiting_task(job.job_id, &pool.name, 1).await;
    let node = tc.free_node(&pool.name, None).await;

    let unknown = scheduler::can_schedule(&tc.ctx, node.machine_id, Uuid::new_v4())
        .await
        .unwrap();
    assert!(!unknown.allowed);
    assert!(unknown.work_stopped);

    task.clone().mark_stopping(&tc.ctx).await.unwrap();
    let stopped = scheduler::can_schedule(&tc.ctx, node.machine_id, task.task_id)
        .await
        .unwrap();
    assert!(!stopped.allowed);
    assert!(stopped.work_stopped);

    let err = scheduler::can_schedule(&tc.ctx, Uuid::new_v4(), task.task_id)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));
}

#[tokio::test]
async fn test_outdated_node_gets_no_work() {
    let tc = TestContext::new();
    let pool = tc.running_pool("linux", false).await;
    let job = tc.enabled_job().await;
    tc.waiting_task(job.job_id, &pool.name, 1).await;
    assert_eq!(scheduler::schedule_tasks(&tc.ctx).await.unwrap(), 1);

    let machine_id = Uuid::new_v4();
    agent_events::register(
        &tc.ctx,
        AgentRegistration {
            machine_id,
            pool_name: pool.name.clone(),
            scaleset_id: None,
            version: "2.19.0".to_string(),
        },
    )
    .await
    .unwrap();
    tc.send_state(machine_id, NodeState::Free, None)
        .await
        .unwrap();

    assert!(scheduler::receive_work(&tc.ctx, machine_id)
        .await
        .unwrap()
        .is_none());
    let node = tc.node(machine_id).await.unwrap();
    assert!(node.reimage_requested);
    assert_eq!(node.state, NodeState::Done);

    // the work set is still queued for a current node
    let current = tc.free_node(&pool.name, None).await;
    assert!(scheduler::receive_work(&tc.ctx, current.machine_id)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_work_set_is_requeued_when_protection_fails() {
    let tc = TestContext::new();
    let pool = tc.running_pool("managed", true).await;
    let scaleset = tc.running_scaleset(&pool.name, 1).await;
    let machine_id = tc.cloud.instances(scaleset.scaleset_id).await[0];
    tc.free_node_with_id(&pool.name, Some(scaleset.scaleset_id), machine_id)
        .await;

    let job = tc.enabled_job().await;
    let task = tc.waiting_task(job.job_id, &pool.name, 1).await;
    assert_eq!(scheduler::schedule_tasks(&tc.ctx).await.unwrap(), 1);

    // a scaleset mid-operation rejects the protection update
    tc.cloud.set_busy(scaleset.scaleset_id, true).await;
    assert!(scheduler::receive_work(&tc.ctx, machine_id).await.is_err());

    let queued = pool.peek_work_queue(&tc.ctx, 10).await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].work_units[0].task_id, task.task_id);
    assert!(tc.cloud.protected(scaleset.scaleset_id).await.is_empty());

    tc.cloud.set_busy(scaleset.scaleset_id, false).await;
    let work_set = scheduler::receive_work(&tc.ctx, machine_id)
        .await
        .unwrap()
        .expect("work set expected");
    assert_eq!(work_set.work_units[0].task_id, task.task_id);
    assert_eq!(tc.cloud.protected(scaleset.scaleset_id).await, vec![machine_id]);
    assert!(pool.peek_work_queue(&tc.ctx, 10).await.unwrap().is_empty());
}
