// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle properties of jobs, scalesets, nodes and the shrink queue.

mod common;

use common::{IMAGE, TestContext, scaleset_params};
use uuid::Uuid;

use fuzzfleet_orchestrator::cloud::{
    AutoscaleProfile, ProvisioningState, VmssProvider, fuzz_extensions,
};
use fuzzfleet_orchestrator::config::{Config, NodeDisposalStrategy};
use fuzzfleet_orchestrator::models::{Node, Scaleset};
use fuzzfleet_orchestrator::operations::process_state_updates;
use fuzzfleet_orchestrator::states::{JobState, NodeState, ScalesetState, TaskState};
use fuzzfleet_orchestrator::workers::reconcile::process_scaleset;

#[tokio::test]
async fn test_job_stops_only_after_every_task() {
    let tc = TestContext::new();
    let pool = tc.running_pool("linux", false).await;
    let job = tc.enabled_job().await;
    let first = tc.waiting_task(job.job_id, &pool.name, 1).await;
    let second = tc.waiting_task(job.job_id, &pool.name, 1).await;

    // one task stopped is not enough
    let first = first.mark_stopping(&tc.ctx).await.unwrap();
    process_state_updates(&tc.ctx, first).await.unwrap();
    fuzzfleet_orchestrator::models::Job::stop_if_all_done(&tc.ctx)
        .await
        .unwrap();
    assert_eq!(tc.job(job.job_id).await.state, JobState::Enabled);

    // stopping the job asks the remaining task to stop and waits for it
    let job = tc.job(job.job_id).await.stopping(&tc.ctx).await.unwrap();
    assert_eq!(job.state, JobState::Stopping);
    assert_eq!(tc.task(second.task_id).await.state, TaskState::Stopping);
    assert_eq!(tc.event_count("job_stopped").await, 0);

    let second = tc.task(second.task_id).await;
    process_state_updates(&tc.ctx, second).await.unwrap();

    let job = process_state_updates(&tc.ctx, tc.job(job.job_id).await)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.state, JobState::Stopped);
    assert_eq!(job.task_info.len(), 2);

    // stopped jobs never move back
    let job = job.init(&tc.ctx).await.unwrap();
    assert_eq!(job.state, JobState::Stopped);
    let job = job.stopping(&tc.ctx).await.unwrap();
    assert_eq!(job.state, JobState::Stopped);
    assert_eq!(tc.job(job.job_id).await.state, JobState::Stopped);
    assert_eq!(tc.event_count("job_stopped").await, 1);
}

#[tokio::test]
async fn test_job_without_tasks_stops_when_requested() {
    let tc = TestContext::new();
    let job = tc.enabled_job().await;

    // the all-done sweep leaves empty jobs alone
    fuzzfleet_orchestrator::models::Job::stop_if_all_done(&tc.ctx)
        .await
        .unwrap();
    assert_eq!(tc.job(job.job_id).await.state, JobState::Enabled);

    let job = job.stopping(&tc.ctx).await.unwrap();
    assert_eq!(job.state, JobState::Stopped);
    assert!(job.task_info.is_empty());
}

#[tokio::test]
async fn test_never_started_job_is_stopped() {
    let tc = TestContext::new();
    let pool = tc.running_pool("linux", false).await;
    let job = tc.enabled_job().await;
    let task = tc.waiting_task(job.job_id, &pool.name, 1).await;

    let old = chrono::Utc::now() - chrono::Duration::days(31);
    tc.backdate(&tc.job(job.job_id).await, old).await;

    fuzzfleet_orchestrator::models::Job::stop_never_started_jobs(&tc.ctx)
        .await
        .unwrap();

    let task = tc.task(task.task_id).await;
    assert_eq!(task.state, TaskState::Stopping);
    assert_eq!(task.error.unwrap().errors, vec!["job never started"]);
    assert_eq!(tc.job(job.job_id).await.state, JobState::Stopping);
}

#[tokio::test]
async fn test_shrink_queue_hands_out_exactly_n_credits() {
    let tc = TestContext::new();
    for n in [0u32, 1, 3] {
        let queue = tc.ctx.scaleset_shrink_queue(Uuid::new_v4());
        queue.create().await.unwrap();
        queue.set_size(n).await.unwrap();

        for _ in 0..n {
            assert!(queue.should_shrink().await.unwrap());
        }
        assert!(!queue.should_shrink().await.unwrap());
        assert!(!queue.should_shrink().await.unwrap());
    }
}

#[tokio::test]
async fn test_set_size_clamps_to_image_maximum() {
    let tc = TestContext::new();
    tc.running_pool("managed", true).await;

    let shared = Scaleset::create(
        &tc.ctx,
        scaleset_params("managed", "/subscriptions/x/galleries/y/images/z", 10),
    )
    .await
    .unwrap();
    let shared = shared.set_size(&tc.ctx, 5000).await.unwrap();
    assert_eq!(shared.size, 600);

    let marketplace = Scaleset::create(&tc.ctx, scaleset_params("managed", IMAGE, 10))
        .await
        .unwrap();
    let marketplace = marketplace.set_size(&tc.ctx, 5000).await.unwrap();
    assert_eq!(marketplace.size, 1000);

    let marketplace = marketplace.set_size(&tc.ctx, 7).await.unwrap();
    assert_eq!(marketplace.size, 7);
    assert_eq!(tc.scaleset(marketplace.scaleset_id).await.unwrap().size, 7);
}

#[tokio::test]
async fn test_set_size_on_running_scaleset_schedules_resize() {
    let tc = TestContext::new();
    let pool = tc.running_pool("managed", true).await;
    let scaleset = tc.running_scaleset(&pool.name, 2).await;

    let scaleset = scaleset.set_size(&tc.ctx, 4).await.unwrap();
    assert_eq!(scaleset.state, ScalesetState::Resize);
    assert_eq!(tc.event_count("scaleset_resize_scheduled").await, 1);

    let scaleset = scaleset.resize(&tc.ctx).await.unwrap();
    assert_eq!(tc.cloud.instances(scaleset.scaleset_id).await.len(), 4);
    assert_eq!(scaleset.state, ScalesetState::Resize);
}

#[tokio::test]
async fn test_resize_waits_for_every_node_to_check_in() {
    let tc = TestContext::new();
    let pool = tc.running_pool("managed", true).await;
    let scaleset = tc.running_scaleset(&pool.name, 3).await;
    let instances = tc.cloud.instances(scaleset.scaleset_id).await;
    assert_eq!(instances.len(), 3);

    let scaleset = scaleset
        .set_state(&tc.ctx, ScalesetState::Resize)
        .await
        .unwrap();
    for machine_id in &instances[..2] {
        tc.free_node_with_id(&pool.name, Some(scaleset.scaleset_id), *machine_id)
            .await;
    }

    let scaleset = scaleset.resize(&tc.ctx).await.unwrap();
    assert_eq!(scaleset.state, ScalesetState::Resize);

    tc.free_node_with_id(&pool.name, Some(scaleset.scaleset_id), instances[2])
        .await;
    let scaleset = scaleset.resize(&tc.ctx).await.unwrap();
    assert_eq!(scaleset.state, ScalesetState::Running);
}

#[tokio::test]
async fn test_shrinking_resize_queues_credits_and_halts_free_nodes() {
    let tc = TestContext::new();
    let pool = tc.running_pool("managed", true).await;
    let scaleset = tc.running_scaleset(&pool.name, 3).await;
    let instances = tc.cloud.instances(scaleset.scaleset_id).await;
    for machine_id in &instances {
        tc.free_node_with_id(&pool.name, Some(scaleset.scaleset_id), *machine_id)
            .await;
    }

    let scaleset = scaleset.set_size(&tc.ctx, 1).await.unwrap();
    let scaleset = scaleset.resize(&tc.ctx).await.unwrap();
    assert_eq!(
        tc.ctx
            .scaleset_shrink_queue(scaleset.scaleset_id)
            .len()
            .await
            .unwrap(),
        2
    );

    // the next two nodes asking for work consume the credits and halt
    for machine_id in &instances {
        tc.send_state(*machine_id, NodeState::Free, None)
            .await
            .unwrap();
    }
    let halted: Vec<Node> = Node::search_states(&tc.ctx, Some(scaleset.scaleset_id), &[NodeState::Halt])
        .await
        .unwrap();
    assert_eq!(halted.len(), 2);
    assert!(halted.iter().all(|n| n.delete_requested));
}

#[tokio::test]
async fn test_halt_is_terminal() {
    let tc = TestContext::new();
    let pool = tc.running_pool("managed", true).await;
    let scaleset = tc.running_scaleset(&pool.name, 1).await;

    let scaleset = scaleset.set_shutdown(&tc.ctx, true).await.unwrap();
    assert_eq!(scaleset.state, ScalesetState::Halt);

    for state in [
        ScalesetState::Running,
        ScalesetState::Resize,
        ScalesetState::Init,
        ScalesetState::Shutdown,
    ] {
        let unchanged = scaleset.clone().set_state(&tc.ctx, state).await.unwrap();
        assert_eq!(unchanged.state, ScalesetState::Halt);
    }
    let scaleset = scaleset.set_shutdown(&tc.ctx, false).await.unwrap();
    assert_eq!(scaleset.state, ScalesetState::Halt);
    assert_eq!(
        tc.scaleset(scaleset.scaleset_id).await.unwrap().state,
        ScalesetState::Halt
    );

    // processing a halted scaleset removes it and its cloud resource
    assert!(process_state_updates(&tc.ctx, scaleset.clone())
        .await
        .unwrap()
        .is_none());
    assert!(tc.scaleset(scaleset.scaleset_id).await.is_none());
    assert!(!tc.cloud.vmss_exists(scaleset.scaleset_id).await);
    assert_eq!(tc.event_count("scaleset_deleted").await, 1);
}

#[tokio::test]
async fn test_pending_cloud_delete_keeps_halted_scaleset() {
    let tc = TestContext::new();
    let pool = tc.running_pool("managed", true).await;
    let scaleset = tc.running_scaleset(&pool.name, 1).await;
    tc.cloud.set_delete_pending(scaleset.scaleset_id, true).await;

    let scaleset = scaleset.set_shutdown(&tc.ctx, true).await.unwrap();
    let scaleset = scaleset.halt(&tc.ctx).await.unwrap().expect("kept while pending");
    assert_eq!(scaleset.state, ScalesetState::Halt);

    tc.cloud.set_delete_pending(scaleset.scaleset_id, false).await;
    assert!(scaleset.halt(&tc.ctx).await.unwrap().is_none());
}

async fn done_nodes(tc: &TestContext, pool_name: &str, scaleset: &Scaleset) -> Vec<Uuid> {
    let instances = tc.cloud.instances(scaleset.scaleset_id).await;
    for machine_id in &instances {
        let node = tc
            .free_node_with_id(pool_name, Some(scaleset.scaleset_id), *machine_id)
            .await;
        node.acquire_scale_in_protection(&tc.ctx).await.unwrap();
        tc.send_state(*machine_id, NodeState::Done, None)
            .await
            .unwrap();
    }

    let mut keep = tc.node(instances[0]).await.unwrap();
    keep.debug_keep_node = true;
    keep.save(&tc.ctx).await.unwrap();
    instances
}

#[tokio::test]
async fn test_debug_nodes_are_not_reimaged() {
    let tc = TestContext::new();
    let pool = tc.running_pool("managed", true).await;
    let scaleset = tc.running_scaleset(&pool.name, 3).await;
    let instances = done_nodes(&tc, &pool.name, &scaleset).await;

    let (_, modified) = scaleset.cleanup_nodes(&tc.ctx).await.unwrap();
    assert!(modified);

    let reimaged = tc.cloud.reimaged_nodes().await;
    assert_eq!(reimaged.len(), 2);
    assert!(!reimaged.contains(&instances[0]));

    // reimaged nodes register again; the kept node stays
    assert!(tc.node(instances[0]).await.is_some());
    assert!(tc.node(instances[1]).await.is_none());
    assert!(tc.node(instances[2]).await.is_none());
}

fn decommissioning() -> TestContext {
    TestContext::with_config(Config {
        service_version: common::VERSION.to_string(),
        node_disposal_strategy: NodeDisposalStrategy::Decommission,
        ..Config::default()
    })
}

#[tokio::test]
async fn test_debug_nodes_keep_protection_when_decommissioning() {
    let tc = decommissioning();
    let pool = tc.running_pool("managed", true).await;
    let scaleset = tc.running_scaleset(&pool.name, 3).await;
    let instances = done_nodes(&tc, &pool.name, &scaleset).await;
    assert_eq!(tc.cloud.protected(scaleset.scaleset_id).await.len(), 3);

    scaleset.clone().cleanup_nodes(&tc.ctx).await.unwrap();

    assert!(tc.cloud.reimaged_nodes().await.is_empty());
    assert!(tc.cloud.deleted_nodes().await.is_empty());
    assert_eq!(tc.cloud.protected(scaleset.scaleset_id).await, vec![instances[0]]);
}

#[tokio::test]
async fn test_delete_requested_nodes_are_deleted_from_cloud() {
    let tc = TestContext::new();
    let pool = tc.running_pool("managed", true).await;
    let scaleset = tc.running_scaleset(&pool.name, 2).await;
    let instances = tc.cloud.instances(scaleset.scaleset_id).await;
    for machine_id in &instances {
        tc.free_node_with_id(&pool.name, Some(scaleset.scaleset_id), *machine_id)
            .await;
    }

    let node = tc.node(instances[0]).await.unwrap();
    node.set_halt(&tc.ctx).await.unwrap();

    scaleset.cleanup_nodes(&tc.ctx).await.unwrap();

    assert_eq!(tc.cloud.deleted_nodes().await, vec![instances[0]]);
    assert!(tc.node(instances[0]).await.is_none());
    assert!(tc.node(instances[1]).await.is_some());
}

#[tokio::test]
async fn test_scaleset_init_fails_on_os_mismatch() {
    let tc = TestContext::new();
    tc.running_pool("managed", true).await;
    tc.cloud
        .set_image_os("MicrosoftWindowsServer:2019", fuzzfleet_orchestrator::models::Os::Windows)
        .await;

    let scaleset = Scaleset::create(
        &tc.ctx,
        scaleset_params("managed", "MicrosoftWindowsServer:2019", 2),
    )
    .await
    .unwrap();
    let scaleset = process_state_updates(&tc.ctx, scaleset)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(scaleset.state, ScalesetState::CreationFailed);
    assert!(scaleset.error.unwrap().errors[0].contains("invalid os"));
    assert_eq!(tc.event_count("scaleset_failed").await, 1);
}

#[tokio::test]
async fn test_scaleset_setup_records_create_failure() {
    let tc = TestContext::new();
    tc.running_pool("managed", true).await;
    tc.cloud.fail_next_create("quota exceeded").await;

    let mut scaleset = Scaleset::create(&tc.ctx, scaleset_params("managed", IMAGE, 2))
        .await
        .unwrap();
    for _ in 0..4 {
        scaleset = process_state_updates(&tc.ctx, scaleset)
            .await
            .unwrap()
            .unwrap();
    }

    assert_eq!(scaleset.state, ScalesetState::CreationFailed);
    assert!(scaleset.error.unwrap().errors[0].contains("quota exceeded"));
}

#[tokio::test]
async fn test_dead_nodes_fail_their_tasks() {
    let tc = TestContext::new();
    let pool = tc.running_pool("managed", true).await;
    let scaleset = tc.running_scaleset(&pool.name, 1).await;
    let machine_id = tc.cloud.instances(scaleset.scaleset_id).await[0];
    let job = tc.enabled_job().await;
    let task = tc.waiting_task(job.job_id, &pool.name, 1).await;

    tc.free_node_with_id(&pool.name, Some(scaleset.scaleset_id), machine_id)
        .await;
    tc.send_state(
        machine_id,
        NodeState::SettingUp,
        Some(fuzzfleet_orchestrator::agent_events::NodeStateData::SettingUp {
            tasks: vec![task.task_id],
        }),
    )
    .await
    .unwrap();

    let mut node = tc.node(machine_id).await.unwrap();
    node.heartbeat = Some(chrono::Utc::now() - chrono::Duration::hours(2));
    node.save(&tc.ctx).await.unwrap();

    scaleset.cleanup_nodes(&tc.ctx).await.unwrap();

    let task = tc.task(task.task_id).await;
    assert_eq!(task.state, TaskState::Stopping);
    assert!(task.error.unwrap().errors[0].starts_with("node heartbeat expired"));
    assert_eq!(tc.cloud.reimaged_nodes().await, vec![machine_id]);
}

#[tokio::test]
async fn test_decommission_counts_only_released_protection() {
    let tc = decommissioning();
    let pool = tc.running_pool("managed", true).await;
    let scaleset = tc.running_scaleset(&pool.name, 2).await;
    let scaleset_id = scaleset.scaleset_id;
    let machine_id = tc.cloud.instances(scaleset_id).await[0];

    let node = tc
        .free_node_with_id(&pool.name, Some(scaleset_id), machine_id)
        .await;
    node.acquire_scale_in_protection(&tc.ctx).await.unwrap();
    tc.send_state(machine_id, NodeState::Done, None)
        .await
        .unwrap();

    let (scaleset, modified) = scaleset.cleanup_nodes(&tc.ctx).await.unwrap();
    assert!(modified);
    assert!(tc.cloud.protected(scaleset_id).await.is_empty());

    // the record stays until the autoscaler removes the instance
    let (_, modified) = scaleset.unwrap().cleanup_nodes(&tc.ctx).await.unwrap();
    assert!(!modified);
    assert!(tc.node(machine_id).await.is_some());
}

#[tokio::test]
async fn test_decommissioned_scaleset_still_drains() {
    let tc = decommissioning();
    let pool = tc.running_pool("managed", true).await;
    let scaleset = tc.running_scaleset(&pool.name, 2).await;
    let scaleset_id = scaleset.scaleset_id;
    let instances = tc.cloud.instances(scaleset_id).await;
    for machine_id in &instances {
        tc.free_node_with_id(&pool.name, Some(scaleset_id), *machine_id)
            .await;
    }
    tc.send_state(instances[0], NodeState::Done, None)
        .await
        .unwrap();

    scaleset.set_shutdown(&tc.ctx, false).await.unwrap();
    for _ in 0..3 {
        let current = tc.scaleset(scaleset_id).await.unwrap();
        process_scaleset(&tc.ctx, current).await.unwrap();
    }

    assert_eq!(
        tc.scaleset(scaleset_id).await.unwrap().state,
        ScalesetState::Shutdown
    );
    assert!(tc.node(instances[1]).await.unwrap().delete_requested);
    assert_eq!(
        tc.cloud.autoscale_profile(scaleset_id).await,
        Some(AutoscaleProfile::scale_in_only(0, 2))
    );
    assert!(tc.cloud.deleted_nodes().await.is_empty());
}

#[tokio::test]
async fn test_shutdown_limits_autoscale_to_protected_nodes() {
    let tc = TestContext::new();
    let pool = tc.running_pool("managed", true).await;
    let scaleset = tc.running_scaleset(&pool.name, 3).await;
    let scaleset_id = scaleset.scaleset_id;
    let instances = tc.cloud.instances(scaleset_id).await;
    for machine_id in &instances {
        tc.free_node_with_id(&pool.name, Some(scaleset_id), *machine_id)
            .await;
    }
    let working = tc.node(instances[0]).await.unwrap();
    working.acquire_scale_in_protection(&tc.ctx).await.unwrap();

    let scaleset = scaleset.set_shutdown(&tc.ctx, false).await.unwrap();
    let scaleset = scaleset
        .shutdown(&tc.ctx)
        .await
        .unwrap()
        .expect("still draining");

    assert_eq!(
        tc.cloud.autoscale_profile(scaleset_id).await,
        Some(AutoscaleProfile::scale_in_only(1, 3))
    );
    for machine_id in &instances {
        assert!(tc.node(*machine_id).await.unwrap().delete_requested);
    }

    // once the autoscaler has removed every instance the scaleset goes away
    tc.cloud.set_capacity(scaleset_id, 0).await;
    assert!(scaleset.shutdown(&tc.ctx).await.unwrap().is_none());
    assert!(tc.scaleset(scaleset_id).await.is_none());
    assert!(!tc.cloud.vmss_exists(scaleset_id).await);
}

#[tokio::test]
async fn test_running_scaleset_adopts_cloud_size() {
    let tc = TestContext::new();
    let pool = tc.running_pool("managed", true).await;
    let scaleset = tc.running_scaleset(&pool.name, 2).await;
    let scaleset_id = scaleset.scaleset_id;

    tc.cloud.set_capacity(scaleset_id, 5).await;
    let scaleset = scaleset.sync_scaleset_size(&tc.ctx).await.unwrap();
    assert_eq!(scaleset.size, 5);
    assert_eq!(tc.scaleset(scaleset_id).await.unwrap().size, 5);

    // a resizing scaleset keeps its requested size
    let scaleset = scaleset
        .set_state(&tc.ctx, ScalesetState::Resize)
        .await
        .unwrap();
    tc.cloud.set_capacity(scaleset_id, 1).await;
    let scaleset = scaleset.sync_scaleset_size(&tc.ctx).await.unwrap();
    assert_eq!(scaleset.size, 5);
}

#[tokio::test]
async fn test_resize_of_vanished_scaleset_halts() {
    let tc = TestContext::new();
    let pool = tc.running_pool("managed", true).await;
    let scaleset = tc.running_scaleset(&pool.name, 2).await;
    let scaleset = scaleset.set_size(&tc.ctx, 4).await.unwrap();
    assert_eq!(scaleset.state, ScalesetState::Resize);

    assert!(tc.cloud.delete_vmss(scaleset.scaleset_id).await.unwrap());
    let scaleset = scaleset.resize(&tc.ctx).await.unwrap();
    assert_eq!(scaleset.state, ScalesetState::Halt);
}

#[tokio::test]
async fn test_grow_waits_while_scaleset_is_busy() {
    let tc = TestContext::new();
    let pool = tc.running_pool("managed", true).await;
    let scaleset = tc.running_scaleset(&pool.name, 2).await;
    let scaleset_id = scaleset.scaleset_id;
    let scaleset = scaleset.set_size(&tc.ctx, 4).await.unwrap();

    tc.cloud.set_busy(scaleset_id, true).await;
    let scaleset = scaleset.resize(&tc.ctx).await.unwrap();
    assert_eq!(scaleset.state, ScalesetState::Resize);
    assert_eq!(tc.cloud.instances(scaleset_id).await.len(), 2);

    tc.cloud.set_busy(scaleset_id, false).await;
    let scaleset = scaleset.resize(&tc.ctx).await.unwrap();
    assert_eq!(scaleset.state, ScalesetState::Resize);
    assert_eq!(tc.cloud.instances(scaleset_id).await.len(), 4);
}

#[tokio::test]
async fn test_setup_creates_network_then_waits_for_provisioning() {
    let tc = TestContext::new();
    tc.running_pool("managed", true).await;
    let scaleset = Scaleset::create(&tc.ctx, scaleset_params("managed", IMAGE, 2))
        .await
        .unwrap();
    let scaleset_id = scaleset.scaleset_id;

    // the new network is persisted before the VM scaleset is created
    let scaleset = process_state_updates(&tc.ctx, scaleset)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(scaleset.state, ScalesetState::Setup);
    assert!(tc.cloud.network_exists("eastus").await);
    assert!(!tc.cloud.vmss_exists(scaleset_id).await);

    let scaleset = process_state_updates(&tc.ctx, scaleset)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(scaleset.state, ScalesetState::Setup);
    assert!(tc.cloud.vmss_exists(scaleset_id).await);

    tc.cloud
        .set_vmss_provisioning(scaleset_id, ProvisioningState::Creating)
        .await;
    let scaleset = process_state_updates(&tc.ctx, scaleset)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(scaleset.state, ScalesetState::Setup);
    assert!(scaleset.client_object_id.is_some());

    tc.cloud
        .set_vmss_provisioning(scaleset_id, ProvisioningState::Succeeded)
        .await;
    let scaleset = process_state_updates(&tc.ctx, scaleset)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(scaleset.state, ScalesetState::Running);
    assert_eq!(
        tc.cloud.autoscale_profile(scaleset_id).await,
        Some(AutoscaleProfile::default_for(2, scaleset.max_size()))
    );
}

#[tokio::test]
async fn test_pool_shrink_credit_deletes_instead_of_reimaging() {
    let tc = TestContext::new();
    let pool = tc.running_pool("managed", true).await;
    let scaleset = tc.running_scaleset(&pool.name, 2).await;
    let instances = tc.cloud.instances(scaleset.scaleset_id).await;
    for machine_id in &instances {
        tc.free_node_with_id(&pool.name, Some(scaleset.scaleset_id), *machine_id)
            .await;
    }
    tc.send_state(instances[0], NodeState::Done, None)
        .await
        .unwrap();

    let pool_queue = tc.ctx.pool_shrink_queue(pool.pool_id);
    pool_queue.add_entry().await.unwrap();

    let (_, modified) = scaleset.cleanup_nodes(&tc.ctx).await.unwrap();
    assert!(modified);
    assert_eq!(tc.cloud.deleted_nodes().await, vec![instances[0]]);
    assert!(tc.cloud.reimaged_nodes().await.is_empty());
    assert!(tc.node(instances[0]).await.is_none());
    assert!(tc.node(instances[1]).await.is_some());
    assert_eq!(pool_queue.len().await.unwrap(), 0);
}

#[tokio::test]
async fn test_config_update_pushes_extensions() {
    let tc = TestContext::new();
    let pool = tc.running_pool("managed", true).await;
    let mut scaleset = tc.running_scaleset(&pool.name, 1).await;
    let scaleset_id = scaleset.scaleset_id;
    scaleset.needs_config_update = true;
    let scaleset = scaleset.save(&tc.ctx).await.unwrap();

    tc.cloud.set_busy(scaleset_id, true).await;
    let scaleset = scaleset.update_configs(&tc.ctx).await.unwrap();
    assert!(scaleset.needs_config_update);

    tc.cloud.set_busy(scaleset_id, false).await;
    let scaleset = scaleset.update_configs(&tc.ctx).await.unwrap();
    assert!(!scaleset.needs_config_update);
    assert_eq!(
        tc.cloud.vmss_extensions(scaleset_id).await,
        fuzz_extensions(&pool, &scaleset)
    );
}
