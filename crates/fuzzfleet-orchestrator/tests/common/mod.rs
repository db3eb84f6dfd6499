// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for fuzzfleet-orchestrator integration tests.
//!
//! Provides TestContext wiring an orchestrator context to the memory store,
//! the simulated cloud, the in-memory queue and a collecting event sink.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fuzzfleet_store::{
    Entity, EntityStore, MemoryStore, QueryFilter, Store, StoreError, StoredRecord,
};
use uuid::Uuid;

use fuzzfleet_orchestrator::OrchestratorContext;
use fuzzfleet_orchestrator::agent_events::{
    self, AgentRegistration, NodeEvent, NodeEventEnvelope, NodeStateData, NodeStateUpdate,
};
use fuzzfleet_orchestrator::cloud::SimulatedCloud;
use fuzzfleet_orchestrator::config::Config;
use fuzzfleet_orchestrator::events::MemoryEventSink;
use fuzzfleet_orchestrator::models::{
    Architecture, AutoScaleConfig, Job, JobConfig, NewScaleset, Node, Os, Pool, Scaleset, Task,
    TaskConfig, TaskDetails, TaskPool, TaskType,
};
use fuzzfleet_orchestrator::operations::process_state_updates;
use fuzzfleet_orchestrator::queue::MemoryQueue;
use fuzzfleet_orchestrator::states::{NodeState, ScalesetState};

/// Agent version matching the service version of every test context.
pub const VERSION: &str = "2.20.0";

/// Marketplace image accepted by the simulated cloud as Linux.
pub const IMAGE: &str = "Canonical:UbuntuServer:18.04-LTS:latest";

/// Memory store that fails replaces of selected rows as concurrent updates.
pub struct ConflictingStore {
    inner: Arc<MemoryStore>,
    rejected: Mutex<HashSet<String>>,
}

impl ConflictingStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            rejected: Mutex::new(HashSet::new()),
        }
    }

    /// Fail every later replace of records stored under `row_key`.
    pub fn reject_writes(&self, row_key: impl Into<String>) {
        self.rejected.lock().unwrap().insert(row_key.into());
    }
}

#[async_trait]
impl EntityStore for ConflictingStore {
    fn backend_name(&self) -> &'static str {
        "conflicting-memory"
    }

    async fn get(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> fuzzfleet_store::Result<Option<StoredRecord>> {
        self.inner.get(table, partition_key, row_key).await
    }

    async fn query(
        &self,
        table: &str,
        filter: &QueryFilter,
    ) -> fuzzfleet_store::Result<Vec<StoredRecord>> {
        self.inner.query(table, filter).await
    }

    async fn insert(&self, record: StoredRecord) -> fuzzfleet_store::Result<StoredRecord> {
        self.inner.insert(record).await
    }

    async fn replace(&self, record: StoredRecord) -> fuzzfleet_store::Result<StoredRecord> {
        let rejected = self.rejected.lock().unwrap().contains(&record.row_key);
        if rejected {
            return Err(StoreError::ConcurrencyConflict {
                table: record.table,
                partition_key: record.partition_key,
                row_key: record.row_key,
            });
        }
        self.inner.replace(record).await
    }

    async fn delete(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        etag: Option<&str>,
    ) -> fuzzfleet_store::Result<bool> {
        self.inner.delete(table, partition_key, row_key, etag).await
    }
}

/// Test context holding the orchestrator context and direct handles to the
/// in-memory backends behind it.
pub struct TestContext {
    pub ctx: OrchestratorContext,
    pub store: Arc<MemoryStore>,
    pub conflicts: Arc<ConflictingStore>,
    pub cloud: SimulatedCloud,
    pub queue: Arc<MemoryQueue>,
    pub events: Arc<MemoryEventSink>,
}

impl TestContext {
    /// Create a context with default configuration.
    pub fn new() -> Self {
        Self::with_config(Config {
            service_version: VERSION.to_string(),
            ..Config::default()
        })
    }

    /// Create a context with the given configuration.
    pub fn with_config(config: Config) -> Self {
        let store = Arc::new(MemoryStore::new());
        let conflicts = Arc::new(ConflictingStore::new(store.clone()));
        let cloud = SimulatedCloud::new();
        let queue = Arc::new(MemoryQueue::new());
        let events = Arc::new(MemoryEventSink::new());

        let ctx = OrchestratorContext::new(
            Store::new(conflicts.clone()),
            cloud.providers(),
            queue.clone(),
            events.clone(),
            config,
        );

        Self {
            ctx,
            store,
            conflicts,
            cloud,
            queue,
            events,
        }
    }

    /// Age a stored entity.
    pub async fn backdate<E: Entity>(&self, entity: &E, timestamp: DateTime<Utc>) {
        self.store
            .backdate(E::TABLE, &entity.partition_key(), &entity.row_key(), timestamp)
            .await
            .expect("Failed to backdate entity");
    }

    /// Create a pool and bring it to `running`.
    pub async fn running_pool(&self, name: &str, managed: bool) -> Pool {
        self.running_pool_with(name, managed, None).await
    }

    /// Create a pool with an autoscale configuration and bring it to `running`.
    pub async fn running_pool_with(
        &self,
        name: &str,
        managed: bool,
        autoscale: Option<AutoScaleConfig>,
    ) -> Pool {
        let pool = Pool::create(
            &self.ctx,
            name,
            Os::Linux,
            Architecture::X86_64,
            managed,
            None,
            autoscale,
        )
        .await
        .expect("Failed to create pool");
        process_state_updates(&self.ctx, pool)
            .await
            .expect("Failed to init pool")
            .expect("Pool deleted during init")
    }

    /// Create a scaleset and drive it until it is `running`.
    pub async fn running_scaleset(&self, pool_name: &str, size: u32) -> Scaleset {
        let mut scaleset = Scaleset::create(&self.ctx, scaleset_params(pool_name, IMAGE, size))
            .await
            .expect("Failed to create scaleset");

        for _ in 0..10 {
            if scaleset.state == ScalesetState::Running {
                return scaleset;
            }
            scaleset = process_state_updates(&self.ctx, scaleset)
                .await
                .expect("Failed to process scaleset")
                .expect("Scaleset deleted during setup");
        }
        panic!("scaleset stuck in {}", scaleset.state);
    }

    /// Create an enabled job.
    pub async fn enabled_job(&self) -> Job {
        let job = Job::create(&self.ctx, job_config(), None)
            .await
            .expect("Failed to create job");
        process_state_updates(&self.ctx, job)
            .await
            .expect("Failed to init job")
            .expect("Job deleted during init")
    }

    /// Create a waiting task on `pool_name`.
    pub async fn waiting_task(&self, job_id: Uuid, pool_name: &str, count: u32) -> Task {
        let task = Task::create(&self.ctx, task_config(job_id, pool_name, count), None)
            .await
            .expect("Failed to create task");
        process_state_updates(&self.ctx, task)
            .await
            .expect("Failed to init task")
            .expect("Task deleted during init")
    }

    /// Register a node and report it free.
    pub async fn free_node(&self, pool_name: &str, scaleset_id: Option<Uuid>) -> Node {
        let machine_id = Uuid::new_v4();
        self.free_node_with_id(pool_name, scaleset_id, machine_id)
            .await
    }

    /// Register `machine_id` and report it free.
    pub async fn free_node_with_id(
        &self,
        pool_name: &str,
        scaleset_id: Option<Uuid>,
        machine_id: Uuid,
    ) -> Node {
        agent_events::register(
            &self.ctx,
            AgentRegistration {
                machine_id,
                pool_name: pool_name.to_string(),
                scaleset_id,
                version: VERSION.to_string(),
            },
        )
        .await
        .expect("Failed to register node");

        self.send_state(machine_id, NodeState::Free, None)
            .await
            .expect("Failed to report node free");
        self.node(machine_id).await.expect("Node missing after registration")
    }

    /// Report a node state change.
    pub async fn send_state(
        &self,
        machine_id: Uuid,
        state: NodeState,
        data: Option<NodeStateData>,
    ) -> fuzzfleet_orchestrator::Result<()> {
        agent_events::process_node_event(
            &self.ctx,
            NodeEventEnvelope {
                machine_id,
                event: NodeEvent::StateUpdate(NodeStateUpdate { state, data }),
            },
        )
        .await
    }

    /// Current node record.
    pub async fn node(&self, machine_id: Uuid) -> Option<Node> {
        Node::get_by_machine_id(&self.ctx, machine_id)
            .await
            .expect("Failed to load node")
    }

    /// Current task record.
    pub async fn task(&self, task_id: Uuid) -> Task {
        Task::get_by_task_id(&self.ctx, task_id)
            .await
            .expect("Failed to load task")
            .expect("Task missing")
    }

    /// Current job record.
    pub async fn job(&self, job_id: Uuid) -> Job {
        Job::get(&self.ctx, job_id)
            .await
            .expect("Failed to load job")
            .expect("Job missing")
    }

    /// Current scaleset record.
    pub async fn scaleset(&self, scaleset_id: Uuid) -> Option<Scaleset> {
        Scaleset::get_by_id(&self.ctx, scaleset_id)
            .await
            .expect("Failed to load scaleset")
    }

    /// Number of recorded events of one kind.
    pub async fn event_count(&self, event_type: &str) -> usize {
        self.events.events_of(event_type).await.len()
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Job configuration lasting one day.
pub fn job_config() -> JobConfig {
    JobConfig {
        project: "project".to_string(),
        name: "name".to_string(),
        build: "build".to_string(),
        duration: 24,
    }
}

/// Fuzzing task configuration targeting a pool.
pub fn task_config(job_id: Uuid, pool_name: &str, count: u32) -> TaskConfig {
    TaskConfig {
        job_id,
        prereq_tasks: Vec::new(),
        task: TaskDetails {
            task_type: TaskType::LibfuzzerFuzz,
            duration: 24,
            target_exe: "fuzz.exe".to_string(),
            reboot_after_setup: None,
        },
        vm: None,
        pool: Some(TaskPool {
            count,
            pool_name: pool_name.to_string(),
        }),
        containers: Vec::new(),
        tags: BTreeMap::new(),
        debug: Vec::new(),
        colocate: None,
    }
}

/// Scaleset parameters in the default region.
pub fn scaleset_params(pool_name: &str, image: &str, size: u32) -> NewScaleset {
    NewScaleset {
        pool_name: pool_name.to_string(),
        vm_sku: "Standard_D2s_v3".to_string(),
        image: image.to_string(),
        region: "eastus".to_string(),
        size,
        spot_instances: false,
        ephemeral_os_disks: true,
        tags: BTreeMap::new(),
    }
}
