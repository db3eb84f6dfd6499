// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle states and the state-set predicates shared by every module.
//!
//! Each entity type has exactly one state enum defined here together with the
//! sets the reconciliation loop cares about (`needs_work`, `available`, ...).
//! The sets are exposed both as predicates and as constant slices so they can
//! be fed straight into store queries.

use serde::{Deserialize, Serialize};

macro_rules! state_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// Every state in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Stored representation of the state.
            pub fn as_str(self) -> &'static str {
                match self {
                    $( $name::$variant => $text ),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl From<$name> for serde_json::Value {
            fn from(state: $name) -> Self {
                serde_json::Value::String(state.as_str().to_string())
            }
        }
    };
}

state_enum! {
    /// Lifecycle of a worker node as reported by its agent.
    NodeState {
        /// Registered, agent starting up.
        Init => "init",
        /// Idle and able to take work.
        Free => "free",
        /// Running setup for assigned tasks.
        SettingUp => "setting_up",
        /// Rebooting after setup.
        Rebooting => "rebooting",
        /// Setup complete, about to run tasks.
        Ready => "ready",
        /// Running at least one task.
        Busy => "busy",
        /// Finished its work and waiting to be reset.
        Done => "done",
        /// Draining before removal.
        Shutdown => "shutdown",
        /// Stopped and waiting to be deleted.
        Halt => "halt",
    }
}

impl NodeState {
    /// States the reconciliation loop must dispose of.
    pub const NEEDS_WORK: &'static [NodeState] =
        &[NodeState::Done, NodeState::Shutdown, NodeState::Halt];

    /// States from which a node can be reimaged or deleted.
    pub const READY_FOR_RESET: &'static [NodeState] = Self::NEEDS_WORK;

    /// States in which a node may pick up a new work set.
    pub const CAN_PROCESS_NEW_WORK: &'static [NodeState] = &[NodeState::Free];

    /// States in which a node is considered idle.
    pub const AVAILABLE: &'static [NodeState] = &[NodeState::Free, NodeState::Ready];

    /// True when reconciliation has to act on the node.
    pub fn needs_work(self) -> bool {
        Self::NEEDS_WORK.contains(&self)
    }

    /// True once a node waits to be reimaged or deleted.
    pub fn ready_for_reset(self) -> bool {
        Self::READY_FOR_RESET.contains(&self)
    }

    /// True when the node may receive new work.
    pub fn can_process_new_work(self) -> bool {
        Self::CAN_PROCESS_NEW_WORK.contains(&self)
    }

    /// True when the node is idle.
    pub fn available(self) -> bool {
        Self::AVAILABLE.contains(&self)
    }
}

state_enum! {
    /// Progress of one task on one node.
    NodeTaskState {
        /// Assigned but not yet started.
        Init => "init",
        /// Setting up on the node.
        SettingUp => "setting_up",
        /// Running on the node.
        Running => "running",
    }
}

state_enum! {
    /// Lifecycle of a fuzzing task.
    TaskState {
        /// Created, waiting for its queue to be set up.
        Init => "init",
        /// Waiting to be scheduled.
        Waiting => "waiting",
        /// Handed to a pool work queue.
        Scheduled => "scheduled",
        /// A node is running setup for it.
        SettingUp => "setting_up",
        /// Running on at least one node.
        Running => "running",
        /// Being torn down.
        Stopping => "stopping",
        /// Finished.
        Stopped => "stopped",
        /// Waiting for its job.
        WaitJob => "wait_job",
    }
}

impl TaskState {
    /// States the reconciliation loop must drive.
    pub const NEEDS_WORK: &'static [TaskState] = &[TaskState::Init, TaskState::Stopping];

    /// States that are not shutting down.
    pub const AVAILABLE: &'static [TaskState] = &[
        TaskState::Init,
        TaskState::Waiting,
        TaskState::Scheduled,
        TaskState::SettingUp,
        TaskState::Running,
        TaskState::WaitJob,
    ];

    /// States of a task that is going away.
    pub const SHUTTING_DOWN: &'static [TaskState] = &[TaskState::Stopping, TaskState::Stopped];

    /// States reached once the task started running.
    pub const HAS_STARTED: &'static [TaskState] =
        &[TaskState::Running, TaskState::Stopping, TaskState::Stopped];

    /// True when reconciliation has to act on the task.
    pub fn needs_work(self) -> bool {
        Self::NEEDS_WORK.contains(&self)
    }

    /// True while the task is not shutting down.
    pub fn available(self) -> bool {
        Self::AVAILABLE.contains(&self)
    }

    /// True when the task is stopping or stopped.
    pub fn shutting_down(self) -> bool {
        Self::SHUTTING_DOWN.contains(&self)
    }

    /// True once the task started running.
    pub fn has_started(self) -> bool {
        Self::HAS_STARTED.contains(&self)
    }
}

state_enum! {
    /// Lifecycle of a job.
    JobState {
        /// Created.
        Init => "init",
        /// Accepting and running tasks.
        Enabled => "enabled",
        /// Waiting for its tasks to stop.
        Stopping => "stopping",
        /// Every task stopped.
        Stopped => "stopped",
    }
}

impl JobState {
    /// States the reconciliation loop must drive.
    pub const NEEDS_WORK: &'static [JobState] = &[JobState::Init, JobState::Stopping];

    /// States that are not shutting down.
    pub const AVAILABLE: &'static [JobState] = &[JobState::Init, JobState::Enabled];

    /// True when reconciliation has to act on the job.
    pub fn needs_work(self) -> bool {
        Self::NEEDS_WORK.contains(&self)
    }

    /// True while the job is not shutting down.
    pub fn available(self) -> bool {
        Self::AVAILABLE.contains(&self)
    }

    /// Position in the lifecycle. Job state never moves to a lower ordinal.
    pub fn ordinal(self) -> u8 {
        match self {
            JobState::Init => 0,
            JobState::Enabled => 1,
            JobState::Stopping => 2,
            JobState::Stopped => 3,
        }
    }
}

state_enum! {
    /// Lifecycle of a VM scaleset.
    ScalesetState {
        /// Created, waiting for its pool.
        Init => "init",
        /// Network and cloud resource being created.
        Setup => "setup",
        /// Size changing.
        Resize => "resize",
        /// Steady state.
        Running => "running",
        /// Draining.
        Shutdown => "shutdown",
        /// Being deleted. Terminal.
        Halt => "halt",
        /// Cloud resource could not be created.
        CreationFailed => "creation_failed",
    }
}

impl ScalesetState {
    /// States the reconciliation loop must drive.
    pub const NEEDS_WORK: &'static [ScalesetState] = &[
        ScalesetState::Init,
        ScalesetState::Setup,
        ScalesetState::Resize,
        ScalesetState::Shutdown,
        ScalesetState::Halt,
    ];

    /// States in which the scaleset's nodes may take work.
    pub const AVAILABLE: &'static [ScalesetState] =
        &[ScalesetState::Resize, ScalesetState::Running];

    /// States in which the scaleset is being changed and must not be autoscaled.
    pub const MODIFYING: &'static [ScalesetState] = Self::NEEDS_WORK;

    /// True when reconciliation has to act on the scaleset.
    pub fn needs_work(self) -> bool {
        Self::NEEDS_WORK.contains(&self)
    }

    /// True when nodes of the scaleset may take work.
    pub fn available(self) -> bool {
        Self::AVAILABLE.contains(&self)
    }

    /// True while the scaleset is being changed.
    pub fn modifying(self) -> bool {
        Self::MODIFYING.contains(&self)
    }
}

state_enum! {
    /// Lifecycle of a pool.
    PoolState {
        /// Created, queues not yet set up.
        Init => "init",
        /// Accepting work.
        Running => "running",
        /// Draining.
        Shutdown => "shutdown",
        /// Being deleted.
        Halt => "halt",
    }
}

impl PoolState {
    /// States the reconciliation loop must drive.
    pub const NEEDS_WORK: &'static [PoolState] =
        &[PoolState::Init, PoolState::Shutdown, PoolState::Halt];

    /// States in which the pool accepts work.
    pub const AVAILABLE: &'static [PoolState] = &[PoolState::Init, PoolState::Running];

    /// True when reconciliation has to act on the pool.
    pub fn needs_work(self) -> bool {
        Self::NEEDS_WORK.contains(&self)
    }

    /// True when the pool accepts work.
    pub fn available(self) -> bool {
        Self::AVAILABLE.contains(&self)
    }
}

state_enum! {
    /// Lifecycle of a single-VM helper (proxy or repro).
    VmState {
        /// VM being created.
        Init => "init",
        /// Extensions being installed.
        ExtensionsLaunch => "extensions_launch",
        /// Extension installation failed.
        ExtensionsFailed => "extensions_failed",
        /// VM allocation failed.
        VmAllocationFailed => "vm_allocation_failed",
        /// Ready.
        Running => "running",
        /// VM being deleted.
        Stopping => "stopping",
        /// VM gone.
        Stopped => "stopped",
    }
}

impl VmState {
    /// States the reconciliation loop must drive.
    pub const NEEDS_WORK: &'static [VmState] =
        &[VmState::Init, VmState::ExtensionsLaunch, VmState::Stopping];

    /// States that are not shutting down.
    pub const AVAILABLE: &'static [VmState] = &[
        VmState::Init,
        VmState::ExtensionsLaunch,
        VmState::ExtensionsFailed,
        VmState::VmAllocationFailed,
        VmState::Running,
    ];

    /// True when reconciliation has to act on the VM.
    pub fn needs_work(self) -> bool {
        Self::NEEDS_WORK.contains(&self)
    }

    /// True while the VM is not shutting down.
    pub fn available(self) -> bool {
        Self::AVAILABLE.contains(&self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_reset_states() {
        assert!(NodeState::Done.ready_for_reset());
        assert!(NodeState::Shutdown.needs_work());
        assert!(NodeState::Halt.needs_work());
        assert!(!NodeState::Busy.ready_for_reset());
        assert!(NodeState::Free.can_process_new_work());
        assert!(!NodeState::Ready.can_process_new_work());
        assert!(NodeState::Ready.available());
    }

    #[test]
    fn test_task_sets_partition_states() {
        for state in TaskState::ALL {
            assert_ne!(state.available(), state.shutting_down(), "{state}");
        }
        assert!(TaskState::Running.has_started());
        assert!(!TaskState::SettingUp.has_started());
        assert!(TaskState::Init.needs_work());
        assert!(TaskState::Stopping.needs_work());
    }

    #[test]
    fn test_job_ordinals_follow_lifecycle() {
        let ordinals: Vec<u8> = JobState::ALL.iter().map(|s| s.ordinal()).collect();
        assert_eq!(ordinals, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_scaleset_available_is_resize_and_running() {
        let available: Vec<_> = ScalesetState::ALL
            .iter()
            .copied()
            .filter(|s| s.available())
            .collect();
        assert_eq!(available, vec![ScalesetState::Resize, ScalesetState::Running]);
        assert!(!ScalesetState::Init.available());
        assert!(ScalesetState::Halt.modifying());
        assert!(!ScalesetState::Running.needs_work());
        assert!(!ScalesetState::CreationFailed.needs_work());
    }

    #[test]
    fn test_vm_sets() {
        assert!(VmState::ExtensionsLaunch.needs_work());
        assert!(!VmState::Running.needs_work());
        assert!(!VmState::Stopped.available());
    }

    #[test]
    fn test_serde_matches_as_str() {
        for state in ScalesetState::ALL {
            let json = serde_json::to_value(state).unwrap();
            assert_eq!(json, serde_json::Value::from(*state));
        }
        let parsed: VmState = serde_json::from_str("\"extensions_launch\"").unwrap();
        assert_eq!(parsed, VmState::ExtensionsLaunch);
        assert_eq!(NodeState::SettingUp.to_string(), "setting_up");
    }
}
