//! Messages consumed by a resource pool loop

use crate::allocation::{AgentCommand, TaskEvent};
use slotsched_core::{
    AgentId, AllocateRequest, AllocationId, ContainerId, ContainerSummary, Device, GroupHandle,
    JobQueue, QueueStats, ResourceSummary, SchedResult, SchedulingState, TaskHandle, TaskSummary,
    ValidateCommandResourcesResponse,
};
use std::fmt;
use tokio::sync::{mpsc, oneshot};

/// Inbox message of a pool.
///
/// Tells carry no reply slot. Asks carry a `reply_to` one-shot sender that
/// the pool answers exactly once; a dropped reply slot is ignored.
pub enum PoolMessage {
    /// Register a request; a second request for the same handle is a no-op
    Allocate {
        request: AllocateRequest,
        events: mpsc::UnboundedSender<TaskEvent>,
    },
    /// The task has freed its resources and leaves the pool
    ResourcesReleased { handle: TaskHandle },
    SetGroupWeight { handle: GroupHandle, weight: f64 },
    SetGroupMaxSlots {
        handle: GroupHandle,
        max_slots: Option<usize>,
    },
    /// Only honored by pools whose policy orders by priority
    SetGroupPriority { handle: GroupHandle, priority: i32 },
    GroupStopped { handle: GroupHandle },
    SetTaskName { handle: TaskHandle, name: String },
    /// The task's containers started running
    TaskRunning { handle: TaskHandle },
    /// Move a group's job directly ahead of or behind another group's job
    MoveJob {
        handle: GroupHandle,
        anchor: GroupHandle,
        ahead: bool,
        reply_to: oneshot::Sender<SchedResult<()>>,
    },
    /// Restore a queue position recorded before a restart
    RecoverJobPosition { handle: GroupHandle, position: f64 },

    AddAgent {
        agent_id: AgentId,
        label: String,
        commands: mpsc::UnboundedSender<AgentCommand>,
    },
    RemoveAgent { agent_id: AgentId },
    AddDevice {
        agent_id: AgentId,
        device: Device,
        /// Container already holding the device
        container_id: Option<ContainerId>,
    },
    RemoveDevice { agent_id: AgentId, device_id: u32 },
    FreeDevice {
        agent_id: AgentId,
        device_id: u32,
        container_id: ContainerId,
    },
    EnableAgent { agent_id: AgentId },
    DisableAgent { agent_id: AgentId, drain: bool },

    /// Re-register a task that is already running on `containers`
    RestoreResources {
        request: AllocateRequest,
        events: mpsc::UnboundedSender<TaskEvent>,
        containers: Vec<ContainerSummary>,
        reply_to: oneshot::Sender<SchedResult<()>>,
    },

    GetTaskSummary {
        id: AllocationId,
        reply_to: oneshot::Sender<Option<TaskSummary>>,
    },
    GetTaskSummaries {
        reply_to: oneshot::Sender<Vec<TaskSummary>>,
    },
    GetResourceSummary {
        reply_to: oneshot::Sender<ResourceSummary>,
    },
    GetJobQueue {
        reply_to: oneshot::Sender<JobQueue>,
    },
    GetJobQueueStats {
        reply_to: oneshot::Sender<QueueStats>,
    },
    ValidateCommandResources {
        slots: usize,
        reply_to: oneshot::Sender<ValidateCommandResourcesResponse>,
    },
    GetSchedulingState {
        reply_to: oneshot::Sender<SchedulingState>,
    },
}

impl PoolMessage {
    /// Whether handling the message can change what the next pass decides
    pub fn affects_placement(&self) -> bool {
        !matches!(
            self,
            PoolMessage::SetTaskName { .. }
                | PoolMessage::GetTaskSummary { .. }
                | PoolMessage::GetTaskSummaries { .. }
                | PoolMessage::GetResourceSummary { .. }
                | PoolMessage::GetJobQueue { .. }
                | PoolMessage::GetJobQueueStats { .. }
                | PoolMessage::ValidateCommandResources { .. }
                | PoolMessage::GetSchedulingState { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PoolMessage::Allocate { .. } => "allocate",
            PoolMessage::ResourcesReleased { .. } => "resources-released",
            PoolMessage::SetGroupWeight { .. } => "set-group-weight",
            PoolMessage::SetGroupMaxSlots { .. } => "set-group-max-slots",
            PoolMessage::SetGroupPriority { .. } => "set-group-priority",
            PoolMessage::GroupStopped { .. } => "group-stopped",
            PoolMessage::SetTaskName { .. } => "set-task-name",
            PoolMessage::TaskRunning { .. } => "task-running",
            PoolMessage::MoveJob { .. } => "move-job",
            PoolMessage::RecoverJobPosition { .. } => "recover-job-position",
            PoolMessage::AddAgent { .. } => "add-agent",
            PoolMessage::RemoveAgent { .. } => "remove-agent",
            PoolMessage::AddDevice { .. } => "add-device",
            PoolMessage::RemoveDevice { .. } => "remove-device",
            PoolMessage::FreeDevice { .. } => "free-device",
            PoolMessage::EnableAgent { .. } => "enable-agent",
            PoolMessage::DisableAgent { .. } => "disable-agent",
            PoolMessage::RestoreResources { .. } => "restore-resources",
            PoolMessage::GetTaskSummary { .. } => "get-task-summary",
            PoolMessage::GetTaskSummaries { .. } => "get-task-summaries",
            PoolMessage::GetResourceSummary { .. } => "get-resource-summary",
            PoolMessage::GetJobQueue { .. } => "get-job-queue",
            PoolMessage::GetJobQueueStats { .. } => "get-job-queue-stats",
            PoolMessage::ValidateCommandResources { .. } => "validate-command-resources",
            PoolMessage::GetSchedulingState { .. } => "get-scheduling-state",
        }
    }
}

impl fmt::Debug for PoolMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_only_messages_do_not_affect_placement() {
        let (tx, _rx) = oneshot::channel();
        assert!(!PoolMessage::GetJobQueue { reply_to: tx }.affects_placement());

        let (tx, _rx) = oneshot::channel();
        let msg = PoolMessage::ValidateCommandResources {
            slots: 4,
            reply_to: tx,
        };
        assert!(!msg.affects_placement());
        assert_eq!(format!("{:?}", msg), "validate-command-resources");

        assert!(PoolMessage::ResourcesReleased {
            handle: TaskHandle::new()
        }
        .affects_placement());
        assert!(PoolMessage::SetGroupWeight {
            handle: GroupHandle::new(),
            weight: 2.0
        }
        .affects_placement());

        let (tx, _rx) = oneshot::channel();
        let msg = PoolMessage::MoveJob {
            handle: GroupHandle::new(),
            anchor: GroupHandle::new(),
            ahead: true,
            reply_to: tx,
        };
        assert!(msg.affects_placement());
        assert_eq!(format!("{:?}", msg), "move-job");
    }
}
