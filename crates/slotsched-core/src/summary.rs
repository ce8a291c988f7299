//! Read-only snapshots reported to observers

use crate::config::SchedulerType;
use crate::types::{AgentId, AllocationId, ContainerId, Device, JobId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Devices held by one container of a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub agent_id: AgentId,
    pub container_id: ContainerId,
    pub devices: Vec<Device>,
}

/// Snapshot of one registered task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: AllocationId,
    pub name: String,
    pub registered_time: DateTime<Utc>,
    pub resource_pool: String,
    pub slots_needed: usize,
    /// Empty while the task is pending
    pub resources: Vec<ContainerSummary>,
    pub scheduler_type: SchedulerType,
    /// Group priority, only reported by priority-scheduled pools
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

/// Idle/busy state of one agent as seen by the provisioner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSummary {
    pub name: String,
    pub is_idle: bool,
}

/// Scaling signal forwarded to the provisioner
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingInfo {
    pub desired_new_instances: usize,
    pub agents: BTreeMap<String, AgentSummary>,
}

impl ScalingInfo {
    /// Replace the signal with a freshly computed one.
    ///
    /// Returns true only if anything changed, so callers can forward on change.
    pub fn update(&mut self, desired_new_instances: usize, agents: BTreeMap<String, AgentSummary>) -> bool {
        if self.desired_new_instances == desired_new_instances && self.agents == agents {
            return false;
        }
        self.desired_new_instances = desired_new_instances;
        self.agents = agents;
        true
    }
}

/// Aggregate slot usage of a pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSummary {
    pub num_agents: usize,
    pub num_total_slots: usize,
    pub num_active_slots: usize,
    pub max_num_aux_containers: usize,
    pub num_active_aux_containers: usize,
}

/// Snapshot of a pool's scheduling inputs, used by observers and tests
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulingState {
    pub pending_tasks: usize,
    pub allocated_tasks: usize,
    pub agents: usize,
    pub groups: usize,
}

/// Queue state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    Queued,
    Scheduled,
    ScheduledBackfilled,
}

/// Queue position and slot usage of one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RmJobInfo {
    /// Number of jobs ordered before this one; -1 when the policy has no order
    pub jobs_ahead: i64,
    pub state: JobState,
    pub requested_slots: usize,
    pub allocated_slots: usize,
}

/// Per-job queue information keyed by job
pub type JobQueue = BTreeMap<JobId, RmJobInfo>;

/// Counts of queued and scheduled jobs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued_count: usize,
    pub scheduled_count: usize,
}

impl QueueStats {
    /// Count the jobs of a queue by state
    pub fn from_queue(queue: &JobQueue) -> Self {
        let mut stats = Self::default();
        for info in queue.values() {
            match info.state {
                JobState::Queued => stats.queued_count += 1,
                JobState::Scheduled | JobState::ScheduledBackfilled => stats.scheduled_count += 1,
            }
        }
        stats
    }
}

/// Answer to a command resource validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateCommandResourcesResponse {
    pub fulfillable: bool,
}
