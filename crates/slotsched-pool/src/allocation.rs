//! Allocations handed to tasks and the commands they forward to backends

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use slotsched_core::{
    AgentId, AllocationId, ContainerId, ContainerSummary, Device, SchedError, SchedResult,
    ScalingInfo, TaskHandle,
};
use tokio::sync::mpsc;

/// Pseudo-agent every pod of a Kubernetes pool is accounted to
pub const KUBERNETES_AGENT: &str = "kubernetes";

/// Opaque description of what a task runs; only the backend interprets it
pub type TaskSpec = serde_json::Value;

/// Command forwarded to the agent that owns a container
#[derive(Debug, Clone, PartialEq)]
pub enum AgentCommand {
    StartTaskContainer {
        allocation_id: AllocationId,
        container_id: ContainerId,
        devices: Vec<Device>,
        spec: TaskSpec,
    },
    KillTaskContainer {
        container_id: ContainerId,
    },
}

/// Command forwarded to the pod manager of a Kubernetes pool
#[derive(Debug, Clone, PartialEq)]
pub enum PodCommand {
    StartPods {
        allocation_id: AllocationId,
        container_id: ContainerId,
        slots: usize,
        spec: TaskSpec,
    },
    KillPods {
        container_id: ContainerId,
    },
}

/// One slice of a task's resources and the backend that runs it
#[derive(Debug, Clone)]
pub enum Allocation {
    Agent {
        allocation_id: AllocationId,
        agent_id: AgentId,
        container_id: ContainerId,
        devices: Vec<Device>,
        agent: mpsc::UnboundedSender<AgentCommand>,
    },
    Kubernetes {
        allocation_id: AllocationId,
        container_id: ContainerId,
        slots: usize,
        pods: mpsc::UnboundedSender<PodCommand>,
    },
}

impl Allocation {
    pub fn container_id(&self) -> ContainerId {
        match self {
            Allocation::Agent { container_id, .. } | Allocation::Kubernetes { container_id, .. } => {
                *container_id
            }
        }
    }

    /// Ask the backend to start the task
    pub fn start(&self, spec: TaskSpec) -> SchedResult<()> {
        match self {
            Allocation::Agent {
                allocation_id,
                agent_id,
                container_id,
                devices,
                agent,
            } => agent
                .send(AgentCommand::StartTaskContainer {
                    allocation_id: allocation_id.clone(),
                    container_id: *container_id,
                    devices: devices.clone(),
                    spec,
                })
                .map_err(|_| SchedError::AgentNotFound(agent_id.to_string())),
            Allocation::Kubernetes {
                allocation_id,
                container_id,
                slots,
                pods,
            } => pods
                .send(PodCommand::StartPods {
                    allocation_id: allocation_id.clone(),
                    container_id: *container_id,
                    slots: *slots,
                    spec,
                })
                .map_err(|_| SchedError::Unsupported("no pod manager attached".to_string())),
        }
    }

    /// Ask the backend to stop the task
    pub fn kill(&self) -> SchedResult<()> {
        match self {
            Allocation::Agent {
                agent_id,
                container_id,
                agent,
                ..
            } => agent
                .send(AgentCommand::KillTaskContainer {
                    container_id: *container_id,
                })
                .map_err(|_| SchedError::AgentNotFound(agent_id.to_string())),
            Allocation::Kubernetes {
                container_id, pods, ..
            } => pods
                .send(PodCommand::KillPods {
                    container_id: *container_id,
                })
                .map_err(|_| SchedError::Unsupported("no pod manager attached".to_string())),
        }
    }

    pub fn summary(&self) -> ContainerSummary {
        match self {
            Allocation::Agent {
                agent_id,
                container_id,
                devices,
                ..
            } => ContainerSummary {
                agent_id: agent_id.clone(),
                container_id: *container_id,
                devices: devices.clone(),
            },
            Allocation::Kubernetes { container_id, .. } => ContainerSummary {
                agent_id: AgentId::from(KUBERNETES_AGENT),
                container_id: *container_id,
                devices: Vec::new(),
            },
        }
    }
}

/// Resources granted to one request
#[derive(Debug, Clone)]
pub struct ResourcesAllocated {
    pub id: AllocationId,
    pub handle: TaskHandle,
    pub resource_pool: String,
    pub allocations: Vec<Allocation>,
    pub job_submission_time: Option<DateTime<Utc>>,
}

impl ResourcesAllocated {
    /// Start every allocation; stops at the first backend that is gone
    pub fn start(&self, spec: &TaskSpec) -> SchedResult<()> {
        for allocation in &self.allocations {
            allocation.start(spec.clone())?;
        }
        Ok(())
    }

    pub fn kill(&self) -> SchedResult<()> {
        for allocation in &self.allocations {
            allocation.kill()?;
        }
        Ok(())
    }
}

/// Notification sent by a pool to a requesting task
#[derive(Debug, Clone)]
pub enum TaskEvent {
    ResourcesAllocated(ResourcesAllocated),
    /// The pool wants the resources back; the task answers with
    /// `ResourcesReleased` once they are free
    ReleaseResources { handle: TaskHandle },
    /// An agent holding some of the task's containers left the pool. The
    /// task is already unregistered and its other containers freed.
    AgentFailed { handle: TaskHandle, agent_id: AgentId },
}

/// Scaling signal of one pool, as forwarded to the provisioner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingUpdate {
    pub resource_pool: String,
    pub info: ScalingInfo,
}
