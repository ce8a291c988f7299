//! slotsched-pool: Resource pool loops for slotsched
//!
//! This crate runs the scheduling core as independent message loops:
//! - One loop per resource pool, driven by a bounded inbox and a fixed tick
//! - Agent-backed pools scheduling onto devices, Kubernetes pools planning pods
//! - Allocations that forward start/kill commands to their backend
//! - The resource manager routing requests to pools by name

pub mod allocation;
pub mod kubernetes_pool;
pub mod manager;
pub mod messages;
pub mod resource_pool;
pub mod runtime;
mod state;

pub use allocation::{
    AgentCommand, Allocation, PodCommand, ResourcesAllocated, ScalingUpdate, TaskEvent, TaskSpec,
    KUBERNETES_AGENT,
};
pub use kubernetes_pool::KubernetesPool;
pub use manager::{PoolInfo, PoolSupervisor, ResourceManager};
pub use messages::PoolMessage;
pub use resource_pool::ResourcePool;
pub use runtime::{spawn_pool, PoolActor, PoolHandle, DEFAULT_ASK_TIMEOUT};
