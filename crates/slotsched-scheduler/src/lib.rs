//! slotsched-scheduler: Placement and scheduling policies for slotsched
//!
//! This crate provides the synchronous scheduling core of a resource pool:
//! - Task registry and per-agent device bookkeeping
//! - Copy-on-write agent overlays for one scheduling pass
//! - The fitting engine (shared, dedicated and heterogeneous fits)
//! - Fair-share and priority scheduling policies
//! - Job queue reporting and the scaling signal
//! - Greedy pod planning for Kubernetes-backed pools

pub mod agent_state;
pub mod fair_share;
pub mod fitting;
pub mod group;
pub mod job_queue;
pub mod kubernetes;
pub mod overlay;
pub mod priority;
pub mod scaling;
pub mod scheduler;
pub mod task_list;

#[cfg(test)]
pub(crate) mod test_util;

pub use agent_state::{release_containers, reserve_containers, AgentMap, AgentState};
pub use fair_share::FairShareScheduler;
pub use fitting::{Fit, Fitter};
pub use group::{Group, Groups};
pub use job_queue::{job_queue_stats, move_job, queue_position, reduce_to_job_queue, sort_by_priority};
pub use kubernetes::{plan_pods, KubernetesPlanner, PodPlan};
pub use overlay::{AgentOverlay, AgentView};
pub use priority::PriorityScheduler;
pub use scaling::{agent_summaries, desired_new_instances, resource_summary};
pub use scheduler::{make_scheduler, Placement, SchedulingDecision, Scheduler};
pub use task_list::{AllocatedContainer, TaskAllocation, TaskList};
