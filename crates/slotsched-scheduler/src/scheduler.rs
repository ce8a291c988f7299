//! Scheduling policy interface

use crate::agent_state::{AgentMap, AgentState};
use crate::fair_share::FairShareScheduler;
use crate::fitting::{Fit, Fitter};
use crate::group::Groups;
use crate::priority::PriorityScheduler;
use crate::task_list::TaskList;
use slotsched_core::{
    AllocateRequest, JobQueue, SchedError, SchedResult, SchedulerConfig, SchedulerType, TaskHandle,
};
use std::collections::BTreeSet;

/// A request chosen for allocation together with where it goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub handle: TaskHandle,
    pub fits: Vec<Fit>,
    /// Placed while a more important request was still waiting
    pub backfilled: bool,
}

impl Placement {
    pub fn new(handle: TaskHandle, fits: Vec<Fit>) -> Self {
        Self {
            handle,
            fits,
            backfilled: false,
        }
    }
}

/// Outcome of one scheduling pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulingDecision {
    pub to_allocate: Vec<Placement>,
    /// Allocated tasks asked to give their resources back, without duplicates
    pub to_release: Vec<TaskHandle>,
}

impl SchedulingDecision {
    pub fn is_empty(&self) -> bool {
        self.to_allocate.is_empty() && self.to_release.is_empty()
    }

    pub(crate) fn extend(&mut self, other: SchedulingDecision) {
        self.to_allocate.extend(other.to_allocate);
        for handle in other.to_release {
            if !self.to_release.contains(&handle) {
                self.to_release.push(handle);
            }
        }
    }
}

/// A scheduling policy.
///
/// `schedule` never mutates the registry or the agents, and the same inputs
/// yield the same decision. The fair-share allocation timeout also reads
/// the clock.
pub trait Scheduler: Send + Sync {
    /// Decide what to allocate and what to release
    fn schedule(
        &self,
        tasks: &TaskList,
        groups: &Groups,
        agents: &AgentMap,
    ) -> SchedResult<SchedulingDecision>;

    /// Queue position and slot usage of every job
    fn job_queue(&self, tasks: &TaskList, groups: &Groups) -> JobQueue;

    fn scheduler_type(&self) -> SchedulerType;
}

/// Build the policy for an agent-backed pool
pub fn make_scheduler(config: &SchedulerConfig) -> SchedResult<Box<dyn Scheduler>> {
    let fitter = Fitter::new(config.fitting_policy, config.allow_heterogeneous_fits);
    match config.scheduler_type {
        SchedulerType::FairShare => {
            let timeout = config
                .allocation_timeout_ms
                .filter(|ms| *ms > 0)
                .map(|ms| chrono::Duration::milliseconds(ms as i64));
            Ok(Box::new(
                FairShareScheduler::new(fitter).with_allocation_timeout(timeout),
            ))
        }
        SchedulerType::Priority => Ok(Box::new(PriorityScheduler::new(
            fitter,
            config.priority.preemption,
        ))),
        SchedulerType::Kubernetes => Err(SchedError::Config(
            "the kubernetes scheduler only runs in kubernetes pools".to_string(),
        )),
    }
}

/// Distinct labels of the pool's agents; labels without agents are absent
pub(crate) fn agent_labels(agents: &AgentMap) -> BTreeSet<&str> {
    agents.values().map(|a| a.label()).collect()
}

/// Requests of one label, split by whether they need slots
pub(crate) fn task_filter(label: &str, zero_slots: bool) -> impl Fn(&AllocateRequest) -> bool + '_ {
    move |req| req.label == label && (req.slots_needed == 0) == zero_slots
}

pub(crate) fn total_capacity<'a>(agents: impl IntoIterator<Item = &'a AgentState>) -> usize {
    agents.into_iter().map(|a| a.num_slots()).sum()
}
