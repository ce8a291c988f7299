//! Greedy pod planning for Kubernetes-backed pools
//!
//! The cluster is treated as one pseudo-agent whose capacity is managed by
//! Kubernetes itself. Every pending request is turned into pods as soon as
//! its group's max slots allow it.

use crate::group::Groups;
use crate::job_queue::{reduce_to_job_queue, sort_by_priority};
use crate::task_list::TaskList;
use slotsched_core::{GroupHandle, JobQueue, SchedError, SchedResult, TaskHandle};
use std::collections::HashMap;
use tracing::{debug, error};

/// Shape of the pods that run one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PodPlan {
    pub num_pods: usize,
    pub slots_per_pod: usize,
}

impl PodPlan {
    pub fn slots(&self) -> usize {
        self.num_pods * self.slots_per_pod
    }
}

/// Split a request into pods of at most `max_slots_per_pod` slots.
///
/// Requests of zero or one slot always take a single pod. Larger requests
/// need a positive pod size, and must divide evenly when they span pods.
pub fn plan_pods(slots_needed: usize, max_slots_per_pod: usize) -> SchedResult<PodPlan> {
    if slots_needed <= 1 {
        return Ok(PodPlan {
            num_pods: 1,
            slots_per_pod: slots_needed,
        });
    }
    if max_slots_per_pod == 0 {
        return Err(SchedError::Config(
            "set max_slots_per_pod > 0 to schedule tasks with slots".to_string(),
        ));
    }
    if slots_needed <= max_slots_per_pod {
        return Ok(PodPlan {
            num_pods: 1,
            slots_per_pod: slots_needed,
        });
    }
    if slots_needed % max_slots_per_pod != 0 {
        return Err(SchedError::Unsupported(format!(
            "task number of slots ({}) is not schedulable on the configured max_slots_per_pod ({})",
            slots_needed, max_slots_per_pod
        )));
    }
    Ok(PodPlan {
        num_pods: slots_needed / max_slots_per_pod,
        slots_per_pod: max_slots_per_pod,
    })
}

/// Greedy planner used by Kubernetes pools in place of a scheduler.
///
/// This is the single-agent case of fitting with the agent's capacity left
/// to the cluster: a shared fit on the pseudo-agent always succeeds, so the
/// [`Fitter`](crate::fitting::Fitter) is not consulted. What remains is the
/// pod shape of each request and the group slot limits.
#[derive(Debug, Clone, Copy)]
pub struct KubernetesPlanner {
    max_slots_per_pod: usize,
}

impl KubernetesPlanner {
    pub fn new(max_slots_per_pod: usize) -> Self {
        Self { max_slots_per_pod }
    }

    pub fn max_slots_per_pod(&self) -> usize {
        self.max_slots_per_pod
    }

    /// Plan pods for every pending request, in registration order.
    ///
    /// A request is skipped while its group would exceed its max slots;
    /// requests that cannot be split into pods are logged and skipped.
    pub fn plan(&self, tasks: &TaskList, groups: &Groups) -> Vec<(TaskHandle, PodPlan)> {
        let mut used: HashMap<GroupHandle, usize> = HashMap::new();
        for req in tasks.iter().filter(|r| tasks.is_scheduled(&r.handle)) {
            *used.entry(req.group_handle()).or_default() += req.slots_needed;
        }

        let mut plans = Vec::new();
        for req in tasks.iter() {
            if tasks.is_scheduled(&req.handle) {
                continue;
            }

            let group = req.group_handle();
            let group_used = used.get(&group).copied().unwrap_or(0);
            if let Some(max_slots) = groups.max_slots(&group) {
                if group_used + req.slots_needed > max_slots {
                    debug!(task = %req.id, group = %group, max_slots, "Group is at its slot limit");
                    continue;
                }
            }

            match plan_pods(req.slots_needed, self.max_slots_per_pod) {
                Ok(plan) => {
                    used.insert(group, group_used + req.slots_needed);
                    plans.push((req.handle, plan));
                }
                Err(e) => {
                    error!(task = %req.id, error = %e, "Cannot plan pods for task");
                }
            }
        }
        plans
    }

    /// Kubernetes treats higher priority numbers as more important
    pub fn job_queue(&self, tasks: &TaskList, groups: &Groups) -> JobQueue {
        reduce_to_job_queue(&sort_by_priority(tasks, groups, true), tasks)
    }
}
