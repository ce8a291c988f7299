//! Strict-priority scheduling with optional preemption and backfilling

use crate::agent_state::AgentMap;
use crate::fitting::Fitter;
use crate::group::Groups;
use crate::job_queue::{reduce_to_job_queue, sort_by_priority};
use crate::overlay::AgentOverlay;
use crate::scheduler::{agent_labels, task_filter, Placement, Scheduler, SchedulingDecision};
use crate::task_list::TaskList;
use slotsched_core::{
    AllocateRequest, GroupHandle, JobQueue, SchedResult, SchedulerType, TaskHandle,
};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Requests keyed by the priority of their group
type Buckets<'a> = BTreeMap<i32, Vec<&'a AllocateRequest>>;

/// Schedules the most important groups first.
///
/// Once a request fails to fit, less important requests are only started
/// if they can be preempted later (backfilling), and only when preemption
/// is enabled. Without preemption a large important request can keep the
/// rest of the pool waiting.
#[derive(Debug, Clone, Default)]
pub struct PriorityScheduler {
    fitter: Fitter,
    preemption: bool,
}

impl PriorityScheduler {
    pub fn new(fitter: Fitter, preemption: bool) -> Self {
        Self { fitter, preemption }
    }

    pub fn preemption_enabled(&self) -> bool {
        self.preemption
    }

    fn schedule_partition(
        &self,
        tasks: &TaskList,
        groups: &Groups,
        agents: &AgentMap,
        filter: impl Fn(&AllocateRequest) -> bool,
    ) -> SchedResult<SchedulingDecision> {
        let (pending, scheduled) = priority_buckets(tasks, groups, filter);
        let mut overlay = AgentOverlay::new(agents);
        let mut decision = SchedulingDecision::default();
        let mut backfilling = false;

        for (&priority, reqs) in &pending {
            debug!(priority, pending = reqs.len(), backfilling, "Processing priority");

            let mut successful = Vec::new();
            let mut unsuccessful = Vec::new();
            for req in reqs {
                let fits = self.fitter.find_fits(req, &overlay);
                if fits.is_empty() {
                    unsuccessful.push(*req);
                    continue;
                }
                overlay.reserve(&fits)?;
                successful.push((*req, Placement::new(req.handle, fits)));
            }

            // Nothing starts while more important work waits on a release
            if decision.to_release.is_empty() {
                if !backfilling {
                    for (req, placement) in successful {
                        debug!(task = %req.id, "Scheduling task");
                        decision.to_allocate.push(placement);
                    }
                } else if self.preemption {
                    for (req, mut placement) in successful {
                        if !req.is_preemptible() {
                            continue;
                        }
                        debug!(task = %req.id, "Scheduling task via backfilling");
                        placement.backfilled = true;
                        decision.to_allocate.push(placement);
                    }
                }
            }

            if !unsuccessful.is_empty() {
                backfilling = true;
            }
            if !self.preemption {
                continue;
            }

            for req in unsuccessful {
                // Earlier releases may already have made room
                let fits = self.fitter.find_fits(req, &overlay);
                if !fits.is_empty() {
                    debug!(
                        task = %req.id,
                        "Task can start once already selected preemptions complete"
                    );
                    overlay.reserve(&fits)?;
                    continue;
                }
                self.try_preemption(
                    tasks,
                    req,
                    priority,
                    &scheduled,
                    &mut overlay,
                    &mut decision.to_release,
                )?;
            }
        }
        Ok(decision)
    }

    /// Release less important work, least important and newest first, until
    /// `req` fits. Nothing is released unless it fits in the end.
    fn try_preemption(
        &self,
        tasks: &TaskList,
        req: &AllocateRequest,
        priority: i32,
        scheduled: &Buckets<'_>,
        overlay: &mut AgentOverlay<'_>,
        to_release: &mut Vec<TaskHandle>,
    ) -> SchedResult<bool> {
        debug!(task = %req.id, "Trying to schedule task by preempting other tasks");
        let mut nested = AgentOverlay::new(&*overlay);
        let mut preempted = Vec::new();

        for candidates in scheduled.range(priority.saturating_add(1)..).rev().map(|(_, c)| c) {
            for candidate in candidates.iter().rev() {
                if !candidate.is_preemptible() || to_release.contains(&candidate.handle) {
                    continue;
                }
                if let Some(allocation) = tasks.allocations(&candidate.handle) {
                    nested.release(allocation);
                }
                preempted.push(*candidate);

                let fits = self.fitter.find_fits(req, &nested);
                if fits.is_empty() {
                    continue;
                }
                nested.reserve(&fits)?;
                overlay.apply(nested.into_changes());

                for victim in preempted {
                    debug!(task = %victim.id, preempted_for = %req.id, "Preempting task");
                    if !to_release.contains(&victim.handle) {
                        to_release.push(victim.handle);
                    }
                }
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl Scheduler for PriorityScheduler {
    fn schedule(
        &self,
        tasks: &TaskList,
        groups: &Groups,
        agents: &AgentMap,
    ) -> SchedResult<SchedulingDecision> {
        debug!(
            tasks = tasks.len(),
            agents = agents.len(),
            preemption = self.preemption,
            "Running priority pass"
        );

        let mut decision = SchedulingDecision::default();
        for label in agent_labels(agents) {
            // Slot-bearing and aux requests never block each other
            for zero_slots in [false, true] {
                decision.extend(self.schedule_partition(
                    tasks,
                    groups,
                    agents,
                    task_filter(label, zero_slots),
                )?);
            }
        }
        Ok(decision)
    }

    fn job_queue(&self, tasks: &TaskList, groups: &Groups) -> JobQueue {
        reduce_to_job_queue(&sort_by_priority(tasks, groups, false), tasks)
    }

    fn scheduler_type(&self) -> SchedulerType {
        SchedulerType::Priority
    }
}

/// Split the filtered requests into pending and scheduled buckets.
///
/// Pending requests of one priority are ordered by the slots their group
/// already holds, then by submission.
pub(crate) fn priority_buckets<'a>(
    tasks: &'a TaskList,
    groups: &Groups,
    filter: impl Fn(&AllocateRequest) -> bool,
) -> (Buckets<'a>, Buckets<'a>) {
    let mut pending = Buckets::new();
    let mut scheduled = Buckets::new();
    let mut active_slots: HashMap<GroupHandle, usize> = HashMap::new();

    for req in sort_by_priority(tasks, groups, false) {
        if !filter(req) {
            continue;
        }
        let priority = groups.priority(&req.group_handle());
        if tasks.is_scheduled(&req.handle) {
            *active_slots.entry(req.group_handle()).or_default() += req.slots_needed;
            scheduled.entry(priority).or_default().push(req);
        } else {
            pending.entry(priority).or_default().push(req);
        }
    }

    for reqs in pending.values_mut() {
        reqs.sort_by_key(|r| active_slots.get(&r.group_handle()).copied().unwrap_or(0));
    }
    (pending, scheduled)
}
