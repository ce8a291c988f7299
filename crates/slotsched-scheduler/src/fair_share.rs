//! Fair-share scheduling
//!
//! Slots are offered to groups by progressive filling, an implementation of
//! max-min fairness: every unsatisfied group's offer rises toward its
//! weighted share of the capacity until all slots are offered or all demand
//! is met. Groups holding more than their offer are asked to release
//! preemptible work; groups holding less get pending requests started.

use crate::agent_state::AgentMap;
use crate::fitting::Fitter;
use crate::group::Groups;
use crate::job_queue::unordered_job_queue;
use crate::overlay::AgentOverlay;
use crate::scheduler::{
    agent_labels, task_filter, total_capacity, Placement, Scheduler, SchedulingDecision,
};
use crate::task_list::TaskList;
use slotsched_core::{AllocateRequest, GroupHandle, JobQueue, SchedResult, SchedulerType};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tracing::{debug, info};

/// Max-min fair scheduler over weighted groups
#[derive(Debug, Clone, Default)]
pub struct FairShareScheduler {
    fitter: Fitter,
    /// Allocated work that has not started running within this long may be
    /// released even if it is not preemptible
    allocation_timeout: Option<Duration>,
}

/// Demand and offer of one group within a label
#[derive(Debug)]
struct GroupState<'a> {
    handle: GroupHandle,
    weight: f64,
    seq: u64,
    disabled: bool,
    /// Slots needed to run every request of the group, capped by its max slots
    slot_demand: usize,
    /// Slots held by allocated requests
    active_slots: usize,
    /// Slots held by allocated requests that cannot be preempted
    presubscribed_slots: usize,
    /// Presubscribed slots not yet accounted against an offer
    preoffered: usize,
    offered: usize,
    pending: Vec<&'a AllocateRequest>,
    allocated: Vec<&'a AllocateRequest>,
}

impl<'a> GroupState<'a> {
    fn new(handle: GroupHandle, groups: &Groups) -> Self {
        Self {
            handle,
            weight: groups.weight(&handle),
            seq: groups.seq(&handle),
            disabled: false,
            slot_demand: 0,
            active_slots: 0,
            presubscribed_slots: 0,
            preoffered: 0,
            offered: 0,
            pending: Vec::new(),
            allocated: Vec::new(),
        }
    }

    fn is_satisfied(&self) -> bool {
        self.offered >= self.slot_demand
    }

    fn smallest_pending(&self) -> Option<usize> {
        self.pending.iter().map(|r| r.slots_needed).min()
    }
}

impl FairShareScheduler {
    pub fn new(fitter: Fitter) -> Self {
        Self {
            fitter,
            allocation_timeout: None,
        }
    }

    pub fn with_allocation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.allocation_timeout = timeout;
        self
    }

    /// Whether an allocated request waited too long to start running
    fn timed_out(&self, tasks: &TaskList, req: &AllocateRequest, now: DateTime<Utc>) -> bool {
        let Some(timeout) = self.allocation_timeout else {
            return false;
        };
        let running = tasks.allocations(&req.handle).map(|a| a.running).unwrap_or(false);
        if running {
            return false;
        }
        tasks
            .registered_time(&req.handle)
            .map(|registered| now - registered > timeout)
            .unwrap_or(false)
    }

    /// One scheduling pass with `now` as the current time
    pub fn schedule_at(
        &self,
        tasks: &TaskList,
        groups: &Groups,
        agents: &AgentMap,
        now: DateTime<Utc>,
    ) -> SchedResult<SchedulingDecision> {
        debug!(
            tasks = tasks.len(),
            groups = groups.len(),
            agents = agents.len(),
            "Running fair-share pass"
        );

        let mut decision = SchedulingDecision::default();
        for label in agent_labels(agents) {
            let mut overlay = AgentOverlay::new(agents);

            let zero_slot = self.schedule_zero_slots(tasks, &mut overlay, task_filter(label, true))?;
            decision.to_allocate.extend(zero_slot);

            let capacity = total_capacity(agents.values().filter(|a| a.label() == label));
            decision.extend(self.schedule_slots(
                tasks,
                groups,
                &mut overlay,
                capacity,
                now,
                task_filter(label, false),
            )?);
        }
        Ok(decision)
    }

    /// Start every pending aux request that still finds an aux slot
    fn schedule_zero_slots(
        &self,
        tasks: &TaskList,
        overlay: &mut AgentOverlay<'_>,
        filter: impl Fn(&AllocateRequest) -> bool,
    ) -> SchedResult<Vec<Placement>> {
        let mut placements = Vec::new();
        for req in tasks.iter().filter(|r| filter(r)) {
            if tasks.is_scheduled(&req.handle) {
                continue;
            }
            let fits = self.fitter.find_fits(req, &*overlay);
            if fits.is_empty() {
                debug!(task = %req.id, "No aux slot available");
                continue;
            }
            overlay.reserve(&fits)?;
            placements.push(Placement::new(req.handle, fits));
        }
        Ok(placements)
    }

    fn schedule_slots(
        &self,
        tasks: &TaskList,
        groups: &Groups,
        overlay: &mut AgentOverlay<'_>,
        capacity: usize,
        now: DateTime<Utc>,
        filter: impl Fn(&AllocateRequest) -> bool,
    ) -> SchedResult<SchedulingDecision> {
        let mut states = group_states(tasks, groups, capacity, filter);
        allocate_slot_offers(&mut states, capacity);
        self.assign_tasks(tasks, &mut states, overlay, now)
    }

    fn assign_tasks(
        &self,
        tasks: &TaskList,
        states: &mut [GroupState<'_>],
        overlay: &mut AgentOverlay<'_>,
        now: DateTime<Utc>,
    ) -> SchedResult<SchedulingDecision> {
        let mut decision = SchedulingDecision::default();

        for state in states.iter_mut() {
            debug!(
                group = %state.handle,
                demand = state.slot_demand,
                active = state.active_slots,
                offered = state.offered,
                "Assigning tasks"
            );

            if state.active_slots > state.offered {
                // Slots are not freed immediately, so a group never releases
                // and starts work in the same pass.
                for req in &state.allocated {
                    if !req.is_preemptible() && !self.timed_out(tasks, req, now) {
                        continue;
                    }
                    decision.to_release.push(req.handle);
                    state.active_slots -= req.slots_needed;
                    if state.active_slots <= state.offered {
                        break;
                    }
                }
            } else if state.active_slots < state.offered {
                let mut remaining = state.offered - state.active_slots;
                for req in &state.pending {
                    if req.slots_needed > remaining {
                        continue;
                    }
                    let fits = self.fitter.find_fits(req, &*overlay);
                    if fits.is_empty() {
                        continue;
                    }
                    overlay.reserve(&fits)?;
                    remaining -= req.slots_needed;
                    decision.to_allocate.push(Placement::new(req.handle, fits));
                }
            }
        }
        Ok(decision)
    }
}

impl Scheduler for FairShareScheduler {
    fn schedule(
        &self,
        tasks: &TaskList,
        groups: &Groups,
        agents: &AgentMap,
    ) -> SchedResult<SchedulingDecision> {
        self.schedule_at(tasks, groups, agents, Utc::now())
    }

    fn job_queue(&self, tasks: &TaskList, _groups: &Groups) -> JobQueue {
        unordered_job_queue(tasks)
    }

    fn scheduler_type(&self) -> SchedulerType {
        SchedulerType::FairShare
    }
}

/// Group the filtered requests and compute each group's demand.
///
/// Requests larger than the whole capacity can never run and are left out,
/// so they do not hold back the rest of their group.
fn group_states<'a>(
    tasks: &'a TaskList,
    groups: &Groups,
    capacity: usize,
    filter: impl Fn(&AllocateRequest) -> bool,
) -> Vec<GroupState<'a>> {
    let mut states: Vec<GroupState<'a>> = Vec::new();
    let mut index: HashMap<GroupHandle, usize> = HashMap::new();

    for req in tasks.iter() {
        if !filter(req) || req.slots_needed > capacity {
            continue;
        }

        let handle = req.group_handle();
        let i = *index.entry(handle).or_insert_with(|| {
            states.push(GroupState::new(handle, groups));
            states.len() - 1
        });

        let state = &mut states[i];
        state.slot_demand += req.slots_needed;
        if tasks.is_scheduled(&req.handle) {
            if !req.is_preemptible() {
                state.presubscribed_slots += req.slots_needed;
            }
            state.active_slots += req.slots_needed;
            state.allocated.push(req);
        } else {
            state.pending.push(req);
        }
    }

    for state in &mut states {
        if let Some(max_slots) = groups.max_slots(&state.handle) {
            state.slot_demand = state.slot_demand.min(max_slots);
        }
    }
    states
}

fn total_weight(states: &[GroupState<'_>]) -> f64 {
    states
        .iter()
        .filter(|s| !s.disabled && !s.is_satisfied())
        .map(|s| s.weight)
        .sum()
}

/// An outstanding preoffer absorbs offers no larger than itself.
///
/// Returns the remaining preoffer and the offer left to grant.
fn account_for_preoffers(preoffered: usize, offer: usize) -> (usize, usize) {
    if preoffered == 0 {
        return (0, offer);
    }
    match preoffered.cmp(&offer) {
        std::cmp::Ordering::Equal => (0, 0),
        std::cmp::Ordering::Greater => (preoffered - offer, 0),
        std::cmp::Ordering::Less => (0, offer),
    }
}

/// Progressive filling of slot offers across groups
fn allocate_slot_offers(states: &mut [GroupState<'_>], mut capacity: usize) {
    debug!(groups = states.len(), capacity, "Allocating slot offers");

    // Non-preemptible work keeps its slots whatever the shares come out to
    for state in states.iter_mut() {
        if state.presubscribed_slots == 0 {
            continue;
        }
        state.offered = state.presubscribed_slots;
        state.preoffered = state.presubscribed_slots;
        capacity = capacity.saturating_sub(state.presubscribed_slots);
    }

    // Smaller demands first; slots are indivisible so they get the rounding
    states.sort_by(|a, b| a.slot_demand.cmp(&b.slot_demand).then(a.seq.cmp(&b.seq)));

    let mut newest_first: Vec<usize> = (0..states.len()).collect();
    newest_first.sort_by(|a, b| states[*b].seq.cmp(&states[*a].seq));

    // Recomputed rather than decremented to avoid drift between weights
    // of very different magnitudes
    let mut weight = total_weight(states);
    let mut states_left = states.len();

    while states_left > 0 {
        let mut progress = false;
        let start_capacity = capacity;

        for i in 0..states.len() {
            if states[i].disabled || states[i].is_satisfied() {
                continue;
            }
            progress = true;

            let state = &mut states[i];
            let share = ((start_capacity as f64 * state.weight / weight) as usize).max(1);
            let offer = share
                .min(capacity)
                .min(state.slot_demand - state.offered);
            let (preoffered, offer) = account_for_preoffers(state.preoffered, offer);
            state.preoffered = preoffered;
            state.offered += offer;
            capacity -= offer;

            if state.is_satisfied() {
                states_left = states_left.saturating_sub(1);
                weight = total_weight(states);
            }
        }

        if capacity == 0 {
            // Multi-slot requests can leave every group below the size of its
            // smallest request. Disable the newest such group and share its
            // offer among the others.
            let victim = newest_first.iter().copied().find(|&i| {
                let s = &states[i];
                !s.disabled
                    && !s.is_satisfied()
                    && s.smallest_pending().map_or(false, |n| n > s.offered)
            });
            let Some(i) = victim else {
                return;
            };

            let state = &mut states[i];
            info!(
                group = %state.handle,
                offered = state.offered,
                demand = state.slot_demand,
                "Disabling group to break a multi-slot deadlock"
            );
            capacity += state.offered;
            state.offered = 0;
            state.disabled = true;
            states_left = states_left.saturating_sub(1);
            weight = total_weight(states);
        } else if !progress {
            return;
        }
    }
}
