//! Scaling signal and pool summaries

use crate::agent_state::AgentMap;
use crate::group::Groups;
use crate::task_list::TaskList;
use slotsched_core::{AgentSummary, GroupHandle, ResourceSummary};
use std::collections::{BTreeMap, HashMap};

/// Number of extra instances needed to run every pending request.
///
/// Aux demand is divided by the aux cap per agent and slot demand by the
/// instance size, both rounded up; the larger wins. Slot demand is capped
/// per group by its max slots. A request larger than one instance that is
/// not a whole multiple of it can never be placed and is ignored. A zero
/// instance size or aux cap disables the matching half of the estimate.
pub fn desired_new_instances(
    tasks: &TaskList,
    groups: &Groups,
    slots_per_instance: usize,
    max_aux_per_agent: usize,
) -> usize {
    let mut pending_aux: usize = 0;
    let mut group_slots: HashMap<GroupHandle, usize> = HashMap::new();

    for req in tasks.iter() {
        if tasks.is_scheduled(&req.handle) {
            continue;
        }
        if req.slots_needed == 0 {
            pending_aux += 1;
            continue;
        }
        if slots_per_instance > 0
            && req.slots_needed > slots_per_instance
            && req.slots_needed % slots_per_instance != 0
        {
            continue;
        }
        *group_slots.entry(req.group_handle()).or_default() += req.slots_needed;
    }

    let slot_demand: usize = group_slots
        .into_iter()
        .map(|(handle, slots)| match groups.max_slots(&handle) {
            Some(max_slots) => slots.min(max_slots),
            None => slots,
        })
        .sum();

    let by_aux = if max_aux_per_agent > 0 {
        pending_aux.div_ceil(max_aux_per_agent)
    } else {
        0
    };
    let by_slots = if slots_per_instance > 0 {
        slot_demand.div_ceil(slots_per_instance)
    } else {
        0
    };
    by_aux.max(by_slots)
}

/// Idle/busy summary of every agent, keyed by name
pub fn agent_summaries(agents: &AgentMap) -> BTreeMap<String, AgentSummary> {
    agents
        .values()
        .map(|agent| {
            let summary = agent.summary();
            (summary.name.clone(), summary)
        })
        .collect()
}

pub fn resource_summary(agents: &AgentMap) -> ResourceSummary {
    agents.values().fold(
        ResourceSummary {
            num_agents: agents.len(),
            ..Default::default()
        },
        |mut summary, agent| {
            summary.num_total_slots += agent.num_slots();
            summary.num_active_slots += agent.num_used_slots();
            summary.max_num_aux_containers += agent.max_zero_slot_containers();
            summary.num_active_aux_containers += agent.num_zero_slot_containers();
            summary
        },
    )
}
