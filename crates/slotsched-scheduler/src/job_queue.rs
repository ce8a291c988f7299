//! Job queue reporting

use crate::group::Groups;
use crate::task_list::TaskList;
use slotsched_core::{
    AllocateRequest, GroupHandle, JobQueue, JobState, QueueStats, RmJobInfo, SchedError, SchedResult,
};
use std::cmp::Ordering;

/// Place of a request among requests of equal priority: the group's
/// explicit queue position, else the job submission time in seconds.
pub fn queue_position(groups: &Groups, req: &AllocateRequest) -> Option<f64> {
    groups
        .get(&req.group_handle())
        .and_then(|g| g.queue_position)
        .or_else(|| {
            req.job_submission_time()
                .map(|t| t.timestamp_micros() as f64 / 1e6)
        })
}

/// Order two requests by queue position; requests with one come first,
/// and registration order breaks the remaining ties.
fn compare_by_position(
    tasks: &TaskList,
    groups: &Groups,
    a: &AllocateRequest,
    b: &AllocateRequest,
) -> Ordering {
    match (queue_position(groups, a), queue_position(groups, b)) {
        (Some(x), Some(y)) if x != y => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        _ => tasks
            .registration_seq(&a.handle)
            .cmp(&tasks.registration_seq(&b.handle)),
    }
}

/// Every request, most important group first.
///
/// Lower priority numbers are more important, except in Kubernetes pools
/// where the order is reversed.
pub fn sort_by_priority<'a>(
    tasks: &'a TaskList,
    groups: &Groups,
    kubernetes: bool,
) -> Vec<&'a AllocateRequest> {
    let mut reqs: Vec<&AllocateRequest> = tasks.iter().collect();
    reqs.sort_by(|a, b| {
        let pa = groups.priority(&a.group_handle());
        let pb = groups.priority(&b.group_handle());
        let by_priority = if kubernetes { pb.cmp(&pa) } else { pa.cmp(&pb) };
        by_priority.then_with(|| compare_by_position(tasks, groups, a, b))
    });
    reqs
}

/// Move a group's job directly ahead of or behind the anchor group's job.
///
/// The job takes the anchor's priority when they differ. Its new position
/// is halfway to the anchor's neighbour on that side, or one second past
/// the anchor when the neighbour has another priority or there is none.
pub fn move_job(
    tasks: &TaskList,
    groups: &mut Groups,
    job: GroupHandle,
    anchor: GroupHandle,
    ahead: bool,
    kubernetes: bool,
) -> SchedResult<()> {
    if job == anchor {
        return Ok(());
    }

    let mut order: Vec<(GroupHandle, Option<f64>)> = Vec::new();
    for req in sort_by_priority(tasks, groups, kubernetes) {
        let group = req.group_handle();
        if !order.iter().any(|(g, _)| *g == group) {
            order.push((group, queue_position(groups, req)));
        }
    }

    let Some(job_index) = order.iter().position(|(g, _)| *g == job) else {
        return Err(SchedError::GroupNotFound(job.to_string()));
    };
    order.remove(job_index);
    let Some(anchor_index) = order.iter().position(|(g, _)| *g == anchor) else {
        return Err(SchedError::GroupNotFound(anchor.to_string()));
    };
    let Some(anchor_position) = order[anchor_index].1 else {
        return Err(SchedError::Scheduler(format!(
            "group {anchor} has no queue position"
        )));
    };

    let anchor_priority = groups.priority(&anchor);
    if groups.priority(&job) != anchor_priority {
        groups.get_or_create(job).priority = Some(anchor_priority);
    }

    let neighbour = if ahead {
        anchor_index.checked_sub(1).and_then(|i| order.get(i))
    } else {
        order.get(anchor_index + 1)
    };
    let neighbour_position = neighbour
        .filter(|(g, _)| groups.priority(g) == anchor_priority)
        .and_then(|(_, position)| *position);

    let position = match neighbour_position {
        Some(other) => {
            let mid = (anchor_position + other) / 2.0;
            if mid == anchor_position || mid == other {
                return Err(SchedError::Scheduler(format!(
                    "no room to move group {job} next to group {anchor}"
                )));
            }
            mid
        }
        None if ahead => anchor_position - 1.0,
        None => anchor_position + 1.0,
    };

    groups.get_or_create(job).queue_position = Some(position);
    Ok(())
}

/// Fold ordered requests into per-job queue entries.
///
/// A job's position is the number of distinct jobs seen before its first
/// request. Requests without job metadata are not reported.
pub fn reduce_to_job_queue(reqs: &[&AllocateRequest], tasks: &TaskList) -> JobQueue {
    let mut queue = JobQueue::new();
    let mut jobs_ahead = 0;

    for req in reqs {
        let Some(job) = &req.job else {
            continue;
        };

        let scheduled = tasks.is_scheduled(&req.handle);
        let state = match (scheduled, tasks.is_backfilled(&req.handle)) {
            (false, _) => JobState::Queued,
            (true, false) => JobState::Scheduled,
            (true, true) => JobState::ScheduledBackfilled,
        };
        let allocated = if scheduled { req.slots_needed } else { 0 };

        match queue.get_mut(&job.job_id) {
            Some(info) => {
                info.requested_slots += req.slots_needed;
                info.allocated_slots += allocated;
                info.state = merge_states(info.state, state);
            }
            None => {
                queue.insert(
                    job.job_id.clone(),
                    RmJobInfo {
                        jobs_ahead,
                        state,
                        requested_slots: req.slots_needed,
                        allocated_slots: allocated,
                    },
                );
                jobs_ahead += 1;
            }
        }
    }
    queue
}

/// A job is as far along as its furthest task
fn merge_states(a: JobState, b: JobState) -> JobState {
    fn rank(state: JobState) -> u8 {
        match state {
            JobState::Queued => 0,
            JobState::ScheduledBackfilled => 1,
            JobState::Scheduled => 2,
        }
    }
    if rank(b) > rank(a) {
        b
    } else {
        a
    }
}

/// Queue for policies that do not order jobs
pub(crate) fn unordered_job_queue(tasks: &TaskList) -> JobQueue {
    let reqs: Vec<&AllocateRequest> = tasks.iter().collect();
    let mut queue = reduce_to_job_queue(&reqs, tasks);
    for info in queue.values_mut() {
        info.jobs_ahead = -1;
    }
    queue
}

/// Count queued and scheduled jobs of the registry
pub fn job_queue_stats(tasks: &TaskList) -> QueueStats {
    let reqs: Vec<&AllocateRequest> = tasks.iter().collect();
    QueueStats::from_queue(&reduce_to_job_queue(&reqs, tasks))
}
