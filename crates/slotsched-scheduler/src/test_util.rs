//! Fixtures shared by the scheduler tests

use crate::agent_state::{release_containers, reserve_containers, AgentMap, AgentState};
use crate::group::Groups;
use crate::scheduler::{Placement, SchedulingDecision};
use crate::task_list::{AllocatedContainer, TaskAllocation, TaskList};
use chrono::{DateTime, TimeZone, Utc};
use slotsched_core::{
    AgentId, AllocateRequest, AllocationId, ContainerId, Device, GroupHandle, JobId, JobInfo,
    TaskHandle,
};
use std::collections::HashMap;

/// Agent with `slots` devices of which `slots_used` are owned, and
/// `zero_slot_containers` running aux containers.
pub(crate) fn new_fake_agent(
    id: &str,
    slots: u32,
    slots_used: usize,
    max_zero_slot_containers: usize,
    zero_slot_containers: usize,
) -> AgentState {
    let mut agent = AgentState::new(AgentId::from(id), "", max_zero_slot_containers);
    for i in 0..slots {
        agent.add_device(Device::gpu(i), None);
    }
    if slots_used > 0 {
        agent
            .allocate_free_devices(slots_used, ContainerId::new())
            .expect("fake agent has enough devices");
    }
    for _ in 0..zero_slot_containers {
        agent
            .allocate_free_devices(0, ContainerId::new())
            .expect("fake agent has enough aux capacity");
    }
    agent
}

/// Submission time used when a test does not care about it
pub(crate) fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MockAgent {
    pub id: &'static str,
    pub slots: u32,
    pub max_zero_slot_containers: usize,
    pub label: &'static str,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MockGroup {
    pub id: &'static str,
    pub max_slots: Option<usize>,
    pub weight: Option<f64>,
    pub priority: Option<i32>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MockTask {
    pub id: &'static str,
    /// Defaults to the group, or the task itself without a group
    pub job_id: Option<&'static str>,
    pub group: Option<&'static str>,
    pub slots_needed: usize,
    pub label: &'static str,
    pub non_preemptible: bool,
    /// Registered as allocated on this agent
    pub allocated_agent: Option<&'static str>,
    /// Whether the allocated container already owns devices
    pub container_started: bool,
    pub job_submission_time: Option<DateTime<Utc>>,
}

/// Registry, groups and agents as a pool would hand them to a scheduler
pub(crate) struct SchedulerState {
    pub tasks: TaskList,
    pub groups: Groups,
    pub agents: AgentMap,
    group_handles: HashMap<&'static str, GroupHandle>,
}

impl SchedulerState {
    pub fn new(tasks: &[MockTask], groups: &[MockGroup], agents: &[MockAgent]) -> Self {
        Self::with_default_priority(tasks, groups, agents, None)
    }

    pub fn with_default_priority(
        tasks: &[MockTask],
        groups: &[MockGroup],
        agents: &[MockAgent],
        default_priority: Option<i32>,
    ) -> Self {
        let mut state = Self {
            tasks: TaskList::new(),
            groups: Groups::new(default_priority),
            agents: AgentMap::new(),
            group_handles: HashMap::new(),
        };

        for mock in agents {
            let id = AgentId::from(mock.id);
            let mut agent = AgentState::new(id.clone(), mock.label, mock.max_zero_slot_containers);
            for i in 0..mock.slots {
                agent.add_device(Device::gpu(i), None);
            }
            state.agents.insert(id, agent);
        }

        for mock in groups {
            let handle = GroupHandle::new();
            state.group_handles.insert(mock.id, handle);
            let group = state.groups.get_or_create(handle);
            group.max_slots = mock.max_slots;
            if let Some(weight) = mock.weight {
                group.weight = weight;
            }
            if mock.priority.is_some() {
                group.priority = mock.priority;
            }
        }

        for mock in tasks {
            state.add_task(mock);
        }
        state
    }

    fn add_task(&mut self, mock: &MockTask) {
        let handle = TaskHandle::new();
        let group = match mock.group {
            Some(id) => *self.group_handles.entry(id).or_default(),
            None => GroupHandle::from(handle),
        };
        self.groups.get_or_create(group);

        let mut req = AllocateRequest::new(handle, mock.slots_needed);
        req.id = AllocationId::from(mock.id);
        req.name = mock.id.to_string();
        req.group = Some(group);
        req.label = mock.label.to_string();
        req.non_preemptible = mock.non_preemptible;
        req.job = Some(JobInfo {
            job_id: JobId::new(mock.job_id.or(mock.group).unwrap_or(mock.id)),
            submission_time: mock.job_submission_time.unwrap_or_else(base_time),
        });
        assert!(self.tasks.add_task(req));

        if let Some(agent_id) = mock.allocated_agent {
            let agent_id = AgentId::from(agent_id);
            let container_id = ContainerId::new();
            let mut devices = Vec::new();
            if mock.container_started {
                let agent = self.agents.get_mut(&agent_id).expect("allocated agent exists");
                devices = agent
                    .allocate_free_devices(mock.slots_needed, container_id)
                    .expect("allocated agent has room");
            }
            self.tasks.set_allocations(
                handle,
                TaskAllocation::new(vec![AllocatedContainer {
                    agent_id,
                    container_id,
                    devices,
                    slots: mock.slots_needed,
                }]),
            );
        }
    }

    /// Register more pending tasks after the initial setup
    pub fn add_unallocated_tasks(&mut self, tasks: &[MockTask]) {
        for mock in tasks {
            self.add_task(mock);
        }
    }

    /// Commit placements to the agents and the registry
    pub fn allocate(&mut self, placements: &[Placement]) {
        for placement in placements {
            let containers =
                reserve_containers(&mut self.agents, &placement.fits).expect("placement fits");
            let mut allocation = TaskAllocation::new(containers);
            allocation.backfilled = placement.backfilled;
            self.tasks.set_allocations(placement.handle, allocation);
        }
    }

    /// Finish a task: free its devices and drop it from the registry
    pub fn remove_task(&mut self, id: &str) -> bool {
        let Some(handle) = self.handle(id) else {
            return false;
        };
        if let Some(allocation) = self.tasks.allocations(&handle) {
            release_containers(&mut self.agents, &allocation.containers);
        }
        self.tasks.remove_task_by_handle(&handle).is_some()
    }

    pub fn handle(&self, id: &str) -> Option<TaskHandle> {
        self.tasks.task_by_id(&AllocationId::from(id)).map(|r| r.handle)
    }

    pub fn group(&self, id: &str) -> GroupHandle {
        self.group_handles[id]
    }

    fn id_of(&self, handle: &TaskHandle) -> String {
        self.tasks
            .task_by_handle(handle)
            .map(|r| r.id.to_string())
            .unwrap_or_default()
    }

    /// Sorted IDs of the tasks chosen for allocation
    pub fn allocated_ids(&self, decision: &SchedulingDecision) -> Vec<String> {
        let mut ids: Vec<String> = decision
            .to_allocate
            .iter()
            .map(|p| self.id_of(&p.handle))
            .collect();
        ids.sort();
        ids
    }

    /// Sorted IDs of the tasks chosen for release
    pub fn released_ids(&self, decision: &SchedulingDecision) -> Vec<String> {
        let mut ids: Vec<String> = decision.to_release.iter().map(|h| self.id_of(h)).collect();
        ids.sort();
        ids
    }
}

/// Sorted owned copies, for comparing with `allocated_ids`/`released_ids`
pub(crate) fn ids(ids: &[&str]) -> Vec<String> {
    let mut ids: Vec<String> = ids.iter().map(|s| s.to_string()).collect();
    ids.sort();
    ids
}
