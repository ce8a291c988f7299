//! Registry of pending and allocated requests

use chrono::{DateTime, Utc};
use slotsched_core::{AgentId, AllocateRequest, AllocationId, ContainerId, ContainerSummary, Device, TaskHandle};
use std::collections::{BTreeMap, HashMap};

/// One container reserved for a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatedContainer {
    pub agent_id: AgentId,
    pub container_id: ContainerId,
    /// Devices reserved on the agent; empty for zero-slot containers and pods
    pub devices: Vec<Device>,
    /// Slots the container accounts for
    pub slots: usize,
}

impl AllocatedContainer {
    pub fn summary(&self) -> ContainerSummary {
        ContainerSummary {
            agent_id: self.agent_id.clone(),
            container_id: self.container_id,
            devices: self.devices.clone(),
        }
    }
}

/// Current allocation record of a task
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskAllocation {
    pub containers: Vec<AllocatedContainer>,
    /// Allocated while a more important request was waiting
    pub backfilled: bool,
    /// The task reported its containers running
    pub running: bool,
}

impl TaskAllocation {
    pub fn new(containers: Vec<AllocatedContainer>) -> Self {
        Self {
            containers,
            backfilled: false,
            running: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    /// Slots held across all containers
    pub fn slots(&self) -> usize {
        self.containers.iter().map(|c| c.slots).sum()
    }
}

struct TaskEntry {
    seq: u64,
    registered_time: DateTime<Utc>,
    request: AllocateRequest,
}

/// Ordered, indexed collection of live requests.
///
/// Iteration follows registration order. Lookups by handle and by ID are O(1).
/// Allocation records live in a side table keyed by handle.
#[derive(Default)]
pub struct TaskList {
    order: BTreeMap<u64, TaskHandle>,
    tasks: HashMap<TaskHandle, TaskEntry>,
    ids: HashMap<AllocationId, TaskHandle>,
    allocations: HashMap<TaskHandle, TaskAllocation>,
    next_seq: u64,
}

impl TaskList {
    /// Create an empty task list
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request. Returns false if the handle already has one or
    /// another handle holds the same ID.
    pub fn add_task(&mut self, request: AllocateRequest) -> bool {
        if self.tasks.contains_key(&request.handle) || self.ids.contains_key(&request.id) {
            return false;
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        let handle = request.handle;
        self.order.insert(seq, handle);
        self.ids.insert(request.id.clone(), handle);
        self.tasks.insert(
            handle,
            TaskEntry {
                seq,
                registered_time: Utc::now(),
                request,
            },
        );
        true
    }

    /// Remove a request together with its allocation record
    pub fn remove_task_by_handle(&mut self, handle: &TaskHandle) -> Option<AllocateRequest> {
        let entry = self.tasks.remove(handle)?;
        self.order.remove(&entry.seq);
        if self.ids.get(&entry.request.id) == Some(handle) {
            self.ids.remove(&entry.request.id);
        }
        self.allocations.remove(handle);
        Some(entry.request)
    }

    pub fn task_by_handle(&self, handle: &TaskHandle) -> Option<&AllocateRequest> {
        self.tasks.get(handle).map(|e| &e.request)
    }

    pub fn task_by_id(&self, id: &AllocationId) -> Option<&AllocateRequest> {
        self.ids.get(id).and_then(|h| self.task_by_handle(h))
    }

    /// Rename a registered task. Returns false for unknown handles.
    pub fn set_task_name(&mut self, handle: &TaskHandle, name: impl Into<String>) -> bool {
        match self.tasks.get_mut(handle) {
            Some(entry) => {
                entry.request.name = name.into();
                true
            }
            None => false,
        }
    }

    pub fn registered_time(&self, handle: &TaskHandle) -> Option<DateTime<Utc>> {
        self.tasks.get(handle).map(|e| e.registered_time)
    }

    /// Position of the task in registration order
    pub fn registration_seq(&self, handle: &TaskHandle) -> Option<u64> {
        self.tasks.get(handle).map(|e| e.seq)
    }

    pub fn set_allocations(&mut self, handle: TaskHandle, allocation: TaskAllocation) {
        self.allocations.insert(handle, allocation);
    }

    pub fn allocations(&self, handle: &TaskHandle) -> Option<&TaskAllocation> {
        self.allocations.get(handle)
    }

    /// Mark an allocated task as running. Returns false without an allocation.
    pub fn set_running(&mut self, handle: &TaskHandle) -> bool {
        match self.allocations.get_mut(handle) {
            Some(allocation) => {
                allocation.running = true;
                true
            }
            None => false,
        }
    }

    /// Drop only the allocation record, keeping the request registered
    pub fn remove_allocations(&mut self, handle: &TaskHandle) -> Option<TaskAllocation> {
        self.allocations.remove(handle)
    }

    /// Whether the task holds a non-empty allocation
    pub fn is_scheduled(&self, handle: &TaskHandle) -> bool {
        self.allocations
            .get(handle)
            .map(|a| !a.is_empty())
            .unwrap_or(false)
    }

    /// Whether the task was allocated through backfilling
    pub fn is_backfilled(&self, handle: &TaskHandle) -> bool {
        self.allocations
            .get(handle)
            .map(|a| a.backfilled)
            .unwrap_or(false)
    }

    /// Iterate requests in registration order
    pub fn iter(&self) -> impl Iterator<Item = &AllocateRequest> + '_ {
        self.order
            .values()
            .filter_map(move |h| self.tasks.get(h).map(|e| &e.request))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
