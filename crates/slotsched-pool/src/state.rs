//! Bookkeeping shared by agent-backed and Kubernetes-backed pools

use crate::allocation::{Allocation, ResourcesAllocated, TaskEvent};
use slotsched_core::{
    validate_priority, AllocateRequest, ContainerSummary, GroupHandle, JobQueue, SchedError,
    SchedResult, SchedulerType, SchedulingState, TaskHandle, TaskSummary,
};
use slotsched_scheduler::{move_job, AllocatedContainer, Groups, TaskAllocation, TaskList};
use std::collections::HashMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Registry, groups and task channels of one pool
pub(crate) struct PoolState {
    pub name: String,
    pub scheduler_type: SchedulerType,
    pub tasks: TaskList,
    pub groups: Groups,
    events: HashMap<TaskHandle, mpsc::UnboundedSender<TaskEvent>>,
    job_queue: watch::Sender<JobQueue>,
    /// Set by every placement-affecting message, cleared by a pass
    pub dirty: bool,
}

impl PoolState {
    pub fn new(name: impl Into<String>, scheduler_type: SchedulerType, default_priority: i32) -> Self {
        let (job_queue, _) = watch::channel(JobQueue::new());
        Self {
            name: name.into(),
            scheduler_type,
            tasks: TaskList::new(),
            groups: Groups::new(Some(default_priority)),
            events: HashMap::new(),
            job_queue,
            dirty: false,
        }
    }

    pub fn job_queue_feed(&self) -> watch::Receiver<JobQueue> {
        self.job_queue.subscribe()
    }

    /// Fill in defaults and register the request with its group
    pub fn register(
        &mut self,
        request: AllocateRequest,
        events: mpsc::UnboundedSender<TaskEvent>,
    ) -> Option<TaskHandle> {
        let mut request = request.with_defaults();
        if request.resource_pool.is_empty() {
            request.resource_pool = self.name.clone();
        }

        let handle = request.handle;
        let group = request.group_handle();
        let (id, slots) = (request.id.clone(), request.slots_needed);
        if !self.tasks.add_task(request) {
            debug!(pool = %self.name, task = %id, "Task already registered");
            return None;
        }

        self.groups.get_or_create(group);
        self.events.insert(handle, events);
        info!(pool = %self.name, task = %id, slots, "Registered task");
        Some(handle)
    }

    /// Drop the request and its channel, returning its allocation record
    pub fn unregister(&mut self, handle: &TaskHandle) -> Option<TaskAllocation> {
        let allocation = self.tasks.allocations(handle).cloned();
        let request = self.tasks.remove_task_by_handle(handle)?;
        self.events.remove(handle);
        info!(pool = %self.name, task = %request.id, "Removed task");
        allocation
    }

    pub fn set_group_weight(&mut self, handle: GroupHandle, weight: f64) {
        debug!(pool = %self.name, group = %handle, weight, "Setting group weight");
        self.groups.get_or_create(handle).weight = weight;
    }

    pub fn set_group_max_slots(&mut self, handle: GroupHandle, max_slots: Option<usize>) {
        debug!(pool = %self.name, group = %handle, ?max_slots, "Setting group max slots");
        self.groups.get_or_create(handle).max_slots = max_slots;
    }

    /// Fair-share pools keep no priority; out-of-range values are rejected
    pub fn set_group_priority(&mut self, handle: GroupHandle, priority: i32) -> SchedResult<()> {
        if self.scheduler_type == SchedulerType::FairShare {
            debug!(pool = %self.name, group = %handle, "Ignoring group priority in fair-share pool");
            return Ok(());
        }
        validate_priority(priority)?;
        debug!(pool = %self.name, group = %handle, priority, "Setting group priority");
        self.groups.get_or_create(handle).priority = Some(priority);
        Ok(())
    }

    pub fn group_stopped(&mut self, handle: &GroupHandle) {
        if self.groups.remove(handle).is_some() {
            debug!(pool = %self.name, group = %handle, "Forgot stopped group");
        }
    }

    pub fn set_task_name(&mut self, handle: &TaskHandle, name: String) {
        if !self.tasks.set_task_name(handle, name) {
            debug!(pool = %self.name, task = %handle, "Cannot rename unknown task");
        }
    }

    pub fn task_running(&mut self, handle: &TaskHandle) {
        if !self.tasks.set_running(handle) {
            debug!(pool = %self.name, task = %handle, "Running report for unallocated task");
        }
    }

    /// Reorder the job queue; fair-share pools keep no queue order
    pub fn move_job(&mut self, handle: GroupHandle, anchor: GroupHandle, ahead: bool) -> SchedResult<()> {
        if self.scheduler_type == SchedulerType::FairShare {
            return Err(SchedError::Unsupported(
                "fair-share pools do not order jobs".to_string(),
            ));
        }
        move_job(
            &self.tasks,
            &mut self.groups,
            handle,
            anchor,
            ahead,
            self.scheduler_type == SchedulerType::Kubernetes,
        )?;
        info!(pool = %self.name, group = %handle, anchor = %anchor, ahead, "Moved job");
        Ok(())
    }

    pub fn recover_job_position(&mut self, handle: GroupHandle, position: f64) {
        debug!(pool = %self.name, group = %handle, position, "Recovered job position");
        self.groups.get_or_create(handle).queue_position = Some(position);
    }

    /// Record the allocation and tell the task.
    ///
    /// Returns the containers back when the task is gone, so the caller
    /// can free them.
    pub fn commit_allocation(
        &mut self,
        handle: TaskHandle,
        containers: Vec<AllocatedContainer>,
        backfilled: bool,
        allocations: Vec<Allocation>,
    ) -> Option<Vec<AllocatedContainer>> {
        let Some(request) = self.tasks.task_by_handle(&handle) else {
            return Some(containers);
        };

        let event = TaskEvent::ResourcesAllocated(ResourcesAllocated {
            id: request.id.clone(),
            handle,
            resource_pool: self.name.clone(),
            allocations,
            job_submission_time: request.job_submission_time(),
        });
        info!(
            pool = %self.name,
            task = %request.id,
            slots = request.slots_needed,
            containers = containers.len(),
            backfilled,
            "Allocated resources"
        );

        self.tasks.set_allocations(
            handle,
            TaskAllocation {
                containers,
                backfilled,
                running: false,
            },
        );

        if self.notify(&handle, event) {
            return None;
        }

        debug!(pool = %self.name, task = %handle, "Task went away before allocation, releasing");
        self.unregister(&handle).map(|a| a.containers)
    }

    /// Ask a task to give its resources back.
    ///
    /// A task that cannot be reached is treated as released right away;
    /// its allocation record is returned for the caller to free.
    pub fn request_release(&mut self, handle: TaskHandle) -> Option<TaskAllocation> {
        let request = self.tasks.task_by_handle(&handle)?;
        info!(pool = %self.name, task = %request.id, "Requesting resource release");

        if self.notify(&handle, TaskEvent::ReleaseResources { handle }) {
            return None;
        }
        self.unregister(&handle)
    }

    /// Deliver an event to a registered task, ignoring tasks that went away
    pub fn notify(&self, handle: &TaskHandle, event: TaskEvent) -> bool {
        self.events
            .get(handle)
            .map(|tx| tx.send(event).is_ok())
            .unwrap_or(false)
    }

    pub fn task_summary(&self, request: &AllocateRequest) -> TaskSummary {
        let resources: Vec<ContainerSummary> = self
            .tasks
            .allocations(&request.handle)
            .map(|a| a.containers.iter().map(|c| c.summary()).collect())
            .unwrap_or_default();

        let priority = match self.scheduler_type {
            SchedulerType::FairShare => None,
            SchedulerType::Priority | SchedulerType::Kubernetes => {
                Some(self.groups.priority(&request.group_handle()))
            }
        };

        TaskSummary {
            id: request.id.clone(),
            name: request.name.clone(),
            registered_time: self
                .tasks
                .registered_time(&request.handle)
                .unwrap_or_else(chrono::Utc::now),
            resource_pool: self.name.clone(),
            slots_needed: request.slots_needed,
            resources,
            scheduler_type: self.scheduler_type,
            priority,
        }
    }

    /// Summaries of every task in registration order
    pub fn task_summaries(&self) -> Vec<TaskSummary> {
        self.tasks.iter().map(|r| self.task_summary(r)).collect()
    }

    pub fn scheduling_state(&self, agents: usize) -> SchedulingState {
        let allocated_tasks = self
            .tasks
            .iter()
            .filter(|r| self.tasks.is_scheduled(&r.handle))
            .count();
        SchedulingState {
            pending_tasks: self.tasks.len() - allocated_tasks,
            allocated_tasks,
            agents,
            groups: self.groups.len(),
        }
    }

    /// Publish the job queue to watchers when it changed
    pub fn publish_job_queue(&self, queue: JobQueue) {
        self.job_queue.send_if_modified(|current| {
            if *current == queue {
                return false;
            }
            *current = queue;
            true
        });
    }
}
