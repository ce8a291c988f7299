//! Agent-backed resource pool
//!
//! The pool owns the task registry, the groups and the agent map of one
//! pool. Messages mutate that state and mark the pool dirty; the next tick
//! runs the scheduler once, commits its decision and recomputes the
//! scaling signal.

use crate::allocation::{AgentCommand, Allocation, ResourcesAllocated, ScalingUpdate, TaskEvent};
use crate::messages::PoolMessage;
use crate::runtime::PoolActor;
use crate::state::PoolState;
use slotsched_core::{
    AgentId, AllocateRequest, ContainerSummary, JobQueue, ResourcePoolConfig, ScalingInfo,
    SchedError, SchedResult, SchedulerConfig, TaskHandle, ValidateCommandResourcesResponse,
};
use slotsched_scheduler::{
    agent_summaries, desired_new_instances, job_queue_stats, make_scheduler, release_containers,
    reserve_containers, resource_summary, AgentMap, AgentState, AllocatedContainer, Placement,
    Scheduler, TaskAllocation,
};
use std::collections::HashMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Resource pool scheduling onto registered agents
pub struct ResourcePool {
    config: ResourcePoolConfig,
    scheduler: Box<dyn Scheduler>,
    state: PoolState,
    agents: AgentMap,
    agent_commands: HashMap<AgentId, mpsc::UnboundedSender<AgentCommand>>,
    scaling: Option<mpsc::UnboundedSender<ScalingUpdate>>,
    scaling_info: ScalingInfo,
}

impl ResourcePool {
    pub fn new(config: ResourcePoolConfig, scheduler_config: &SchedulerConfig) -> SchedResult<Self> {
        let scheduler = make_scheduler(scheduler_config)?;
        let state = PoolState::new(
            config.pool_name.clone(),
            scheduler.scheduler_type(),
            scheduler_config.default_priority(),
        );
        Ok(Self {
            config,
            scheduler,
            state,
            agents: AgentMap::new(),
            agent_commands: HashMap::new(),
            scaling: None,
            scaling_info: ScalingInfo::default(),
        })
    }

    /// Forward scaling signals to a provisioner
    pub fn with_scaling(mut self, scaling: mpsc::UnboundedSender<ScalingUpdate>) -> Self {
        self.scaling = Some(scaling);
        self
    }

    pub fn job_queue_feed(&self) -> watch::Receiver<JobQueue> {
        self.state.job_queue_feed()
    }

    /// Whether a placement-affecting message arrived since the last pass
    pub fn is_dirty(&self) -> bool {
        self.state.dirty
    }

    fn agent_mut(&mut self, agent_id: &AgentId) -> SchedResult<&mut AgentState> {
        self.agents
            .get_mut(agent_id)
            .ok_or_else(|| SchedError::AgentNotFound(agent_id.to_string()))
    }

    fn add_agent(
        &mut self,
        agent_id: AgentId,
        label: String,
        commands: mpsc::UnboundedSender<AgentCommand>,
    ) {
        if self.agents.contains_key(&agent_id) {
            info!(pool = %self.state.name, agent = %agent_id, "Agent reconnected");
        } else {
            info!(pool = %self.state.name, agent = %agent_id, label = %label, "Adding agent");
            self.agents.insert(
                agent_id.clone(),
                AgentState::new(
                    agent_id.clone(),
                    label,
                    self.config.max_aux_containers_per_agent,
                ),
            );
        }
        self.agent_commands.insert(agent_id, commands);
    }

    /// Tasks holding at least one container on the agent
    fn tasks_on_agent(&self, agent_id: &AgentId) -> Vec<TaskHandle> {
        self.state
            .tasks
            .iter()
            .filter(|r| {
                self.state
                    .tasks
                    .allocations(&r.handle)
                    .map(|a| a.containers.iter().any(|c| &c.agent_id == agent_id))
                    .unwrap_or(false)
            })
            .map(|r| r.handle)
            .collect()
    }

    /// Containers on a departed agent are gone, so their tasks count as
    /// released: they are told and unregistered, and their containers on
    /// other agents are freed.
    fn remove_agent(&mut self, agent_id: &AgentId) -> SchedResult<()> {
        self.agents
            .remove(agent_id)
            .ok_or_else(|| SchedError::AgentNotFound(agent_id.to_string()))?;
        self.agent_commands.remove(agent_id);

        let failed = self.tasks_on_agent(agent_id);
        for handle in &failed {
            self.state.notify(
                handle,
                TaskEvent::AgentFailed {
                    handle: *handle,
                    agent_id: agent_id.clone(),
                },
            );
            if let Some(allocation) = self.state.unregister(handle) {
                release_containers(&mut self.agents, &allocation.containers);
            }
        }
        info!(
            pool = %self.state.name,
            agent = %agent_id,
            failed_tasks = failed.len(),
            "Removed agent"
        );
        Ok(())
    }

    /// Without draining, tasks running on the agent are asked to leave
    fn disable_agent(&mut self, agent_id: &AgentId, drain: bool) -> SchedResult<()> {
        self.agent_mut(agent_id)?.disable(drain);
        if drain {
            return Ok(());
        }

        for handle in self.tasks_on_agent(agent_id) {
            self.release(handle);
        }
        Ok(())
    }

    fn resources_released(&mut self, handle: &TaskHandle) {
        if self.state.tasks.task_by_handle(handle).is_none() {
            debug!(pool = %self.state.name, task = %handle, "Release for unknown task");
            return;
        }
        if let Some(allocation) = self.state.unregister(handle) {
            release_containers(&mut self.agents, &allocation.containers);
        }
    }

    /// Re-register a running task and mark its devices as owned again.
    ///
    /// Every agent is checked before anything changes.
    fn restore_resources(
        &mut self,
        request: AllocateRequest,
        events: mpsc::UnboundedSender<TaskEvent>,
        containers: Vec<ContainerSummary>,
    ) -> SchedResult<()> {
        if self.state.tasks.task_by_handle(&request.handle).is_some() {
            return Err(SchedError::Invariant(format!(
                "task {} is already registered",
                request.handle
            )));
        }
        for container in &containers {
            if !self.agents.contains_key(&container.agent_id) {
                return Err(SchedError::AgentNotFound(container.agent_id.to_string()));
            }
        }

        let mut restored = Vec::with_capacity(containers.len());
        for container in containers {
            let agent = self.agent_mut(&container.agent_id)?;
            if container.devices.is_empty() {
                agent.allocate_free_devices(0, container.container_id)?;
            } else {
                for device in &container.devices {
                    agent.add_device(device.clone(), Some(container.container_id));
                }
            }
            restored.push(AllocatedContainer {
                slots: container.devices.len(),
                agent_id: container.agent_id,
                container_id: container.container_id,
                devices: container.devices,
            });
        }

        let Some(handle) = self.state.register(request, events) else {
            release_containers(&mut self.agents, &restored);
            return Err(SchedError::Invariant("restored task was registered twice".to_string()));
        };
        let allocations = self.allocations_for(&handle, &restored)?;
        self.state
            .tasks
            .set_allocations(handle, TaskAllocation::new(restored));

        if let Some(request) = self.state.tasks.task_by_handle(&handle) {
            info!(pool = %self.state.name, task = %request.id, "Restored running task");
            let event = TaskEvent::ResourcesAllocated(ResourcesAllocated {
                id: request.id.clone(),
                handle,
                resource_pool: self.state.name.clone(),
                allocations,
                job_submission_time: request.job_submission_time(),
            });
            self.state.notify(&handle, event);
        }
        Ok(())
    }

    fn allocations_for(
        &self,
        handle: &TaskHandle,
        containers: &[AllocatedContainer],
    ) -> SchedResult<Vec<Allocation>> {
        let allocation_id = self
            .state
            .tasks
            .task_by_handle(handle)
            .map(|r| r.id.clone())
            .ok_or_else(|| SchedError::TaskNotFound(handle.to_string()))?;

        containers
            .iter()
            .map(|c| {
                let agent = self
                    .agent_commands
                    .get(&c.agent_id)
                    .cloned()
                    .ok_or_else(|| SchedError::AgentNotFound(c.agent_id.to_string()))?;
                Ok(Allocation::Agent {
                    allocation_id: allocation_id.clone(),
                    agent_id: c.agent_id.clone(),
                    container_id: c.container_id,
                    devices: c.devices.clone(),
                    agent,
                })
            })
            .collect()
    }

    /// Reserve the placement's containers and hand them to the task
    fn allocate(&mut self, placement: Placement) -> SchedResult<()> {
        if self.state.tasks.task_by_handle(&placement.handle).is_none() {
            debug!(pool = %self.state.name, task = %placement.handle, "Placed task is gone");
            return Ok(());
        }

        let containers = reserve_containers(&mut self.agents, &placement.fits).map_err(|e| {
            error!(
                pool = %self.state.name,
                task = %placement.handle,
                error = %e,
                "Failed to reserve containers"
            );
            e
        })?;

        let allocations = match self.allocations_for(&placement.handle, &containers) {
            Ok(allocations) => allocations,
            Err(e) => {
                release_containers(&mut self.agents, &containers);
                return Err(e);
            }
        };

        if let Some(orphaned) = self.state.commit_allocation(
            placement.handle,
            containers,
            placement.backfilled,
            allocations,
        ) {
            release_containers(&mut self.agents, &orphaned);
        }
        Ok(())
    }

    fn release(&mut self, handle: TaskHandle) {
        if let Some(allocation) = self.state.request_release(handle) {
            release_containers(&mut self.agents, &allocation.containers);
        }
    }

    fn update_scaling(&mut self) {
        let Some(scaling) = &self.scaling else {
            return;
        };

        let desired = desired_new_instances(
            &self.state.tasks,
            &self.state.groups,
            self.config.slots_per_instance.unwrap_or(0),
            self.config.max_aux_containers_per_agent,
        );
        if !self
            .scaling_info
            .update(desired, agent_summaries(&self.agents))
        {
            return;
        }

        debug!(pool = %self.state.name, desired_new_instances = desired, "Scaling signal changed");
        let update = ScalingUpdate {
            resource_pool: self.state.name.clone(),
            info: self.scaling_info.clone(),
        };
        if scaling.send(update).is_err() {
            debug!(pool = %self.state.name, "Provisioner is gone, dropping scaling signal");
        }
    }

    fn validate_command_resources(&self, slots: usize) -> ValidateCommandResourcesResponse {
        ValidateCommandResourcesResponse {
            fulfillable: self.config.slots_per_instance.map_or(true, |n| n >= slots),
        }
    }
}

impl PoolActor for ResourcePool {
    fn name(&self) -> &str {
        &self.state.name
    }

    fn handle(&mut self, msg: PoolMessage) -> SchedResult<()> {
        if msg.affects_placement() {
            self.state.dirty = true;
        }

        match msg {
            PoolMessage::Allocate { request, events } => {
                self.state.register(request, events);
            }
            PoolMessage::ResourcesReleased { handle } => self.resources_released(&handle),
            PoolMessage::SetGroupWeight { handle, weight } => {
                self.state.set_group_weight(handle, weight)
            }
            PoolMessage::SetGroupMaxSlots { handle, max_slots } => {
                self.state.set_group_max_slots(handle, max_slots)
            }
            PoolMessage::SetGroupPriority { handle, priority } => {
                self.state.set_group_priority(handle, priority)?
            }
            PoolMessage::GroupStopped { handle } => self.state.group_stopped(&handle),
            PoolMessage::SetTaskName { handle, name } => self.state.set_task_name(&handle, name),
            PoolMessage::TaskRunning { handle } => self.state.task_running(&handle),
            PoolMessage::MoveJob {
                handle,
                anchor,
                ahead,
                reply_to,
            } => {
                let _ = reply_to.send(self.state.move_job(handle, anchor, ahead));
            }
            PoolMessage::RecoverJobPosition { handle, position } => {
                self.state.recover_job_position(handle, position)
            }

            PoolMessage::AddAgent {
                agent_id,
                label,
                commands,
            } => self.add_agent(agent_id, label, commands),
            PoolMessage::RemoveAgent { agent_id } => self.remove_agent(&agent_id)?,
            PoolMessage::AddDevice {
                agent_id,
                device,
                container_id,
            } => self.agent_mut(&agent_id)?.add_device(device, container_id),
            PoolMessage::RemoveDevice {
                agent_id,
                device_id,
            } => {
                self.agent_mut(&agent_id)?.remove_device(device_id)?;
            }
            PoolMessage::FreeDevice {
                agent_id,
                device_id,
                container_id,
            } => self
                .agent_mut(&agent_id)?
                .free_device(device_id, &container_id)?,
            PoolMessage::EnableAgent { agent_id } => self.agent_mut(&agent_id)?.enable(),
            PoolMessage::DisableAgent { agent_id, drain } => {
                self.disable_agent(&agent_id, drain)?
            }

            PoolMessage::RestoreResources {
                request,
                events,
                containers,
                reply_to,
            } => {
                let result = self.restore_resources(request, events, containers);
                if let Err(e) = &result {
                    warn!(pool = %self.state.name, error = %e, "Failed to restore task");
                }
                let _ = reply_to.send(result);
            }

            PoolMessage::GetTaskSummary { id, reply_to } => {
                let summary = self
                    .state
                    .tasks
                    .task_by_id(&id)
                    .map(|r| self.state.task_summary(r));
                let _ = reply_to.send(summary);
            }
            PoolMessage::GetTaskSummaries { reply_to } => {
                let _ = reply_to.send(self.state.task_summaries());
            }
            PoolMessage::GetResourceSummary { reply_to } => {
                let _ = reply_to.send(resource_summary(&self.agents));
            }
            PoolMessage::GetJobQueue { reply_to } => {
                let _ = reply_to.send(
                    self.scheduler
                        .job_queue(&self.state.tasks, &self.state.groups),
                );
            }
            PoolMessage::GetJobQueueStats { reply_to } => {
                let _ = reply_to.send(job_queue_stats(&self.state.tasks));
            }
            PoolMessage::ValidateCommandResources { slots, reply_to } => {
                let _ = reply_to.send(self.validate_command_resources(slots));
            }
            PoolMessage::GetSchedulingState { reply_to } => {
                let _ = reply_to.send(self.state.scheduling_state(self.agents.len()));
            }
        }
        Ok(())
    }

    fn tick(&mut self) -> SchedResult<()> {
        if !self.state.dirty {
            return Ok(());
        }
        self.state.dirty = false;

        let decision = self
            .scheduler
            .schedule(&self.state.tasks, &self.state.groups, &self.agents)?;
        if !decision.is_empty() {
            debug!(
                pool = %self.state.name,
                to_allocate = decision.to_allocate.len(),
                to_release = decision.to_release.len(),
                "Scheduling pass"
            );
        }

        for placement in decision.to_allocate {
            if let Err(e) = self.allocate(placement) {
                // The rest of the decision is recomputed by the next pass
                self.state.dirty = true;
                return Err(e);
            }
        }
        for handle in decision.to_release {
            self.release(handle);
        }

        self.state.publish_job_queue(
            self.scheduler
                .job_queue(&self.state.tasks, &self.state.groups),
        );
        self.update_scaling();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotsched_core::{
        AllocationId, ContainerId, Device, GroupHandle, JobId, JobInfo, JobState,
        PrioritySchedulerConfig, SchedulerType,
    };
    use tokio::sync::oneshot;

    fn pool_config(slots_per_instance: Option<usize>) -> ResourcePoolConfig {
        ResourcePoolConfig {
            pool_name: "default".to_string(),
            slots_per_instance,
            ..Default::default()
        }
    }

    fn fair_share_pool() -> ResourcePool {
        ResourcePool::new(pool_config(None), &SchedulerConfig::default()).unwrap()
    }

    fn add_agent(
        pool: &mut ResourcePool,
        id: &str,
        slots: u32,
    ) -> mpsc::UnboundedReceiver<AgentCommand> {
        let (tx, rx) = mpsc::unbounded_channel();
        pool.handle(PoolMessage::AddAgent {
            agent_id: AgentId::from(id),
            label: String::new(),
            commands: tx,
        })
        .unwrap();
        for i in 0..slots {
            pool.handle(PoolMessage::AddDevice {
                agent_id: AgentId::from(id),
                device: Device::gpu(i),
                container_id: None,
            })
            .unwrap();
        }
        rx
    }

    fn allocate(
        pool: &mut ResourcePool,
        request: AllocateRequest,
    ) -> mpsc::UnboundedReceiver<TaskEvent> {
        let (events, rx) = mpsc::unbounded_channel();
        pool.handle(PoolMessage::Allocate { request, events }).unwrap();
        rx
    }

    fn request(id: &str, slots: usize) -> AllocateRequest {
        let mut req = AllocateRequest::new(TaskHandle::new(), slots);
        req.id = AllocationId::from(id);
        req
    }

    fn ask<T>(pool: &mut ResourcePool, make: impl FnOnce(oneshot::Sender<T>) -> PoolMessage) -> T {
        let (tx, mut rx) = oneshot::channel();
        pool.handle(make(tx)).unwrap();
        rx.try_recv().unwrap()
    }

    fn expect_allocated(rx: &mut mpsc::UnboundedReceiver<TaskEvent>) -> ResourcesAllocated {
        match rx.try_recv() {
            Ok(TaskEvent::ResourcesAllocated(allocated)) => allocated,
            other => panic!("expected an allocation, got {:?}", other),
        }
    }

    #[test]
    fn test_allocation_happens_on_tick() {
        let mut pool = fair_share_pool();
        let mut agent_rx = add_agent(&mut pool, "agent1", 4);
        let mut events = allocate(&mut pool, request("task1", 2));

        assert!(events.try_recv().is_err());
        pool.tick().unwrap();

        let allocated = expect_allocated(&mut events);
        assert_eq!(allocated.id, AllocationId::from("task1"));
        assert_eq!(allocated.resource_pool, "default");
        assert_eq!(allocated.allocations.len(), 1);
        assert_eq!(allocated.allocations[0].summary().devices.len(), 2);

        allocated.start(&serde_json::json!({"entrypoint": "train.py"})).unwrap();
        assert!(matches!(
            agent_rx.try_recv(),
            Ok(AgentCommand::StartTaskContainer { .. })
        ));

        let summary = ask(&mut pool, |reply_to| PoolMessage::GetResourceSummary { reply_to });
        assert_eq!(summary.num_total_slots, 4);
        assert_eq!(summary.num_active_slots, 2);
    }

    #[test]
    fn test_no_pass_without_changes() {
        let mut pool = fair_share_pool();
        add_agent(&mut pool, "agent1", 0);
        let mut events = allocate(&mut pool, request("task1", 1));
        pool.tick().unwrap();
        assert!(events.try_recv().is_err());
        assert!(!pool.is_dirty());

        // Capacity that appears without a message does not trigger a pass
        pool.agents
            .get_mut(&AgentId::from("agent1"))
            .unwrap()
            .add_device(Device::gpu(0), None);
        pool.tick().unwrap();
        ask(&mut pool, |reply_to| PoolMessage::GetJobQueue { reply_to });
        pool.tick().unwrap();
        assert!(events.try_recv().is_err());

        pool.handle(PoolMessage::SetGroupWeight {
            handle: GroupHandle::new(),
            weight: 1.0,
        })
        .unwrap();
        assert!(pool.is_dirty());
        pool.tick().unwrap();
        expect_allocated(&mut events);
    }

    #[test]
    fn test_read_only_messages_leave_pool_clean() {
        let mut pool = fair_share_pool();
        add_agent(&mut pool, "agent1", 2);
        let _events = allocate(&mut pool, request("task1", 1));
        pool.tick().unwrap();
        assert!(!pool.is_dirty());

        let summaries = ask(&mut pool, |reply_to| PoolMessage::GetTaskSummaries { reply_to });
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].resources.len(), 1);
        assert_eq!(summaries[0].priority, None);

        ask(&mut pool, |reply_to| PoolMessage::GetTaskSummary {
            id: AllocationId::from("task1"),
            reply_to,
        })
        .unwrap();
        ask(&mut pool, |reply_to| PoolMessage::GetResourceSummary { reply_to });
        ask(&mut pool, |reply_to| PoolMessage::GetJobQueue { reply_to });
        ask(&mut pool, |reply_to| PoolMessage::GetJobQueueStats { reply_to });
        ask(&mut pool, |reply_to| PoolMessage::ValidateCommandResources {
            slots: 1,
            reply_to,
        });
        ask(&mut pool, |reply_to| PoolMessage::GetSchedulingState { reply_to });
        assert!(!pool.is_dirty());
    }

    #[test]
    fn test_release_flow() {
        let config = SchedulerConfig {
            scheduler_type: SchedulerType::Priority,
            priority: PrioritySchedulerConfig {
                preemption: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut pool = ResourcePool::new(pool_config(None), &config).unwrap();
        add_agent(&mut pool, "agent1", 1);

        let low_group = GroupHandle::new();
        let mut low_req = request("low", 1);
        low_req.group = Some(low_group);
        pool.handle(PoolMessage::SetGroupPriority {
            handle: low_group,
            priority: 50,
        })
        .unwrap();
        let low_handle = low_req.handle;
        let mut low = allocate(&mut pool, low_req);
        pool.tick().unwrap();
        expect_allocated(&mut low);

        let high_group = GroupHandle::new();
        let mut high_req = request("high", 1);
        high_req.group = Some(high_group);
        pool.handle(PoolMessage::SetGroupPriority {
            handle: high_group,
            priority: 10,
        })
        .unwrap();
        let mut high = allocate(&mut pool, high_req);
        pool.tick().unwrap();

        assert!(matches!(
            low.try_recv(),
            Ok(TaskEvent::ReleaseResources { handle }) if handle == low_handle
        ));
        assert!(high.try_recv().is_err());

        // Nothing changes in the registry until the task reports back
        let state = ask(&mut pool, |reply_to| PoolMessage::GetSchedulingState { reply_to });
        assert_eq!(state.allocated_tasks, 1);

        pool.handle(PoolMessage::ResourcesReleased { handle: low_handle })
            .unwrap();
        pool.tick().unwrap();
        expect_allocated(&mut high);

        let summary = ask(&mut pool, |reply_to| PoolMessage::GetTaskSummary {
            id: AllocationId::from("high"),
            reply_to,
        })
        .unwrap();
        assert_eq!(summary.priority, Some(10));
    }

    fn job_request(id: &str, submitted: chrono::DateTime<chrono::Utc>) -> AllocateRequest {
        let mut req = request(id, 1);
        req.group = Some(GroupHandle::new());
        req.job = Some(JobInfo {
            job_id: JobId::from(id),
            submission_time: submitted,
        });
        req
    }

    #[test]
    fn test_move_job_reorders_priority_pool() {
        let config = SchedulerConfig {
            scheduler_type: SchedulerType::Priority,
            ..Default::default()
        };
        let mut pool = ResourcePool::new(pool_config(None), &config).unwrap();
        add_agent(&mut pool, "agent1", 1);

        let now = chrono::Utc::now();
        let first = job_request("first", now - chrono::Duration::minutes(10));
        let second = job_request("second", now);
        let (first_group, second_group) = (first.group_handle(), second.group_handle());
        let mut first_events = allocate(&mut pool, first);
        let mut second_events = allocate(&mut pool, second);

        let moved = ask(&mut pool, |reply_to| PoolMessage::MoveJob {
            handle: second_group,
            anchor: first_group,
            ahead: true,
            reply_to,
        });
        assert!(moved.is_ok());

        let queue = ask(&mut pool, |reply_to| PoolMessage::GetJobQueue { reply_to });
        assert_eq!(queue[&JobId::from("second")].jobs_ahead, 0);
        assert_eq!(queue[&JobId::from("first")].jobs_ahead, 1);

        pool.tick().unwrap();
        expect_allocated(&mut second_events);
        assert!(first_events.try_recv().is_err());

        // A recovered position puts the job back at the end
        pool.handle(PoolMessage::RecoverJobPosition {
            handle: second_group,
            position: (now + chrono::Duration::hours(1)).timestamp() as f64,
        })
        .unwrap();
        let queue = ask(&mut pool, |reply_to| PoolMessage::GetJobQueue { reply_to });
        assert_eq!(queue[&JobId::from("first")].jobs_ahead, 0);

        let moved = ask(&mut pool, |reply_to| PoolMessage::MoveJob {
            handle: second_group,
            anchor: GroupHandle::new(),
            ahead: true,
            reply_to,
        });
        assert!(matches!(moved, Err(SchedError::GroupNotFound(_))));
    }

    #[test]
    fn test_move_job_unsupported_in_fair_share_pool() {
        let mut pool = fair_share_pool();
        let first = job_request("first", chrono::Utc::now());
        let second = job_request("second", chrono::Utc::now());
        let (first_group, second_group) = (first.group_handle(), second.group_handle());
        let _first = allocate(&mut pool, first);
        let _second = allocate(&mut pool, second);

        let moved = ask(&mut pool, |reply_to| PoolMessage::MoveJob {
            handle: second_group,
            anchor: first_group,
            ahead: true,
            reply_to,
        });
        assert!(matches!(moved, Err(SchedError::Unsupported(_))));
    }

    #[test]
    fn test_scaling_sent_only_on_change() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut pool = ResourcePool::new(pool_config(Some(4)), &SchedulerConfig::default())
            .unwrap()
            .with_scaling(tx);

        // 6 slots is neither within nor a multiple of one instance
        let _task1 = allocate(&mut pool, request("task1", 6));
        pool.tick().unwrap();
        assert!(rx.try_recv().is_err());

        let _task2 = allocate(&mut pool, request("task2", 8));
        pool.tick().unwrap();
        let update = rx.try_recv().unwrap();
        assert_eq!(update.resource_pool, "default");
        assert_eq!(update.info.desired_new_instances, 2);

        pool.handle(PoolMessage::SetGroupWeight {
            handle: GroupHandle::new(),
            weight: 2.0,
        })
        .unwrap();
        pool.tick().unwrap();
        assert!(rx.try_recv().is_err());

        add_agent(&mut pool, "agent1", 4);
        pool.tick().unwrap();
        let update = rx.try_recv().unwrap();
        assert_eq!(update.info.agents.len(), 1);
    }

    #[test]
    fn test_job_queue_feed_follows_passes() {
        let mut pool = fair_share_pool();
        let mut feed = pool.job_queue_feed();
        add_agent(&mut pool, "agent1", 1);

        let mut req = request("task1", 1);
        req.job = Some(JobInfo {
            job_id: JobId::from("job1"),
            submission_time: chrono::Utc::now(),
        });
        let _events = allocate(&mut pool, req);
        assert!(!feed.has_changed().unwrap());

        pool.tick().unwrap();
        assert!(feed.has_changed().unwrap());
        let queue = feed.borrow_and_update().clone();
        assert_eq!(queue[&JobId::from("job1")].state, JobState::Scheduled);
        assert_eq!(queue[&JobId::from("job1")].jobs_ahead, -1);
    }

    #[test]
    fn test_unknown_agent_is_fatal() {
        let mut pool = fair_share_pool();
        let err = pool
            .handle(PoolMessage::RemoveAgent {
                agent_id: AgentId::from("missing"),
            })
            .unwrap_err();
        assert!(err.is_fatal());

        add_agent(&mut pool, "agent1", 1);
        let err = pool
            .handle(PoolMessage::FreeDevice {
                agent_id: AgentId::from("agent1"),
                device_id: 0,
                container_id: ContainerId::new(),
            })
            .unwrap_err();
        assert!(matches!(err, SchedError::Invariant(_)));
    }

    #[test]
    fn test_removed_agent_fails_its_tasks() {
        let mut pool = fair_share_pool();
        add_agent(&mut pool, "agent1", 1);
        add_agent(&mut pool, "agent2", 1);
        let mut failed = allocate(&mut pool, request("task1", 1));
        let mut kept = allocate(&mut pool, request("task2", 1));
        pool.tick().unwrap();
        let on_agent1 = expect_allocated(&mut failed).allocations[0].summary().agent_id
            == AgentId::from("agent1");
        expect_allocated(&mut kept);
        let (gone, survivor) = if on_agent1 {
            (&mut failed, &mut kept)
        } else {
            (&mut kept, &mut failed)
        };

        pool.handle(PoolMessage::RemoveAgent {
            agent_id: AgentId::from("agent1"),
        })
        .unwrap();
        assert!(matches!(
            gone.try_recv(),
            Ok(TaskEvent::AgentFailed { agent_id, .. }) if agent_id == AgentId::from("agent1")
        ));
        assert!(survivor.try_recv().is_err());
        pool.tick().unwrap();

        let state = ask(&mut pool, |reply_to| PoolMessage::GetSchedulingState { reply_to });
        assert_eq!(state.agents, 1);
        assert_eq!(state.allocated_tasks, 1);
        assert_eq!(state.pending_tasks, 0);
        let summaries = ask(&mut pool, |reply_to| PoolMessage::GetTaskSummaries { reply_to });
        assert!(summaries
            .iter()
            .all(|s| s.resources.iter().all(|c| c.agent_id == AgentId::from("agent2"))));
    }

    #[test]
    fn test_failed_commit_keeps_pool_dirty() {
        let mut pool = fair_share_pool();
        let _agent_rx = add_agent(&mut pool, "agent1", 1);
        let mut events = allocate(&mut pool, request("task1", 1));

        let commands = pool.agent_commands.remove(&AgentId::from("agent1")).unwrap();
        assert!(pool.tick().is_err());
        assert!(pool.is_dirty());
        assert!(events.try_recv().is_err());
        let summary = ask(&mut pool, |reply_to| PoolMessage::GetResourceSummary { reply_to });
        assert_eq!(summary.num_active_slots, 0);

        pool.agent_commands.insert(AgentId::from("agent1"), commands);
        pool.tick().unwrap();
        expect_allocated(&mut events);
    }

    #[test]
    fn test_disable_without_drain_evicts_tasks() {
        let mut pool = fair_share_pool();
        add_agent(&mut pool, "agent1", 2);
        let mut events = allocate(&mut pool, request("task1", 1));
        pool.tick().unwrap();
        expect_allocated(&mut events);

        pool.handle(PoolMessage::DisableAgent {
            agent_id: AgentId::from("agent1"),
            drain: true,
        })
        .unwrap();
        assert!(events.try_recv().is_err());

        pool.handle(PoolMessage::DisableAgent {
            agent_id: AgentId::from("agent1"),
            drain: false,
        })
        .unwrap();
        assert!(matches!(
            events.try_recv(),
            Ok(TaskEvent::ReleaseResources { .. })
        ));
    }

    #[test]
    fn test_restore_resources() {
        let mut pool = fair_share_pool();
        add_agent(&mut pool, "agent1", 0);
        let container_id = ContainerId::new();
        let (events, mut rx) = mpsc::unbounded_channel();

        let result = ask(&mut pool, |reply_to| PoolMessage::RestoreResources {
            request: request("running", 2),
            events,
            containers: vec![ContainerSummary {
                agent_id: AgentId::from("agent1"),
                container_id,
                devices: vec![Device::gpu(0), Device::gpu(1)],
            }],
            reply_to,
        });
        assert!(result.is_ok());

        let allocated = expect_allocated(&mut rx);
        assert_eq!(allocated.allocations[0].container_id(), container_id);
        let summary = ask(&mut pool, |reply_to| PoolMessage::GetResourceSummary { reply_to });
        assert_eq!(summary.num_active_slots, 2);

        let (events, _rx) = mpsc::unbounded_channel();
        let result = ask(&mut pool, |reply_to| PoolMessage::RestoreResources {
            request: request("elsewhere", 1),
            events,
            containers: vec![ContainerSummary {
                agent_id: AgentId::from("missing"),
                container_id: ContainerId::new(),
                devices: vec![Device::gpu(0)],
            }],
            reply_to,
        });
        assert!(matches!(result, Err(SchedError::AgentNotFound(_))));
    }

    #[test]
    fn test_validate_command_resources() {
        let mut pool = ResourcePool::new(pool_config(Some(8)), &SchedulerConfig::default()).unwrap();
        let fits = |pool: &mut ResourcePool, slots| {
            ask(pool, |reply_to| PoolMessage::ValidateCommandResources { slots, reply_to })
                .fulfillable
        };
        assert!(fits(&mut pool, 8));
        assert!(!fits(&mut pool, 9));

        let mut pool = fair_share_pool();
        assert!(fits(&mut pool, 1000));
    }
}
