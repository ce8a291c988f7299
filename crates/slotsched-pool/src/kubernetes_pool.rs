//! Kubernetes-backed resource pool
//!
//! Capacity belongs to the cluster, so the pool keeps no agents. Each tick
//! turns pending requests into pods with the greedy planner and hands the
//! pods to the pod manager.

use crate::allocation::{Allocation, PodCommand, ResourcesAllocated, TaskEvent, KUBERNETES_AGENT};
use crate::messages::PoolMessage;
use crate::runtime::PoolActor;
use crate::state::PoolState;
use slotsched_core::{
    AgentId, AllocateRequest, ContainerId, ContainerSummary, JobQueue, ResourcePoolConfig,
    ResourceSummary, SchedError, SchedResult, SchedulerConfig, SchedulerType, TaskHandle,
    ValidateCommandResourcesResponse,
};
use slotsched_scheduler::{
    job_queue_stats, plan_pods, AllocatedContainer, KubernetesPlanner, PodPlan, TaskAllocation,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub struct KubernetesPool {
    planner: KubernetesPlanner,
    state: PoolState,
    pods: mpsc::UnboundedSender<PodCommand>,
}

impl KubernetesPool {
    pub fn new(
        config: &ResourcePoolConfig,
        scheduler_config: &SchedulerConfig,
        pods: mpsc::UnboundedSender<PodCommand>,
    ) -> SchedResult<Self> {
        if scheduler_config.scheduler_type != SchedulerType::Kubernetes {
            return Err(SchedError::Config(format!(
                "resource pool {} is not configured for kubernetes",
                config.pool_name
            )));
        }
        let max_slots_per_pod = config.max_slots_per_pod.unwrap_or(0);
        if max_slots_per_pod == 0 {
            return Err(SchedError::Config(format!(
                "kubernetes resource pool {} needs max_slots_per_pod",
                config.pool_name
            )));
        }

        Ok(Self {
            planner: KubernetesPlanner::new(max_slots_per_pod),
            state: PoolState::new(
                config.pool_name.clone(),
                SchedulerType::Kubernetes,
                scheduler_config.default_priority(),
            ),
            pods,
        })
    }

    pub fn job_queue_feed(&self) -> watch::Receiver<JobQueue> {
        self.state.job_queue_feed()
    }

    pub fn is_dirty(&self) -> bool {
        self.state.dirty
    }

    fn pods_for(&self, handle: &TaskHandle, containers: &[AllocatedContainer]) -> Vec<Allocation> {
        let allocation_id = self
            .state
            .tasks
            .task_by_handle(handle)
            .map(|r| r.id.clone())
            .unwrap_or_default();
        containers
            .iter()
            .map(|c| Allocation::Kubernetes {
                allocation_id: allocation_id.clone(),
                container_id: c.container_id,
                slots: c.slots,
                pods: self.pods.clone(),
            })
            .collect()
    }

    fn allocate(&mut self, handle: TaskHandle, plan: PodPlan) {
        let containers: Vec<AllocatedContainer> = (0..plan.num_pods)
            .map(|_| AllocatedContainer {
                agent_id: AgentId::from(KUBERNETES_AGENT),
                container_id: ContainerId::new(),
                devices: Vec::new(),
                slots: plan.slots_per_pod,
            })
            .collect();
        let allocations = self.pods_for(&handle, &containers);

        debug!(
            pool = %self.state.name,
            task = %handle,
            num_pods = plan.num_pods,
            slots_per_pod = plan.slots_per_pod,
            "Planned pods"
        );
        // Pods of a departed task were never started, nothing to free
        self.state
            .commit_allocation(handle, containers, false, allocations);
    }

    fn restore_resources(
        &mut self,
        request: AllocateRequest,
        events: mpsc::UnboundedSender<TaskEvent>,
        containers: Vec<ContainerSummary>,
    ) -> SchedResult<()> {
        let slots_needed = request.slots_needed;
        let Some(handle) = self.state.register(request, events) else {
            return Err(SchedError::Invariant("task is already registered".to_string()));
        };

        let slots_per_pod = slots_needed / containers.len().max(1);
        let restored: Vec<AllocatedContainer> = containers
            .into_iter()
            .map(|c| AllocatedContainer {
                agent_id: AgentId::from(KUBERNETES_AGENT),
                container_id: c.container_id,
                devices: Vec::new(),
                slots: slots_per_pod,
            })
            .collect();
        let allocations = self.pods_for(&handle, &restored);
        self.state
            .tasks
            .set_allocations(handle, TaskAllocation::new(restored));

        if let Some(request) = self.state.tasks.task_by_handle(&handle) {
            info!(pool = %self.state.name, task = %request.id, "Restored running pods");
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

    /// Only slot usage is known; the cluster owns the rest
    fn resource_summary(&self) -> ResourceSummary {
        let num_active_slots = self
            .state
            .tasks
            .iter()
            .filter_map(|r| self.state.tasks.allocations(&r.handle))
            .map(|a| a.slots())
            .sum();
        ResourceSummary {
            num_active_slots,
            ..Default::default()
        }
    }
}

impl PoolActor for KubernetesPool {
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
            PoolMessage::ResourcesReleased { handle } => {
                if self.state.unregister(&handle).is_none() {
                    debug!(pool = %self.state.name, task = %handle, "Released task held no pods");
                }
            }
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

            msg @ (PoolMessage::AddAgent { .. }
            | PoolMessage::RemoveAgent { .. }
            | PoolMessage::AddDevice { .. }
            | PoolMessage::RemoveDevice { .. }
            | PoolMessage::FreeDevice { .. }
            | PoolMessage::EnableAgent { .. }
            | PoolMessage::DisableAgent { .. }) => {
                return Err(SchedError::Unsupported(format!(
                    "{} in kubernetes pool {}",
                    msg.kind(),
                    self.state.name
                )));
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
                let _ = reply_to.send(self.resource_summary());
            }
            PoolMessage::GetJobQueue { reply_to } => {
                let _ = reply_to.send(self.planner.job_queue(&self.state.tasks, &self.state.groups));
            }
            PoolMessage::GetJobQueueStats { reply_to } => {
                let _ = reply_to.send(job_queue_stats(&self.state.tasks));
            }
            PoolMessage::ValidateCommandResources { slots, reply_to } => {
                let fulfillable = plan_pods(slots, self.planner.max_slots_per_pod()).is_ok();
                let _ = reply_to.send(ValidateCommandResourcesResponse { fulfillable });
            }
            PoolMessage::GetSchedulingState { reply_to } => {
                let _ = reply_to.send(self.state.scheduling_state(0));
            }
        }
        Ok(())
    }

    fn tick(&mut self) -> SchedResult<()> {
        if !self.state.dirty {
            return Ok(());
        }
        self.state.dirty = false;

        for (handle, plan) in self.planner.plan(&self.state.tasks, &self.state.groups) {
            self.allocate(handle, plan);
        }
        self.state
            .publish_job_queue(self.planner.job_queue(&self.state.tasks, &self.state.groups));
        Ok(())
    }
}
