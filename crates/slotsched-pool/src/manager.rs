//! Resource manager: one loop per configured pool, routed by pool name

use crate::allocation::{PodCommand, ScalingUpdate, TaskEvent};
use crate::kubernetes_pool::KubernetesPool;
use crate::resource_pool::ResourcePool;
use crate::runtime::{spawn_pool, PoolHandle};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use slotsched_core::{
    AllocateRequest, AllocationId, DaemonConfig, JobQueue, SchedError, SchedResult, SchedulerType,
    TaskSummary,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Static description of a running pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolInfo {
    pub name: String,
    pub description: String,
    pub scheduler_type: SchedulerType,
    pub is_default: bool,
}

struct PoolEntry {
    info: PoolInfo,
    handle: PoolHandle,
    job_queue: watch::Receiver<JobQueue>,
}

/// Routes requests to the pool they name.
///
/// Cheap to clone; every clone talks to the same pool loops.
#[derive(Clone)]
pub struct ResourceManager {
    default_pool: String,
    pools: Arc<BTreeMap<String, PoolEntry>>,
}

/// Owns the pool loops and the channels leaving them
pub struct PoolSupervisor {
    shutdown: watch::Sender<bool>,
    joins: Vec<(String, JoinHandle<SchedResult<()>>)>,
    pod_commands: BTreeMap<String, mpsc::UnboundedReceiver<PodCommand>>,
    scaling: Option<mpsc::UnboundedReceiver<ScalingUpdate>>,
}

impl ResourceManager {
    /// Spawn one loop per configured pool on the current runtime
    pub fn start(config: &DaemonConfig) -> SchedResult<(Self, PoolSupervisor)> {
        config.validate()?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (scaling_tx, scaling_rx) = mpsc::unbounded_channel();
        let mut pools = BTreeMap::new();
        let mut joins = Vec::new();
        let mut pod_commands = BTreeMap::new();

        for pool_config in &config.resource_pools {
            let scheduler = config.scheduler_for(pool_config);
            let name = pool_config.pool_name.clone();

            let (handle, join, job_queue) = if scheduler.scheduler_type == SchedulerType::Kubernetes {
                let (pods_tx, pods_rx) = mpsc::unbounded_channel();
                let pool = KubernetesPool::new(pool_config, scheduler, pods_tx)?;
                let job_queue = pool.job_queue_feed();
                pod_commands.insert(name.clone(), pods_rx);
                let (handle, join) = spawn_pool(
                    pool,
                    scheduler.tick_interval(),
                    pool_config.inbox_capacity,
                    shutdown_rx.clone(),
                );
                (handle, join, job_queue)
            } else {
                let mut pool = ResourcePool::new(pool_config.clone(), scheduler)?;
                if pool_config.slots_per_instance.is_some() {
                    pool = pool.with_scaling(scaling_tx.clone());
                }
                let job_queue = pool.job_queue_feed();
                let (handle, join) = spawn_pool(
                    pool,
                    scheduler.tick_interval(),
                    pool_config.inbox_capacity,
                    shutdown_rx.clone(),
                );
                (handle, join, job_queue)
            };

            info!(
                pool = %name,
                scheduler = %scheduler.scheduler_type,
                fitting_policy = ?scheduler.fitting_policy,
                "Started resource pool"
            );
            joins.push((name.clone(), join));
            pools.insert(
                name.clone(),
                PoolEntry {
                    info: PoolInfo {
                        is_default: name == config.default_resource_pool,
                        name: name.clone(),
                        description: pool_config.description.clone(),
                        scheduler_type: scheduler.scheduler_type,
                    },
                    handle,
                    job_queue,
                },
            );
        }

        let manager = Self {
            default_pool: config.default_resource_pool.clone(),
            pools: Arc::new(pools),
        };
        let supervisor = PoolSupervisor {
            shutdown,
            joins,
            pod_commands,
            scaling: Some(scaling_rx),
        };
        Ok((manager, supervisor))
    }

    pub fn default_pool(&self) -> &str {
        &self.default_pool
    }

    pub fn pools(&self) -> Vec<PoolInfo> {
        self.pools.values().map(|p| p.info.clone()).collect()
    }

    fn entry(&self, name: &str) -> SchedResult<&PoolEntry> {
        let name = if name.is_empty() { self.default_pool.as_str() } else { name };
        self.pools
            .get(name)
            .ok_or_else(|| SchedError::PoolNotFound(name.to_string()))
    }

    /// Handle of the named pool; an empty name selects the default pool
    pub fn pool(&self, name: &str) -> SchedResult<&PoolHandle> {
        self.entry(name).map(|p| &p.handle)
    }

    /// Route a request to the pool it names
    pub async fn allocate(
        &self,
        request: AllocateRequest,
    ) -> SchedResult<mpsc::UnboundedReceiver<TaskEvent>> {
        self.pool(&request.resource_pool)?.allocate(request).await
    }

    /// Latest published job queue of a pool
    pub fn job_queue_feed(&self, name: &str) -> SchedResult<watch::Receiver<JobQueue>> {
        self.entry(name).map(|p| p.job_queue.clone())
    }

    /// Summaries of every task across all pools, grouped by pool
    pub async fn task_summaries(&self) -> SchedResult<Vec<TaskSummary>> {
        let results = join_all(self.pools.values().map(|p| p.handle.task_summaries())).await;
        let mut summaries = Vec::new();
        for result in results {
            summaries.extend(result?);
        }
        Ok(summaries)
    }

    /// Find a task in whichever pool holds it
    pub async fn task_summary(&self, id: &AllocationId) -> SchedResult<TaskSummary> {
        let results = join_all(
            self.pools
                .values()
                .map(|p| p.handle.task_summary(id.clone())),
        )
        .await;
        for result in results {
            if let Some(summary) = result? {
                return Ok(summary);
            }
        }
        Err(SchedError::TaskNotFound(id.to_string()))
    }
}

impl PoolSupervisor {
    /// Commands for the pod manager of a Kubernetes pool; taken once
    pub fn take_pod_commands(&mut self, pool: &str) -> Option<mpsc::UnboundedReceiver<PodCommand>> {
        self.pod_commands.remove(pool)
    }

    /// Scaling signals of every autoscaling pool; taken once
    pub fn take_scaling_updates(&mut self) -> Option<mpsc::UnboundedReceiver<ScalingUpdate>> {
        self.scaling.take()
    }

    /// Signal every pool to stop and wait for their loops.
    ///
    /// Returns the first error a pool stopped with.
    pub async fn shutdown(self) -> SchedResult<()> {
        info!(pools = self.joins.len(), "Stopping resource pools");
        let _ = self.shutdown.send(true);

        let mut first_error = None;
        for (name, join) in self.joins {
            let result = join
                .await
                .map_err(|e| SchedError::Internal(format!("pool {} panicked: {}", name, e)))
                .and_then(|r| r);
            if let Err(e) = result {
                error!(pool = %name, error = %e, "Resource pool failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::PoolMessage;
    use slotsched_core::{
        AgentId, Device, ResourcePoolConfig, SchedulerConfig, TaskHandle,
    };

    fn config() -> DaemonConfig {
        DaemonConfig {
            resource_pools: vec![
                ResourcePoolConfig {
                    pool_name: "default".to_string(),
                    slots_per_instance: Some(4),
                    ..Default::default()
                },
                ResourcePoolConfig {
                    pool_name: "k8s".to_string(),
                    max_slots_per_pod: Some(4),
                    scheduler: Some(SchedulerConfig {
                        scheduler_type: SchedulerType::Kubernetes,
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_routing_by_pool_name() {
        let (manager, mut supervisor) = ResourceManager::start(&config()).unwrap();
        assert_eq!(manager.pools().len(), 2);
        assert!(manager.pools().iter().any(|p| p.name == "default" && p.is_default));
        assert_eq!(manager.pool("").unwrap().name(), "default");
        assert_eq!(manager.pool("k8s").unwrap().name(), "k8s");
        assert!(matches!(
            manager.pool("missing"),
            Err(SchedError::PoolNotFound(_))
        ));
        assert!(supervisor.take_pod_commands("k8s").is_some());
        assert!(supervisor.take_pod_commands("default").is_none());

        let mut request = AllocateRequest::new(TaskHandle::new(), 4);
        request.resource_pool = "k8s".to_string();
        let mut events = manager.allocate(request).await.unwrap();
        assert!(matches!(
            events.recv().await,
            Some(TaskEvent::ResourcesAllocated(allocated)) if allocated.resource_pool == "k8s"
        ));

        let summaries = manager.task_summaries().await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].scheduler_type, SchedulerType::Kubernetes);
        let found = manager.task_summary(&summaries[0].id).await.unwrap();
        assert_eq!(found.resource_pool, "k8s");
        assert!(matches!(
            manager.task_summary(&AllocationId::from("missing")).await,
            Err(SchedError::TaskNotFound(_))
        ));

        supervisor.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_allocation_through_default_pool() {
        let (manager, mut supervisor) = ResourceManager::start(&config()).unwrap();
        let mut scaling = supervisor.take_scaling_updates().unwrap();
        let pool = manager.pool("default").unwrap();

        let (agent_tx, _agent_rx) = mpsc::unbounded_channel();
        pool.send(PoolMessage::AddAgent {
            agent_id: AgentId::from("agent1"),
            label: String::new(),
            commands: agent_tx,
        })
        .await
        .unwrap();
        for i in 0..2 {
            pool.send(PoolMessage::AddDevice {
                agent_id: AgentId::from("agent1"),
                device: Device::gpu(i),
                container_id: None,
            })
            .await
            .unwrap();
        }

        let request = AllocateRequest::new(TaskHandle::new(), 2);
        let mut events = manager.allocate(request).await.unwrap();
        assert!(matches!(
            events.recv().await,
            Some(TaskEvent::ResourcesAllocated(_))
        ));

        let update = scaling.recv().await.unwrap();
        assert_eq!(update.resource_pool, "default");
        assert!(!update.info.agents["agent1"].is_idle);

        let state = pool.scheduling_state().await.unwrap();
        assert_eq!(state.allocated_tasks, 1);
        assert_eq!(state.agents, 1);

        supervisor.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_pool_error_reaches_supervisor() {
        let (manager, supervisor) = ResourceManager::start(&config()).unwrap();
        manager
            .pool("default")
            .unwrap()
            .send(PoolMessage::RemoveAgent {
                agent_id: AgentId::from("missing"),
            })
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert!(matches!(
            supervisor.shutdown().await,
            Err(SchedError::AgentNotFound(_))
        ));
    }

    #[test]
    fn test_start_rejects_invalid_config() {
        let config = DaemonConfig {
            resource_pools: Vec::new(),
            ..Default::default()
        };
        assert!(ResourceManager::start(&config).is_err());
    }
}
