//! Pool message loop and the handle used to talk to it
//!
//! Every pool runs as one task that consumes its bounded inbox one message
//! at a time and runs a scheduling pass on a fixed interval. Nothing inside
//! a pool is shared; callers only hold a [`PoolHandle`].

use crate::allocation::TaskEvent;
use crate::messages::PoolMessage;
use slotsched_core::{
    AllocateRequest, AllocationId, ContainerSummary, GroupHandle, JobQueue, QueueStats,
    ResourceSummary, SchedError, SchedResult, SchedulingState, TaskHandle, TaskSummary,
    ValidateCommandResourcesResponse,
};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// How long an ask waits for the pool's reply
pub const DEFAULT_ASK_TIMEOUT: Duration = Duration::from_secs(5);

/// Behavior of a pool driven by [`spawn_pool`]
pub trait PoolActor: Send + 'static {
    fn name(&self) -> &str;

    /// Handle one inbox message
    fn handle(&mut self, msg: PoolMessage) -> SchedResult<()>;

    /// Periodic scheduling tick; a no-op unless something changed
    fn tick(&mut self) -> SchedResult<()>;
}

/// Start a pool loop on the current runtime
pub fn spawn_pool<A: PoolActor>(
    actor: A,
    tick_interval: Duration,
    inbox_capacity: usize,
    shutdown: watch::Receiver<bool>,
) -> (PoolHandle, JoinHandle<SchedResult<()>>) {
    let (tx, rx) = mpsc::channel(inbox_capacity.max(1));
    let handle = PoolHandle {
        name: actor.name().to_string(),
        tx,
        ask_timeout: DEFAULT_ASK_TIMEOUT,
    };
    let join = tokio::spawn(run_pool(actor, rx, tick_interval, shutdown));
    (handle, join)
}

async fn run_pool<A: PoolActor>(
    mut actor: A,
    mut rx: mpsc::Receiver<PoolMessage>,
    tick_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> SchedResult<()> {
    info!(
        pool = %actor.name(),
        tick_interval_ms = tick_interval.as_millis() as u64,
        "Starting resource pool"
    );

    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First pass one interval after start
    ticker.tick().await;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(pool = %actor.name(), "Resource pool shutting down");
                    return Ok(());
                }
            }
            msg = rx.recv() => {
                let Some(msg) = msg else {
                    info!(pool = %actor.name(), "All pool handles dropped, stopping");
                    return Ok(());
                };
                let kind = msg.kind();
                if let Err(e) = actor.handle(msg) {
                    check_error(actor.name(), kind, e)?;
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = actor.tick() {
                    check_error(actor.name(), "tick", e)?;
                }
            }
        }
    }
}

/// Stop the loop on fatal errors, log the rest
fn check_error(pool: &str, during: &str, e: SchedError) -> SchedResult<()> {
    if e.is_fatal() {
        error!(pool = %pool, during, error = %e, "Resource pool stopped on fatal error");
        return Err(e);
    }
    warn!(pool = %pool, during, error = %e, "Failed to handle pool message");
    Ok(())
}

/// Cloneable sender side of a pool loop
#[derive(Debug, Clone)]
pub struct PoolHandle {
    name: String,
    tx: mpsc::Sender<PoolMessage>,
    ask_timeout: Duration,
}

impl PoolHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Use a different deadline for asks
    pub fn with_ask_timeout(mut self, ask_timeout: Duration) -> Self {
        self.ask_timeout = ask_timeout;
        self
    }

    /// Fire-and-forget send; waits only for inbox space
    pub async fn send(&self, msg: PoolMessage) -> SchedResult<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| SchedError::PoolStopped(self.name.clone()))
    }

    /// Send without waiting; fails when the inbox is full
    pub fn try_send(&self, msg: PoolMessage) -> SchedResult<()> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(msg) => {
                SchedError::Internal(format!("inbox of pool {} is full ({:?})", self.name, msg))
            }
            mpsc::error::TrySendError::Closed(_) => SchedError::PoolStopped(self.name.clone()),
        })
    }

    /// Send a message carrying a reply slot and wait for the answer
    pub async fn ask<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> PoolMessage,
    ) -> SchedResult<T> {
        let (reply_to, reply) = oneshot::channel();
        let msg = make(reply_to);
        let kind = msg.kind();
        self.send(msg).await?;

        match tokio::time::timeout(self.ask_timeout, reply).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(SchedError::PoolStopped(self.name.clone())),
            Err(_) => {
                debug!(pool = %self.name, ask = kind, "Ask timed out");
                Err(SchedError::Timeout(format!("{} reply from pool {}", kind, self.name)))
            }
        }
    }

    /// Register a request; allocation and release events arrive on the
    /// returned receiver
    pub async fn allocate(
        &self,
        request: AllocateRequest,
    ) -> SchedResult<mpsc::UnboundedReceiver<TaskEvent>> {
        let (events, rx) = mpsc::unbounded_channel();
        self.send(PoolMessage::Allocate { request, events }).await?;
        Ok(rx)
    }

    pub async fn resources_released(&self, handle: TaskHandle) -> SchedResult<()> {
        self.send(PoolMessage::ResourcesReleased { handle }).await
    }

    pub async fn set_group_weight(&self, handle: GroupHandle, weight: f64) -> SchedResult<()> {
        self.send(PoolMessage::SetGroupWeight { handle, weight }).await
    }

    pub async fn set_group_max_slots(
        &self,
        handle: GroupHandle,
        max_slots: Option<usize>,
    ) -> SchedResult<()> {
        self.send(PoolMessage::SetGroupMaxSlots { handle, max_slots })
            .await
    }

    pub async fn set_group_priority(&self, handle: GroupHandle, priority: i32) -> SchedResult<()> {
        self.send(PoolMessage::SetGroupPriority { handle, priority })
            .await
    }

    pub async fn task_running(&self, handle: TaskHandle) -> SchedResult<()> {
        self.send(PoolMessage::TaskRunning { handle }).await
    }

    /// Move `handle`'s job directly ahead of or behind `anchor`'s job
    pub async fn move_job(
        &self,
        handle: GroupHandle,
        anchor: GroupHandle,
        ahead: bool,
    ) -> SchedResult<()> {
        self.ask(|reply_to| PoolMessage::MoveJob {
            handle,
            anchor,
            ahead,
            reply_to,
        })
        .await?
    }

    pub async fn recover_job_position(&self, handle: GroupHandle, position: f64) -> SchedResult<()> {
        self.send(PoolMessage::RecoverJobPosition { handle, position })
            .await
    }

    pub async fn restore_resources(
        &self,
        request: AllocateRequest,
        containers: Vec<ContainerSummary>,
    ) -> SchedResult<mpsc::UnboundedReceiver<TaskEvent>> {
        let (events, rx) = mpsc::unbounded_channel();
        self.ask(|reply_to| PoolMessage::RestoreResources {
            request,
            events,
            containers,
            reply_to,
        })
        .await??;
        Ok(rx)
    }

    pub async fn task_summary(&self, id: AllocationId) -> SchedResult<Option<TaskSummary>> {
        self.ask(|reply_to| PoolMessage::GetTaskSummary { id, reply_to })
            .await
    }

    pub async fn task_summaries(&self) -> SchedResult<Vec<TaskSummary>> {
        self.ask(|reply_to| PoolMessage::GetTaskSummaries { reply_to })
            .await
    }

    pub async fn resource_summary(&self) -> SchedResult<ResourceSummary> {
        self.ask(|reply_to| PoolMessage::GetResourceSummary { reply_to })
            .await
    }

    pub async fn job_queue(&self) -> SchedResult<JobQueue> {
        self.ask(|reply_to| PoolMessage::GetJobQueue { reply_to })
            .await
    }

    pub async fn job_queue_stats(&self) -> SchedResult<QueueStats> {
        self.ask(|reply_to| PoolMessage::GetJobQueueStats { reply_to })
            .await
    }

    pub async fn validate_command_resources(
        &self,
        slots: usize,
    ) -> SchedResult<ValidateCommandResourcesResponse> {
        self.ask(|reply_to| PoolMessage::ValidateCommandResources { slots, reply_to })
            .await
    }

    pub async fn scheduling_state(&self) -> SchedResult<SchedulingState> {
        self.ask(|reply_to| PoolMessage::GetSchedulingState { reply_to })
            .await
    }
}
