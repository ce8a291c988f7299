//! Copy-on-write agent views for a scheduling pass

use crate::agent_state::{AgentMap, AgentState};
use crate::fitting::Fit;
use crate::task_list::TaskAllocation;
use slotsched_core::{AgentId, ContainerId, SchedError, SchedResult};
use std::collections::BTreeMap;
use tracing::debug;

/// Read access to a set of agents in address order
pub trait AgentView {
    fn agent(&self, id: &AgentId) -> Option<&AgentState>;

    fn agents(&self) -> Box<dyn Iterator<Item = &AgentState> + '_>;
}

impl AgentView for AgentMap {
    fn agent(&self, id: &AgentId) -> Option<&AgentState> {
        self.get(id)
    }

    fn agents(&self) -> Box<dyn Iterator<Item = &AgentState> + '_> {
        Box::new(self.values())
    }
}

/// Reservations made during one pass, layered over another view.
///
/// An agent is cloned on its first modification; untouched agents are read
/// straight from the base. Overlays nest: a nested overlay over this one
/// starts from the agents already cloned here.
pub struct AgentOverlay<'a> {
    base: &'a dyn AgentView,
    touched: BTreeMap<AgentId, AgentState>,
}

impl<'a> AgentOverlay<'a> {
    pub fn new(base: &'a dyn AgentView) -> Self {
        Self {
            base,
            touched: BTreeMap::new(),
        }
    }

    fn agent_mut(&mut self, id: &AgentId) -> SchedResult<&mut AgentState> {
        if !self.touched.contains_key(id) {
            let agent = self
                .base
                .agent(id)
                .ok_or_else(|| SchedError::AgentNotFound(id.to_string()))?
                .clone();
            self.touched.insert(id.clone(), agent);
        }
        self.touched
            .get_mut(id)
            .ok_or_else(|| SchedError::AgentNotFound(id.to_string()))
    }

    /// Reserve devices for each fit under fresh container ids
    pub fn reserve(&mut self, fits: &[Fit]) -> SchedResult<()> {
        for fit in fits {
            self.agent_mut(&fit.agent_id)?
                .allocate_free_devices(fit.slots, ContainerId::new())?;
        }
        Ok(())
    }

    /// Give back a task's containers as if it had been released
    pub fn release(&mut self, allocation: &TaskAllocation) {
        for container in &allocation.containers {
            match self.agent_mut(&container.agent_id) {
                Ok(agent) => agent.deallocate_container(&container.container_id),
                Err(_) => debug!(
                    agent = %container.agent_id,
                    container = %container.container_id,
                    "Skipping release on disconnected agent"
                ),
            }
        }
    }

    /// Number of agents cloned so far
    pub fn touched(&self) -> usize {
        self.touched.len()
    }

    /// Take the modified agents, e.g. to apply them to an outer overlay
    pub fn into_changes(self) -> BTreeMap<AgentId, AgentState> {
        self.touched
    }

    /// Adopt the changes of a nested overlay
    pub fn apply(&mut self, changes: BTreeMap<AgentId, AgentState>) {
        self.touched.extend(changes);
    }
}

impl AgentView for AgentOverlay<'_> {
    fn agent(&self, id: &AgentId) -> Option<&AgentState> {
        self.touched.get(id).or_else(|| self.base.agent(id))
    }

    fn agents(&self) -> Box<dyn Iterator<Item = &AgentState> + '_> {
        Box::new(
            self.base
                .agents()
                .map(move |agent| self.touched.get(agent.id()).unwrap_or(agent)),
        )
    }
}
