//! Fitting engine: finds agents for a request
//!
//! A request is first placed on a single shared agent. Requests needing more
//! than one slot may instead take whole idle agents (a dedicated fit), with an
//! equal share per agent or, when allowed, uneven shares (a heterogeneous fit).

use crate::agent_state::AgentState;
use crate::overlay::AgentView;
use slotsched_core::{AgentId, AllocateRequest, AllocationId, FittingPolicy};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::debug;

/// A placement of part (or all) of a request on one agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fit {
    pub agent_id: AgentId,
    pub slots: usize,
}

/// Stateless fitting configuration of a pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Fitter {
    policy: FittingPolicy,
    allow_heterogeneous: bool,
}

struct Candidate<'a> {
    agent: &'a AgentState,
    score: f64,
    distance: u64,
}

impl Fitter {
    pub fn new(policy: FittingPolicy, allow_heterogeneous: bool) -> Self {
        Self {
            policy,
            allow_heterogeneous,
        }
    }

    pub fn policy(&self) -> FittingPolicy {
        self.policy
    }

    /// Find a placement for a request. Empty when nothing fits.
    pub fn find_fits(&self, req: &AllocateRequest, agents: &dyn AgentView) -> Vec<Fit> {
        if let Some(fit) = self.find_shared_fit(req, agents) {
            return vec![fit];
        }
        if req.slots_needed <= 1 || req.fitting_requirements.single_agent {
            return Vec::new();
        }
        self.find_dedicated_fits(req, agents)
    }

    fn find_shared_fit(&self, req: &AllocateRequest, agents: &dyn AgentView) -> Option<Fit> {
        let mut candidates: Vec<Candidate<'_>> = agents
            .agents()
            .filter(|agent| {
                slots_satisfied(req, agent)
                    && max_zero_slot_containers_satisfied(req, agent)
                    && label_satisfied(req, agent)
            })
            .map(|agent| self.candidate(req, agent))
            .collect();

        candidates.sort_by(compare_candidates);
        candidates.first().map(|c| Fit {
            agent_id: c.agent.id().clone(),
            slots: req.slots_needed,
        })
    }

    /// Place a request across whole idle agents
    pub fn find_dedicated_fits(&self, req: &AllocateRequest, agents: &dyn AgentView) -> Vec<Fit> {
        let mut by_capacity: BTreeMap<usize, Vec<Candidate<'_>>> = BTreeMap::new();
        for agent in agents.agents() {
            if !label_satisfied(req, agent) || agent.num_used_slots() != 0 {
                continue;
            }
            let empty = agent.num_empty_slots();
            if empty == 0 {
                continue;
            }
            by_capacity
                .entry(empty)
                .or_default()
                .push(self.candidate(req, agent));
        }

        for (capacity, candidates) in by_capacity.iter_mut().rev() {
            if req.slots_needed % *capacity != 0 {
                continue;
            }
            let needed = req.slots_needed / *capacity;
            if candidates.len() < needed {
                continue;
            }
            candidates.sort_by(compare_candidates);
            return candidates
                .iter()
                .take(needed)
                .map(|c| Fit {
                    agent_id: c.agent.id().clone(),
                    slots: *capacity,
                })
                .collect();
        }

        if !self.allow_heterogeneous {
            return Vec::new();
        }

        let mut candidates: Vec<Candidate<'_>> = by_capacity.into_values().flatten().collect();
        candidates.sort_by(|a, b| {
            b.agent
                .num_empty_slots()
                .cmp(&a.agent.num_empty_slots())
                .then_with(|| compare_candidates(a, b))
        });

        let mut remaining = req.slots_needed;
        let mut fits = Vec::new();
        for candidate in &candidates {
            let empty = candidate.agent.num_empty_slots();
            if empty > remaining {
                continue;
            }
            fits.push(Fit {
                agent_id: candidate.agent.id().clone(),
                slots: empty,
            });
            remaining -= empty;
            if remaining == 0 {
                break;
            }
        }

        if remaining != 0 {
            debug!(
                task = %req.id,
                slots = req.slots_needed,
                "No heterogeneous fit found"
            );
            return Vec::new();
        }
        fits
    }

    /// Soft-constraint score of an agent for a request, in [0, 1]
    pub fn score(&self, req: &AllocateRequest, agent: &AgentState) -> f64 {
        match self.policy {
            FittingPolicy::Best => best_fit(req, agent),
            FittingPolicy::Worst => worst_fit(req, agent),
        }
    }

    fn candidate<'a>(&self, req: &AllocateRequest, agent: &'a AgentState) -> Candidate<'a> {
        Candidate {
            agent,
            score: self.score(req, agent),
            distance: hash_distance(&req.id, agent.id()),
        }
    }
}

/// Highest score first, then smallest hash distance, then agent address
fn compare_candidates(a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.distance.cmp(&b.distance))
        .then_with(|| a.agent.id().cmp(b.agent.id()))
}

/// Pseudo-random but stable distance between a request and an agent
pub fn hash_distance(request: &AllocationId, agent: &AgentId) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(request.as_str().as_bytes());
    hasher.update(&[0]);
    hasher.update(agent.as_str().as_bytes());
    let hash = hasher.finalize();

    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}

fn slots_satisfied(req: &AllocateRequest, agent: &AgentState) -> bool {
    req.slots_needed <= agent.num_empty_slots()
}

fn max_zero_slot_containers_satisfied(req: &AllocateRequest, agent: &AgentState) -> bool {
    req.slots_needed != 0 || agent.num_empty_zero_slots() > 0
}

fn label_satisfied(req: &AllocateRequest, agent: &AgentState) -> bool {
    req.label == agent.label()
}

/// Prefer the agent that ends up fullest
pub fn best_fit(req: &AllocateRequest, agent: &AgentState) -> f64 {
    if req.slots_needed == 0 {
        let max = agent.max_zero_slot_containers();
        if max == 0 {
            return 0.0;
        }
        let free = max.saturating_sub(agent.num_zero_slot_containers());
        return 1.0 / (1.0 + free as f64);
    }
    if agent.num_slots() == 0 {
        return 0.0;
    }
    1.0 / (1.0 + agent.num_empty_slots() as f64)
}

/// Prefer the agent that stays emptiest
pub fn worst_fit(req: &AllocateRequest, agent: &AgentState) -> f64 {
    if req.slots_needed == 0 {
        let max = agent.max_zero_slot_containers();
        if max == 0 {
            return 0.0;
        }
        let free = max.saturating_sub(agent.num_zero_slot_containers());
        return free as f64 / max as f64;
    }
    let total = agent.num_slots();
    if total == 0 {
        return 0.0;
    }
    agent.num_empty_slots() as f64 / total as f64
}
