//! Per-agent device bookkeeping

use crate::fitting::Fit;
use crate::task_list::AllocatedContainer;
use slotsched_core::{AgentId, AgentSummary, ContainerId, Device, SchedError, SchedResult};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Agents of a pool keyed by address
pub type AgentMap = BTreeMap<AgentId, AgentState>;

/// Scheduler view of one agent: which container owns each device, and
/// which containers occupy aux (zero-slot) capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentState {
    id: AgentId,
    label: String,
    devices: BTreeMap<u32, DeviceSlot>,
    zero_slot_containers: BTreeSet<ContainerId>,
    max_zero_slot_containers: usize,
    enabled: bool,
    draining: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DeviceSlot {
    device: Device,
    owner: Option<ContainerId>,
}

impl AgentState {
    /// Create a new enabled agent without devices
    pub fn new(id: AgentId, label: impl Into<String>, max_zero_slot_containers: usize) -> Self {
        Self {
            id,
            label: label.into(),
            devices: BTreeMap::new(),
            zero_slot_containers: BTreeSet::new(),
            max_zero_slot_containers,
            enabled: true,
            draining: false,
        }
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn max_zero_slot_containers(&self) -> usize {
        self.max_zero_slot_containers
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    /// Total slots the agent offers
    pub fn num_slots(&self) -> usize {
        if self.draining {
            self.num_used_slots()
        } else if !self.enabled {
            0
        } else {
            self.devices.len()
        }
    }

    /// Slots owned by a container
    pub fn num_used_slots(&self) -> usize {
        self.devices.values().filter(|d| d.owner.is_some()).count()
    }

    /// Slots that can take new work
    pub fn num_empty_slots(&self) -> usize {
        if self.draining || !self.enabled {
            return 0;
        }
        self.num_slots() - self.num_used_slots()
    }

    pub fn num_zero_slot_containers(&self) -> usize {
        self.zero_slot_containers.len()
    }

    /// Aux containers that can still be placed
    pub fn num_empty_zero_slots(&self) -> usize {
        if self.draining || !self.enabled {
            return 0;
        }
        self.max_zero_slot_containers
            .saturating_sub(self.zero_slot_containers.len())
    }

    /// Whether nothing runs on the agent
    pub fn idle(&self) -> bool {
        self.num_used_slots() == 0 && self.zero_slot_containers.is_empty()
    }

    /// Reserve `slots` free devices (or one aux slot when `slots` is 0) for a container
    pub fn allocate_free_devices(
        &mut self,
        slots: usize,
        container_id: ContainerId,
    ) -> SchedResult<Vec<Device>> {
        if slots == 0 {
            if self.zero_slot_containers.len() >= self.max_zero_slot_containers {
                return Err(SchedError::Invariant(format!(
                    "agent {} has no free zero-slot capacity ({} of {})",
                    self.id,
                    self.zero_slot_containers.len(),
                    self.max_zero_slot_containers
                )));
            }
            self.zero_slot_containers.insert(container_id);
            return Ok(Vec::new());
        }

        let free: Vec<u32> = self
            .devices
            .iter()
            .filter(|(_, d)| d.owner.is_none())
            .map(|(id, _)| *id)
            .take(slots)
            .collect();

        if free.len() < slots {
            return Err(SchedError::InsufficientDevices {
                agent: self.id.to_string(),
                requested: slots,
                free: free.len(),
            });
        }

        let mut devices = Vec::with_capacity(slots);
        for id in free {
            if let Some(slot) = self.devices.get_mut(&id) {
                slot.owner = Some(container_id);
                devices.push(slot.device.clone());
            }
        }
        Ok(devices)
    }

    /// Free every device and aux slot held by a container
    pub fn deallocate_container(&mut self, container_id: &ContainerId) {
        self.zero_slot_containers.remove(container_id);
        for slot in self.devices.values_mut() {
            if slot.owner.as_ref() == Some(container_id) {
                slot.owner = None;
            }
        }
    }

    /// Free one device; it must be owned by `container_id`
    pub fn free_device(&mut self, device_id: u32, container_id: &ContainerId) -> SchedResult<()> {
        let slot = self
            .devices
            .get_mut(&device_id)
            .ok_or_else(|| SchedError::DeviceNotFound {
                agent: self.id.to_string(),
                device: device_id,
            })?;

        if slot.owner.as_ref() != Some(container_id) {
            return Err(SchedError::Invariant(format!(
                "device {} on agent {} is not owned by container {}",
                device_id, self.id, container_id
            )));
        }
        slot.owner = None;
        Ok(())
    }

    /// Devices currently owned by a container
    pub fn container_devices(&self, container_id: &ContainerId) -> Vec<Device> {
        self.devices
            .values()
            .filter(|d| d.owner.as_ref() == Some(container_id))
            .map(|d| d.device.clone())
            .collect()
    }

    /// Whether the container holds devices or an aux slot here
    pub fn has_container(&self, container_id: &ContainerId) -> bool {
        self.zero_slot_containers.contains(container_id)
            || self.devices.values().any(|d| d.owner.as_ref() == Some(container_id))
    }

    /// Add a device, optionally already owned by a running container
    pub fn add_device(&mut self, device: Device, owner: Option<ContainerId>) {
        info!(agent = %self.id, device = device.id, "Adding device");
        self.devices.insert(device.id, DeviceSlot { device, owner });
    }

    /// Remove a device from the agent
    pub fn remove_device(&mut self, device_id: u32) -> SchedResult<Device> {
        info!(agent = %self.id, device = device_id, "Removing device");
        self.devices
            .remove(&device_id)
            .map(|slot| slot.device)
            .ok_or_else(|| SchedError::DeviceNotFound {
                agent: self.id.to_string(),
                device: device_id,
            })
    }

    /// Re-admit the agent for scheduling
    pub fn enable(&mut self) {
        info!(agent = %self.id, "Enabling agent");
        self.enabled = true;
        self.draining = false;
    }

    /// Stop placing new work; with `drain` running work keeps its slots
    pub fn disable(&mut self, drain: bool) {
        if drain {
            info!(agent = %self.id, "Draining agent");
        } else {
            info!(agent = %self.id, "Disabling agent");
        }
        self.enabled = false;
        self.draining = drain;
    }

    pub fn summary(&self) -> AgentSummary {
        AgentSummary {
            name: self.id.to_string(),
            is_idle: self.idle(),
        }
    }
}

/// Reserve one fresh container per fit on the real agents.
///
/// All-or-nothing: when any fit cannot be reserved, the containers already
/// reserved for the same placement are freed again before the error returns.
pub fn reserve_containers(agents: &mut AgentMap, fits: &[Fit]) -> SchedResult<Vec<AllocatedContainer>> {
    let mut reserved: Vec<AllocatedContainer> = Vec::with_capacity(fits.len());

    for fit in fits {
        let container_id = ContainerId::new();
        let result = match agents.get_mut(&fit.agent_id) {
            Some(agent) => agent.allocate_free_devices(fit.slots, container_id),
            None => Err(SchedError::AgentNotFound(fit.agent_id.to_string())),
        };

        match result {
            Ok(devices) => reserved.push(AllocatedContainer {
                agent_id: fit.agent_id.clone(),
                container_id,
                devices,
                slots: fit.slots,
            }),
            Err(e) => {
                release_containers(agents, &reserved);
                return Err(e);
            }
        }
    }
    Ok(reserved)
}

/// Free a task's containers on whichever agents still exist
pub fn release_containers<'a>(
    agents: &mut AgentMap,
    containers: impl IntoIterator<Item = &'a AllocatedContainer>,
) {
    for container in containers {
        match agents.get_mut(&container.agent_id) {
            Some(agent) => agent.deallocate_container(&container.container_id),
            None => debug!(
                agent = %container.agent_id,
                container = %container.container_id,
                "Skipping release on disconnected agent"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_agent(slots: u32, max_zero: usize) -> AgentState {
        let mut agent = AgentState::new(AgentId::from("agent1"), "", max_zero);
        for i in 0..slots {
            agent.add_device(Device::gpu(i), None);
        }
        agent
    }

    #[test]
    fn test_empty_agent() {
        let agent = AgentState::new(AgentId::from("agent1"), "", 100);
        assert_eq!(agent.num_slots(), 0);
        assert_eq!(agent.num_empty_slots(), 0);
        assert!(agent.idle());
    }

    #[test]
    fn test_allocate_and_deallocate_devices() {
        let mut agent = create_test_agent(4, 100);
        let container = ContainerId::new();

        let devices = agent.allocate_free_devices(3, container).unwrap();
        assert_eq!(devices.len(), 3);
        assert_eq!(agent.num_used_slots(), 3);
        assert_eq!(agent.num_empty_slots(), 1);
        assert!(!agent.idle());
        assert_eq!(agent.container_devices(&container), devices);

        agent.deallocate_container(&container);
        assert_eq!(agent.num_empty_slots(), 4);
        assert!(agent.idle());
    }

    #[test]
    fn test_allocate_insufficient_devices() {
        let mut agent = create_test_agent(2, 100);
        let result = agent.allocate_free_devices(3, ContainerId::new());
        assert!(matches!(
            result,
            Err(SchedError::InsufficientDevices { requested: 3, free: 2, .. })
        ));
        assert_eq!(agent.num_used_slots(), 0);
    }

    #[test]
    fn test_zero_slot_containers_respect_cap() {
        let mut agent = create_test_agent(0, 1);
        let container = ContainerId::new();

        assert!(agent.allocate_free_devices(0, container).unwrap().is_empty());
        assert_eq!(agent.num_zero_slot_containers(), 1);
        assert_eq!(agent.num_empty_zero_slots(), 0);
        assert!(!agent.idle());

        let result = agent.allocate_free_devices(0, ContainerId::new());
        assert!(matches!(result, Err(SchedError::Invariant(_))));

        agent.deallocate_container(&container);
        assert!(agent.idle());
    }

    #[test]
    fn test_free_device_requires_owner() {
        let mut agent = create_test_agent(2, 100);
        let container = ContainerId::new();
        let devices = agent.allocate_free_devices(1, container).unwrap();

        let other = ContainerId::new();
        assert!(agent.free_device(devices[0].id, &other).is_err());
        assert!(agent.free_device(7, &container).is_err());

        agent.free_device(devices[0].id, &container).unwrap();
        assert_eq!(agent.num_used_slots(), 0);
        assert!(agent.free_device(devices[0].id, &container).is_err());
    }

    #[test]
    fn test_remove_device() {
        let mut agent = create_test_agent(2, 100);
        assert_eq!(agent.remove_device(1).unwrap().id, 1);
        assert_eq!(agent.num_slots(), 1);
        assert!(matches!(
            agent.remove_device(1),
            Err(SchedError::DeviceNotFound { device: 1, .. })
        ));
    }

    #[test]
    fn test_reserve_containers_rolls_back() {
        let mut agents = AgentMap::new();
        for (id, slots) in [("agent1", 4), ("agent2", 2)] {
            let mut agent = AgentState::new(AgentId::from(id), "", 100);
            for i in 0..slots {
                agent.add_device(Device::gpu(i), None);
            }
            agents.insert(AgentId::from(id), agent);
        }

        let fits = vec![
            Fit { agent_id: AgentId::from("agent1"), slots: 4 },
            Fit { agent_id: AgentId::from("agent2"), slots: 3 },
        ];
        assert!(matches!(
            reserve_containers(&mut agents, &fits),
            Err(SchedError::InsufficientDevices { .. })
        ));
        assert!(agents.values().all(|a| a.idle()));

        let fits = vec![Fit { agent_id: AgentId::from("missing"), slots: 1 }];
        assert!(matches!(
            reserve_containers(&mut agents, &fits),
            Err(SchedError::AgentNotFound(_))
        ));

        let fits = vec![
            Fit { agent_id: AgentId::from("agent1"), slots: 2 },
            Fit { agent_id: AgentId::from("agent2"), slots: 2 },
        ];
        let containers = reserve_containers(&mut agents, &fits).unwrap();
        assert_eq!(containers.len(), 2);
        assert_eq!(agents[&AgentId::from("agent1")].num_used_slots(), 2);

        release_containers(&mut agents, &containers);
        assert!(agents.values().all(|a| a.idle()));
    }

    #[test]
    fn test_disable_and_drain() {
        let mut agent = create_test_agent(4, 100);
        agent.allocate_free_devices(1, ContainerId::new()).unwrap();

        agent.disable(false);
        assert_eq!(agent.num_slots(), 0);
        assert_eq!(agent.num_empty_slots(), 0);
        assert_eq!(agent.num_empty_zero_slots(), 0);

        agent.disable(true);
        assert_eq!(agent.num_slots(), 1);
        assert_eq!(agent.num_empty_slots(), 0);

        agent.enable();
        assert_eq!(agent.num_slots(), 4);
        assert_eq!(agent.num_empty_slots(), 3);
    }
}
