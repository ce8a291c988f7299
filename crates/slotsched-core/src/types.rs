//! Identifier, device and allocation request type definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity of a requesting task.
///
/// Notifications (allocations, release requests) are routed back to the
/// task through this handle; at most one live request exists per handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskHandle(Uuid);

impl TaskHandle {
    /// Create a new random task handle
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TaskHandle {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a scheduling group (usually one per job).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupHandle(Uuid);

impl GroupHandle {
    /// Create a new random group handle
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for GroupHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for GroupHandle {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// A task without an explicit group forms a group of its own.
impl From<TaskHandle> for GroupHandle {
    fn from(handle: TaskHandle) -> Self {
        Self(handle.0)
    }
}

impl fmt::Display for GroupHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Agent address, unique within a resource pool
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AgentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a container placed on an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(Uuid);

impl ContainerId {
    /// Generate a fresh container id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ContainerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable ID of an allocation request
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllocationId(String);

impl AllocationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random allocation id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for AllocationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Job identifier used for queue reporting
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of a schedulable device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceType {
    /// NVIDIA GPU
    Cuda,
    /// AMD GPU
    Rocm,
    /// CPU slot
    Cpu,
}

/// A device on an agent; one device is one slot
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Device {
    /// Index of the device on its agent
    pub id: u32,
    /// Vendor/model string
    pub brand: String,
    /// Device kind
    pub device_type: DeviceType,
}

impl Device {
    /// Create a new device
    pub fn new(id: u32, brand: impl Into<String>, device_type: DeviceType) -> Self {
        Self {
            id,
            brand: brand.into(),
            device_type,
        }
    }

    /// Create a CUDA device with a generic brand (handy for tests and fakes)
    pub fn gpu(id: u32) -> Self {
        Self::new(id, "GPU", DeviceType::Cuda)
    }
}

/// Hard placement requirements of a request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FittingRequirements {
    /// Place the request on exactly one agent
    #[serde(default)]
    pub single_agent: bool,
}

/// Job metadata attached to a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub job_id: JobId,
    pub submission_time: DateTime<Utc>,
}

/// Default name of a request registered without one
pub const UNNAMED_TASK: &str = "Unnamed Task";

/// A request for slots on behalf of one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocateRequest {
    /// Stable request ID; generated on registration when empty
    #[serde(default)]
    pub id: AllocationId,
    /// Human-readable name; defaulted on registration when empty
    #[serde(default)]
    pub name: String,
    /// Handle notifications are routed to
    pub handle: TaskHandle,
    /// Owning group; the task's own handle when absent
    #[serde(default)]
    pub group: Option<GroupHandle>,
    /// Slots (devices) needed; zero means an aux container
    pub slots_needed: usize,
    /// Node-pool affinity label
    #[serde(default)]
    pub label: String,
    /// Running allocations of this request are never reclaimed
    #[serde(default)]
    pub non_preemptible: bool,
    #[serde(default)]
    pub fitting_requirements: FittingRequirements,
    /// Target resource pool; the default pool when empty
    #[serde(default)]
    pub resource_pool: String,
    #[serde(default)]
    pub job: Option<JobInfo>,
}

impl AllocateRequest {
    /// Create a request for `slots_needed` slots with every optional field empty
    pub fn new(handle: TaskHandle, slots_needed: usize) -> Self {
        Self {
            id: AllocationId::default(),
            name: String::new(),
            handle,
            group: None,
            slots_needed,
            label: String::new(),
            non_preemptible: false,
            fitting_requirements: FittingRequirements::default(),
            resource_pool: String::new(),
            job: None,
        }
    }

    /// Group the request is scheduled under
    pub fn group_handle(&self) -> GroupHandle {
        self.group.unwrap_or_else(|| GroupHandle::from(self.handle))
    }

    pub fn is_preemptible(&self) -> bool {
        !self.non_preemptible
    }

    pub fn job_submission_time(&self) -> Option<DateTime<Utc>> {
        self.job.as_ref().map(|j| j.submission_time)
    }

    /// Fill in the ID, name and group when the requester left them empty
    pub fn with_defaults(mut self) -> Self {
        if self.id.is_empty() {
            self.id = AllocationId::generate();
        }
        if self.name.is_empty() {
            self.name = UNNAMED_TASK.to_string();
        }
        if self.group.is_none() {
            self.group = Some(GroupHandle::from(self.handle));
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let handle = TaskHandle::new();
        let req = AllocateRequest::new(handle, 2).with_defaults();

        assert!(!req.id.is_empty());
        assert_eq!(req.name, UNNAMED_TASK);
        assert_eq!(req.group, Some(GroupHandle::from(handle)));
        assert!(req.is_preemptible());
    }

    #[test]
    fn test_request_defaults_keep_explicit_values() {
        let group = GroupHandle::new();
        let mut req = AllocateRequest::new(TaskHandle::new(), 1);
        req.id = AllocationId::from("trial-1");
        req.name = "trial".to_string();
        req.group = Some(group);

        let req = req.with_defaults();
        assert_eq!(req.id.as_str(), "trial-1");
        assert_eq!(req.name, "trial");
        assert_eq!(req.group_handle(), group);
    }

    #[test]
    fn test_request_deserialize_minimal() {
        let handle = TaskHandle::new();
        let json = format!(r#"{{"handle":"{}","slots_needed":4}}"#, handle);
        let req: AllocateRequest = serde_json::from_str(&json).unwrap();

        assert_eq!(req.handle, handle);
        assert_eq!(req.slots_needed, 4);
        assert!(req.label.is_empty());
        assert!(!req.fitting_requirements.single_agent);
    }
}
