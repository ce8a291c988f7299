//! Error types for slotsched

use thiserror::Error;

/// Main error type for slotsched
#[derive(Error, Debug)]
pub enum SchedError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Scheduler error
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Internal bookkeeping invariant was violated
    #[error("Invariant violation: {0}")]
    Invariant(String),

    /// Agent not found
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// Device not found on an agent
    #[error("Device {device} not found on agent {agent}")]
    DeviceNotFound { agent: String, device: u32 },

    /// Task not found
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Group has no queued work in the pool
    #[error("Group not found: {0}")]
    GroupNotFound(String),

    /// Resource pool not found
    #[error("Resource pool not found: {0}")]
    PoolNotFound(String),

    /// Not enough free devices for a reservation
    #[error("Insufficient devices on agent {agent}: requested {requested}, free {free}")]
    InsufficientDevices {
        agent: String,
        requested: usize,
        free: usize,
    },

    /// Operation not supported by this pool or scheduler
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Pool loop has stopped
    #[error("Resource pool stopped: {0}")]
    PoolStopped(String),

    /// Ask deadline elapsed
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for slotsched operations
pub type SchedResult<T> = Result<T, SchedError>;

impl SchedError {
    /// Whether the error means the pool's bookkeeping can no longer be trusted.
    ///
    /// A pool loop that sees a fatal error stops and hands it to its supervisor.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SchedError::Invariant(_)
                | SchedError::AgentNotFound(_)
                | SchedError::DeviceNotFound { .. }
                | SchedError::InsufficientDevices { .. }
        )
    }
}

impl From<serde_json::Error> for SchedError {
    fn from(err: serde_json::Error) -> Self {
        SchedError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for SchedError {
    fn from(err: toml::de::Error) -> Self {
        SchedError::Config(err.to_string())
    }
}
