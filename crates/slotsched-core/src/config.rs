//! Configuration types for slotsched

use crate::error::{SchedError, SchedResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Most important group priority
pub const MIN_PRIORITY: i32 = 1;
/// Least important group priority
pub const MAX_PRIORITY: i32 = 99;
/// Priority given to groups that never set one
pub const DEFAULT_PRIORITY: i32 = 42;
/// Priority given to groups in Kubernetes-backed pools
pub const KUBERNETES_DEFAULT_PRIORITY: i32 = 50;
/// Name of the pool that serves requests naming no pool
pub const DEFAULT_POOL_NAME: &str = "default";

/// Main daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// API server configuration
    pub api: ApiConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Scheduler used by pools without their own
    pub scheduler: SchedulerConfig,
    /// Pool that serves requests with an empty pool name
    pub default_resource_pool: String,
    /// Resource pools to run
    pub resource_pools: Vec<ResourcePoolConfig>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
            scheduler: SchedulerConfig::default(),
            default_resource_pool: DEFAULT_POOL_NAME.to_string(),
            resource_pools: vec![ResourcePoolConfig::default()],
        }
    }
}

impl DaemonConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> SchedResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SchedError::Config(format!("Failed to read config file: {}", e)))?;
        toml::from_str(&content)
            .map_err(|e| SchedError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Reject configurations the pools cannot run with
    pub fn validate(&self) -> SchedResult<()> {
        if self.resource_pools.is_empty() {
            return Err(SchedError::Config("no resource pools configured".to_string()));
        }

        self.scheduler.validate()?;

        let mut seen = HashSet::new();
        for pool in &self.resource_pools {
            if pool.pool_name.is_empty() {
                return Err(SchedError::Config("resource pool name is empty".to_string()));
            }
            if !seen.insert(pool.pool_name.as_str()) {
                return Err(SchedError::Config(format!(
                    "duplicate resource pool name: {}",
                    pool.pool_name
                )));
            }
            let scheduler = self.scheduler_for(pool);
            scheduler.validate()?;
            if scheduler.scheduler_type == SchedulerType::Kubernetes
                && pool.max_slots_per_pod.unwrap_or(0) == 0
            {
                return Err(SchedError::Config(format!(
                    "kubernetes resource pool {} needs max_slots_per_pod",
                    pool.pool_name
                )));
            }
        }

        if !seen.contains(self.default_resource_pool.as_str()) {
            return Err(SchedError::Config(format!(
                "default resource pool {} is not configured",
                self.default_resource_pool
            )));
        }
        Ok(())
    }

    /// Effective scheduler configuration of a pool
    pub fn scheduler_for<'a>(&'a self, pool: &'a ResourcePoolConfig) -> &'a SchedulerConfig {
        pool.scheduler.as_ref().unwrap_or(&self.scheduler)
    }
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address to bind the REST API server
    pub address: String,
    /// Port for the REST API server
    pub port: u16,
    /// Enable CORS
    pub cors_enabled: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 8090,
            cors_enabled: true,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log file path (if any)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Scheduling policy of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulerType {
    /// Weighted max-min fairness between groups
    FairShare,
    /// Strict priority with optional preemption
    Priority,
    /// Greedy packing onto Kubernetes pods
    Kubernetes,
}

impl fmt::Display for SchedulerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerType::FairShare => write!(f, "fair-share"),
            SchedulerType::Priority => write!(f, "priority"),
            SchedulerType::Kubernetes => write!(f, "kubernetes"),
        }
    }
}

/// Soft constraint used to rank candidate agents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FittingPolicy {
    /// Pack onto the fullest agent that still fits
    #[default]
    Best,
    /// Spread onto the emptiest agent
    Worst,
}

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Scheduling policy
    #[serde(rename = "type")]
    pub scheduler_type: SchedulerType,
    /// Soft constraint for fitting
    pub fitting_policy: FittingPolicy,
    /// Priority scheduler settings
    pub priority: PrioritySchedulerConfig,
    /// Allow multi-agent fits with uneven per-agent slot counts
    pub allow_heterogeneous_fits: bool,
    /// Interval between scheduling ticks in milliseconds
    pub tick_interval_ms: u64,
    /// Fair share only: allocated work that has not started running within
    /// this many milliseconds may be released. Unset or zero disables it.
    pub allocation_timeout_ms: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scheduler_type: SchedulerType::FairShare,
            fitting_policy: FittingPolicy::Best,
            priority: PrioritySchedulerConfig::default(),
            allow_heterogeneous_fits: false,
            tick_interval_ms: 500,
            allocation_timeout_ms: None,
        }
    }
}

impl SchedulerConfig {
    /// Tick interval as a duration
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Priority assigned to groups created without one
    pub fn default_priority(&self) -> i32 {
        match self.scheduler_type {
            SchedulerType::Kubernetes => KUBERNETES_DEFAULT_PRIORITY,
            _ => self.priority.default_priority,
        }
    }

    pub fn validate(&self) -> SchedResult<()> {
        if self.tick_interval_ms == 0 {
            return Err(SchedError::Config(
                "tick_interval_ms must be greater than zero".to_string(),
            ));
        }
        validate_priority(self.priority.default_priority)
    }
}

/// Priority scheduler settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrioritySchedulerConfig {
    /// Release lower-priority work to make room for higher-priority work
    pub preemption: bool,
    /// Priority of groups that never set one
    pub default_priority: i32,
}

impl Default for PrioritySchedulerConfig {
    fn default() -> Self {
        Self {
            preemption: false,
            default_priority: DEFAULT_PRIORITY,
        }
    }
}

/// Check that a priority lies in the accepted range
pub fn validate_priority(priority: i32) -> SchedResult<()> {
    if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
        return Err(SchedError::Config(format!(
            "priority {} is outside {}..={}",
            priority, MIN_PRIORITY, MAX_PRIORITY
        )));
    }
    Ok(())
}

/// Resource pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcePoolConfig {
    /// Unique pool name
    pub pool_name: String,
    /// Free-form description
    pub description: String,
    /// Scheduler override for this pool
    pub scheduler: Option<SchedulerConfig>,
    /// Zero-slot containers allowed per agent
    pub max_aux_containers_per_agent: usize,
    /// Slots one provisioned instance brings, if the pool autoscales
    pub slots_per_instance: Option<usize>,
    /// Slots one pod can hold (Kubernetes pools)
    pub max_slots_per_pod: Option<usize>,
    /// Bounded inbox size of the pool loop
    pub inbox_capacity: usize,
}

impl Default for ResourcePoolConfig {
    fn default() -> Self {
        Self {
            pool_name: DEFAULT_POOL_NAME.to_string(),
            description: String::new(),
            scheduler: None,
            max_aux_containers_per_agent: 100,
            slots_per_instance: None,
            max_slots_per_pod: None,
            inbox_capacity: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_daemon_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.api.port, 8090);
        assert_eq!(config.scheduler.scheduler_type, SchedulerType::FairShare);
        assert_eq!(config.scheduler.tick_interval(), Duration::from_millis(500));
        assert!(config.scheduler.allocation_timeout_ms.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_parse() {
        let toml_str = r#"
default_resource_pool = "gpu"

[logging]
level = "debug"

[scheduler]
type = "priority"
fitting_policy = "worst"
allocation_timeout_ms = 60000

[scheduler.priority]
preemption = true

[[resource_pools]]
pool_name = "gpu"
slots_per_instance = 8

[[resource_pools]]
pool_name = "k8s"
max_slots_per_pod = 4

[resource_pools.scheduler]
type = "kubernetes"
"#;
        let config: DaemonConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.scheduler.scheduler_type, SchedulerType::Priority);
        assert_eq!(config.scheduler.fitting_policy, FittingPolicy::Worst);
        assert!(config.scheduler.priority.preemption);
        assert_eq!(config.scheduler.allocation_timeout_ms, Some(60000));
        assert_eq!(config.scheduler.priority.default_priority, DEFAULT_PRIORITY);
        assert_eq!(config.resource_pools.len(), 2);
        assert_eq!(config.resource_pools[0].max_aux_containers_per_agent, 100);

        let k8s = &config.resource_pools[1];
        assert_eq!(
            config.scheduler_for(k8s).scheduler_type,
            SchedulerType::Kubernetes
        );
        assert_eq!(config.scheduler_for(k8s).default_priority(), KUBERNETES_DEFAULT_PRIORITY);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicate_pools() {
        let mut config = DaemonConfig::default();
        config.resource_pools.push(ResourcePoolConfig::default());
        assert!(matches!(config.validate(), Err(SchedError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_missing_default_pool() {
        let config = DaemonConfig {
            default_resource_pool: "missing".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_scheduler_settings() {
        let mut config = DaemonConfig::default();
        config.scheduler.priority.default_priority = 100;
        assert!(config.validate().is_err());

        let mut config = DaemonConfig::default();
        config.scheduler.tick_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = DaemonConfig::default();
        config.resource_pools[0].scheduler = Some(SchedulerConfig {
            scheduler_type: SchedulerType::Kubernetes,
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_scheduler_type_fails_to_parse() {
        let toml_str = r#"
[scheduler]
type = "round-robin"
"#;
        assert!(toml::from_str::<DaemonConfig>(toml_str).is_err());
    }
}
