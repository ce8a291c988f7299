//! slotsched-core: Core types for the slotsched resource scheduler
//!
//! This crate provides the types shared by every other slotsched crate:
//! - Task, group, agent and container identifiers
//! - Allocation requests and devices
//! - Summaries reported to observers (tasks, agents, job queue, scaling)
//! - Configuration types
//! - Error handling

pub mod config;
pub mod error;
pub mod summary;
pub mod types;

pub use config::*;
pub use error::*;
pub use summary::*;
pub use types::*;
