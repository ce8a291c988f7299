//! slotsched-api: REST API server for slotsched
//!
//! This crate provides the REST API for observing and steering pools:
//! - Pool, task and resource summaries
//! - Job queue and queue statistics
//! - Group weight, priority and max-slots updates
//! - System status

pub mod rest;

pub use rest::create_router;
