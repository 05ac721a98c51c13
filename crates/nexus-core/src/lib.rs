//! # nexus-core
//!
//! Core types, traits, and utilities shared by the nexus scheduling fabric.
//!
//! Nexus routes deep-learning inference queries from many frontends to a pool
//! of GPU backends under per-query latency SLAs. This crate provides the
//! foundational pieces both scheduling tiers build on:
//!
//! - Identifiers and the `ModelSession`/`BackendInfo` data model
//! - Wire messages for the control and dispatch planes
//! - The `ModelProfile` oracle interface
//! - Request-rate estimation utilities
//! - Configuration schema and parsing
//! - Error handling types

pub mod config;
pub mod error;
pub mod profile;
pub mod rate;
pub mod time;
pub mod types;
pub mod wire;

// Re-export commonly used types at the crate root
pub use config::{DispatcherConfig, NexusConfig, SchedulerConfig};
pub use error::{Error, Result};
pub use profile::{ModelProfile, ProfileDatabase};
pub use rate::{EwmaRate, IntervalCounter};
pub use types::{BackendInfo, GlobalId, ModelSession, NodeId, NodeType, PlanId, QueryId};
pub use wire::{
    BackendRate, BatchPlan, CtrlStatus, DispatchReply, DispatchRequest, ModelRoute,
    ModelRouteUpdates, ModelTableEntry, Query, QueryClock, WorkloadStats,
};
