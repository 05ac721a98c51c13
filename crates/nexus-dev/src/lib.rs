//! # nexus-dev
//!
//! Test support for the nexus scheduling fabric: synthetic latency profiles,
//! recording node handles, an in-process cluster harness, and a small load
//! generator. Everything here is test-only; production deployments wire real
//! transports against the same traits.

pub mod harness;
pub mod load_generator;
pub mod profiles;

pub use harness::{backend_info, RecorderConnector, RecordingBackend, RecordingFrontend, TestCluster};
pub use load_generator::{run_open_loop, LoadGeneratorConfig, LoadSummary};
pub use profiles::{LinearProfile, MockProfileDatabase};
