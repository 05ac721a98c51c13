//! # nexus-scheduler
//!
//! The global scheduler tier of nexus. Allocates GPU capacity across model
//! sessions on epoch boundaries using measured request rates, admits new
//! workloads without disrupting live ones, and redistributes load when
//! backends join or leave. The per-query tier lives in `nexus-dispatcher`
//! and consumes the model routes this crate produces.

pub mod backend;
pub mod frontend;
pub mod handles;
pub mod instance;
pub mod scheduler;
pub mod session;

pub use backend::BackendDelegate;
pub use frontend::FrontendDelegate;
pub use handles::{BackendHandle, BackendPush, ChannelBackend, ChannelFrontend, FrontendHandle, FrontendPush};
pub use instance::InstanceInfo;
pub use scheduler::{Scheduler, StaticModelSpec};
pub use session::SessionInfo;
