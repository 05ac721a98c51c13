//! # nexus-dispatcher
//!
//! The per-query tier of nexus. For every incoming query it picks a backend
//! by deficit round robin over the session's scheduler-assigned route and
//! emits a deadline-annotated batch plan. The UDP dispatch plane and the
//! deadline-ordered delayed-batching variant live here too.

pub mod delayed;
pub mod dispatcher;
pub mod route;
pub mod server;

pub use delayed::DelayedScheduler;
pub use dispatcher::{BackendConnector, DispatchStats, Dispatcher};
pub use route::DrrRoute;
pub use server::UdpDispatchServer;
