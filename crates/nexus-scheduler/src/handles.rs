//! Push handles to registered nodes
//!
//! The scheduler never blocks on I/O while holding its mutex; everything it
//! sends to a frontend or backend goes through these non-blocking handles.
//! Transport adapters implement the traits over their RPC clients; tests and
//! in-process deployments use the channel-backed implementations below.

use nexus_core::wire::{BackendListUpdate, BatchPlan, ModelRouteUpdates, ModelTableEntry};
use nexus_core::{ModelSession, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// Scheduler-to-frontend push surface
pub trait FrontendHandle: Send + Sync {
    /// Deliver refreshed routes for sessions the frontend subscribes to
    fn update_model_routes(&self, updates: ModelRouteUpdates);

    /// Deliver the current backend membership
    fn update_backend_list(&self, update: BackendListUpdate);
}

/// Scheduler-to-backend push surface
pub trait BackendHandle: Send + Sync {
    /// Replace the backend's model table with the scheduler's current plan
    fn update_model_table(&self, table: Vec<ModelTableEntry>);

    /// Instruct the backend to load a model at the planned batch size
    fn load_model(&self, session: ModelSession, max_batch: u32);

    /// Hand a batch plan to the backend for execution.
    ///
    /// Fails when the backend is gone; the caller drops the plan and logs.
    fn enqueue_batch_plan(&self, plan: BatchPlan) -> Result<()>;
}

/// Message pushed through a [`ChannelFrontend`]
#[derive(Debug, Clone, PartialEq)]
pub enum FrontendPush {
    ModelRoutes(ModelRouteUpdates),
    BackendList(BackendListUpdate),
}

/// Message pushed through a [`ChannelBackend`]
#[derive(Debug, Clone, PartialEq)]
pub enum BackendPush {
    ModelTable(Vec<ModelTableEntry>),
    LoadModel { session: ModelSession, max_batch: u32 },
    BatchPlan(BatchPlan),
}

/// Channel-backed frontend handle
#[derive(Clone)]
pub struct ChannelFrontend {
    tx: mpsc::UnboundedSender<FrontendPush>,
}

impl ChannelFrontend {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FrontendPush>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl FrontendHandle for ChannelFrontend {
    fn update_model_routes(&self, updates: ModelRouteUpdates) {
        if self.tx.send(FrontendPush::ModelRoutes(updates)).is_err() {
            warn!("Dropping model route update: frontend channel closed");
        }
    }

    fn update_backend_list(&self, update: BackendListUpdate) {
        if self.tx.send(FrontendPush::BackendList(update)).is_err() {
            warn!("Dropping backend list update: frontend channel closed");
        }
    }
}

/// Channel-backed backend handle
#[derive(Clone)]
pub struct ChannelBackend {
    tx: mpsc::UnboundedSender<BackendPush>,
}

impl ChannelBackend {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<BackendPush>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl BackendHandle for ChannelBackend {
    fn update_model_table(&self, table: Vec<ModelTableEntry>) {
        if self.tx.send(BackendPush::ModelTable(table)).is_err() {
            warn!("Dropping model table update: backend channel closed");
        }
    }

    fn load_model(&self, session: ModelSession, max_batch: u32) {
        if self
            .tx
            .send(BackendPush::LoadModel { session, max_batch })
            .is_err()
        {
            warn!("Dropping load model command: backend channel closed");
        }
    }

    fn enqueue_batch_plan(&self, plan: BatchPlan) -> Result<()> {
        self.tx
            .send(BackendPush::BatchPlan(plan))
            .map_err(|_| nexus_core::Error::transport("backend channel closed"))
    }
}
