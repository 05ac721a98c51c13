//! Frontend delegate: subscription and liveness state for one frontend

use crate::handles::FrontendHandle;
use nexus_core::wire::{BackendListUpdate, ModelRouteUpdates};
use nexus_core::NodeId;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

/// The scheduler's view of one registered frontend.
pub struct FrontendDelegate {
    node_id: NodeId,
    handle: Arc<dyn FrontendHandle>,
    subscribed: HashSet<String>,
    last_seen: Instant,
}

impl FrontendDelegate {
    pub fn new(node_id: NodeId, handle: Arc<dyn FrontendHandle>) -> Self {
        Self {
            node_id,
            handle,
            subscribed: HashSet::new(),
            last_seen: Instant::now(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Record a keepalive
    pub fn tick(&mut self) {
        self.last_seen = Instant::now();
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub fn subscribe_model(&mut self, session_id: impl Into<String>) {
        self.subscribed.insert(session_id.into());
    }

    pub fn subscribed_models(&self) -> impl Iterator<Item = &String> {
        self.subscribed.iter()
    }

    pub fn update_model_routes(&self, updates: ModelRouteUpdates) {
        self.handle.update_model_routes(updates);
    }

    pub fn update_backend_list(&self, update: BackendListUpdate) {
        self.handle.update_backend_list(update);
    }
}
