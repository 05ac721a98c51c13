//! Per-query dispatch
//!
//! One route lookup under a short lock, then the batch plan is built and
//! handed off outside it. Queries are never retried here: a backend that
//! vanishes between route lookup and enqueue costs us the query, logged.

use crate::route::DrrRoute;
use dashmap::DashMap;
use nexus_core::time::unix_now_ns;
use nexus_core::wire::{
    BackendListUpdate, BackendRate, BatchPlan, CtrlStatus, DispatchReply, ModelRoute,
    ModelRouteUpdates, Query,
};
use nexus_core::{
    BackendInfo, DispatcherConfig, GlobalId, ModelSession, NodeId, PlanId, ProfileDatabase,
};
use nexus_scheduler::handles::BackendHandle;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Opens a batch-plan channel to a backend given its advertised identity.
/// The transport layer implements this over its client connections; tests
/// hand out channel-backed handles.
pub trait BackendConnector: Send + Sync {
    fn connect(&self, info: &BackendInfo) -> Option<Arc<dyn BackendHandle>>;
}

/// Dispatch counters, mirrored into logs on shutdown
#[derive(Debug, Default)]
pub struct DispatchStats {
    pub requests_total: AtomicU64,
    pub dispatched_total: AtomicU64,
    pub model_not_found_total: AtomicU64,
    pub dropped_total: AtomicU64,
}

struct BackendEntry {
    info: BackendInfo,
    handle: Arc<dyn BackendHandle>,
}

#[derive(Default)]
struct RouteState {
    /// DRR table per model session id
    models: HashMap<String, DrrRoute>,

    /// Session descriptors, for SLAs and profile lookups
    sessions: HashMap<String, ModelSession>,
}

/// The per-query dispatcher.
pub struct Dispatcher {
    config: DispatcherConfig,
    profiles: Arc<dyn ProfileDatabase>,
    connector: Arc<dyn BackendConnector>,

    /// Route state guarded by the dispatch lock; held only for the lookup
    routes: Mutex<RouteState>,

    /// Backend handles, read lock-free on the hot path
    backends: DashMap<NodeId, BackendEntry>,

    next_global_id: AtomicU64,
    next_plan_id: AtomicU64,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        profiles: Arc<dyn ProfileDatabase>,
        connector: Arc<dyn BackendConnector>,
    ) -> Self {
        Self {
            config,
            profiles,
            connector,
            routes: Mutex::new(RouteState::default()),
            backends: DashMap::new(),
            next_global_id: AtomicU64::new(1),
            next_plan_id: AtomicU64::new(1),
            stats: DispatchStats::default(),
        }
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Route one query and hand its batch plan to the chosen backend.
    ///
    /// Returns the reply to send back, or `None` when the query was dropped
    /// because the backend disappeared between route lookup and enqueue.
    pub fn dispatch_request(&self, mut query: Query) -> Option<DispatchReply> {
        query.clock.dispatcher_sched_ns = unix_now_ns();
        query.global_id = GlobalId::new(self.next_global_id.fetch_add(1, Ordering::Relaxed));
        self.stats.requests_total.fetch_add(1, Ordering::Relaxed);

        let query_id = query.query_id;
        let reply_session_id = query.model_session_id.clone();
        let reply = move |status: CtrlStatus| DispatchReply {
            query_id,
            model_session_id: reply_session_id.clone(),
            status,
        };

        // Route lookup is the only work under the lock
        let (backend_info, session) = {
            let mut routes = self.routes.lock();
            let Some(route) = routes.models.get_mut(&query.model_session_id) else {
                self.stats
                    .model_not_found_total
                    .fetch_add(1, Ordering::Relaxed);
                return Some(reply(CtrlStatus::ModelNotFound));
            };
            let backend_info = match route.get_backend() {
                Ok(info) => info,
                Err(_) => {
                    self.stats
                        .model_not_found_total
                        .fetch_add(1, Ordering::Relaxed);
                    return Some(reply(CtrlStatus::ModelNotFound));
                }
            };
            let Some(session) = routes.sessions.get(&query.model_session_id).cloned() else {
                self.stats
                    .model_not_found_total
                    .fetch_add(1, Ordering::Relaxed);
                return Some(reply(CtrlStatus::ModelNotFound));
            };
            (backend_info, session)
        };

        let Some(entry) = self.backends.get(&backend_info.node_id) else {
            warn!(
                backend_id = %backend_info.node_id,
                global_id = %query.global_id,
                "Backend vanished before enqueue, dropping query"
            );
            self.stats.dropped_total.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        // Build the batch plan outside the lock
        let now = unix_now_ns();
        let exec_time_ns = now + self.config.network_latency_budget_us as i64 * 1000;
        let deadline_ns = query.deadline_ns(&session);
        let forward_ns = self
            .profiles
            .profile(
                &backend_info.gpu_device,
                &backend_info.gpu_uuid,
                &session,
            )
            .map(|profile| (profile.forward_latency_us(1) * 1000.0) as i64)
            .unwrap_or(0);
        let expected_finish_time_ns = exec_time_ns + forward_ns;
        let plan_id = PlanId::new(self.next_plan_id.fetch_add(1, Ordering::Relaxed));

        query.clock.dispatcher_dispatch_ns = unix_now_ns();
        let model_session_id = query.model_session_id.clone();
        let global_id = query.global_id;
        let plan = BatchPlan {
            plan_id,
            model_session_id,
            queries_without_input: vec![query],
            exec_time_ns,
            deadline_ns,
            expected_finish_time_ns,
        };

        if let Err(err) = entry.handle.enqueue_batch_plan(plan) {
            warn!(
                backend_id = %backend_info.node_id,
                global_id = %global_id,
                error = %err,
                "Failed to enqueue batch plan, dropping query"
            );
            self.stats.dropped_total.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        self.stats.dispatched_total.fetch_add(1, Ordering::Relaxed);
        debug!(global_id = %global_id, backend_id = %backend_info.node_id, "Dispatched query");
        Some(reply(CtrlStatus::Ok))
    }

    /// Apply a route refresh from the scheduler
    pub fn update_model_routes(&self, updates: ModelRouteUpdates) {
        let mut routes = self.routes.lock();
        for model_route in updates.model_route {
            routes
                .models
                .entry(model_route.model_session_id.clone())
                .or_insert_with(DrrRoute::new)
                .update(&model_route);
        }
    }

    /// Register a session locally before the scheduler's first route push,
    /// bootstrapping a uniform route over the known backends.
    pub fn add_model_session(&self, session: ModelSession) {
        let session_id = session.to_string();
        let mut routes = self.routes.lock();
        if routes.sessions.contains_key(&session_id) {
            return;
        }
        info!(session = %session_id, "Add model session");
        let bootstrap = ModelRoute {
            model_session_id: session_id.clone(),
            backend_rate: self
                .backends
                .iter()
                .map(|entry| BackendRate {
                    info: entry.info.clone(),
                    throughput: 1.0,
                })
                .collect(),
        };
        routes
            .models
            .entry(session_id.clone())
            .or_insert_with(DrrRoute::new)
            .update(&bootstrap);
        routes.sessions.insert(session_id, session);
    }

    /// Install a route directly (e.g. the one returned by LoadModel)
    pub fn set_model_route(&self, session: ModelSession, route: &ModelRoute) {
        let session_id = session.to_string();
        let mut routes = self.routes.lock();
        routes
            .models
            .entry(session_id.clone())
            .or_insert_with(DrrRoute::new)
            .update(route);
        routes.sessions.insert(session_id, session);
    }

    /// Apply a backend membership refresh, connecting to newcomers
    pub fn update_backend_list(&self, update: BackendListUpdate) {
        for info in update.backends {
            if self.backends.contains_key(&info.node_id) {
                continue;
            }
            match self.connector.connect(&info) {
                Some(handle) => {
                    info!(backend_id = %info.node_id, "Connected to backend");
                    self.backends
                        .insert(info.node_id, BackendEntry { info, handle });
                }
                None => warn!(backend_id = %info.node_id, "Failed to connect to backend"),
            }
        }
    }

    pub fn remove_backend(&self, node_id: NodeId) {
        if self.backends.remove(&node_id).is_some() {
            info!(backend_id = %node_id, "Disconnected backend");
        }
    }

    pub fn backend_count(&self) -> usize {
        self.backends.len()
    }
}
