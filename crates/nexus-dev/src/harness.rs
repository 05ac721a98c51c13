//! In-process cluster harness
//!
//! Wires a scheduler and a dispatcher together with recording node handles
//! so integration tests can drive the whole control loop synchronously and
//! assert on every push that crossed the fabric.

use dashmap::DashMap;
use nexus_core::time::unix_now_ns;
use nexus_core::wire::{
    BackendListUpdate, BatchPlan, DispatchReply, LoadModelReply, LoadModelRequest, ModelRoute,
    ModelRouteUpdates, ModelTableEntry, Query, QueryClock,
};
use nexus_core::{
    BackendInfo, DispatcherConfig, ModelSession, NodeId, ProfileDatabase, QueryId, Result,
    SchedulerConfig,
};
use nexus_dispatcher::{BackendConnector, Dispatcher};
use nexus_scheduler::handles::{BackendHandle, BackendPush, FrontendHandle, FrontendPush};
use nexus_scheduler::Scheduler;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Deterministic backend identity for tests
pub fn backend_info(node_id: u32) -> BackendInfo {
    BackendInfo {
        node_id: NodeId::new(node_id),
        host: "127.0.0.1".to_string(),
        port: 8000 + node_id as u16,
        gpu_device: "tesla_v100".to_string(),
        gpu_uuid: uuid::Uuid::new_v4().to_string(),
        gpu_available_memory: 16 << 30,
    }
}

/// Frontend handle that records every push for later assertions
#[derive(Default)]
pub struct RecordingFrontend {
    pushes: Mutex<Vec<FrontendPush>>,
}

impl RecordingFrontend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn pushes(&self) -> Vec<FrontendPush> {
        self.pushes.lock().clone()
    }

    pub fn take_pushes(&self) -> Vec<FrontendPush> {
        std::mem::take(&mut *self.pushes.lock())
    }

    /// Most recent route pushed for a session, if any
    pub fn latest_route(&self, session_id: &str) -> Option<ModelRoute> {
        self.pushes
            .lock()
            .iter()
            .rev()
            .find_map(|push| match push {
                FrontendPush::ModelRoutes(updates) => updates
                    .model_route
                    .iter()
                    .find(|route| route.model_session_id == session_id)
                    .cloned(),
                FrontendPush::BackendList(_) => None,
            })
    }
}

impl FrontendHandle for RecordingFrontend {
    fn update_model_routes(&self, updates: ModelRouteUpdates) {
        self.pushes.lock().push(FrontendPush::ModelRoutes(updates));
    }

    fn update_backend_list(&self, update: BackendListUpdate) {
        self.pushes.lock().push(FrontendPush::BackendList(update));
    }
}

/// Backend handle that records every push; can be told to refuse plans to
/// simulate a backend dying between route lookup and enqueue
#[derive(Default)]
pub struct RecordingBackend {
    pushes: Mutex<Vec<BackendPush>>,
    fail_enqueue: AtomicBool,
}

impl RecordingBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn pushes(&self) -> Vec<BackendPush> {
        self.pushes.lock().clone()
    }

    /// Batch plans enqueued so far
    pub fn plans(&self) -> Vec<BatchPlan> {
        self.pushes
            .lock()
            .iter()
            .filter_map(|push| match push {
                BackendPush::BatchPlan(plan) => Some(plan.clone()),
                _ => None,
            })
            .collect()
    }

    /// Most recent model table pushed by the scheduler
    pub fn latest_model_table(&self) -> Option<Vec<ModelTableEntry>> {
        self.pushes.lock().iter().rev().find_map(|push| match push {
            BackendPush::ModelTable(table) => Some(table.clone()),
            _ => None,
        })
    }

    pub fn set_fail_enqueue(&self, fail: bool) {
        self.fail_enqueue.store(fail, Ordering::SeqCst);
    }
}

impl BackendHandle for RecordingBackend {
    fn update_model_table(&self, table: Vec<ModelTableEntry>) {
        self.pushes.lock().push(BackendPush::ModelTable(table));
    }

    fn load_model(&self, session: ModelSession, max_batch: u32) {
        self.pushes
            .lock()
            .push(BackendPush::LoadModel { session, max_batch });
    }

    fn enqueue_batch_plan(&self, plan: BatchPlan) -> Result<()> {
        if self.fail_enqueue.load(Ordering::SeqCst) {
            return Err(nexus_core::Error::transport("backend refused plan"));
        }
        self.pushes.lock().push(BackendPush::BatchPlan(plan));
        Ok(())
    }
}

/// Connector handing out one [`RecordingBackend`] per node id
#[derive(Default)]
pub struct RecorderConnector {
    backends: DashMap<NodeId, Arc<RecordingBackend>>,
}

impl RecorderConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create or fetch the recorder for a node, for registration and
    /// inspection alike
    pub fn backend(&self, node_id: NodeId) -> Arc<RecordingBackend> {
        self.backends
            .entry(node_id)
            .or_insert_with(RecordingBackend::new)
            .clone()
    }
}

impl BackendConnector for RecorderConnector {
    fn connect(&self, info: &BackendInfo) -> Option<Arc<dyn BackendHandle>> {
        Some(self.backend(info.node_id))
    }
}

/// A scheduler and dispatcher wired over recording handles.
pub struct TestCluster {
    pub scheduler: Arc<Scheduler>,
    pub dispatcher: Arc<Dispatcher>,
    pub connector: Arc<RecorderConnector>,
    frontends: Mutex<HashMap<NodeId, Arc<RecordingFrontend>>>,
    next_query_id: Mutex<u64>,
}

impl TestCluster {
    pub fn new(
        scheduler_config: SchedulerConfig,
        dispatcher_config: DispatcherConfig,
        profiles: Arc<dyn ProfileDatabase>,
    ) -> Self {
        let connector = RecorderConnector::new();
        Self {
            scheduler: Arc::new(Scheduler::new(scheduler_config, profiles.clone())),
            dispatcher: Arc::new(Dispatcher::new(
                dispatcher_config,
                profiles,
                connector.clone(),
            )),
            connector,
            frontends: Mutex::new(HashMap::new()),
            next_query_id: Mutex::new(0),
        }
    }

    /// Cluster where every GPU sustains exactly `rps` requests per second
    pub fn with_capacity(rps: f64) -> Self {
        Self::new(
            SchedulerConfig::default(),
            DispatcherConfig::default(),
            Arc::new(crate::profiles::MockProfileDatabase::with_capacity(rps)),
        )
    }

    pub fn register_frontend(&self, node_id: u32) -> Result<Arc<RecordingFrontend>> {
        let frontend = RecordingFrontend::new();
        self.scheduler
            .register_frontend(NodeId::new(node_id), frontend.clone())?;
        self.frontends
            .lock()
            .insert(NodeId::new(node_id), frontend.clone());
        Ok(frontend)
    }

    /// Register a backend with the scheduler and connect the dispatcher to it
    pub fn register_backend(&self, node_id: u32) -> Result<Arc<RecordingBackend>> {
        let info = backend_info(node_id);
        debug!(backend_id = %info.node_id, "Register test backend");
        let recorder = self.connector.backend(info.node_id);
        self.scheduler.register_backend(info.clone(), recorder.clone())?;
        self.dispatcher.update_backend_list(BackendListUpdate {
            backends: vec![info],
        });
        Ok(recorder)
    }

    pub fn frontend(&self, node_id: u32) -> Option<Arc<RecordingFrontend>> {
        self.frontends.lock().get(&NodeId::new(node_id)).cloned()
    }

    /// Admit a session for a frontend and install the returned route into
    /// the dispatcher
    pub fn load_model(
        &self,
        frontend_id: u32,
        session: &ModelSession,
        workload: f64,
    ) -> LoadModelReply {
        let reply = self.scheduler.load_model(LoadModelRequest {
            node_id: NodeId::new(frontend_id),
            model_session: session.clone(),
            estimate_workload: workload,
        });
        if let Some(route) = &reply.model_route {
            self.dispatcher.set_model_route(session.clone(), route);
        }
        reply
    }

    /// Drain a frontend's recorded route pushes into the dispatcher,
    /// mirroring what the frontend transport does in production
    pub fn apply_route_updates(&self, frontend_id: u32) {
        let Some(frontend) = self.frontend(frontend_id) else {
            return;
        };
        for push in frontend.take_pushes() {
            match push {
                FrontendPush::ModelRoutes(updates) => {
                    self.dispatcher.update_model_routes(updates);
                }
                FrontendPush::BackendList(update) => {
                    self.dispatcher.update_backend_list(update);
                }
            }
        }
    }

    /// Dispatch one query as `frontend_id`, stamping the receive clock
    pub fn dispatch(&self, frontend_id: u32, session_id: &str) -> Option<DispatchReply> {
        let query_id = {
            let mut next = self.next_query_id.lock();
            *next += 1;
            *next
        };
        self.dispatcher.dispatch_request(Query {
            query_id: QueryId::new(query_id),
            global_id: Default::default(),
            model_session_id: session_id.to_string(),
            frontend_id: NodeId::new(frontend_id),
            clock: QueryClock {
                frontend_recv_ns: unix_now_ns(),
                ..Default::default()
            },
        })
    }
}
