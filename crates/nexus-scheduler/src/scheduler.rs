//! The global scheduler
//!
//! One control task ticks every beacon interval: it folds reported workloads
//! into per-session rate histories, reaps dead nodes, and decides whether to
//! run an epoch schedule. Epochs re-plan the backend-to-session assignment
//! from the latest rate estimates, spill overloaded backends, place whatever
//! is still owed, and push the results to every affected node.
//!
//! All state lives behind one mutex. Nothing under the mutex blocks: pushes
//! to nodes go through the non-blocking handles in [`crate::handles`].

use crate::backend::BackendDelegate;
use crate::frontend::FrontendDelegate;
use crate::handles::{BackendHandle, FrontendHandle};
use crate::instance::InstanceInfo;
use crate::session::SessionInfo;
use nexus_core::wire::{
    BackendListUpdate, BackendRate, CtrlStatus, LoadModelReply, LoadModelRequest, ModelRoute,
    ModelRouteUpdates, RegisterReply, WorkloadStats,
};
use nexus_core::{BackendInfo, ModelSession, NodeId, NodeType, ProfileDatabase, Result, SchedulerConfig};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Arena index of a session record. Prefix-linked sessions share one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct SessionSlot(u64);

/// One model entry of a static workload file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticModelSpec {
    pub framework: String,
    pub model_name: String,
    pub version: u32,
    #[serde(default)]
    pub image_height: Option<u32>,
    #[serde(default)]
    pub image_width: Option<u32>,
    pub latency_sla_us: u64,
    /// Fixed serving rate the backend is sized for
    #[serde(default)]
    pub rate: f64,
    /// Register the pinned backend as a backup instead of a primary host
    #[serde(default)]
    pub backup: bool,
}

impl StaticModelSpec {
    pub fn session(&self) -> ModelSession {
        let mut session = ModelSession::new(
            self.framework.clone(),
            self.model_name.clone(),
            self.version,
            self.latency_sla_us,
        );
        if let (Some(h), Some(w)) = (self.image_height, self.image_width) {
            session = session.with_input_dims(h, w);
        }
        session
    }
}

struct State {
    frontends: BTreeMap<NodeId, FrontendDelegate>,
    backends: BTreeMap<NodeId, BackendDelegate>,

    /// Canonical session id -> arena slot
    session_slots: HashMap<String, SessionSlot>,

    /// Arena of session records
    sessions: BTreeMap<SessionSlot, SessionInfo>,

    next_slot: u64,

    /// Static workload table loaded at startup, indexed by workload id
    static_workloads: Vec<Vec<StaticModelSpec>>,

    /// workload id -> backend currently pinned to it
    assigned_static_workloads: BTreeMap<usize, NodeId>,
}

impl State {
    fn slot_of(&self, session_id: &str) -> Option<SessionSlot> {
        self.session_slots.get(session_id).copied()
    }

    fn insert_session(&mut self, info: SessionInfo) -> SessionSlot {
        let slot = SessionSlot(self.next_slot);
        self.next_slot += 1;
        for session in &info.model_sessions {
            self.session_slots.insert(session.to_string(), slot);
        }
        self.sessions.insert(slot, info);
        slot
    }

    /// Build the wire route for one session id from its record
    fn model_route(&self, session_id: &str) -> Option<ModelRoute> {
        let slot = self.slot_of(session_id)?;
        let record = self.sessions.get(&slot)?;
        let backend_rate = record
            .backend_weights
            .iter()
            .filter_map(|(backend_id, weight)| {
                self.backends.get(backend_id).map(|backend| BackendRate {
                    info: backend.info().clone(),
                    throughput: *weight,
                })
            })
            .collect();
        Some(ModelRoute {
            model_session_id: session_id.to_string(),
            backend_rate,
        })
    }

    fn backend_list(&self) -> BackendListUpdate {
        BackendListUpdate {
            backends: self.backends.values().map(|b| b.info().clone()).collect(),
        }
    }
}

/// The global scheduler. Cheap to share: all methods take `&self`.
pub struct Scheduler {
    config: SchedulerConfig,
    profiles: Arc<dyn ProfileDatabase>,
    state: Mutex<State>,
    running: AtomicBool,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, profiles: Arc<dyn ProfileDatabase>) -> Self {
        if !config.enable_epoch_schedule {
            info!("Epoch scheduling is off");
        }
        Self {
            config,
            profiles,
            state: Mutex::new(State {
                frontends: BTreeMap::new(),
                backends: BTreeMap::new(),
                session_slots: HashMap::new(),
                sessions: BTreeMap::new(),
                next_slot: 0,
                static_workloads: Vec::new(),
                assigned_static_workloads: BTreeMap::new(),
            }),
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Load the static workload table from a YAML file: a list of backend
    /// entries, each a list of model specs.
    pub fn load_workload_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        info!("Load workload file from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        let workloads: Vec<Vec<StaticModelSpec>> = serde_yaml::from_str(&text)?;
        for (id, models) in workloads.iter().enumerate() {
            info!("Workload {}: {} models", id, models.len());
        }
        self.state.lock().static_workloads = workloads;
        Ok(())
    }

    /// Install static workloads directly (tests, embedded deployments)
    pub fn set_static_workloads(&self, workloads: Vec<Vec<StaticModelSpec>>) {
        self.state.lock().static_workloads = workloads;
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    pub fn register_frontend(
        &self,
        node_id: NodeId,
        handle: Arc<dyn FrontendHandle>,
    ) -> Result<RegisterReply> {
        let mut state = self.state.lock();
        if state.frontends.contains_key(&node_id) {
            return Err(nexus_core::Error::node_conflict(format!(
                "frontend {}",
                node_id
            )));
        }
        let frontend = FrontendDelegate::new(node_id, handle);
        frontend.update_backend_list(state.backend_list());
        state.frontends.insert(node_id, frontend);
        info!(frontend_id = %node_id, "Register frontend");
        Ok(RegisterReply {
            status: CtrlStatus::Ok,
            beacon_interval_sec: self.config.beacon_interval_sec,
        })
    }

    pub fn register_backend(
        &self,
        info: BackendInfo,
        handle: Arc<dyn BackendHandle>,
    ) -> Result<RegisterReply> {
        let mut state = self.state.lock();
        let node_id = info.node_id;
        if state.backends.contains_key(&node_id) {
            return Err(nexus_core::Error::node_conflict(format!(
                "backend {}",
                node_id
            )));
        }
        info!(backend_id = %node_id, gpu = %info.gpu_device, "Register backend");
        let backend = BackendDelegate::new(info, handle, self.profiles.clone());
        state.backends.insert(node_id, backend);
        self.add_backend(&mut state, node_id);

        // Tell every frontend about the new backend
        let update = BackendListUpdate {
            backends: vec![state.backends[&node_id].info().clone()],
        };
        for frontend in state.frontends.values() {
            frontend.update_backend_list(update.clone());
        }
        Ok(RegisterReply {
            status: CtrlStatus::Ok,
            beacon_interval_sec: self.config.beacon_interval_sec,
        })
    }

    pub fn unregister_frontend(&self, node_id: NodeId) -> Result<()> {
        let mut state = self.state.lock();
        let frontend = state
            .frontends
            .remove(&node_id)
            .ok_or_else(|| nexus_core::Error::not_registered(format!("frontend {}", node_id)))?;
        info!(frontend_id = %node_id, "Remove frontend");
        self.remove_frontend(&mut state, frontend);
        Ok(())
    }

    pub fn unregister_backend(&self, node_id: NodeId) -> Result<()> {
        let mut state = self.state.lock();
        let backend = state
            .backends
            .remove(&node_id)
            .ok_or_else(|| nexus_core::Error::not_registered(format!("backend {}", node_id)))?;
        info!(backend_id = %node_id, "Remove backend");
        self.remove_backend(&mut state, backend);
        Ok(())
    }

    pub fn keep_alive(&self, node_id: NodeId, node_type: NodeType) -> Result<()> {
        let mut state = self.state.lock();
        match node_type {
            NodeType::Frontend => state
                .frontends
                .get_mut(&node_id)
                .map(FrontendDelegate::tick)
                .ok_or_else(|| nexus_core::Error::not_registered(format!("frontend {}", node_id))),
            NodeType::Backend => state
                .backends
                .get_mut(&node_id)
                .map(BackendDelegate::tick)
                .ok_or_else(|| nexus_core::Error::not_registered(format!("backend {}", node_id))),
        }
    }

    // ------------------------------------------------------------------
    // Admission and workload reports
    // ------------------------------------------------------------------

    /// Admit a model session for a frontend.
    ///
    /// If the session is already live the frontend just subscribes; epoch
    /// scheduling will grow capacity as its reports come in. A fresh session
    /// is placed transactionally: either the whole estimated workload fits
    /// or nothing is committed.
    pub fn load_model(&self, request: LoadModelRequest) -> LoadModelReply {
        let mut state = self.state.lock();
        let model_sess_id = request.model_session.to_string();
        if !state.frontends.contains_key(&request.node_id) {
            return LoadModelReply {
                status: CtrlStatus::NotRegistered,
                model_route: None,
            };
        }

        if let Some(slot) = state.slot_of(&model_sess_id) {
            // Already loaded: subscribe and return the current route.
            // Capacity adjustments are epoch scheduling's job.
            if let Some(record) = state.sessions.get_mut(&slot) {
                record.subscribe(request.node_id, model_sess_id.clone());
            }
            if let Some(frontend) = state.frontends.get_mut(&request.node_id) {
                frontend.subscribe_model(model_sess_id.clone());
            }
            let route = state.model_route(&model_sess_id);
            return LoadModelReply {
                status: CtrlStatus::Ok,
                model_route: route,
            };
        }

        // Find best-fit backends for the estimated workload without
        // committing anything.
        let mut assignments: Vec<(NodeId, InstanceInfo)> = Vec::new();
        let mut used: HashSet<NodeId> = HashSet::new();
        let mut workload = request.estimate_workload;
        if workload.abs() < 1e-3 {
            match find_best_backend(&state.backends, &request.model_session, 0.0, &used) {
                Some(found) => assignments.push(found),
                None => {
                    return LoadModelReply {
                        status: CtrlStatus::NotEnoughBackends,
                        model_route: None,
                    }
                }
            }
        } else {
            while workload > 1e-3 {
                match find_best_backend(&state.backends, &request.model_session, workload, &used) {
                    Some((backend_id, inst)) => {
                        used.insert(backend_id);
                        workload -= inst.throughput();
                        assignments.push((backend_id, inst));
                    }
                    None => {
                        return LoadModelReply {
                            status: CtrlStatus::NotEnoughBackends,
                            model_route: None,
                        }
                    }
                }
            }
        }

        // Commit
        let mut record = SessionInfo::new(request.model_session.clone());
        for (backend_id, inst) in assignments {
            record.backend_weights.insert(backend_id, inst.weight());
            if let Some(backend) = state.backends.get_mut(&backend_id) {
                backend.load_model(inst);
                backend.update_model_table_rpc();
            }
        }
        record.subscribe(request.node_id, model_sess_id.clone());
        state.insert_session(record);
        if let Some(frontend) = state.frontends.get_mut(&request.node_id) {
            frontend.subscribe_model(model_sess_id.clone());
        }
        info!(session = %model_sess_id, workload = request.estimate_workload, "Load model");
        LoadModelReply {
            status: CtrlStatus::Ok,
            model_route: state.model_route(&model_sess_id),
        }
    }

    /// Attach a prefix-shared session to a live one. The child rides on the
    /// parent's instances and shares its record; frontends subscribe to it
    /// through the ordinary LoadModel path afterwards.
    pub fn load_prefix_model(&self, parent_id: &str, child: ModelSession) -> Result<()> {
        let mut state = self.state.lock();
        let slot = state
            .slot_of(parent_id)
            .ok_or_else(|| nexus_core::Error::model_not_found(parent_id.to_string()))?;
        let child_id = child.to_string();
        if state.slot_of(&child_id).is_some() {
            return Err(nexus_core::Error::invalid_load_model(format!(
                "session {} already loaded",
                child_id
            )));
        }
        let (primary_id, hosting) = match state.sessions.get(&slot) {
            Some(record) => (
                record.primary_id(),
                record.backend_weights.keys().copied().collect::<Vec<_>>(),
            ),
            None => return Err(nexus_core::Error::model_not_found(parent_id.to_string())),
        };
        for backend_id in &hosting {
            if let Some(backend) = state.backends.get_mut(backend_id) {
                backend.load_prefix_model(child.clone(), &primary_id);
                backend.update_model_table_rpc();
            }
        }
        if let Some(record) = state.sessions.get_mut(&slot) {
            record.model_sessions.push(child);
        }
        state.session_slots.insert(child_id.clone(), slot);
        info!(parent = parent_id, child = %child_id, "Load prefix model");
        Ok(())
    }

    /// Load the workload file named in the configuration, if any
    pub fn load_configured_workloads(&self) -> Result<()> {
        if let Some(path) = self.config.workload_file.clone() {
            self.load_workload_file(path)?;
        }
        Ok(())
    }

    /// Fold a frontend's workload report into the per-session rate state
    pub fn report_workload(&self, stats: WorkloadStats) -> Result<()> {
        let mut state = self.state.lock();
        if !state.frontends.contains_key(&stats.node_id) {
            return Err(nexus_core::Error::not_registered(format!(
                "frontend {}",
                stats.node_id
            )));
        }
        for model_stats in stats.model_stats {
            match state.slot_of(&model_stats.model_session_id) {
                Some(slot) => {
                    if let Some(record) = state.sessions.get_mut(&slot) {
                        record.update_workload(stats.node_id, model_stats.rate);
                    }
                }
                None => warn!(
                    session = %model_stats.model_session_id,
                    "Workload report for unknown session"
                ),
            }
        }
        Ok(())
    }

    pub fn get_model_route(&self, session_id: &str) -> Option<ModelRoute> {
        self.state.lock().model_route(session_id)
    }

    // ------------------------------------------------------------------
    // Beacon loop
    // ------------------------------------------------------------------

    /// Run the control loop until [`Scheduler::stop`] is called
    pub async fn run(self: Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        let beacon = Duration::from_secs(self.config.beacon_interval_sec);
        let mut last_epoch = Instant::now();
        tokio::time::sleep(beacon).await;
        while self.running.load(Ordering::SeqCst) {
            let trigger = self.beacon_tick();
            if self.config.enable_epoch_schedule {
                let elapsed = last_epoch.elapsed();
                let due = if trigger {
                    elapsed >= Duration::from_secs(self.config.min_epoch_sec)
                } else {
                    elapsed >= Duration::from_secs(self.config.epoch_interval_sec)
                };
                if due {
                    self.epoch_schedule();
                    last_epoch = Instant::now();
                }
            }
            tokio::time::sleep(beacon).await;
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// One beacon: reap dead nodes, refresh rate histories, and report
    /// whether any session's rate has drifted far enough to warrant an
    /// early epoch.
    pub fn beacon_tick(&self) -> bool {
        self.reap_dead_nodes();
        self.beacon_check()
    }

    /// Aggregate reported rates into histories and compute the epoch trigger
    pub fn beacon_check(&self) -> bool {
        let mut state = self.state.lock();
        let history_len = self.config.history_len();

        for record in state.sessions.values_mut() {
            let rps = record.aggregate_rps();
            record.push_history(rps, history_len);
            debug!(
                session = %record.primary_id(),
                rps,
                "Beacon rate sample"
            );
        }

        let mut trigger = false;
        for record in state.sessions.values() {
            if record.rps_history.len() < history_len {
                continue;
            }
            let estimate_rps = record.estimate_rps(self.config.min_rate);
            let throughput = record.total_throughput();
            if estimate_rps < throughput * self.config.trigger_low
                || estimate_rps > throughput * self.config.trigger_high
            {
                trigger = true;
                break;
            }
        }
        trigger
    }

    /// Evict nodes whose keepalive has lapsed
    fn reap_dead_nodes(&self) {
        let timeout = Duration::from_secs(
            self.config.beacon_interval_sec * self.config.keepalive_timeout_intervals,
        );
        let mut state = self.state.lock();

        let dead_frontends: Vec<NodeId> = state
            .frontends
            .values()
            .filter(|f| f.last_seen().elapsed() > timeout)
            .map(|f| f.node_id())
            .collect();
        for node_id in dead_frontends {
            warn!(frontend_id = %node_id, "Frontend keepalive lapsed, evicting");
            if let Some(frontend) = state.frontends.remove(&node_id) {
                self.remove_frontend(&mut state, frontend);
            }
        }

        let dead_backends: Vec<NodeId> = state
            .backends
            .values()
            .filter(|b| b.last_seen().elapsed() > timeout)
            .map(|b| b.node_id())
            .collect();
        for node_id in dead_backends {
            warn!(backend_id = %node_id, "Backend keepalive lapsed, evicting");
            if let Some(backend) = state.backends.remove(&node_id) {
                self.remove_backend(&mut state, backend);
            }
        }
    }

    // ------------------------------------------------------------------
    // Epoch scheduling
    // ------------------------------------------------------------------

    /// Re-plan the whole backend-to-session assignment from current rates
    pub fn epoch_schedule(&self) {
        let mut state = self.state.lock();
        let history_len = self.config.history_len();
        let mut changed_sessions: HashSet<SessionSlot> = HashSet::new();
        let mut overload_backends: Vec<NodeId> = Vec::new();

        debug!("Epoch schedule");
        // 1. Adjust allocations session by session
        let slots: Vec<SessionSlot> = state.sessions.keys().copied().collect();
        for slot in slots {
            let (throughput, estimate_rps, session_id) = match state.sessions.get(&slot) {
                Some(record) if record.rps_history.len() >= history_len => (
                    record.total_throughput(),
                    record.estimate_rps(self.config.min_rate),
                    record.primary_id(),
                ),
                _ => continue,
            };
            if let Some(record) = state.sessions.get_mut(&slot) {
                record.unassigned_workload = (estimate_rps - throughput).max(0.0);
            }
            debug!(
                session = %session_id,
                estimate_rps,
                throughput,
                "Epoch estimate"
            );

            if estimate_rps < throughput * self.config.release_threshold {
                self.shrink_session(&mut state, slot, &session_id, estimate_rps);
                changed_sessions.insert(slot);
            } else if estimate_rps > throughput {
                self.grow_session(
                    &mut state,
                    slot,
                    &session_id,
                    estimate_rps,
                    &mut overload_backends,
                );
                changed_sessions.insert(slot);
            }
        }

        // 2. Spill overloaded backends
        for backend_id in overload_backends {
            let spilled = match state.backends.get_mut(&backend_id) {
                Some(backend) => backend.spill_out_workload(),
                None => continue,
            };
            for (sessions, rate) in spilled {
                let primary_id = sessions[0].to_string();
                if let Some(slot) = state.slot_of(&primary_id) {
                    if let Some(record) = state.sessions.get_mut(&slot) {
                        record.backend_weights.remove(&backend_id);
                        record.unassigned_workload += rate;
                    }
                    changed_sessions.insert(slot);
                }
            }
        }

        // 3. Consolidate low-utilization backends
        if self.config.enable_consolidation {
            self.consolidate_backends(&mut state, &mut changed_sessions);
        }

        // 4. Place whatever is still owed
        allocate_unassigned_workloads(&mut state, &mut changed_sessions, None);

        // 5. Push model tables and changed routes
        for backend in state.backends.values() {
            backend.update_model_table_rpc();
        }
        update_model_routes(&state, &changed_sessions);

        display_model_table(&state);
    }

    /// Release capacity from a session whose rate dropped. Statically pinned
    /// backends keep their share; adjustable backends shed largest-first.
    fn shrink_session(
        &self,
        state: &mut State,
        slot: SessionSlot,
        session_id: &str,
        estimate_rps: f64,
    ) {
        let mut remaining = estimate_rps;
        let mut adjustable: Vec<(NodeId, f64)> = Vec::new();
        if let Some(record) = state.sessions.get(&slot) {
            for (&backend_id, &weight) in &record.backend_weights {
                let is_static = state
                    .backends
                    .get(&backend_id)
                    .map_or(false, |b| b.workload_id() >= 0);
                if is_static {
                    remaining -= weight;
                } else {
                    adjustable.push((backend_id, weight));
                }
            }
        }
        adjustable.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        for (backend_id, weight) in adjustable {
            if remaining < 1e-3 {
                if let Some(backend) = state.backends.get_mut(&backend_id) {
                    backend.unload_model(session_id);
                }
                if let Some(record) = state.sessions.get_mut(&slot) {
                    record.backend_weights.remove(&backend_id);
                }
            } else if weight > remaining {
                let (granted, new_weight) = match state.backends.get_mut(&backend_id) {
                    Some(backend) => {
                        let granted = backend.update_model_throughput(session_id, remaining);
                        (granted, backend.get_model_weight(session_id).unwrap_or(0.0))
                    }
                    None => continue,
                };
                if let Some(record) = state.sessions.get_mut(&slot) {
                    record.backend_weights.insert(backend_id, new_weight);
                }
                remaining -= granted;
            } else {
                remaining -= weight;
            }
        }
    }

    /// Grow a session whose rate exceeds its allocation, re-planning each
    /// adjustable backend towards the residual rate and noting overloads.
    fn grow_session(
        &self,
        state: &mut State,
        slot: SessionSlot,
        session_id: &str,
        estimate_rps: f64,
        overload_backends: &mut Vec<NodeId>,
    ) {
        let mut remaining = estimate_rps;
        let mut adjustable: Vec<(NodeId, f64)> = Vec::new();
        if let Some(record) = state.sessions.get(&slot) {
            for (&backend_id, &weight) in &record.backend_weights {
                let is_static = state
                    .backends
                    .get(&backend_id)
                    .map_or(false, |b| b.workload_id() >= 0);
                if is_static {
                    remaining -= weight;
                } else {
                    adjustable.push((backend_id, weight));
                }
            }
        }
        adjustable.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        for (backend_id, _weight) in adjustable {
            if remaining < 1e-3 {
                if let Some(backend) = state.backends.get_mut(&backend_id) {
                    backend.unload_model(session_id);
                }
                if let Some(record) = state.sessions.get_mut(&slot) {
                    record.backend_weights.remove(&backend_id);
                }
            } else {
                let (granted, new_weight, overloaded) = match state.backends.get_mut(&backend_id) {
                    Some(backend) => {
                        let granted = backend.update_model_throughput(session_id, remaining);
                        let weight = backend.get_model_weight(session_id).unwrap_or(0.0);
                        let overloaded = backend.overload()
                            && backend.occupancy() > self.config.overload_occupancy;
                        (granted, weight, overloaded)
                    }
                    None => continue,
                };
                if let Some(record) = state.sessions.get_mut(&slot) {
                    record.backend_weights.insert(backend_id, new_weight);
                }
                remaining -= granted;
                if overloaded {
                    overload_backends.push(backend_id);
                }
            }
        }

        if let Some(record) = state.sessions.get_mut(&slot) {
            record.unassigned_workload = if remaining > 1e-3 { remaining } else { 0.0 };
        }
    }

    /// Drain lightly-loaded backends onto their peers to free whole GPUs.
    /// Reached only when `enable_consolidation` is set.
    fn consolidate_backends(&self, state: &mut State, changed_sessions: &mut HashSet<SessionSlot>) {
        let mut skip: HashSet<NodeId> = HashSet::new();
        let mut pool: Vec<NodeId> = Vec::new();
        for (&backend_id, backend) in &state.backends {
            if backend.occupancy() == 0.0 {
                skip.insert(backend_id);
            } else {
                pool.push(backend_id);
            }
        }

        while !pool.is_empty() {
            pool.sort_by(|a, b| {
                let occ_a = state.backends.get(a).map_or(0.0, BackendDelegate::occupancy);
                let occ_b = state.backends.get(b).map_or(0.0, BackendDelegate::occupancy);
                occ_b.partial_cmp(&occ_a).unwrap_or(std::cmp::Ordering::Equal)
            });
            let Some(victim_id) = pool.pop() else { break };
            skip.insert(victim_id);

            let instances: Vec<InstanceInfo> = match state.backends.get(&victim_id) {
                Some(backend) => backend.instances().cloned().collect(),
                None => continue,
            };
            let mut full = false;
            for inst in instances {
                let Some((target_id, new_inst)) =
                    find_best_backend(&state.backends, inst.primary(), inst.workload(), &skip)
                else {
                    full = true;
                    break;
                };
                if let Some(backend) = state.backends.get_mut(&victim_id) {
                    backend.unload_model(&inst.session_id());
                }
                let new_weight = new_inst.weight();
                let primary_id = new_inst.session_id();
                if let Some(target) = state.backends.get_mut(&target_id) {
                    target.load_model(new_inst);
                    for child in inst.sessions().iter().skip(1) {
                        target.load_prefix_model(child.clone(), &primary_id);
                    }
                }
                if let Some(slot) = state.slot_of(&primary_id) {
                    if let Some(record) = state.sessions.get_mut(&slot) {
                        record.backend_weights.remove(&victim_id);
                        record.backend_weights.insert(target_id, new_weight);
                    }
                    changed_sessions.insert(slot);
                }
                info!(
                    session = %primary_id,
                    from = %victim_id,
                    to = %target_id,
                    "Consolidate model instance"
                );
            }
            if full {
                break;
            }
        }
    }

    // ------------------------------------------------------------------
    // Backend join / leave
    // ------------------------------------------------------------------

    /// Wire a newly registered backend into the assignment: pin it to the
    /// first unassigned static workload if one exists, otherwise offer its
    /// capacity to sessions still owed throughput.
    fn add_backend(&self, state: &mut State, backend_id: NodeId) {
        let mut changed_sessions: HashSet<SessionSlot> = HashSet::new();
        let mut changed_backends: BTreeSet<NodeId> = BTreeSet::new();

        // 1. Static workload to assign?
        let assign_load_id = (0..state.static_workloads.len())
            .find(|id| !state.assigned_static_workloads.contains_key(id));
        if let Some(load_id) = assign_load_id {
            info!(workload = load_id, backend_id = %backend_id, "Assign static workload");
            state.assigned_static_workloads.insert(load_id, backend_id);
            let specs = state.static_workloads[load_id].clone();
            if let Some(backend) = state.backends.get_mut(&backend_id) {
                for spec in specs.iter().filter(|spec| !spec.backup) {
                    if let Err(err) = backend.load_static_model(spec.session(), spec.rate) {
                        warn!(
                            session = %spec.session(),
                            backend_id = %backend_id,
                            error = %err,
                            "Skipping static model"
                        );
                    }
                }
                backend.set_workload_id(load_id as i32);
            }
            changed_backends.insert(backend_id);

            // Session records for everything the backend now hosts
            for spec in &specs {
                let session = spec.session();
                let session_id = session.to_string();
                let slot = match state.slot_of(&session_id) {
                    Some(slot) => slot,
                    None => {
                        let mut record = SessionInfo::new(session.clone());
                        record.has_static_workload = true;
                        state.insert_session(record)
                    }
                };
                if spec.backup {
                    if let Some(backend) = state.backends.get_mut(&backend_id) {
                        backend.add_backup_session(session_id.clone());
                    }
                    if let Some(record) = state.sessions.get_mut(&slot) {
                        record.backup_backends.insert(backend_id);
                    }
                } else {
                    let weight = state
                        .backends
                        .get(&backend_id)
                        .and_then(|b| b.get_model_weight(&session_id))
                        .unwrap_or(0.0);
                    if let Some(record) = state.sessions.get_mut(&slot) {
                        record.backend_weights.insert(backend_id, weight);
                    }
                }
                changed_sessions.insert(slot);
            }
        } else {
            // 2. Offer the capacity to unassigned workloads
            allocate_unassigned_workloads(
                state,
                &mut changed_sessions,
                Some(&mut changed_backends),
            );
        }

        // 3. Push model tables and routes
        for id in &changed_backends {
            if let Some(backend) = state.backends.get(id) {
                backend.update_model_table_rpc();
            }
        }
        update_model_routes(state, &changed_sessions);
    }

    /// Tear a departing backend out of the assignment, migrating its whole
    /// load onto an idle peer when possible and re-queueing it otherwise.
    fn remove_backend(&self, state: &mut State, backend: BackendDelegate) {
        if backend.is_idle() {
            if backend.workload_id() >= 0 {
                state
                    .assigned_static_workloads
                    .remove(&(backend.workload_id() as usize));
            }
            return;
        }
        let backend_id = backend.node_id();
        let mut changed_sessions: HashSet<SessionSlot> = HashSet::new();
        let mut changed_backends: BTreeSet<NodeId> = BTreeSet::new();

        // 1. Drop the backend from every session it served
        let model_sessions = backend.model_sessions();
        for session_id in &model_sessions {
            if let Some(slot) = state.slot_of(session_id) {
                if changed_sessions.insert(slot) {
                    if let Some(record) = state.sessions.get_mut(&slot) {
                        record.backend_weights.remove(&backend_id);
                    }
                }
            }
        }

        // 2. Try to hand the whole load to an idle peer
        let idle_peers: Vec<NodeId> = state
            .backends
            .values()
            .filter(|b| b.is_idle())
            .map(|b| b.node_id())
            .collect();
        let mut assigned: Option<NodeId> = None;
        for peer_id in idle_peers {
            let accepted = state
                .backends
                .get_mut(&peer_id)
                .map_or(false, |peer| peer.assign(&backend));
            if accepted {
                assigned = Some(peer_id);
                break;
            }
        }

        if let Some(peer_id) = assigned {
            let weights: Vec<(String, f64)> = model_sessions
                .iter()
                .map(|session_id| {
                    let throughput = state
                        .backends
                        .get(&peer_id)
                        .and_then(|peer| peer.get_model_throughput(session_id))
                        .unwrap_or(0.0);
                    (session_id.clone(), throughput)
                })
                .collect();
            for (session_id, throughput) in weights {
                if let Some(slot) = state.slot_of(&session_id) {
                    if let Some(record) = state.sessions.get_mut(&slot) {
                        record.backend_weights.insert(peer_id, throughput);
                    }
                }
            }
            if backend.workload_id() >= 0 {
                info!(
                    workload = backend.workload_id(),
                    backend_id = %peer_id,
                    "Reassign static workload"
                );
                state
                    .assigned_static_workloads
                    .insert(backend.workload_id() as usize, peer_id);
            }
            // Migrate backup relations onto the peer
            for session_id in backend.backup_sessions() {
                if let Some(slot) = state.slot_of(session_id) {
                    if let Some(record) = state.sessions.get_mut(&slot) {
                        record.backup_backends.remove(&backend_id);
                        record.backup_backends.insert(peer_id);
                    }
                }
            }
            changed_backends.insert(peer_id);
        } else {
            for session_id in backend.backup_sessions() {
                if let Some(slot) = state.slot_of(session_id) {
                    if let Some(record) = state.sessions.get_mut(&slot) {
                        record.backup_backends.remove(&backend_id);
                    }
                }
            }
            if backend.workload_id() >= 0 {
                info!(workload = backend.workload_id(), "Static workload unassigned");
                state
                    .assigned_static_workloads
                    .remove(&(backend.workload_id() as usize));
            } else {
                // 3. Credit the lost throughput and try to place it elsewhere
                for inst in backend.instances() {
                    if let Some(slot) = state.slot_of(&inst.session_id()) {
                        if let Some(record) = state.sessions.get_mut(&slot) {
                            record.unassigned_workload += inst.throughput();
                        }
                    }
                }
                allocate_unassigned_workloads(
                    state,
                    &mut changed_sessions,
                    Some(&mut changed_backends),
                );
            }
        }

        // 4. Push model tables and changed routes
        for id in &changed_backends {
            if let Some(peer) = state.backends.get(id) {
                peer.update_model_table_rpc();
            }
        }
        update_model_routes(state, &changed_sessions);
    }

    /// Unsubscribe a departing frontend everywhere, unloading sessions whose
    /// last subscriber it was.
    fn remove_frontend(&self, state: &mut State, frontend: FrontendDelegate) {
        let frontend_id = frontend.node_id();
        let mut update_backends: BTreeSet<NodeId> = BTreeSet::new();
        for session_id in frontend.subscribed_models() {
            let Some(slot) = state.slot_of(session_id) else {
                continue;
            };
            let remove = match state.sessions.get_mut(&slot) {
                Some(record) => {
                    record.workloads.remove(&frontend_id);
                    record.unsubscribe(frontend_id, session_id)
                }
                None => continue,
            };
            if !remove {
                continue;
            }
            info!(session = %session_id, "Remove model session");
            let hosting: Vec<NodeId> = state
                .sessions
                .get(&slot)
                .map(|record| record.backend_weights.keys().copied().collect())
                .unwrap_or_default();
            for backend_id in hosting {
                if let Some(backend) = state.backends.get_mut(&backend_id) {
                    backend.unload_model(session_id);
                    update_backends.insert(backend_id);
                }
            }
            state.session_slots.remove(session_id);
            let empty = match state.sessions.get_mut(&slot) {
                Some(record) => {
                    record.model_sessions.retain(|s| s.to_string() != *session_id);
                    record.model_sessions.is_empty()
                }
                None => false,
            };
            if empty {
                state.sessions.remove(&slot);
            }
        }
        for backend_id in update_backends {
            if let Some(backend) = state.backends.get(&backend_id) {
                backend.update_model_table_rpc();
            }
        }
    }

    // ------------------------------------------------------------------
    // Read-only views (tests, CLI surfaces)
    // ------------------------------------------------------------------

    pub fn session_backends(&self, session_id: &str) -> Option<BTreeMap<NodeId, f64>> {
        let state = self.state.lock();
        let slot = state.slot_of(session_id)?;
        state.sessions.get(&slot).map(|r| r.backend_weights.clone())
    }

    pub fn unassigned_workload(&self, session_id: &str) -> Option<f64> {
        let state = self.state.lock();
        let slot = state.slot_of(session_id)?;
        state.sessions.get(&slot).map(|r| r.unassigned_workload)
    }

    pub fn backend_occupancy(&self, node_id: NodeId) -> Option<f64> {
        self.state.lock().backends.get(&node_id).map(BackendDelegate::occupancy)
    }

    pub fn backend_workload_id(&self, node_id: NodeId) -> Option<i32> {
        self.state
            .lock()
            .backends
            .get(&node_id)
            .map(BackendDelegate::workload_id)
    }

    pub fn has_session(&self, session_id: &str) -> bool {
        self.state.lock().slot_of(session_id).is_some()
    }

    pub fn backend_count(&self) -> usize {
        self.state.lock().backends.len()
    }

    pub fn frontend_count(&self) -> usize {
        self.state.lock().frontends.len()
    }
}

/// The placement policy. Considers every adjustable backend not in `skips`
/// and returns the best candidate per the tie-break rules: bootstrap and
/// saturation favor raw throughput, the steady state bin-packs by occupancy.
fn find_best_backend(
    backends: &BTreeMap<NodeId, BackendDelegate>,
    session: &ModelSession,
    request_rate: f64,
    skips: &HashSet<NodeId>,
) -> Option<(NodeId, InstanceInfo)> {
    let mut max_tp: Option<(NodeId, InstanceInfo)> = None;
    let mut max_occ: Option<(NodeId, InstanceInfo, f64)> = None;
    for (&backend_id, backend) in backends {
        if skips.contains(&backend_id) {
            continue;
        }
        if backend.workload_id() >= 0 {
            continue;
        }
        if request_rate.abs() < 1e-3 && !backend.is_idle() {
            continue;
        }
        let Some((inst, occupancy)) = backend.prepare_load_model(session, request_rate) else {
            continue;
        };
        if max_tp
            .as_ref()
            .map_or(true, |(_, best)| inst.throughput() > best.throughput())
        {
            max_tp = Some((backend_id, inst.clone()));
        }
        if max_occ.as_ref().map_or(true, |(_, _, occ)| occupancy > *occ) {
            max_occ = Some((backend_id, inst, occupancy));
        }
    }

    if request_rate.abs() < 1e-3 {
        // Bootstrap a fresh instance on whichever GPU serves it fastest
        max_tp
    } else if max_tp
        .as_ref()
        .map_or(true, |(_, inst)| inst.throughput() < request_rate)
    {
        // No candidate satisfies the rate: saturate the biggest one
        max_tp
    } else {
        // Bin-pack: keep emptier backends free for future sessions
        max_occ.map(|(backend_id, inst, _)| (backend_id, inst))
    }
}

/// Place sessions still owed capacity, largest debt first. Residual debt
/// stays recorded for the next epoch.
fn allocate_unassigned_workloads(
    state: &mut State,
    changed_sessions: &mut HashSet<SessionSlot>,
    mut changed_backends: Option<&mut BTreeSet<NodeId>>,
) {
    let mut pending: Vec<(SessionSlot, f64)> = state
        .sessions
        .iter()
        .filter(|(_, record)| record.unassigned_workload > 1e-3)
        .map(|(&slot, record)| (slot, record.unassigned_workload))
        .collect();
    if pending.is_empty() {
        return;
    }
    pending.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let no_skips = HashSet::new();
    for (slot, _) in pending {
        let (mut request_rate, group) = match state.sessions.get(&slot) {
            Some(record) => (record.unassigned_workload, record.model_sessions.clone()),
            None => continue,
        };
        while request_rate > 1e-3 {
            let Some((backend_id, inst)) =
                find_best_backend(&state.backends, &group[0], request_rate, &no_skips)
            else {
                info!(
                    session = %group[0],
                    rate = request_rate,
                    "Workload left unassigned"
                );
                break;
            };
            request_rate -= inst.throughput();
            let weight = inst.weight();
            let primary_id = inst.session_id();
            if let Some(backend) = state.backends.get_mut(&backend_id) {
                backend.load_model(inst);
                for child in group.iter().skip(1) {
                    backend.load_prefix_model(child.clone(), &primary_id);
                }
            }
            if let Some(record) = state.sessions.get_mut(&slot) {
                record.backend_weights.insert(backend_id, weight);
            }
            changed_sessions.insert(slot);
            if let Some(changed) = changed_backends.as_deref_mut() {
                changed.insert(backend_id);
            }
        }
        if request_rate.abs() < 1e-3 {
            request_rate = 0.0;
        }
        if let Some(record) = state.sessions.get_mut(&slot) {
            record.unassigned_workload = request_rate.max(0.0);
        }
    }
}

/// Push refreshed routes for the changed sessions to their subscribers
fn update_model_routes(state: &State, changed_sessions: &HashSet<SessionSlot>) {
    let mut frontend_updates: BTreeMap<NodeId, ModelRouteUpdates> = BTreeMap::new();
    for slot in changed_sessions {
        let Some(record) = state.sessions.get(slot) else {
            continue;
        };
        for (session_id, subscribers) in &record.session_subscribers {
            let Some(route) = state.model_route(session_id) else {
                continue;
            };
            for frontend_id in subscribers {
                frontend_updates
                    .entry(*frontend_id)
                    .or_default()
                    .model_route
                    .push(route.clone());
            }
        }
    }
    for (frontend_id, updates) in frontend_updates {
        if let Some(frontend) = state.frontends.get(&frontend_id) {
            frontend.update_model_routes(updates);
        }
    }
}

/// Log per-backend occupancy and the per-session share table
fn display_model_table(state: &State) {
    for backend in state.backends.values() {
        let occupancy = backend.occupancy();
        if occupancy > 0.0 {
            debug!(backend_id = %backend.node_id(), occupancy, "Backend occupancy");
        }
    }
    for record in state.sessions.values() {
        let shares: Vec<String> = record
            .backend_weights
            .iter()
            .map(|(backend_id, weight)| {
                let share = state
                    .backends
                    .get(backend_id)
                    .map_or(0.0, |b| b.get_model_gpu_share(&record.primary_id()));
                format!("{}/{:.1}/{:.3}", backend_id, weight, share)
            })
            .collect();
        debug!(
            session = %record.primary_id(),
            assignment = %shares.join(" "),
            "Model table"
        );
    }
}
