//! Session bookkeeping: rate history, backend weights, subscribers

use nexus_core::{ModelSession, NodeId};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// Scheduler-side record of one model session (or a group of prefix-linked
/// sessions sharing instances).
#[derive(Debug, Default)]
pub struct SessionInfo {
    /// Primary session first, prefix-shared secondaries after
    pub model_sessions: Vec<ModelSession>,

    /// Assigned backends and the serving rate each was granted.
    /// Ordered so routes and logs come out deterministic.
    pub backend_weights: BTreeMap<NodeId, f64>,

    /// Last reported request rate per frontend
    pub workloads: HashMap<NodeId, f64>,

    /// Bounded history of aggregate rps samples, one per beacon
    pub rps_history: VecDeque<f64>,

    /// Capacity owed to this session but not yet placed, in rps
    pub unassigned_workload: f64,

    /// Which frontends subscribe to which session id in the group
    pub session_subscribers: HashMap<String, HashSet<NodeId>>,

    /// Backends designated as backups for this session
    pub backup_backends: HashSet<NodeId>,

    /// True when the session came from a static workload file
    pub has_static_workload: bool,
}

impl SessionInfo {
    pub fn new(session: ModelSession) -> Self {
        Self {
            model_sessions: vec![session],
            ..Default::default()
        }
    }

    pub fn primary(&self) -> &ModelSession {
        &self.model_sessions[0]
    }

    pub fn primary_id(&self) -> String {
        self.model_sessions[0].to_string()
    }

    /// Sum of granted serving rates across assigned backends
    pub fn total_throughput(&self) -> f64 {
        self.backend_weights.values().sum()
    }

    /// Record a frontend's reported rate for the next beacon aggregate
    pub fn update_workload(&mut self, frontend_id: NodeId, rate: f64) {
        self.workloads.insert(frontend_id, rate);
    }

    /// Aggregate rps across frontends, clamping negative reports to zero
    pub fn aggregate_rps(&self) -> f64 {
        self.workloads.values().map(|rate| rate.max(0.0)).sum()
    }

    /// Append one beacon sample, suppressing leading zeros so an idle
    /// session does not build a history of silence before first traffic.
    pub fn push_history(&mut self, rps: f64, history_len: usize) {
        if self.rps_history.is_empty() && rps <= 0.0 {
            return;
        }
        self.rps_history.push_back(rps);
        while self.rps_history.len() > history_len {
            self.rps_history.pop_front();
        }
    }

    /// Latest rps sample clamped to the configured floor
    pub fn estimate_rps(&self, min_rate: f64) -> f64 {
        self.rps_history
            .back()
            .copied()
            .unwrap_or(0.0)
            .max(min_rate)
    }

    pub fn subscribe(&mut self, frontend_id: NodeId, session_id: impl Into<String>) {
        self.session_subscribers
            .entry(session_id.into())
            .or_default()
            .insert(frontend_id);
    }

    /// Drop a frontend's subscription to one session id. Returns true when
    /// that session id has no subscribers left and no static workload keeps
    /// it alive, i.e. the caller should unload it.
    pub fn unsubscribe(&mut self, frontend_id: NodeId, session_id: &str) -> bool {
        if let Some(subscribers) = self.session_subscribers.get_mut(session_id) {
            subscribers.remove(&frontend_id);
            if subscribers.is_empty() {
                self.session_subscribers.remove(session_id);
            }
        }
        !self.has_static_workload && !self.session_subscribers.contains_key(session_id)
    }
}
