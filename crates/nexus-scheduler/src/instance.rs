//! Instance bookkeeping: the concrete (backend, session) binding

use nexus_core::wire::ModelTableEntry;
use nexus_core::{ModelProfile, ModelSession, NodeId};
use std::sync::Arc;

/// One model instance planned onto one backend.
///
/// Carries the batch and throughput choices derived from the profile. The
/// instance's GPU share is `throughput / max_throughput(max_batch)`, so a
/// backend's occupancy is simply the sum over its instances.
#[derive(Debug, Clone)]
pub struct InstanceInfo {
    /// Primary session first, prefix-shared sessions after
    sessions: Vec<ModelSession>,

    /// Backend hosting the instance
    backend_id: NodeId,

    /// Latency profile of the primary session on this backend's GPU
    profile: Arc<dyn ModelProfile>,

    /// Planned batch size, sized so the forward pass fits the SLA
    max_batch: u32,

    /// Planned serving rate in rps
    throughput: f64,

    /// Request rate the plan was sized for
    workload: f64,
}

impl InstanceInfo {
    /// Plan an instance for `session` on `backend_id`.
    ///
    /// Returns `None` when not even a single-query batch fits the SLA on
    /// this GPU.
    pub fn new(
        session: ModelSession,
        backend_id: NodeId,
        profile: Arc<dyn ModelProfile>,
    ) -> Option<Self> {
        let max_batch = profile.max_batch_with_full_budget(session.latency_sla_us);
        if max_batch == 0 {
            return None;
        }
        Some(Self {
            sessions: vec![session],
            backend_id,
            profile,
            max_batch,
            throughput: 0.0,
            workload: 0.0,
        })
    }

    pub fn primary(&self) -> &ModelSession {
        &self.sessions[0]
    }

    /// Canonical id of the primary session
    pub fn session_id(&self) -> String {
        self.sessions[0].to_string()
    }

    pub fn sessions(&self) -> &[ModelSession] {
        &self.sessions
    }

    pub fn backend_id(&self) -> NodeId {
        self.backend_id
    }

    pub fn profile(&self) -> &Arc<dyn ModelProfile> {
        &self.profile
    }

    pub fn max_batch(&self) -> u32 {
        self.max_batch
    }

    pub fn throughput(&self) -> f64 {
        self.throughput
    }

    pub fn workload(&self) -> f64 {
        self.workload
    }

    /// Weight used for DRR routing
    pub fn weight(&self) -> f64 {
        self.throughput
    }

    /// Peak sustainable rate of this instance at its planned batch
    pub fn peak_throughput(&self) -> f64 {
        self.profile.max_throughput(self.max_batch)
    }

    /// Fraction of the GPU this instance occupies
    pub fn share(&self) -> f64 {
        let peak = self.peak_throughput();
        if peak <= 0.0 {
            return 0.0;
        }
        self.throughput / peak
    }

    /// Set the planned rate, clamped to the instance's peak
    pub fn set_plan(&mut self, throughput: f64, workload: f64) {
        self.throughput = throughput.min(self.peak_throughput()).max(0.0);
        self.workload = workload.max(0.0);
    }

    /// Attach a prefix-shared session that rides on this instance
    pub fn add_prefix_session(&mut self, session: ModelSession) {
        if !self.sessions.contains(&session) {
            self.sessions.push(session);
        }
    }

    /// Detach a prefix-shared session. Returns false for the primary.
    pub fn remove_prefix_session(&mut self, session_id: &str) -> bool {
        if self.sessions[0].to_string() == session_id {
            return false;
        }
        self.sessions.retain(|s| s.to_string() != session_id);
        true
    }

    /// Row pushed to the backend in model table updates
    pub fn table_entry(&self) -> ModelTableEntry {
        ModelTableEntry {
            model_session_id: self.session_id(),
            sessions: self.sessions.clone(),
            max_batch: self.max_batch,
            throughput: self.throughput,
            workload: self.workload,
        }
    }
}
