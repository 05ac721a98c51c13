//! Backend delegate: the scheduler's mutable capacity view of one GPU

use crate::handles::BackendHandle;
use crate::instance::InstanceInfo;
use nexus_core::wire::ModelTableEntry;
use nexus_core::{BackendInfo, Error, ModelSession, NodeId, ProfileDatabase, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Occupancy above which `spill_out_workload` stops removing instances
const SPILL_TARGET: f64 = 1.0;

/// The scheduler's view of one GPU worker: which model instances it runs,
/// their planned rates, and how much of the GPU they occupy together.
pub struct BackendDelegate {
    info: BackendInfo,
    handle: Arc<dyn BackendHandle>,
    profiles: Arc<dyn ProfileDatabase>,

    /// Static workload pin; negative means the scheduler may resize freely
    workload_id: i32,

    /// Instances keyed by primary session id
    instances: HashMap<String, InstanceInfo>,

    /// Prefix-shared session id -> primary session id
    prefix_index: HashMap<String, String>,

    /// Sessions this backend serves as a backup for
    backup_sessions: Vec<String>,

    last_seen: Instant,
}

impl BackendDelegate {
    pub fn new(
        info: BackendInfo,
        handle: Arc<dyn BackendHandle>,
        profiles: Arc<dyn ProfileDatabase>,
    ) -> Self {
        Self {
            info,
            handle,
            profiles,
            workload_id: -1,
            instances: HashMap::new(),
            prefix_index: HashMap::new(),
            backup_sessions: Vec::new(),
            last_seen: Instant::now(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.info.node_id
    }

    pub fn info(&self) -> &BackendInfo {
        &self.info
    }

    pub fn handle(&self) -> Arc<dyn BackendHandle> {
        self.handle.clone()
    }

    /// Static workload id; >= 0 iff the backend is pinned
    pub fn workload_id(&self) -> i32 {
        self.workload_id
    }

    pub fn set_workload_id(&mut self, id: i32) {
        self.workload_id = id;
    }

    /// Record a keepalive
    pub fn tick(&mut self) {
        self.last_seen = Instant::now();
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// Normalized load; 1.0 means the GPU is saturated
    pub fn occupancy(&self) -> f64 {
        self.instances.values().map(InstanceInfo::share).sum()
    }

    pub fn is_idle(&self) -> bool {
        self.instances.is_empty()
    }

    /// True when the resident instances together overcommit the GPU
    pub fn overload(&self) -> bool {
        self.occupancy() > 1.0 + 1e-6
    }

    fn resolve<'a>(&'a self, session_id: &'a str) -> Option<&'a str> {
        if self.instances.contains_key(session_id) {
            return Some(session_id);
        }
        self.prefix_index.get(session_id).map(String::as_str)
    }

    /// Hypothetical placement of `session` at `rate` rps, without committing.
    ///
    /// Returns the planned instance and the occupancy this backend would have
    /// after loading it. `None` when the session is already hosted here, the
    /// profile is missing, the SLA fits no batch, or the GPU is full.
    pub fn prepare_load_model(
        &self,
        session: &ModelSession,
        rate: f64,
    ) -> Option<(InstanceInfo, f64)> {
        let session_id = session.to_string();
        if self.resolve(&session_id).is_some() {
            return None;
        }
        let profile =
            self.profiles
                .profile(&self.info.gpu_device, &self.info.gpu_uuid, session)?;
        let mut inst = InstanceInfo::new(session.clone(), self.node_id(), profile)?;

        let occupancy = self.occupancy();
        let free = 1.0 - occupancy;
        if free <= 1e-6 {
            return None;
        }
        let available = inst.peak_throughput() * free;
        if available <= 1e-6 {
            return None;
        }
        let planned = if rate < 1e-3 || rate >= available {
            available
        } else {
            rate
        };
        inst.set_plan(planned, rate);
        let occupancy_after = occupancy + inst.share();
        Some((inst, occupancy_after))
    }

    /// Commit a planned instance and tell the backend to load the model
    pub fn load_model(&mut self, inst: InstanceInfo) {
        debug!(
            backend_id = %self.node_id(),
            session = %inst.session_id(),
            throughput = inst.throughput(),
            "Load model instance"
        );
        self.handle
            .load_model(inst.primary().clone(), inst.max_batch());
        self.instances.insert(inst.session_id(), inst);
    }

    /// Load a statically configured model at a fixed rate
    pub fn load_static_model(&mut self, session: ModelSession, rate: f64) -> Result<()> {
        let session_id = session.to_string();
        let profile = self
            .profiles
            .profile(&self.info.gpu_device, &self.info.gpu_uuid, &session)
            .ok_or_else(|| {
                Error::invalid_load_model(format!(
                    "no profile for {} on {}",
                    session_id, self.info.gpu_device
                ))
            })?;
        let mut inst = InstanceInfo::new(session, self.node_id(), profile).ok_or_else(|| {
            Error::invalid_load_model(format!("SLA fits no batch for {}", session_id))
        })?;
        let available = inst.peak_throughput() * (1.0 - self.occupancy());
        inst.set_plan(rate.min(available), rate);
        self.load_model(inst);
        Ok(())
    }

    /// Ride a prefix-shared session on an already-loaded parent instance
    pub fn load_prefix_model(&mut self, child: ModelSession, parent_id: &str) {
        if let Some(inst) = self.instances.get_mut(parent_id) {
            let child_id = child.to_string();
            inst.add_prefix_session(child);
            self.prefix_index.insert(child_id, parent_id.to_string());
        }
    }

    /// Remove a session. A primary id drops the whole instance; a prefix id
    /// only detaches from its group.
    pub fn unload_model(&mut self, session_id: &str) {
        if let Some(inst) = self.instances.remove(session_id) {
            for session in inst.sessions().iter().skip(1) {
                self.prefix_index.remove(&session.to_string());
            }
            debug!(backend_id = %self.node_id(), session = session_id, "Unload model instance");
            return;
        }
        if let Some(parent_id) = self.prefix_index.remove(session_id) {
            if let Some(inst) = self.instances.get_mut(&parent_id) {
                inst.remove_prefix_session(session_id);
            }
        }
    }

    /// Re-plan an existing instance towards `rate` rps; returns the granted
    /// rate, capped only by the instance's own peak.
    ///
    /// Growth may overcommit the GPU across sessions. Epoch scheduling
    /// watches for that and spills the excess rather than refusing here.
    pub fn update_model_throughput(&mut self, session_id: &str, rate: f64) -> f64 {
        let Some(primary_id) = self.resolve(session_id).map(str::to_owned) else {
            return 0.0;
        };
        let Some(inst) = self.instances.get_mut(&primary_id) else {
            return 0.0;
        };
        inst.set_plan(rate, rate);
        inst.throughput()
    }

    pub fn get_model_weight(&self, session_id: &str) -> Option<f64> {
        self.resolve(session_id)
            .and_then(|id| self.instances.get(id))
            .map(InstanceInfo::weight)
    }

    pub fn get_model_throughput(&self, session_id: &str) -> Option<f64> {
        self.resolve(session_id)
            .and_then(|id| self.instances.get(id))
            .map(InstanceInfo::throughput)
    }

    pub fn get_model_gpu_share(&self, session_id: &str) -> f64 {
        self.resolve(session_id)
            .and_then(|id| self.instances.get(id))
            .map(InstanceInfo::share)
            .unwrap_or(0.0)
    }

    /// All session ids loaded here, primaries and prefix riders alike
    pub fn model_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.instances.keys().cloned().collect();
        ids.extend(self.prefix_index.keys().cloned());
        ids
    }

    pub fn instances(&self) -> impl Iterator<Item = &InstanceInfo> {
        self.instances.values()
    }

    /// The model table rows this backend should be running
    pub fn model_table(&self) -> Vec<ModelTableEntry> {
        self.instances.values().map(InstanceInfo::table_entry).collect()
    }

    /// Push the current model table to the backend
    pub fn update_model_table_rpc(&self) {
        self.handle.update_model_table(self.model_table());
    }

    /// Bulk-accept all of `other`'s instances if they fit on this GPU.
    ///
    /// Only an idle backend may accept; on success the static pin and backup
    /// relations transfer too.
    pub fn assign(&mut self, other: &BackendDelegate) -> bool {
        if !self.is_idle() {
            return false;
        }
        let mut accepted: Vec<InstanceInfo> = Vec::new();
        let mut total_share = 0.0;
        for theirs in other.instances.values() {
            let Some(profile) = self.profiles.profile(
                &self.info.gpu_device,
                &self.info.gpu_uuid,
                theirs.primary(),
            ) else {
                return false;
            };
            let Some(mut inst) =
                InstanceInfo::new(theirs.primary().clone(), self.node_id(), profile)
            else {
                return false;
            };
            inst.set_plan(theirs.throughput(), theirs.workload());
            if inst.throughput() + 1e-6 < theirs.throughput() {
                return false;
            }
            for session in theirs.sessions().iter().skip(1) {
                inst.add_prefix_session(session.clone());
            }
            total_share += inst.share();
            if total_share > 1.0 + 1e-6 {
                return false;
            }
            accepted.push(inst);
        }
        info!(
            from = %other.node_id(),
            to = %self.node_id(),
            instances = accepted.len(),
            "Reassign backend workload"
        );
        for inst in accepted {
            for session in inst.sessions().iter().skip(1) {
                self.prefix_index
                    .insert(session.to_string(), inst.session_id());
            }
            self.load_model(inst);
        }
        self.workload_id = other.workload_id;
        self.backup_sessions = other.backup_sessions.clone();
        true
    }

    /// Shed lowest-weight instances until occupancy fits the GPU again.
    ///
    /// Returns the dispossessed session groups with the rates they lose.
    pub fn spill_out_workload(&mut self) -> Vec<(Vec<ModelSession>, f64)> {
        let mut spilled = Vec::new();
        while self.occupancy() > SPILL_TARGET {
            let Some(victim_id) = self
                .instances
                .values()
                .min_by(|a, b| {
                    a.throughput()
                        .partial_cmp(&b.throughput())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(InstanceInfo::session_id)
            else {
                break;
            };
            let inst = self
                .instances
                .remove(&victim_id)
                .expect("victim instance must exist");
            for session in inst.sessions().iter().skip(1) {
                self.prefix_index.remove(&session.to_string());
            }
            info!(
                backend_id = %self.node_id(),
                session = %victim_id,
                rate = inst.throughput(),
                "Spill out overloaded instance"
            );
            spilled.push((inst.sessions().to_vec(), inst.throughput()));
        }
        spilled
    }

    pub fn add_backup_session(&mut self, session_id: impl Into<String>) {
        let id = session_id.into();
        if !self.backup_sessions.contains(&id) {
            self.backup_sessions.push(id);
        }
    }

    pub fn backup_sessions(&self) -> &[String] {
        &self.backup_sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handles::ChannelBackend;
    use nexus_core::ModelProfile;

    #[derive(Debug)]
    struct FlatProfile {
        latency_us: f64,
    }

    impl ModelProfile for FlatProfile {
        fn forward_latency_us(&self, batch: u32) -> f64 {
            self.latency_us * batch as f64
        }

        fn max_batch_with_full_budget(&self, sla_us: u64) -> u32 {
            (sla_us as f64 / self.latency_us) as u32
        }
    }

    struct FlatDb {
        latency_us: f64,
    }

    impl ProfileDatabase for FlatDb {
        fn profile(
            &self,
            _gpu_device: &str,
            _gpu_uuid: &str,
            _session: &ModelSession,
        ) -> Option<Arc<dyn ModelProfile>> {
            Some(Arc::new(FlatProfile {
                latency_us: self.latency_us,
            }))
        }
    }

    fn backend(node_id: u32) -> BackendDelegate {
        let info = BackendInfo {
            node_id: NodeId::new(node_id),
            host: "10.0.0.1".to_string(),
            port: 8001,
            gpu_device: "tesla_v100".to_string(),
            gpu_uuid: format!("GPU-{}", node_id),
            gpu_available_memory: 16 << 30,
        };
        let (handle, _rx) = ChannelBackend::new();
        // 10 ms per query: the GPU sustains 100 rps total.
        BackendDelegate::new(info, handle, Arc::new(FlatDb { latency_us: 10_000.0 }))
    }

    fn session(name: &str) -> ModelSession {
        ModelSession::new("tensorflow", name, 1, 100_000)
    }

    #[test]
    fn test_occupancy_accumulates_across_sessions() {
        let mut b = backend(1);
        let (inst, occ) = b.prepare_load_model(&session("a"), 30.0).unwrap();
        assert!((occ - 0.3).abs() < 1e-9);
        b.load_model(inst);

        let (inst, occ) = b.prepare_load_model(&session("c"), 40.0).unwrap();
        assert!((occ - 0.7).abs() < 1e-9);
        b.load_model(inst);

        assert!((b.occupancy() - 0.7).abs() < 1e-9);
        assert!(!b.overload());
    }

    #[test]
    fn test_prepare_caps_at_free_capacity() {
        let mut b = backend(1);
        let (inst, _) = b.prepare_load_model(&session("a"), 80.0).unwrap();
        b.load_model(inst);

        let (inst, occ) = b.prepare_load_model(&session("c"), 50.0).unwrap();
        assert!((inst.throughput() - 20.0).abs() < 1e-9);
        assert!((occ - 1.0).abs() < 1e-9);
        b.load_model(inst);

        assert!(b.prepare_load_model(&session("d"), 1.0).is_none());
    }

    #[test]
    fn test_prepare_rejects_already_hosted_session() {
        let mut b = backend(1);
        let (inst, _) = b.prepare_load_model(&session("a"), 30.0).unwrap();
        b.load_model(inst);
        assert!(b.prepare_load_model(&session("a"), 10.0).is_none());
    }

    #[test]
    fn test_zero_rate_bootstrap_takes_all_free_capacity() {
        let b = backend(1);
        let (inst, occ) = b.prepare_load_model(&session("a"), 0.0).unwrap();
        assert!((inst.throughput() - 100.0).abs() < 1e-9);
        assert!((occ - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_update_model_throughput_release_and_regrow() {
        let mut b = backend(1);
        let (inst, _) = b.prepare_load_model(&session("a"), 80.0).unwrap();
        b.load_model(inst);

        let granted = b.update_model_throughput(&session("a").to_string(), 30.0);
        assert!((granted - 30.0).abs() < 1e-9);
        assert!((b.occupancy() - 0.3).abs() < 1e-9);

        // Regrow beyond the GPU's peak: the grant clamps there.
        let granted = b.update_model_throughput(&session("a").to_string(), 150.0);
        assert!((granted - 100.0).abs() < 1e-9);
        assert!(!b.overload());
    }

    #[test]
    fn test_growth_can_overcommit_across_sessions() {
        let mut b = backend(1);
        for (name, rate) in [("a", 60.0), ("c", 30.0)] {
            let (inst, _) = b.prepare_load_model(&session(name), rate).unwrap();
            b.load_model(inst);
        }
        assert!(!b.overload());

        let granted = b.update_model_throughput(&session("a").to_string(), 80.0);
        assert!((granted - 80.0).abs() < 1e-9);
        assert!((b.occupancy() - 1.1).abs() < 1e-9);
        assert!(b.overload());
    }

    #[test]
    fn test_assign_moves_whole_load_onto_idle_peer() {
        let mut src = backend(1);
        let (inst, _) = src.prepare_load_model(&session("a"), 30.0).unwrap();
        src.load_model(inst);
        let (inst, _) = src.prepare_load_model(&session("c"), 40.0).unwrap();
        src.load_model(inst);
        src.set_workload_id(3);

        let mut dst = backend(2);
        assert!(dst.assign(&src));
        assert!((dst.occupancy() - 0.7).abs() < 1e-9);
        assert_eq!(dst.workload_id(), 3);
        assert_eq!(
            dst.get_model_throughput(&session("a").to_string()).unwrap(),
            30.0
        );

        // A busy peer refuses.
        let mut busy = backend(4);
        let (inst, _) = busy.prepare_load_model(&session("x"), 10.0).unwrap();
        busy.load_model(inst);
        assert!(!busy.assign(&src));
    }

    #[test]
    fn test_spill_out_until_occupancy_fits() {
        let mut b = backend(1);
        for (name, rate) in [("a", 50.0), ("c", 40.0), ("d", 5.0)] {
            let (inst, _) = b.prepare_load_model(&session(name), rate).unwrap();
            b.load_model(inst);
        }
        // Overcommit by regrowing one instance.
        b.update_model_throughput(&session("a").to_string(), 70.0);
        assert!((b.occupancy() - 1.15).abs() < 1e-9);

        let spilled = b.spill_out_workload();
        assert!(!spilled.is_empty());
        assert!(b.occupancy() <= 1.0 + 1e-9);
        // The smallest instance goes first.
        assert_eq!(spilled[0].0[0].model_name, "d");
    }

    #[test]
    fn test_prefix_model_rides_parent_instance() {
        let mut b = backend(1);
        let parent = session("a");
        let parent_id = parent.to_string();
        let (inst, _) = b.prepare_load_model(&parent, 30.0).unwrap();
        b.load_model(inst);

        let child = ModelSession::new("tensorflow", "a_conv5", 1, 100_000);
        let child_id = child.to_string();
        b.load_prefix_model(child, &parent_id);

        assert_eq!(b.get_model_weight(&child_id), b.get_model_weight(&parent_id));
        assert!((b.occupancy() - 0.3).abs() < 1e-9);

        b.unload_model(&child_id);
        assert_eq!(b.get_model_weight(&child_id), None);
        assert!(b.get_model_weight(&parent_id).is_some());

        b.unload_model(&parent_id);
        assert!(b.is_idle());
    }
}
