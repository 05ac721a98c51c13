//! Synthetic latency profiles for tests

use nexus_core::{ModelProfile, ModelSession, ProfileDatabase};
use std::collections::HashMap;
use std::sync::Arc;

/// Affine latency curve: `forward_latency_us(b) = base_us + per_query_us * b`.
///
/// With `base_us == 0` the peak throughput is `1e6 / per_query_us` rps at any
/// batch size, which makes capacity arithmetic in tests exact.
#[derive(Debug, Clone)]
pub struct LinearProfile {
    pub base_us: f64,
    pub per_query_us: f64,
}

impl LinearProfile {
    /// Profile of a GPU that sustains exactly `rps` requests per second
    pub fn with_capacity(rps: f64) -> Self {
        Self {
            base_us: 0.0,
            per_query_us: 1e6 / rps,
        }
    }
}

impl ModelProfile for LinearProfile {
    fn forward_latency_us(&self, batch: u32) -> f64 {
        self.base_us + self.per_query_us * batch as f64
    }

    fn max_batch_with_full_budget(&self, sla_us: u64) -> u32 {
        let budget = sla_us as f64 - self.base_us;
        if budget < self.per_query_us {
            return 0;
        }
        (budget / self.per_query_us) as u32
    }
}

/// Profile lookup backed by a map, with an optional catch-all default.
///
/// Register overrides per `(gpu_device, model_session_id)`; pairs without an
/// entry fall back to the default, or come back profile-less like a model
/// that was never benchmarked on that GPU.
#[derive(Default)]
pub struct MockProfileDatabase {
    default_profile: Option<Arc<dyn ModelProfile>>,
    profiles: HashMap<(String, String), Arc<dyn ModelProfile>>,
    missing: HashMap<String, ()>,
}

impl MockProfileDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Database answering every lookup with the same profile
    pub fn with_default(profile: impl ModelProfile + 'static) -> Self {
        Self {
            default_profile: Some(Arc::new(profile)),
            ..Default::default()
        }
    }

    /// Database where every GPU sustains exactly `rps` requests per second
    pub fn with_capacity(rps: f64) -> Self {
        Self::with_default(LinearProfile::with_capacity(rps))
    }

    pub fn insert(
        &mut self,
        gpu_device: impl Into<String>,
        session_id: impl Into<String>,
        profile: impl ModelProfile + 'static,
    ) {
        self.profiles
            .insert((gpu_device.into(), session_id.into()), Arc::new(profile));
    }

    /// Mark a GPU device as never profiled, regardless of the default
    pub fn mark_missing(&mut self, gpu_device: impl Into<String>) {
        self.missing.insert(gpu_device.into(), ());
    }
}

impl ProfileDatabase for MockProfileDatabase {
    fn profile(
        &self,
        gpu_device: &str,
        _gpu_uuid: &str,
        session: &ModelSession,
    ) -> Option<Arc<dyn ModelProfile>> {
        if self.missing.contains_key(gpu_device) {
            return None;
        }
        self.profiles
            .get(&(gpu_device.to_string(), session.to_string()))
            .cloned()
            .or_else(|| self.default_profile.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_profile_capacity() {
        let profile = LinearProfile::with_capacity(100.0);
        assert_eq!(profile.max_batch_with_full_budget(100_000), 10);
        assert!((profile.max_throughput(10) - 100.0).abs() < 1e-9);
        assert_eq!(profile.max_batch_with_full_budget(5_000), 0);
    }

    #[test]
    fn test_base_latency_shrinks_batch() {
        let profile = LinearProfile {
            base_us: 50_000.0,
            per_query_us: 10_000.0,
        };
        assert_eq!(profile.max_batch_with_full_budget(100_000), 5);
        assert_eq!(profile.max_batch_with_full_budget(55_000), 0);
    }

    #[test]
    fn test_database_fallback_and_missing() {
        let mut db = MockProfileDatabase::with_capacity(100.0);
        let session = ModelSession::new("tensorflow", "resnet50", 1, 100_000);
        db.insert(
            "tesla_k80",
            session.to_string(),
            LinearProfile::with_capacity(25.0),
        );
        db.mark_missing("cpu");

        let fast = db.profile("tesla_v100", "GPU-1", &session).unwrap();
        assert!((fast.max_throughput(1) - 100.0).abs() < 1e-9);
        let slow = db.profile("tesla_k80", "GPU-2", &session).unwrap();
        assert!((slow.max_throughput(1) - 25.0).abs() < 1e-9);
        assert!(db.profile("cpu", "GPU-3", &session).is_none());
    }
}
