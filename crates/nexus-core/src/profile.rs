//! The model profile oracle
//!
//! Profiles are produced offline by running each model on each GPU type and
//! measuring forward latency as a function of batch size. The scheduling
//! fabric only reads them through these traits.

use crate::types::ModelSession;
use std::fmt;
use std::sync::Arc;

/// Read-only latency/batch profile of one model on one GPU type.
///
/// `forward_latency_us` must be monotone nondecreasing in the batch size.
pub trait ModelProfile: Send + Sync + fmt::Debug {
    /// Forward latency of a batch, in microseconds
    fn forward_latency_us(&self, batch: u32) -> f64;

    /// Largest batch whose forward latency fits within the given SLA,
    /// or 0 if not even a single query fits
    fn max_batch_with_full_budget(&self, sla_us: u64) -> u32;

    /// Sustainable throughput at the given batch size, in requests/s
    fn max_throughput(&self, batch: u32) -> f64 {
        if batch == 0 {
            return 0.0;
        }
        let latency = self.forward_latency_us(batch);
        if latency <= 0.0 {
            return 0.0;
        }
        batch as f64 / latency * 1e6
    }
}

/// Lookup of profiles by (GPU device, model session).
///
/// Returns `None` when the pair was never profiled; call sites treat that as
/// an invalid-load-model condition and skip the backend.
pub trait ProfileDatabase: Send + Sync {
    fn profile(
        &self,
        gpu_device: &str,
        gpu_uuid: &str,
        session: &ModelSession,
    ) -> Option<Arc<dyn ModelProfile>>;
}
