//! Deficit-round-robin route table
//!
//! One `DrrRoute` per model session. Each backend holds a quantum seeded
//! with its serving rate; a selection spends `min_rate` (the smallest rate
//! in the route) from the current backend's quantum, refilling and advancing
//! when it runs dry. Over many calls the selection frequency of each backend
//! approaches its share of the total rate, without sorting or random draws.

use nexus_core::wire::{BackendRate, ModelRoute};
use nexus_core::{BackendInfo, NodeId, Result};
use std::collections::HashMap;
use tracing::{debug, info};

/// Weighted round-robin selector over one session's assigned backends.
#[derive(Debug, Default)]
pub struct DrrRoute {
    model_session_id: String,
    backends: Vec<BackendRate>,
    backend_quanta: HashMap<NodeId, f64>,
    current_index: usize,
    min_rate: f64,
    total_throughput: f64,
}

impl DrrRoute {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn total_throughput(&self) -> f64 {
        self.total_throughput
    }

    pub fn min_rate(&self) -> f64 {
        self.min_rate
    }

    /// Replace the backend list from a scheduler route update.
    ///
    /// Surviving backends keep their quantum and, if possible, the round
    /// pointer stays on the backend it pointed at before the update.
    pub fn update(&mut self, route: &ModelRoute) {
        info!(session = %route.model_session_id, "Update model route");

        // Save the current DRR backend
        let current_backend_id = if self.backends.is_empty() {
            None
        } else {
            Some(self.backends[self.current_index].info.node_id)
        };

        self.model_session_id = route.model_session_id.clone();
        self.backends = route.backend_rate.clone();
        self.total_throughput = 0.0;

        self.min_rate = f64::MAX;
        for backend in &self.backends {
            self.min_rate = self.min_rate.min(backend.throughput);
        }

        // Seed quanta for new backends; survivors keep theirs
        let mut backend_idx: HashMap<NodeId, usize> = HashMap::new();
        for (i, backend) in self.backends.iter().enumerate() {
            let backend_id = backend.info.node_id;
            self.total_throughput += backend.throughput;
            debug!(
                backend_id = %backend_id,
                rate = backend.throughput,
                "Route backend"
            );
            self.backend_quanta
                .entry(backend_id)
                .or_insert(backend.throughput);
            backend_idx.insert(backend_id, i);
        }
        debug!(total_throughput = self.total_throughput, "Route total");

        // Drop quanta of removed backends
        self.backend_quanta
            .retain(|backend_id, _| backend_idx.contains_key(backend_id));

        // Recover the current DRR backend
        match current_backend_id.and_then(|id| backend_idx.get(&id)) {
            Some(&idx) => self.current_index = idx,
            None => {
                if self.backends.is_empty() {
                    self.current_index = 0;
                } else {
                    self.current_index %= self.backends.len();
                }
            }
        }
    }

    /// Pick the next backend. Fails on an empty route; panics if a full
    /// cycle cannot decide, which would mean the quanta are corrupt.
    pub fn get_backend(&mut self) -> Result<BackendInfo> {
        if self.backends.is_empty() {
            return Err(nexus_core::Error::empty_route(self.model_session_id.clone()));
        }
        for visited in 0.. {
            assert!(
                visited <= self.backends.len(),
                "DRR could not decide for session {}",
                self.model_session_id
            );
            let backend = &self.backends[self.current_index];
            let backend_id = backend.info.node_id;
            let quantum = self
                .backend_quanta
                .get_mut(&backend_id)
                .expect("every routed backend has a quantum");
            if *quantum >= self.min_rate {
                *quantum -= self.min_rate;
                return Ok(backend.info.clone());
            }
            *quantum += backend.throughput;
            self.current_index = (self.current_index + 1) % self.backends.len();
        }
        unreachable!()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn backend_info(node_id: u32) -> BackendInfo {
        BackendInfo {
            node_id: NodeId::new(node_id),
            host: "10.0.0.1".to_string(),
            port: 8000 + node_id as u16,
            gpu_device: "tesla_v100".to_string(),
            gpu_uuid: format!("GPU-{}", node_id),
            gpu_available_memory: 16 << 30,
        }
    }

    fn route(rates: &[(u32, f64)]) -> ModelRoute {
        ModelRoute {
            model_session_id: "tensorflow:resnet50:1:100000".to_string(),
            backend_rate: rates
                .iter()
                .map(|&(id, throughput)| BackendRate {
                    info: backend_info(id),
                    throughput,
                })
                .collect(),
        }
    }

    fn selection_counts(drr: &mut DrrRoute, calls: usize) -> HashMap<u32, usize> {
        let mut counts = HashMap::new();
        for _ in 0..calls {
            let info = drr.get_backend().unwrap();
            *counts.entry(info.node_id.value()).or_insert(0) += 1;
        }
        counts
    }

    #[test]
    fn test_empty_route_fails_without_looping() {
        let mut drr = DrrRoute::new();
        assert!(drr.get_backend().is_err());
        drr.update(&route(&[]));
        assert!(drr.get_backend().is_err());
    }

    #[test]
    fn test_single_backend_always_selected() {
        let mut drr = DrrRoute::new();
        drr.update(&route(&[(1, 50.0)]));
        for _ in 0..100 {
            assert_eq!(drr.get_backend().unwrap().node_id, NodeId::new(1));
        }
    }

    #[test]
    fn test_two_to_one_fairness() {
        let mut drr = DrrRoute::new();
        drr.update(&route(&[(1, 2.0), (2, 1.0)]));
        let counts = selection_counts(&mut drr, 3000);
        let b1 = counts[&1] as i64;
        let b2 = counts[&2] as i64;
        assert!((b1 - 2000).abs() <= 2, "backend 1 selected {} times", b1);
        assert!((b2 - 1000).abs() <= 2, "backend 2 selected {} times", b2);
    }

    #[test]
    fn test_fairness_with_uneven_rates() {
        let mut drr = DrrRoute::new();
        drr.update(&route(&[(1, 30.0), (2, 45.0), (3, 25.0)]));
        let counts = selection_counts(&mut drr, 10_000);
        for (id, expected) in [(1u32, 3000.0), (2, 4500.0), (3, 2500.0)] {
            let got = counts[&id] as f64;
            assert!(
                (got - expected).abs() / expected < 0.02,
                "backend {} selected {} times, expected about {}",
                id,
                got,
                expected
            );
        }
    }

    #[test]
    fn test_update_preserves_current_backend() {
        let mut drr = DrrRoute::new();
        drr.update(&route(&[(1, 1.0), (2, 1.0), (3, 1.0)]));
        // Walk until the pointer sits on backend 2.
        while drr.backends[drr.current_index].info.node_id != NodeId::new(2) {
            drr.get_backend().unwrap();
        }
        // Reorder and drop backend 1; pointer must follow backend 2.
        drr.update(&route(&[(3, 1.0), (2, 1.0)]));
        assert_eq!(
            drr.backends[drr.current_index].info.node_id,
            NodeId::new(2)
        );
    }

    #[test]
    fn test_update_clamps_pointer_when_backend_vanishes() {
        let mut drr = DrrRoute::new();
        drr.update(&route(&[(1, 1.0), (2, 1.0), (3, 1.0)]));
        while drr.current_index != 2 {
            drr.get_backend().unwrap();
        }
        drr.update(&route(&[(4, 1.0), (5, 1.0)]));
        assert!(drr.current_index < 2);
        // Still serves.
        drr.get_backend().unwrap();
    }

    #[test]
    fn test_selection_is_deterministic() {
        let run = || {
            let mut drr = DrrRoute::new();
            drr.update(&route(&[(1, 3.0), (2, 2.0)]));
            (0..50)
                .map(|_| drr.get_backend().unwrap().node_id.value())
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }
}
