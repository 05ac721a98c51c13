//! Open-loop load generation against a dispatcher
//!
//! Generates queries with exponentially distributed inter-arrival gaps at a
//! target rate and feeds them straight into a [`Dispatcher`], tallying the
//! outcomes. Arrival times are virtual; the generator never sleeps.

use nexus_core::time::unix_now_ns;
use nexus_core::wire::{CtrlStatus, Query, QueryClock};
use nexus_core::{NodeId, QueryId};
use nexus_dispatcher::Dispatcher;
use rand::Rng;

#[derive(Debug, Clone)]
pub struct LoadGeneratorConfig {
    /// Target requests per second
    pub target_rps: f64,

    /// Total queries to generate
    pub total_queries: usize,

    /// Session to target
    pub model_session_id: String,

    /// Frontend identity stamped on the queries
    pub frontend_id: NodeId,
}

impl Default for LoadGeneratorConfig {
    fn default() -> Self {
        Self {
            target_rps: 100.0,
            total_queries: 1000,
            model_session_id: "tensorflow:resnet50:1:100000".to_string(),
            frontend_id: NodeId::new(1),
        }
    }
}

/// Tally of dispatch outcomes
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadSummary {
    pub dispatched: usize,
    pub model_not_found: usize,
    pub dropped: usize,
}

/// Drive the dispatcher with an open-loop arrival process
pub fn run_open_loop(dispatcher: &Dispatcher, config: &LoadGeneratorConfig) -> LoadSummary {
    let mut rng = rand::thread_rng();
    let mut summary = LoadSummary::default();
    let mut arrival_ns = unix_now_ns();
    let mean_gap_ns = 1e9 / config.target_rps.max(1e-6);

    for i in 0..config.total_queries {
        // Exponential inter-arrival gap
        let u: f64 = rng.gen_range(f64::EPSILON..1.0);
        arrival_ns += (-u.ln() * mean_gap_ns) as i64;

        let query = Query {
            query_id: QueryId::new(i as u64 + 1),
            global_id: Default::default(),
            model_session_id: config.model_session_id.clone(),
            frontend_id: config.frontend_id,
            clock: QueryClock {
                frontend_recv_ns: arrival_ns,
                ..Default::default()
            },
        };
        match dispatcher.dispatch_request(query) {
            Some(reply) if reply.status == CtrlStatus::Ok => summary.dispatched += 1,
            Some(_) => summary.model_not_found += 1,
            None => summary.dropped += 1,
        }
    }
    summary
}
