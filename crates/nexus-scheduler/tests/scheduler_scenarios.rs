//! End-to-end scheduler scenarios driven through the in-process harness

use nexus_core::wire::{CtrlStatus, ModelRoute, ModelStats, WorkloadStats};
use nexus_core::{ModelSession, NodeId, SchedulerConfig};
use nexus_dev::{backend_info, MockProfileDatabase, RecordingBackend, TestCluster};
use nexus_scheduler::{Scheduler, StaticModelSpec};
use std::sync::Arc;

fn session(name: &str) -> ModelSession {
    ModelSession::new("tensorflow", name, 1, 100_000)
}

/// Short history so rate-driven tests converge in a few beacons
fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        avg_interval_sec: 1,
        ..Default::default()
    }
}

#[test]
fn single_backend_hosts_two_sessions() {
    let cluster = TestCluster::with_capacity(100.0);
    cluster.register_frontend(1).unwrap();
    cluster.register_backend(1).unwrap();

    let sess_a = session("model_a");
    let sess_c = session("model_c");
    let reply = cluster.load_model(1, &sess_a, 30.0);
    assert_eq!(reply.status, CtrlStatus::Ok);
    let reply = cluster.load_model(1, &sess_c, 40.0);
    assert_eq!(reply.status, CtrlStatus::Ok);

    let weights_a = cluster
        .scheduler
        .session_backends(&sess_a.to_string())
        .unwrap();
    let weights_c = cluster
        .scheduler
        .session_backends(&sess_c.to_string())
        .unwrap();
    assert_eq!(weights_a.len(), 1);
    assert_eq!(weights_c.len(), 1);
    let total: f64 = weights_a.values().chain(weights_c.values()).sum();
    assert!((total - 70.0).abs() < 1e-6);
    let occupancy = cluster.scheduler.backend_occupancy(NodeId::new(1)).unwrap();
    assert!((occupancy - 0.7).abs() < 1e-6);
}

#[test]
fn overgrowth_triggers_epoch_reallocation() {
    let cluster = TestCluster::new(
        fast_config(),
        Default::default(),
        Arc::new(MockProfileDatabase::with_capacity(100.0)),
    );
    cluster.register_frontend(1).unwrap();
    cluster.register_backend(1).unwrap();

    let sess = session("model_a");
    let sess_id = sess.to_string();
    assert_eq!(cluster.load_model(1, &sess, 30.0).status, CtrlStatus::Ok);

    // The frontend keeps reporting 80 rps until the history fills
    cluster
        .scheduler
        .report_workload(WorkloadStats {
            node_id: NodeId::new(1),
            model_stats: vec![ModelStats {
                model_session_id: sess_id.clone(),
                rate: 80.0,
            }],
        })
        .unwrap();
    let history_len = cluster.scheduler.config().history_len();
    let mut triggered = false;
    for _ in 0..history_len {
        triggered = cluster.scheduler.beacon_check();
    }
    assert!(triggered, "sustained 80 rps against 30 rps must trigger");

    cluster.scheduler.epoch_schedule();
    let weights = cluster.scheduler.session_backends(&sess_id).unwrap();
    let total: f64 = weights.values().sum();
    let unassigned = cluster.scheduler.unassigned_workload(&sess_id).unwrap();
    // The single 100 rps backend can absorb the whole 80 rps
    assert!((total - 80.0).abs() < 1e-6, "weights grew to {}", total);
    assert!(unassigned <= 50.0 + 1e-6);
}

#[test]
fn backend_removal_migrates_to_idle_peer() {
    let cluster = TestCluster::with_capacity(100.0);
    cluster.register_frontend(1).unwrap();
    cluster.register_backend(1).unwrap();
    cluster.register_backend(2).unwrap();

    let sess = session("model_a");
    let sess_id = sess.to_string();
    assert_eq!(cluster.load_model(1, &sess, 30.0).status, CtrlStatus::Ok);
    let before = cluster.scheduler.session_backends(&sess_id).unwrap();
    assert_eq!(before.keys().copied().collect::<Vec<_>>(), vec![NodeId::new(1)]);

    cluster.scheduler.unregister_backend(NodeId::new(1)).unwrap();

    let after = cluster.scheduler.session_backends(&sess_id).unwrap();
    assert_eq!(after.keys().copied().collect::<Vec<_>>(), vec![NodeId::new(2)]);
    assert!((after[&NodeId::new(2)] - 30.0).abs() < 1e-6);
    assert_eq!(cluster.scheduler.unassigned_workload(&sess_id), Some(0.0));
}

#[test]
fn backend_removal_without_peer_queues_workload() {
    let cluster = TestCluster::with_capacity(100.0);
    let frontend = cluster.register_frontend(1).unwrap();
    cluster.register_backend(1).unwrap();

    let sess = session("model_a");
    let sess_id = sess.to_string();
    assert_eq!(cluster.load_model(1, &sess, 30.0).status, CtrlStatus::Ok);
    frontend.take_pushes();

    cluster.scheduler.unregister_backend(NodeId::new(1)).unwrap();

    let unassigned = cluster.scheduler.unassigned_workload(&sess_id).unwrap();
    assert!((unassigned - 30.0).abs() < 1e-6);

    // The subscriber got a route update with the backend gone
    let route = frontend
        .latest_route(&sess_id)
        .expect("route update after removal");
    assert!(route.backend_rate.is_empty());

    // And dispatching against the emptied route misses
    cluster.apply_route_updates(1);
    let reply = cluster.dispatch(1, &sess_id).unwrap();
    assert_eq!(reply.status, CtrlStatus::ModelNotFound);
}

#[test]
fn static_workload_pins_first_backend_only() {
    let cluster = TestCluster::with_capacity(100.0);
    cluster.scheduler.set_static_workloads(vec![vec![StaticModelSpec {
        framework: "tensorflow".to_string(),
        model_name: "model_x".to_string(),
        version: 1,
        image_height: None,
        image_width: None,
        latency_sla_us: 100_000,
        rate: 50.0,
        backup: false,
    }]]);

    cluster.register_backend(1).unwrap();
    assert_eq!(cluster.scheduler.backend_workload_id(NodeId::new(1)), Some(0));
    let sess_id = session("model_x").to_string();
    let weights = cluster.scheduler.session_backends(&sess_id).unwrap();
    assert!((weights[&NodeId::new(1)] - 50.0).abs() < 1e-6);

    cluster.register_backend(2).unwrap();
    assert_eq!(cluster.scheduler.backend_workload_id(NodeId::new(2)), Some(-1));
}

#[test]
fn load_model_rejects_without_partial_commit() {
    let cluster = TestCluster::with_capacity(100.0);
    cluster.register_frontend(1).unwrap();
    cluster.register_backend(1).unwrap();

    let sess = session("model_a");
    let reply = cluster.load_model(1, &sess, 250.0);
    assert_eq!(reply.status, CtrlStatus::NotEnoughBackends);
    assert!(reply.model_route.is_none());

    // Nothing was committed anywhere
    assert!(!cluster.scheduler.has_session(&sess.to_string()));
    assert_eq!(cluster.scheduler.backend_occupancy(NodeId::new(1)), Some(0.0));

    // The same request succeeds once capacity exists
    cluster.register_backend(2).unwrap();
    cluster.register_backend(3).unwrap();
    let reply = cluster.load_model(1, &sess, 250.0);
    assert_eq!(reply.status, CtrlStatus::Ok);
    let weights = cluster.scheduler.session_backends(&sess.to_string()).unwrap();
    let total: f64 = weights.values().sum();
    assert!(total >= 250.0 - 1e-6);
}

#[test]
fn zero_workload_bootstraps_one_idle_backend() {
    let cluster = TestCluster::with_capacity(100.0);
    cluster.register_frontend(1).unwrap();
    cluster.register_backend(1).unwrap();
    cluster.register_backend(2).unwrap();

    let sess = session("model_a");
    let reply = cluster.load_model(1, &sess, 0.0);
    assert_eq!(reply.status, CtrlStatus::Ok);
    let weights = cluster.scheduler.session_backends(&sess.to_string()).unwrap();
    assert_eq!(weights.len(), 1, "exactly one backend for a zero workload");
}

#[test]
fn add_then_remove_backend_restores_state() {
    let cluster = TestCluster::with_capacity(100.0);
    cluster.register_frontend(1).unwrap();
    cluster.register_backend(1).unwrap();
    let sess = session("model_a");
    assert_eq!(cluster.load_model(1, &sess, 30.0).status, CtrlStatus::Ok);
    let weights_before = cluster.scheduler.session_backends(&sess.to_string()).unwrap();

    cluster.register_backend(7).unwrap();
    cluster.scheduler.unregister_backend(NodeId::new(7)).unwrap();

    assert_eq!(cluster.scheduler.backend_count(), 1);
    let weights_after = cluster.scheduler.session_backends(&sess.to_string()).unwrap();
    assert_eq!(weights_before, weights_after);
}

#[test]
fn unprofiled_backend_is_skipped_not_fatal() {
    let mut profiles = MockProfileDatabase::with_capacity(100.0);
    profiles.mark_missing("tesla_k80");
    let scheduler = Scheduler::new(SchedulerConfig::default(), Arc::new(profiles));

    let mut old_gpu = backend_info(1);
    old_gpu.gpu_device = "tesla_k80".to_string();
    scheduler
        .register_backend(old_gpu, RecordingBackend::new())
        .unwrap();
    scheduler
        .register_backend(backend_info(2), RecordingBackend::new())
        .unwrap();

    let frontend = nexus_dev::RecordingFrontend::new();
    scheduler.register_frontend(NodeId::new(1), frontend).unwrap();
    let reply = scheduler.load_model(nexus_core::wire::LoadModelRequest {
        node_id: NodeId::new(1),
        model_session: session("model_a"),
        estimate_workload: 50.0,
    });
    assert_eq!(reply.status, CtrlStatus::Ok);
    let weights = scheduler
        .session_backends(&session("model_a").to_string())
        .unwrap();
    assert_eq!(weights.keys().copied().collect::<Vec<_>>(), vec![NodeId::new(2)]);
}

#[test]
fn duplicate_node_registration_conflicts() {
    let cluster = TestCluster::with_capacity(100.0);
    cluster.register_frontend(1).unwrap();
    assert!(cluster.register_frontend(1).is_err());
    cluster.register_backend(1).unwrap();
    assert!(cluster.register_backend(1).is_err());
}

#[test]
fn frontend_departure_tears_down_its_sessions() {
    let cluster = TestCluster::with_capacity(100.0);
    cluster.register_frontend(1).unwrap();
    cluster.register_backend(1).unwrap();
    let sess = session("model_a");
    assert_eq!(cluster.load_model(1, &sess, 30.0).status, CtrlStatus::Ok);

    cluster.scheduler.unregister_frontend(NodeId::new(1)).unwrap();

    assert!(!cluster.scheduler.has_session(&sess.to_string()));
    assert_eq!(cluster.scheduler.backend_occupancy(NodeId::new(1)), Some(0.0));
}

#[test]
fn second_subscriber_shares_the_session() {
    let cluster = TestCluster::with_capacity(100.0);
    cluster.register_frontend(1).unwrap();
    cluster.register_frontend(2).unwrap();
    cluster.register_backend(1).unwrap();
    let sess = session("model_a");
    assert_eq!(cluster.load_model(1, &sess, 30.0).status, CtrlStatus::Ok);

    let reply = cluster.load_model(2, &sess, 60.0);
    assert_eq!(reply.status, CtrlStatus::Ok);
    // No extra capacity is allocated on subscribe; epochs handle growth
    let weights = cluster.scheduler.session_backends(&sess.to_string()).unwrap();
    let total: f64 = weights.values().sum();
    assert!((total - 30.0).abs() < 1e-6);

    // The first frontend leaving keeps the session alive for the second
    cluster.scheduler.unregister_frontend(NodeId::new(1)).unwrap();
    assert!(cluster.scheduler.has_session(&sess.to_string()));
}

#[test]
fn lapsed_keepalive_evicts_nodes() {
    let config = SchedulerConfig {
        keepalive_timeout_intervals: 0,
        ..Default::default()
    };
    let cluster = TestCluster::new(
        config,
        Default::default(),
        Arc::new(MockProfileDatabase::with_capacity(100.0)),
    );
    cluster.register_frontend(1).unwrap();
    cluster.register_backend(1).unwrap();
    assert_eq!(cluster.scheduler.frontend_count(), 1);
    assert_eq!(cluster.scheduler.backend_count(), 1);

    // Zero grace: the next beacon reaps everything silent since registration
    cluster.scheduler.beacon_tick();
    assert_eq!(cluster.scheduler.frontend_count(), 0);
    assert_eq!(cluster.scheduler.backend_count(), 0);
}

#[test]
fn keepalive_refreshes_liveness() {
    let cluster = TestCluster::with_capacity(100.0);
    cluster.register_frontend(1).unwrap();
    cluster
        .scheduler
        .keep_alive(NodeId::new(1), nexus_core::NodeType::Frontend)
        .unwrap();
    assert!(cluster
        .scheduler
        .keep_alive(NodeId::new(9), nexus_core::NodeType::Backend)
        .is_err());
}

#[test]
fn model_route_serialization_round_trip() {
    let cluster = TestCluster::with_capacity(100.0);
    cluster.register_frontend(1).unwrap();
    cluster.register_backend(1).unwrap();
    cluster.register_backend(2).unwrap();
    let sess = session("model_a");
    assert_eq!(cluster.load_model(1, &sess, 150.0).status, CtrlStatus::Ok);

    let route = cluster
        .scheduler
        .get_model_route(&sess.to_string())
        .unwrap();
    let encoded = serde_json::to_string(&route).unwrap();
    let decoded: ModelRoute = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded, route);
    assert_eq!(decoded.backend_rate.len(), 2);
}

#[test]
fn prefix_model_rides_parent_assignment() {
    let cluster = TestCluster::with_capacity(100.0);
    cluster.register_frontend(1).unwrap();
    cluster.register_backend(1).unwrap();
    let parent = session("model_a");
    let parent_id = parent.to_string();
    assert_eq!(cluster.load_model(1, &parent, 30.0).status, CtrlStatus::Ok);

    let child = session("model_a_conv5");
    let child_id = child.to_string();
    cluster
        .scheduler
        .load_prefix_model(&parent_id, child.clone())
        .unwrap();

    // The child shares the parent's backends and costs no extra capacity
    let child_weights = cluster.scheduler.session_backends(&child_id).unwrap();
    assert_eq!(
        child_weights,
        cluster.scheduler.session_backends(&parent_id).unwrap()
    );
    let occupancy = cluster.scheduler.backend_occupancy(NodeId::new(1)).unwrap();
    assert!((occupancy - 0.3).abs() < 1e-6);

    // A frontend subscribing to the child gets the shared route
    let reply = cluster.load_model(1, &child, 0.0);
    assert_eq!(reply.status, CtrlStatus::Ok);
    assert_eq!(reply.model_route.unwrap().backend_rate.len(), 1);

    // Loading the same child twice is rejected
    assert!(cluster.scheduler.load_prefix_model(&parent_id, child).is_err());
}

#[test]
fn workload_file_drives_static_pinning() {
    use std::io::Write;

    let yaml = r#"
- - framework: tensorflow
    model_name: model_x
    version: 1
    latency_sla_us: 100000
    rate: 50.0
"#;
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();

    let cluster = TestCluster::with_capacity(100.0);
    cluster.scheduler.load_workload_file(file.path()).unwrap();
    cluster.register_backend(1).unwrap();
    assert_eq!(cluster.scheduler.backend_workload_id(NodeId::new(1)), Some(0));
    assert!(cluster.scheduler.has_session(&session("model_x").to_string()));

    // The same file wired through configuration behaves identically
    let config = SchedulerConfig {
        workload_file: Some(file.path().to_path_buf()),
        ..Default::default()
    };
    let configured = TestCluster::new(
        config,
        Default::default(),
        Arc::new(MockProfileDatabase::with_capacity(100.0)),
    );
    configured.scheduler.load_configured_workloads().unwrap();
    configured.register_backend(1).unwrap();
    assert_eq!(
        configured.scheduler.backend_workload_id(NodeId::new(1)),
        Some(0)
    );
}
