//! Wire messages for the control and dispatch planes
//!
//! Dispatch-plane messages travel as single bincode-framed UDP datagrams;
//! control-plane messages are carried by whatever transport implements the
//! node handles. All timestamps are nanoseconds since the Unix epoch.

use crate::types::{BackendInfo, GlobalId, ModelSession, NodeId, NodeType, PlanId, QueryId};
use serde::{Deserialize, Serialize};

/// Status codes surfaced in control replies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CtrlStatus {
    /// Success
    Ok,
    /// Model session is not registered
    ModelNotFound,
    /// Duplicate node id on registration
    NodeConflict,
    /// Operation on an unknown node
    NotRegistered,
    /// Admission could not place the requested workload
    NotEnoughBackends,
    /// Profile missing for a (backend, session) pair
    InvalidLoadModel,
}

/// Clock stamps captured at every hop of a query's path
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryClock {
    /// When the frontend received the user request
    pub frontend_recv_ns: i64,

    /// When the dispatcher read the datagram off the socket
    pub dispatcher_recv_ns: i64,

    /// When the dispatcher started scheduling the query
    pub dispatcher_sched_ns: i64,

    /// When the dispatcher handed the batch plan to the backend
    pub dispatcher_dispatch_ns: i64,
}

/// A query stripped of its input payload. The input travels directly from
/// frontend to backend; the scheduling fabric only ever sees this header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Frontend-local query id
    pub query_id: QueryId,

    /// Cluster-wide id, assigned by the dispatcher
    pub global_id: GlobalId,

    /// Canonical model session id
    pub model_session_id: String,

    /// Id of the frontend that owns the query
    pub frontend_id: NodeId,

    /// Punch clock
    pub clock: QueryClock,
}

impl Query {
    /// Absolute deadline: frontend receive time plus the session SLA.
    pub fn deadline_ns(&self, session: &ModelSession) -> i64 {
        self.clock.frontend_recv_ns + session.latency_sla_us as i64 * 1000
    }
}

/// Datagram from a frontend asking for a query to be routed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    /// Port on which the frontend expects the reply datagram
    pub udp_rpc_port: u16,

    /// The query header to route
    pub query_without_input: Query,
}

/// Reply datagram sent back to the frontend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchReply {
    /// Echo of the frontend-local query id
    pub query_id: QueryId,

    /// Canonical model session id
    pub model_session_id: String,

    /// Outcome of routing
    pub status: CtrlStatus,
}

impl DispatchRequest {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

impl DispatchReply {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// A deadline-annotated execution plan for one backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPlan {
    /// Plan id, strictly increasing per dispatcher
    pub plan_id: PlanId,

    /// Canonical model session id
    pub model_session_id: String,

    /// Queries in the batch, without input payloads
    pub queries_without_input: Vec<Query>,

    /// Earliest time the backend should start executing
    pub exec_time_ns: i64,

    /// Deadline of the earliest query in the batch
    pub deadline_ns: i64,

    /// Expected completion time given the profiled forward latency
    pub expected_finish_time_ns: i64,
}

/// One backend's share of a model route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendRate {
    pub info: BackendInfo,
    pub throughput: f64,
}

/// The scheduler's routing decision for one model session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRoute {
    /// Canonical model session id
    pub model_session_id: String,

    /// Assigned backends with their serving rates
    pub backend_rate: Vec<BackendRate>,
}

/// Route refresh pushed to a subscribing frontend after an epoch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelRouteUpdates {
    pub model_route: Vec<ModelRoute>,
}

/// Backend membership refresh pushed to frontends
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendListUpdate {
    pub backends: Vec<BackendInfo>,
}

/// One row of the model table pushed to a backend: the instance it must run
/// and the batch/throughput plan the scheduler sized for it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelTableEntry {
    /// Canonical id of the primary session
    pub model_session_id: String,

    /// Primary session plus any prefix-shared sessions riding on it
    pub sessions: Vec<ModelSession>,

    /// Planned batch size
    pub max_batch: u32,

    /// Planned serving rate in rps
    pub throughput: f64,

    /// Request rate the plan was sized for, in rps
    pub workload: f64,
}

/// Observed request rate for one model session at one frontend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStats {
    /// Canonical model session id
    pub model_session_id: String,

    /// Requests per second over the reporting window
    pub rate: f64,
}

/// Periodic workload report from a frontend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadStats {
    pub node_id: NodeId,
    pub model_stats: Vec<ModelStats>,
}

/// Node registration request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub node_type: NodeType,
    pub node_id: NodeId,
    pub host: String,
    pub port: u16,
    /// GPU device name; backends only
    pub gpu_device: String,
    /// GPU UUID; backends only
    pub gpu_uuid: String,
    /// Available GPU memory in bytes; backends only
    pub gpu_available_memory: u64,
}

/// Registration reply carrying the beacon interval nodes must honor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterReply {
    pub status: CtrlStatus,
    pub beacon_interval_sec: u64,
}

/// Admission request from a frontend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadModelRequest {
    pub node_id: NodeId,
    pub model_session: ModelSession,
    /// Estimated request rate in rps; 0 bootstraps a single instance
    pub estimate_workload: f64,
}

/// Admission reply; `model_route` is present iff status is `Ok`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadModelReply {
    pub status: CtrlStatus,
    pub model_route: Option<ModelRoute>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(global: u64) -> Query {
        Query {
            query_id: QueryId::new(7),
            global_id: GlobalId::new(global),
            model_session_id: "tensorflow:resnet50:1:100000".to_string(),
            frontend_id: NodeId::new(1),
            clock: QueryClock {
                frontend_recv_ns: 1_000_000,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_dispatch_request_round_trip() {
        let request = DispatchRequest {
            udp_rpc_port: 9001,
            query_without_input: query(42),
        };
        let bytes = request.to_bytes().unwrap();
        assert_eq!(DispatchRequest::from_bytes(&bytes).unwrap(), request);
    }

    #[test]
    fn test_dispatch_reply_round_trip() {
        let reply = DispatchReply {
            query_id: QueryId::new(7),
            model_session_id: "tensorflow:resnet50:1:100000".to_string(),
            status: CtrlStatus::ModelNotFound,
        };
        let bytes = reply.to_bytes().unwrap();
        assert_eq!(DispatchReply::from_bytes(&bytes).unwrap(), reply);
    }

    #[test]
    fn test_query_deadline() {
        let session = ModelSession::new("tensorflow", "resnet50", 1, 100_000);
        let q = query(1);
        assert_eq!(q.deadline_ns(&session), 1_000_000 + 100_000_000);
    }
}
