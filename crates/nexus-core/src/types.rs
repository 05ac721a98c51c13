//! Core identifier and data-model types for nexus

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier of a node (frontend or backend) in the cluster
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct NodeId(u32);

impl NodeId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for NodeId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

macro_rules! monotone_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
            Default,
        )]
        pub struct $name(u64);

        impl $name {
            pub fn new(id: u64) -> Self {
                Self(id)
            }

            pub fn value(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

monotone_id!(
    /// Query id assigned by the frontend, unique per frontend
    QueryId
);
monotone_id!(
    /// Cluster-wide query id, strictly increasing per dispatcher
    GlobalId
);
monotone_id!(
    /// Batch plan id, strictly increasing per dispatcher
    PlanId
);

/// Role a node plays in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    /// Frontends accept user requests and subscribe to model routes
    Frontend,
    /// Backends own one GPU and execute batch plans
    Backend,
}

impl std::str::FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "frontend" => Ok(NodeType::Frontend),
            "backend" => Ok(NodeType::Backend),
            _ => Err(format!("Unknown node type: {}", s)),
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeType::Frontend => write!(f, "frontend"),
            NodeType::Backend => write!(f, "backend"),
        }
    }
}

/// A model session: the unit of scheduling.
///
/// Immutable once created. Two sessions are the same workload iff all fields
/// are equal; the canonical string id produced by [`ModelSession::to_string`]
/// is used as a map key throughout the system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelSession {
    /// Framework that serves the model (e.g. "tensorflow")
    pub framework: String,

    /// Model name within the framework's model zoo
    pub model_name: String,

    /// Model version
    pub version: u32,

    /// Input image height for resizable models
    pub image_height: Option<u32>,

    /// Input image width for resizable models
    pub image_width: Option<u32>,

    /// Latency SLA in microseconds, measured from frontend receive
    pub latency_sla_us: u64,
}

impl ModelSession {
    /// Create a session without input dimensions
    pub fn new(
        framework: impl Into<String>,
        model_name: impl Into<String>,
        version: u32,
        latency_sla_us: u64,
    ) -> Self {
        Self {
            framework: framework.into(),
            model_name: model_name.into(),
            version,
            image_height: None,
            image_width: None,
            latency_sla_us,
        }
    }

    /// Set the input dimensions of a resizable model
    pub fn with_input_dims(mut self, height: u32, width: u32) -> Self {
        self.image_height = Some(height);
        self.image_width = Some(width);
        self
    }

    /// Parse the canonical string id back into a session.
    ///
    /// Accepts `framework:model:version:sla_us` and
    /// `framework:model:version:HxW:sla_us`.
    pub fn parse(id: &str) -> crate::Result<Self> {
        let parts: Vec<&str> = id.split(':').collect();
        let invalid = || crate::Error::internal(format!("Bad model session id: {}", id));
        match parts.as_slice() {
            [framework, model, version, sla] => Ok(Self {
                framework: framework.to_string(),
                model_name: model.to_string(),
                version: version.parse().map_err(|_| invalid())?,
                image_height: None,
                image_width: None,
                latency_sla_us: sla.parse().map_err(|_| invalid())?,
            }),
            [framework, model, version, dims, sla] => {
                let (h, w) = dims.split_once('x').ok_or_else(invalid)?;
                Ok(Self {
                    framework: framework.to_string(),
                    model_name: model.to_string(),
                    version: version.parse().map_err(|_| invalid())?,
                    image_height: Some(h.parse().map_err(|_| invalid())?),
                    image_width: Some(w.parse().map_err(|_| invalid())?),
                    latency_sla_us: sla.parse().map_err(|_| invalid())?,
                })
            }
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for ModelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.image_height, self.image_width) {
            (Some(h), Some(w)) => write!(
                f,
                "{}:{}:{}:{}x{}:{}",
                self.framework, self.model_name, self.version, h, w, self.latency_sla_us
            ),
            _ => write!(
                f,
                "{}:{}:{}:{}",
                self.framework, self.model_name, self.version, self.latency_sla_us
            ),
        }
    }
}

/// Identity of one GPU worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendInfo {
    /// Node id of the backend
    pub node_id: NodeId,

    /// Host the backend listens on
    pub host: String,

    /// Port of the backend's batch-plan endpoint
    pub port: u16,

    /// GPU device name (e.g. "tesla_v100")
    pub gpu_device: String,

    /// GPU UUID
    pub gpu_uuid: String,

    /// Available GPU memory in bytes
    pub gpu_available_memory: u64,
}

impl fmt::Display for BackendInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.node_id, self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_type_parsing() {
        assert_eq!("frontend".parse::<NodeType>().unwrap(), NodeType::Frontend);
        assert_eq!("backend".parse::<NodeType>().unwrap(), NodeType::Backend);
        assert!("router".parse::<NodeType>().is_err());
    }

    #[test]
    fn test_session_id_round_trip() {
        let sess = ModelSession::new("tensorflow", "resnet50", 1, 100_000);
        let id = sess.to_string();
        assert_eq!(id, "tensorflow:resnet50:1:100000");
        assert_eq!(ModelSession::parse(&id).unwrap(), sess);
    }

    #[test]
    fn test_session_id_round_trip_with_dims() {
        let sess = ModelSession::new("caffe2", "vgg_face", 2, 50_000).with_input_dims(224, 224);
        let id = sess.to_string();
        assert_eq!(id, "caffe2:vgg_face:2:224x224:50000");
        assert_eq!(ModelSession::parse(&id).unwrap(), sess);
    }

    #[test]
    fn test_session_parse_rejects_garbage() {
        assert!(ModelSession::parse("nope").is_err());
        assert!(ModelSession::parse("tf:resnet:one:100").is_err());
        assert!(ModelSession::parse("tf:resnet:1:224by224:100").is_err());
    }

    #[test]
    fn test_session_identity_includes_sla() {
        let a = ModelSession::new("tensorflow", "resnet50", 1, 100_000);
        let b = ModelSession::new("tensorflow", "resnet50", 1, 50_000);
        assert_ne!(a, b);
    }
}
