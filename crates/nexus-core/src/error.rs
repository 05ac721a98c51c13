//! Error handling for nexus
//!
//! Provides a unified error type and result type for use across both
//! scheduling tiers.

use crate::wire::CtrlStatus;

/// Result type alias for nexus operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for nexus
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Model session is not registered with the scheduler
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// Duplicate node id on registration
    #[error("Node id conflict: {0}")]
    NodeConflict(String),

    /// Operation on an unknown frontend or backend
    #[error("Node not registered: {0}")]
    NotRegistered(String),

    /// Admission cannot place the requested workload
    #[error("Not enough backends: {0}")]
    NotEnoughBackends(String),

    /// No profile exists for a (backend, session) pair
    #[error("Invalid load model request: {0}")]
    InvalidLoadModel(String),

    /// Route table has no backend to offer
    #[error("Empty route: {0}")]
    EmptyRoute(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    InvalidConfiguration(String),

    /// Transport-related errors
    #[error("Transport error: {0}")]
    Transport(String),

    /// Internal invariant violations that are not fatal
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire encode/decode errors
    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// JSON parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors (workload files)
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration parsing errors
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a model-not-found error
    pub fn model_not_found(msg: impl Into<String>) -> Self {
        Self::ModelNotFound(msg.into())
    }

    /// Create a node-conflict error
    pub fn node_conflict(msg: impl Into<String>) -> Self {
        Self::NodeConflict(msg.into())
    }

    /// Create a not-registered error
    pub fn not_registered(msg: impl Into<String>) -> Self {
        Self::NotRegistered(msg.into())
    }

    /// Create a not-enough-backends error
    pub fn not_enough_backends(msg: impl Into<String>) -> Self {
        Self::NotEnoughBackends(msg.into())
    }

    /// Create an invalid-load-model error
    pub fn invalid_load_model(msg: impl Into<String>) -> Self {
        Self::InvalidLoadModel(msg.into())
    }

    /// Create an empty-route error
    pub fn empty_route(msg: impl Into<String>) -> Self {
        Self::EmptyRoute(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::ModelNotFound(_) => "model_not_found",
            Error::NodeConflict(_) => "node_conflict",
            Error::NotRegistered(_) => "not_registered",
            Error::NotEnoughBackends(_) => "not_enough_backends",
            Error::InvalidLoadModel(_) => "invalid_load_model",
            Error::EmptyRoute(_) => "empty_route",
            Error::InvalidConfiguration(_) => "configuration",
            Error::Transport(_) => "transport",
            Error::Internal(_) => "internal",
            Error::Io(_) => "io",
            Error::Codec(_) => "codec",
            Error::Json(_) => "json",
            Error::Yaml(_) => "yaml",
            Error::Config(_) => "config",
            Error::Other(_) => "other",
        }
    }

    /// Map to the control status surfaced in RPC replies
    pub fn ctrl_status(&self) -> CtrlStatus {
        match self {
            Error::ModelNotFound(_) => CtrlStatus::ModelNotFound,
            Error::NodeConflict(_) => CtrlStatus::NodeConflict,
            Error::NotRegistered(_) => CtrlStatus::NotRegistered,
            Error::NotEnoughBackends(_) => CtrlStatus::NotEnoughBackends,
            Error::InvalidLoadModel(_) => CtrlStatus::InvalidLoadModel,
            // Errors with no direct wire status collapse to a routing miss:
            // the frontend can only resubmit.
            _ => CtrlStatus::ModelNotFound,
        }
    }
}
