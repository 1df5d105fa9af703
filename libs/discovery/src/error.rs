//! Registry Error Types
//!
//! Error handling for registration, discovery, snapshot and federation
//! failures. Benign conditions (heartbeat or deregister for an unknown
//! node) are reported through return values, not errors.

use thiserror::Error;

/// Main registry error type
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Malformed registration input or request
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// Per-service node limit reached
    #[error("Capacity exceeded for service '{service}': limit is {limit} nodes")]
    CapacityExceeded { service: String, limit: usize },

    /// Unknown service, or no eligible node for the request
    #[error("Service '{service}' not found: {reason}")]
    NotFound { service: String, reason: String },

    /// Every otherwise-eligible node is excluded by an open circuit
    #[error("All {open_nodes} nodes of service '{service}' have open circuits")]
    CircuitOpen { service: String, open_nodes: usize },

    /// Operation addressed a node the registry does not know
    #[error("Unknown node '{node}'")]
    UnknownNode { node: String },

    /// Invalid configuration values
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Snapshot encoding, decoding or integrity failure
    #[error("Snapshot error: {message}")]
    Snapshot {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Peer registry query failure
    #[error("Federation error: {peer}: {message}")]
    Federation { peer: String, message: String },

    /// Operation exceeded its deadline
    #[error("Timeout error: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Generic I/O errors
    #[error("I/O error: {message}")]
    Io {
        message: String,
        source: std::io::Error,
    },
}

/// Result type alias for registry operations
pub type Result<T> = std::result::Result<T, RegistryError>;

impl RegistryError {
    /// Create a validation error
    pub fn validation(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Validation {
            message: message.into(),
            field: field.map(|f| f.to_string()),
        }
    }

    /// Create a capacity error
    pub fn capacity_exceeded(service: impl Into<String>, limit: usize) -> Self {
        Self::CapacityExceeded {
            service: service.into(),
            limit,
        }
    }

    /// Create a not-found error
    pub fn not_found(service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NotFound {
            service: service.into(),
            reason: reason.into(),
        }
    }

    /// Create a circuit-open error
    pub fn circuit_open(service: impl Into<String>, open_nodes: usize) -> Self {
        Self::CircuitOpen {
            service: service.into(),
            open_nodes,
        }
    }

    /// Create an unknown-node error
    pub fn unknown_node(node: impl Into<String>) -> Self {
        Self::UnknownNode { node: node.into() }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|f| f.to_string()),
        }
    }

    /// Create a snapshot error
    pub fn snapshot(message: impl Into<String>) -> Self {
        Self::Snapshot {
            message: message.into(),
            source: None,
        }
    }

    /// Create a snapshot error with source
    pub fn snapshot_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Snapshot {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a federation error
    pub fn federation(peer: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Federation {
            peer: peer.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Check if the caller may reasonably retry the same request later
    pub fn is_retryable(&self) -> bool {
        match self {
            RegistryError::Validation { .. } => false,
            RegistryError::CapacityExceeded { .. } => false,
            RegistryError::NotFound { .. } => true,
            RegistryError::CircuitOpen { .. } => true,
            RegistryError::UnknownNode { .. } => false,
            RegistryError::Configuration { .. } => false,
            RegistryError::Snapshot { .. } => false,
            RegistryError::Federation { .. } => true,
            RegistryError::Timeout { .. } => true,
            RegistryError::Io { .. } => true,
        }
    }

    /// Get error category for logging and metrics labels
    pub fn category(&self) -> &'static str {
        match self {
            RegistryError::Validation { .. } => "validation",
            RegistryError::CapacityExceeded { .. } => "capacity",
            RegistryError::NotFound { .. } => "not_found",
            RegistryError::CircuitOpen { .. } => "circuit_open",
            RegistryError::UnknownNode { .. } => "unknown_node",
            RegistryError::Configuration { .. } => "configuration",
            RegistryError::Snapshot { .. } => "snapshot",
            RegistryError::Federation { .. } => "federation",
            RegistryError::Timeout { .. } => "timeout",
            RegistryError::Io { .. } => "io",
        }
    }
}

impl From<std::io::Error> for RegistryError {
    fn from(error: std::io::Error) -> Self {
        Self::Io {
            message: error.to_string(),
            source: error,
        }
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(error: serde_json::Error) -> Self {
        Self::snapshot_with_source("JSON payload", error)
    }
}

impl From<bincode::Error> for RegistryError {
    fn from(error: bincode::Error) -> Self {
        Self::snapshot_with_source("binary payload", error)
    }
}
