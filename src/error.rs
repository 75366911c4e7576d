//! Error types for the fleet operator
//!
//! Provides structured error types for the control plane (registry,
//! directory, REST API) and the node agent (reconciliation, traffic
//! reporting, enforcement restart).

use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Registry Errors
    // =========================================================================
    #[error("Node not found: {node_id}")]
    NodeNotFound { node_id: String },

    // =========================================================================
    // Directory Errors
    // =========================================================================
    #[error("Client not found: {client_id}")]
    ClientNotFound { client_id: String },

    #[error("Client already registered: {email}")]
    ClientExists { email: String },

    // =========================================================================
    // Control Plane Call Errors (agent side)
    // =========================================================================
    #[error("Control plane request failed: {0}")]
    ControlPlane(#[from] reqwest::Error),

    #[error("Control plane returned status {status}: {body}")]
    ControlPlaneStatus { status: u16, body: String },

    // =========================================================================
    // Enforcement Errors (agent side)
    // =========================================================================
    #[error("Enforcement config unreadable: {path}: {reason}")]
    EnforcementConfig { path: String, reason: String },

    #[error("Enforcement restart failed: {reason}")]
    EnforcementRestart { reason: String },

    #[error("Counter drain failed: {reason}")]
    CounterDrain { reason: String },

    // =========================================================================
    // API Errors
    // =========================================================================
    #[error("API request validation failed: {0}")]
    ApiValidation(String),

    #[error("API authentication failed")]
    ApiAuthentication,

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error taxonomy driving what a caller does next.
///
/// Agent-side errors never propagate past the current cycle; this class
/// decides whether the cycle skips quietly, logs loudly, or degrades the
/// node's self-reported status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Unknown node or client id. Log and stop that action for the cycle.
    NotFound,
    /// Network timeout, connection failure, 5xx. Retried on the next
    /// natural schedule, never in a tight loop.
    Transient,
    /// Unparsable response or config. Skip the cycle, keep last-known-good
    /// state, never partially apply.
    Malformed,
    /// Enforcement process could not be restarted. Reported through the
    /// next heartbeat's status field.
    FatalLocal,
    /// Rejected input. Not retryable without a change from the caller.
    InvalidInput,
}

impl Error {
    /// Classify this error into the handling taxonomy
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::NodeNotFound { .. } | Error::ClientNotFound { .. } => ErrorClass::NotFound,

            // A response that arrived but does not parse is malformed, not
            // a network fault
            Error::ControlPlane(e) if e.is_decode() => ErrorClass::Malformed,
            Error::ControlPlane(_) => ErrorClass::Transient,

            Error::ControlPlaneStatus { status, .. } => match status {
                404 => ErrorClass::NotFound,
                400 | 401 | 422 => ErrorClass::InvalidInput,
                _ => ErrorClass::Transient,
            },

            Error::JsonParse(_) | Error::EnforcementConfig { .. } => ErrorClass::Malformed,

            Error::EnforcementRestart { .. } => ErrorClass::FatalLocal,

            Error::ApiValidation(_)
            | Error::ApiAuthentication
            | Error::ClientExists { .. }
            | Error::Configuration(_) => ErrorClass::InvalidInput,

            Error::CounterDrain { .. } | Error::Io(_) | Error::Internal(_) => {
                ErrorClass::Transient
            }
        }
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Whether the agent should simply try again on its next cycle.
    /// Malformed input is included: the config may be repaired out-of-band.
    pub fn retry_next_cycle(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Transient | ErrorClass::Malformed | ErrorClass::FatalLocal
        )
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;
