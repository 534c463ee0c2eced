//! Error types for the simulated worker.

use devpool_proto::ProtoError;
use thiserror::Error;

/// Worker errors with standardized reason codes.
#[derive(Debug, Error)]
pub enum SimError {
    /// Could not reach the coordinator.
    #[error("connect_failed: {0}")]
    Connect(#[source] std::io::Error),

    /// The coordinator did not answer the hello as expected.
    #[error("handshake_failed: {0}")]
    HandshakeFailed(String),

    /// The coordinator refused the hello.
    #[error("rejected: {0}")]
    Rejected(String),

    /// Framing or I/O failure on an established connection.
    #[error("protocol error: {0}")]
    Proto(#[from] ProtoError),
}

impl SimError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            SimError::Connect(_) => "connect_failed",
            SimError::HandshakeFailed(_) => "handshake_failed",
            SimError::Rejected(_) => "rejected",
            SimError::Proto(_) => "protocol_error",
        }
    }
}
