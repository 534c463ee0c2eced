//! Error types for the device pool.
//!
//! Each layer has its own enum. `ServiceError` is the boundary taxonomy
//! handed to callers of [`crate::DeviceService`]; everything below it is
//! folded into one of its variants.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use devpool_id::DeviceId;
use devpool_proto::ParseValueError;
use thiserror::Error;

/// Failure of a single remote call.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    #[error("call '{op}' to {endpoint} timed out after {timeout:?}")]
    Timeout {
        endpoint: String,
        op: &'static str,
        timeout: Duration,
    },

    #[error("connection to {0} was lost")]
    Disconnected(String),

    #[error("no endpoint is registered for {0}")]
    NotConnected(String),

    #[error("unexpected '{got}' response from {endpoint} (expected '{expected}')")]
    UnexpectedResponse {
        endpoint: String,
        expected: &'static str,
        got: &'static str,
    },

    #[error("{endpoint} rejected '{op}': {reason}")]
    Remote {
        endpoint: String,
        op: &'static str,
        reason: String,
    },

    #[error("transport error towards {endpoint}: {message}")]
    Transport { endpoint: String, message: String },
}

impl RpcError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout { .. })
    }

    /// True when the endpoint could not be reached at all.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            RpcError::Disconnected(_) | RpcError::NotConnected(_) | RpcError::Transport { .. }
        )
    }
}

/// Failure managing a worker process.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker {worker} has no log destination configured")]
    MissingLogDestination { worker: String },

    #[error("failed to launch worker {worker}: {source}")]
    Launch {
        worker: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker {worker} did not register within {timeout:?} (log: {})", .log_path.display())]
    Registration {
        worker: String,
        timeout: Duration,
        log_path: PathBuf,
    },

    #[error("worker {0} has been shut down")]
    ShutDown(String),
}

/// Failure of a device-level operation.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("device '{name}' could not be spawned on worker {worker}: {source}")]
    SpawnFailed {
        name: String,
        worker: String,
        #[source]
        source: RpcError,
    },

    #[error("login of '{email}' was rejected: {reason}")]
    LoginRejected { email: String, reason: String },

    #[error(transparent)]
    InvalidArgument(#[from] ParseValueError),
}

/// Failure of a host pool operation.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("cannot create more than {max} devices")]
    CapacityExceeded { max: usize },

    #[error("device pool has been shut down")]
    ShutDown,

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    /// The worker a device was attached to failed to come up.
    #[error("host worker unavailable: {0}")]
    HostUnavailable(Arc<PoolError>),

    #[error("background task failed: {0}")]
    TaskFailed(String),
}

/// Errors returned by [`crate::DeviceService`].
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("device {0} not found")]
    NotFound(DeviceId),

    #[error("device {0} has no logged-in user")]
    NotLoggedIn(DeviceId),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("cannot create more than {max} devices")]
    CapacityExceeded { max: usize },

    #[error("startup failed: {0}")]
    StartupFailed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Stable snake_case code for the error kind.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ServiceError::NotFound(_) => "not_found",
            ServiceError::NotLoggedIn(_) => "not_logged_in",
            ServiceError::InvalidArgument(_) => "invalid_argument",
            ServiceError::Timeout(_) => "timeout",
            ServiceError::Unreachable(_) => "unreachable",
            ServiceError::CapacityExceeded { .. } => "capacity_exceeded",
            ServiceError::StartupFailed(_) => "startup_failed",
            ServiceError::Internal(_) => "internal",
        }
    }

    /// Classifies a (possibly shared) pool error.
    pub fn from_pool(err: &PoolError) -> Self {
        match err {
            PoolError::CapacityExceeded { max } => ServiceError::CapacityExceeded { max: *max },
            PoolError::ShutDown => ServiceError::Unreachable(err.to_string()),
            PoolError::Worker(WorkerError::MissingLogDestination { .. }) => {
                ServiceError::Internal(err.to_string())
            }
            PoolError::Worker(WorkerError::ShutDown(_)) => {
                ServiceError::Unreachable(err.to_string())
            }
            PoolError::Worker(_) => ServiceError::StartupFailed(err.to_string()),
            PoolError::Device(DeviceError::SpawnFailed { .. }) => {
                ServiceError::StartupFailed(err.to_string())
            }
            PoolError::Device(device) => Self::from_device(device),
            PoolError::HostUnavailable(inner) => match Self::from_pool(inner) {
                ServiceError::Internal(_) => ServiceError::Internal(err.to_string()),
                classified => classified,
            },
            PoolError::TaskFailed(_) => ServiceError::Internal(err.to_string()),
        }
    }

    fn from_device(err: &DeviceError) -> Self {
        match err {
            DeviceError::Rpc(rpc) => Self::from_rpc(rpc),
            DeviceError::SpawnFailed { .. } => ServiceError::StartupFailed(err.to_string()),
            DeviceError::LoginRejected { .. } => ServiceError::Internal(err.to_string()),
            DeviceError::InvalidArgument(parse) => ServiceError::InvalidArgument(parse.to_string()),
        }
    }

    fn from_rpc(err: &RpcError) -> Self {
        if err.is_timeout() {
            ServiceError::Timeout(err.to_string())
        } else if err.is_unreachable() {
            ServiceError::Unreachable(err.to_string())
        } else {
            ServiceError::Internal(err.to_string())
        }
    }
}

impl From<DeviceError> for ServiceError {
    fn from(err: DeviceError) -> Self {
        Self::from_device(&err)
    }
}

impl From<PoolError> for ServiceError {
    fn from(err: PoolError) -> Self {
        Self::from_pool(&err)
    }
}

impl From<Arc<PoolError>> for ServiceError {
    fn from(err: Arc<PoolError>) -> Self {
        Self::from_pool(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_timeout_maps_to_timeout() {
        let err = DeviceError::Rpc(RpcError::Timeout {
            endpoint: "wrk_a/d1".to_string(),
            op: "send_text",
            timeout: Duration::from_millis(50),
        });
        assert_eq!(ServiceError::from(err).reason_code(), "timeout");
    }

    #[test]
    fn test_disconnect_maps_to_unreachable() {
        let err = DeviceError::Rpc(RpcError::Disconnected("wrk_a".to_string()));
        assert_eq!(ServiceError::from(err).reason_code(), "unreachable");
    }

    #[test]
    fn test_registration_failure_is_startup_failure() {
        let err = PoolError::HostUnavailable(Arc::new(PoolError::Worker(
            WorkerError::Registration {
                worker: "wrk_a".to_string(),
                timeout: Duration::from_secs(90),
                log_path: PathBuf::from("target/logcat/wrk_a.log"),
            },
        )));
        let service = ServiceError::from(err);
        assert_eq!(service.reason_code(), "startup_failed");
        assert!(service.to_string().contains("wrk_a.log"));
    }

    #[test]
    fn test_capacity_keeps_limit() {
        let service = ServiceError::from(PoolError::CapacityExceeded { max: 3 });
        assert!(matches!(service, ServiceError::CapacityExceeded { max: 3 }));
        assert_eq!(service.reason_code(), "capacity_exceeded");
    }

    #[test]
    fn test_invalid_reaction_is_invalid_argument() {
        let parse = "love".parse::<devpool_proto::Reaction>().unwrap_err();
        let service = ServiceError::from(DeviceError::InvalidArgument(parse));
        assert_eq!(service.reason_code(), "invalid_argument");
    }
}
