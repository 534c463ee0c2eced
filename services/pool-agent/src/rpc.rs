//! Remote call facade.
//!
//! An [`Endpoint`] is anything that can carry a typed [`Request`] to a
//! remote actor and bring back its [`Response`]. [`call`] wraps every
//! round trip in a hard deadline, so a caller never waits longer than the
//! timeout it asked for no matter how the transport behaves.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devpool_proto::{Request, Response};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::RpcError;

/// Payload of the liveness echo.
pub const ECHO_PAYLOAD: &str = "test";

/// Timeout used for liveness echoes.
pub const ECHO_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to a remote actor: a worker process or a device inside one.
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Human readable address, used in logs and errors.
    fn name(&self) -> &str;

    /// Sends `request` and waits for the matching reply.
    async fn call(&self, request: Request, timeout: Duration) -> Result<Response, RpcError>;

    /// Sends `request` without waiting for a reply.
    fn cast(&self, request: Request) -> Result<(), RpcError>;

    /// Endpoint of a device living inside this endpoint's worker.
    fn child(&self, device_ref: &str) -> Arc<dyn Endpoint>;
}

/// Performs one bounded round trip.
///
/// A timeout means the outcome is unknown: the request may still complete
/// remotely.
pub async fn call(
    endpoint: &dyn Endpoint,
    request: Request,
    timeout: Duration,
) -> Result<Response, RpcError> {
    let op = request.op();
    match tokio::time::timeout(timeout, endpoint.call(request, timeout)).await {
        Ok(result) => result,
        Err(_) => {
            debug!(endpoint = endpoint.name(), op, ?timeout, "Call timed out");
            Err(RpcError::Timeout {
                endpoint: endpoint.name().to_string(),
                op,
                timeout,
            })
        }
    }
}

/// Echo round trip. Never fails: any error or a mismatched echo is `false`.
pub async fn is_reachable(endpoint: &dyn Endpoint, timeout: Duration) -> bool {
    let request = Request::Echo {
        msg: ECHO_PAYLOAD.to_string(),
    };
    match call(endpoint, request, timeout).await {
        Ok(Response::Echo { msg }) => msg == ECHO_PAYLOAD,
        Ok(other) => {
            debug!(
                endpoint = endpoint.name(),
                response = other.kind(),
                "Unexpected echo response"
            );
            false
        }
        Err(e) => {
            debug!(endpoint = endpoint.name(), error = %e, "Echo failed");
            false
        }
    }
}

/// A named remote actor whose endpoint can be attached, replaced and
/// cleared over its lifetime.
pub struct RemoteEntity {
    name: String,
    endpoint: RwLock<Option<Arc<dyn Endpoint>>>,
    default_timeout: Duration,
}

impl RemoteEntity {
    pub fn new(name: impl Into<String>, default_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            endpoint: RwLock::new(None),
            default_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub async fn endpoint(&self) -> Option<Arc<dyn Endpoint>> {
        self.endpoint.read().await.clone()
    }

    pub async fn attach(&self, endpoint: Arc<dyn Endpoint>) {
        *self.endpoint.write().await = Some(endpoint);
    }

    /// Clears the endpoint and returns the previous one.
    pub async fn detach(&self) -> Option<Arc<dyn Endpoint>> {
        self.endpoint.write().await.take()
    }

    async fn connected(&self) -> Result<Arc<dyn Endpoint>, RpcError> {
        self.endpoint()
            .await
            .ok_or_else(|| RpcError::NotConnected(self.name.clone()))
    }

    /// Round trip with the default timeout.
    pub async fn ask(&self, request: Request) -> Result<Response, RpcError> {
        self.ask_within(request, self.default_timeout).await
    }

    /// Round trip with an explicit timeout.
    pub async fn ask_within(
        &self,
        request: Request,
        timeout: Duration,
    ) -> Result<Response, RpcError> {
        let endpoint = self.connected().await?;
        call(endpoint.as_ref(), request, timeout).await
    }

    pub async fn tell(&self, request: Request) -> Result<(), RpcError> {
        self.connected().await?.cast(request)
    }

    pub async fn is_reachable(&self, timeout: Duration) -> bool {
        match self.endpoint().await {
            Some(endpoint) => is_reachable(endpoint.as_ref(), timeout).await,
            None => false,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Endpoint that answers every request after a fixed delay.
    pub(crate) struct ScriptedEndpoint {
        pub delay: Duration,
        pub echo_override: Option<String>,
        pub calls: AtomicUsize,
    }

    impl ScriptedEndpoint {
        pub fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                echo_override: None,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Endpoint for ScriptedEndpoint {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn call(&self, request: Request, _timeout: Duration) -> Result<Response, RpcError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(match request {
                Request::Echo { msg } => Response::Echo {
                    msg: self.echo_override.clone().unwrap_or(msg),
                },
                _ => Response::ok(),
            })
        }

        fn cast(&self, _request: Request) -> Result<(), RpcError> {
            Ok(())
        }

        fn child(&self, _device_ref: &str) -> Arc<dyn Endpoint> {
            ScriptedEndpoint::new(self.delay)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_times_out_instead_of_hanging() {
        let endpoint = ScriptedEndpoint::new(Duration::from_secs(30));

        let err = call(endpoint.as_ref(), Request::GetDeviceId, Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert!(matches!(err, RpcError::Timeout { op: "get_device_id", .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_within_deadline_passes_response_through() {
        let endpoint = ScriptedEndpoint::new(Duration::from_millis(10));

        let response = call(endpoint.as_ref(), Request::Stop, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(response, Response::ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_is_reachable_is_repeatable() {
        let endpoint = ScriptedEndpoint::new(Duration::from_millis(1));

        for _ in 0..3 {
            assert!(is_reachable(endpoint.as_ref(), ECHO_TIMEOUT).await);
        }
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_is_reachable_false_on_mismatched_echo() {
        let endpoint = Arc::new(ScriptedEndpoint {
            delay: Duration::ZERO,
            echo_override: Some("nope".to_string()),
            calls: AtomicUsize::new(0),
        });

        assert!(!is_reachable(endpoint.as_ref(), ECHO_TIMEOUT).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_is_reachable_false_on_timeout() {
        let endpoint = ScriptedEndpoint::new(Duration::from_secs(60));

        assert!(!is_reachable(endpoint.as_ref(), ECHO_TIMEOUT).await);
    }

    #[tokio::test]
    async fn test_remote_entity_without_endpoint() {
        let entity = RemoteEntity::new("wrk_x", Duration::from_secs(1));

        let err = entity.ask(Request::Stop).await.unwrap_err();
        assert!(matches!(err, RpcError::NotConnected(name) if name == "wrk_x"));
        assert!(!entity.is_reachable(ECHO_TIMEOUT).await);

        entity.attach(ScriptedEndpoint::new(Duration::ZERO)).await;
        assert!(entity.is_reachable(ECHO_TIMEOUT).await);
        assert!(entity.detach().await.is_some());
        assert!(entity.endpoint().await.is_none());
    }
}
