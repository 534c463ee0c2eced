//! Coordinator endpoint.
//!
//! Workers connect over TCP, introduce themselves with a `hello` frame and
//! are then published under their name. Everything the agent sends to a
//! worker (or to a device inside it) is multiplexed over that one
//! connection and correlated by request id.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devpool_proto::{
    write_frame, Frame, FrameReader, Request, Response, Target, PROTOCOL_VERSION,
};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::RpcError;
use crate::rpc::Endpoint;

/// Time a fresh connection gets to send its `hello`.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound frames buffered per connection.
const OUTBOUND_QUEUE: usize = 256;

#[derive(Default)]
struct Registry {
    workers: HashMap<String, Arc<Connection>>,
    waiters: HashMap<String, Vec<oneshot::Sender<Arc<Connection>>>>,
}

/// Rendezvous point between the agent and its worker processes.
pub struct Coordinator {
    local_addr: SocketAddr,
    registry: Arc<Mutex<Registry>>,
    accept_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    /// Binds the listener and starts accepting workers.
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Arc<Self>> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let registry = Arc::new(Mutex::new(Registry::default()));

        let accept_task = tokio::spawn(accept_loop(listener, registry.clone()));
        info!(addr = %local_addr, "Coordinator listening");

        Ok(Arc::new(Self {
            local_addr,
            registry,
            accept_task: std::sync::Mutex::new(Some(accept_task)),
        }))
    }

    /// Address workers are told to connect to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits until a worker named `worker` has registered and returns its
    /// endpoint.
    pub async fn wait_until_registered(
        &self,
        worker: &str,
        timeout: Duration,
    ) -> Result<Arc<dyn Endpoint>, RpcError> {
        let rx = {
            let mut registry = self.registry.lock().await;
            if let Some(conn) = registry.workers.get(worker) {
                return Ok(RemoteRef::worker(conn.clone()));
            }
            let (tx, rx) = oneshot::channel();
            registry
                .waiters
                .entry(worker.to_string())
                .or_default()
                .push(tx);
            rx
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(conn)) => Ok(RemoteRef::worker(conn)),
            Ok(Err(_)) => Err(RpcError::Disconnected(worker.to_string())),
            Err(_) => {
                let mut registry = self.registry.lock().await;
                if let Some(waiters) = registry.waiters.get_mut(worker) {
                    waiters.retain(|tx| !tx.is_closed());
                    if waiters.is_empty() {
                        registry.waiters.remove(worker);
                    }
                }
                Err(RpcError::Timeout {
                    endpoint: worker.to_string(),
                    op: "register",
                    timeout,
                })
            }
        }
    }

    /// Drops the registration of `worker`, failing its in-flight calls.
    pub async fn deregister(&self, worker: &str) {
        let removed = self.registry.lock().await.workers.remove(worker);
        if let Some(conn) = removed {
            conn.close().await;
            debug!(worker = %worker, "Worker deregistered");
        }
    }

    /// Number of workers currently registered.
    pub async fn registered_count(&self) -> usize {
        self.registry.lock().await.workers.len()
    }

    /// Tells every registered worker to release its remote resources and
    /// forgets them.
    pub async fn release_all(&self) {
        let workers: Vec<_> = {
            let mut registry = self.registry.lock().await;
            registry.waiters.clear();
            registry.workers.drain().collect()
        };

        if workers.is_empty() {
            return;
        }
        info!(count = workers.len(), "Releasing all remote workers");

        for (name, conn) in workers {
            if let Err(e) = conn.cast(Target::Worker, Request::ReleaseRemotes) {
                debug!(worker = %name, error = %e, "Release broadcast not delivered");
            }
        }
    }

    /// Stops accepting new connections.
    pub fn shutdown(&self) {
        let task = match self.accept_task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            task.abort();
            info!(addr = %self.local_addr, "Coordinator stopped");
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(listener: TcpListener, registry: Arc<Mutex<Registry>>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "Worker connected");
                tokio::spawn(serve_connection(stream, peer, registry.clone()));
            }
            Err(e) => {
                warn!(error = %e, "Failed to accept worker connection");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, registry: Arc<Mutex<Registry>>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);

    let hello = match tokio::time::timeout(HELLO_TIMEOUT, reader.next_frame()).await {
        Ok(Ok(Some(frame))) => frame,
        Ok(Ok(None)) => {
            debug!(%peer, "Connection closed before hello");
            return;
        }
        Ok(Err(e)) => {
            warn!(%peer, error = %e, "Failed to read hello");
            return;
        }
        Err(_) => {
            warn!(%peer, "No hello received in time");
            return;
        }
    };

    let worker_name = match hello {
        Frame::Hello {
            worker_name,
            protocol,
            backend,
            otr_only,
        } if protocol == PROTOCOL_VERSION => {
            debug!(%peer, worker = %worker_name, %backend, otr_only, "Hello received");
            worker_name
        }
        Frame::Hello { protocol, .. } => {
            let reason = format!(
                "unsupported protocol {} (expected {})",
                protocol, PROTOCOL_VERSION
            );
            warn!(%peer, %reason, "Rejecting worker");
            let _ = write_frame(&mut write_half, &Frame::Rejected { reason }).await;
            return;
        }
        other => {
            warn!(%peer, frame = ?other, "Expected hello");
            return;
        }
    };

    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
    let conn = Arc::new(Connection::new(worker_name.clone(), tx));
    let writer = tokio::spawn(write_loop(write_half, rx, conn.clone()));

    if conn
        .send(Frame::Welcome {
            worker_name: worker_name.clone(),
        })
        .is_err()
    {
        writer.abort();
        return;
    }

    {
        let mut registry = registry.lock().await;
        if let Some(previous) = registry.workers.insert(worker_name.clone(), conn.clone()) {
            info!(worker = %worker_name, "Worker re-registered, replacing old connection");
            previous.close().await;
        }
        for waiter in registry.waiters.remove(&worker_name).unwrap_or_default() {
            let _ = waiter.send(conn.clone());
        }
    }
    info!(worker = %worker_name, %peer, "Worker registered");

    loop {
        match reader.next_frame().await {
            Ok(Some(Frame::Reply { id, body })) => conn.complete(id, body).await,
            Ok(Some(other)) => {
                warn!(worker = %worker_name, frame = ?other, "Ignoring unexpected frame");
            }
            Ok(None) => {
                info!(worker = %worker_name, "Worker disconnected");
                break;
            }
            Err(e) => {
                warn!(worker = %worker_name, error = %e, "Worker connection failed");
                break;
            }
        }
    }

    conn.close().await;
    writer.abort();

    let mut registry = registry.lock().await;
    if registry
        .workers
        .get(&worker_name)
        .is_some_and(|current| Arc::ptr_eq(current, &conn))
    {
        registry.workers.remove(&worker_name);
    }
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Frame>,
    conn: Arc<Connection>,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut write_half, &frame).await {
            warn!(worker = %conn.worker_name, error = %e, "Failed to write frame");
            conn.close().await;
            break;
        }
    }
}

/// One registered worker connection.
struct Connection {
    worker_name: String,
    tx: mpsc::Sender<Frame>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Response>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Connection {
    fn new(worker_name: String, tx: mpsc::Sender<Frame>) -> Self {
        Self {
            worker_name,
            tx,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    fn send(&self, frame: Frame) -> Result<(), RpcError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::Disconnected(self.worker_name.clone()));
        }
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Closed(_) => {
                RpcError::Disconnected(self.worker_name.clone())
            }
            mpsc::error::TrySendError::Full(_) => RpcError::Transport {
                endpoint: self.worker_name.clone(),
                message: "outbound queue is full".to_string(),
            },
        })
    }

    async fn request(
        &self,
        endpoint: &str,
        target: Target,
        body: Request,
        timeout: Duration,
    ) -> Result<Response, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let op = body.op();
        let (tx, rx) = oneshot::channel();

        self.pending.lock().await.insert(id, tx);
        if self.closed.load(Ordering::SeqCst) {
            self.pending.lock().await.remove(&id);
            return Err(RpcError::Disconnected(endpoint.to_string()));
        }

        let exchange = async {
            self.tx
                .send(Frame::Request { id, target, body })
                .await
                .map_err(|_| RpcError::Disconnected(endpoint.to_string()))?;
            rx.await
                .map_err(|_| RpcError::Disconnected(endpoint.to_string()))
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(RpcError::Timeout {
                    endpoint: endpoint.to_string(),
                    op,
                    timeout,
                })
            }
        }
    }

    async fn complete(&self, id: u64, body: Response) {
        match self.pending.lock().await.remove(&id) {
            Some(tx) => {
                let _ = tx.send(body);
            }
            None => {
                debug!(worker = %self.worker_name, id, "Dropping late reply");
            }
        }
    }

    fn cast(&self, target: Target, body: Request) -> Result<(), RpcError> {
        self.send(Frame::Cast { target, body })
    }

    /// Fails every in-flight call and refuses new ones.
    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let dropped = {
            let mut pending = self.pending.lock().await;
            let count = pending.len();
            pending.clear();
            count
        };
        if dropped > 0 {
            debug!(worker = %self.worker_name, dropped, "Failed in-flight calls");
        }
    }
}

/// Endpoint of a worker, or of a device inside it, over a connection.
struct RemoteRef {
    conn: Arc<Connection>,
    target: Target,
    name: String,
}

impl RemoteRef {
    fn worker(conn: Arc<Connection>) -> Arc<dyn Endpoint> {
        let name = conn.worker_name.clone();
        Arc::new(Self {
            conn,
            target: Target::Worker,
            name,
        })
    }
}

#[async_trait]
impl Endpoint for RemoteRef {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, request: Request, timeout: Duration) -> Result<Response, RpcError> {
        self.conn
            .request(&self.name, self.target.clone(), request, timeout)
            .await
    }

    fn cast(&self, request: Request) -> Result<(), RpcError> {
        self.conn.cast(self.target.clone(), request)
    }

    fn child(&self, device_ref: &str) -> Arc<dyn Endpoint> {
        Arc::new(RemoteRef {
            conn: self.conn.clone(),
            target: Target::device(device_ref),
            name: format!("{}/{}", self.conn.worker_name, device_ref),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn connect_worker(
        addr: SocketAddr,
        name: &str,
    ) -> (FrameReader<tokio::net::tcp::OwnedReadHalf>, OwnedWriteHalf) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        write_frame(
            &mut write_half,
            &Frame::Hello {
                worker_name: name.to_string(),
                protocol: PROTOCOL_VERSION,
                backend: "staging".to_string(),
                otr_only: true,
            },
        )
        .await
        .unwrap();
        let mut reader = FrameReader::new(read_half);
        assert!(matches!(
            reader.next_frame().await.unwrap(),
            Some(Frame::Welcome { .. })
        ));
        (reader, write_half)
    }

    #[tokio::test]
    async fn test_wait_resolves_when_worker_registers() {
        let coordinator = Coordinator::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = coordinator.local_addr();

        let waiting = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .wait_until_registered("wrk_a", Duration::from_secs(5))
                    .await
            })
        };

        let (_reader, _writer) = connect_worker(addr, "wrk_a").await;
        let endpoint = waiting.await.unwrap().unwrap();

        assert_eq!(endpoint.name(), "wrk_a");
        assert_eq!(coordinator.registered_count().await, 1);
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let coordinator = Coordinator::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let err = match coordinator
            .wait_until_registered("wrk_missing", Duration::from_millis(50))
            .await
        {
            Ok(_) => panic!("nobody registered"),
            Err(e) => e,
        };

        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_call_is_correlated_by_id() {
        let coordinator = Coordinator::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let (mut reader, mut writer) = connect_worker(coordinator.local_addr(), "wrk_b").await;
        let endpoint = coordinator
            .wait_until_registered("wrk_b", Duration::from_secs(1))
            .await
            .unwrap();
        let device = endpoint.child("d-1");

        let call = tokio::spawn(async move {
            device
                .call(Request::GetDeviceId, Duration::from_secs(5))
                .await
        });

        let (id, target) = match reader.next_frame().await.unwrap() {
            Some(Frame::Request { id, target, .. }) => (id, target),
            other => panic!("unexpected frame {:?}", other),
        };
        assert_eq!(target, Target::device("d-1"));

        // A reply for an unknown id is ignored.
        write_frame(
            &mut writer,
            &Frame::Reply {
                id: id + 100,
                body: Response::ok(),
            },
        )
        .await
        .unwrap();
        write_frame(
            &mut writer,
            &Frame::Reply {
                id,
                body: Response::ok_with("abc"),
            },
        )
        .await
        .unwrap();

        assert_eq!(call.await.unwrap().unwrap(), Response::ok_with("abc"));
    }

    #[tokio::test]
    async fn test_disconnect_fails_in_flight_calls() {
        let coordinator = Coordinator::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let (mut reader, mut writer) = connect_worker(coordinator.local_addr(), "wrk_c").await;
        let endpoint = coordinator
            .wait_until_registered("wrk_c", Duration::from_secs(1))
            .await
            .unwrap();

        let call = tokio::spawn(async move {
            endpoint
                .call(Request::GetFingerprint, Duration::from_secs(30))
                .await
        });
        assert!(reader.next_frame().await.unwrap().is_some());

        writer.shutdown().await.unwrap();
        drop(writer);
        drop(reader);

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::Disconnected(_)));
    }

    #[tokio::test]
    async fn test_rejects_unknown_protocol() {
        let coordinator = Coordinator::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let stream = TcpStream::connect(coordinator.local_addr()).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        write_frame(
            &mut write_half,
            &Frame::Hello {
                worker_name: "wrk_old".to_string(),
                protocol: PROTOCOL_VERSION + 1,
                backend: "staging".to_string(),
                otr_only: false,
            },
        )
        .await
        .unwrap();

        let mut reader = FrameReader::new(read_half);
        assert!(matches!(
            reader.next_frame().await.unwrap(),
            Some(Frame::Rejected { .. })
        ));
        assert_eq!(coordinator.registered_count().await, 0);
    }

    #[tokio::test]
    async fn test_release_all_broadcasts_and_forgets() {
        let coordinator = Coordinator::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let (mut reader, _writer) = connect_worker(coordinator.local_addr(), "wrk_d").await;
        coordinator
            .wait_until_registered("wrk_d", Duration::from_secs(1))
            .await
            .unwrap();

        coordinator.release_all().await;
        coordinator.release_all().await;

        assert!(matches!(
            reader.next_frame().await.unwrap(),
            Some(Frame::Cast {
                target: Target::Worker,
                body: Request::ReleaseRemotes
            })
        ));
        assert_eq!(coordinator.registered_count().await, 0);
    }
}
