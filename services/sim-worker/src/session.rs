//! Connection to the coordinator.
//!
//! Protocol:
//! 1. Worker connects to the coordinator address it was launched with
//! 2. Worker sends hello
//! 3. Coordinator answers welcome (or rejected)
//! 4. Coordinator sends requests and casts until it stops the worker or
//!    closes the connection

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use devpool_proto::{write_frame, Frame, FrameReader, Request, Response, Target, PROTOCOL_VERSION};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::devices::DeviceTable;
use crate::error::SimError;

/// Outbound frames buffered before request handlers start waiting.
const OUTBOUND_CAPACITY: usize = 256;

/// How the worker was launched.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub worker_name: String,
    pub coordinator_addr: SocketAddr,
    pub backend: String,
    pub otr_only: bool,
    /// Added before answering any device request.
    pub response_delay: Duration,
}

/// Why the session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// The coordinator sent `stop`.
    Stopped,
    /// The coordinator released every remote.
    Released,
    /// The connection was closed by the other side.
    CoordinatorClosed,
}

/// Writer task that is aborted when the session future is dropped.
struct WriterTask(Option<JoinHandle<()>>);

impl WriterTask {
    /// Waits for queued frames to be written. Every sender must be gone.
    async fn finish(mut self) {
        if let Some(handle) = self.0.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for WriterTask {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

/// Connects, registers and serves requests until told to stop.
pub async fn run(options: WorkerOptions) -> Result<Exit, SimError> {
    info!(
        worker = %options.worker_name,
        coordinator = %options.coordinator_addr,
        backend = %options.backend,
        otr_only = options.otr_only,
        "Connecting to coordinator"
    );

    let stream = TcpStream::connect(options.coordinator_addr)
        .await
        .map_err(SimError::Connect)?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);

    let hello = Frame::Hello {
        worker_name: options.worker_name.clone(),
        protocol: PROTOCOL_VERSION,
        backend: options.backend.clone(),
        otr_only: options.otr_only,
    };
    write_frame(&mut write_half, &hello).await?;
    debug!("Sent hello");

    match reader.next_frame().await? {
        Some(Frame::Welcome { .. }) => info!(worker = %options.worker_name, "Registered"),
        Some(Frame::Rejected { reason }) => return Err(SimError::Rejected(reason)),
        Some(other) => {
            return Err(SimError::HandshakeFailed(format!(
                "expected welcome, got {:?}",
                other
            )))
        }
        None => {
            return Err(SimError::HandshakeFailed(
                "coordinator closed the connection".to_string(),
            ))
        }
    }

    let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let writer = WriterTask(Some(tokio::spawn(write_loop(write_half, rx))));
    let devices = Arc::new(Mutex::new(DeviceTable::new()));
    let mut tasks = JoinSet::new();

    let exit = loop {
        while let Some(finished) = tasks.try_join_next() {
            if let Err(e) = finished {
                warn!(error = %e, "Request handler failed");
            }
        }

        let Some(frame) = reader.next_frame().await? else {
            info!("Coordinator closed the connection");
            break Exit::CoordinatorClosed;
        };

        match frame {
            Frame::Request {
                id,
                target: Target::Worker,
                body: Request::Stop,
            } => {
                tasks.shutdown().await;
                let _ = tx
                    .send(Frame::Reply {
                        id,
                        body: Response::Stopped,
                    })
                    .await;
                break Exit::Stopped;
            }
            Frame::Request {
                id,
                target: Target::Worker,
                body,
            } => {
                let reply = lock(&devices).handle_worker(body);
                if tx.send(Frame::Reply { id, body: reply }).await.is_err() {
                    break Exit::CoordinatorClosed;
                }
            }
            Frame::Request {
                id,
                target: Target::Device { device_ref },
                body,
            } => {
                let devices = devices.clone();
                let tx = tx.clone();
                let delay = options.response_delay;
                tasks.spawn(async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    let reply = lock(&devices).handle_device(&device_ref, body);
                    let _ = tx.send(Frame::Reply { id, body: reply }).await;
                });
            }
            Frame::Cast {
                target: Target::Worker,
                body: Request::ReleaseRemotes,
            } => {
                info!("Coordinator released all remotes");
                lock(&devices).clear();
                break Exit::Released;
            }
            Frame::Cast {
                target: Target::Worker,
                body: Request::Stop,
            } => break Exit::Stopped,
            Frame::Cast {
                target: Target::Worker,
                body,
            } => {
                lock(&devices).handle_worker(body);
            }
            Frame::Cast {
                target: Target::Device { device_ref },
                body,
            } => {
                lock(&devices).handle_device(&device_ref, body);
            }
            other => warn!(frame = ?other, "Ignoring unexpected frame"),
        }
    };

    tasks.shutdown().await;
    drop(tx);
    writer.finish().await;

    info!(worker = %options.worker_name, exit = ?exit, "Session ended");
    Ok(exit)
}

fn lock(devices: &Mutex<DeviceTable>) -> std::sync::MutexGuard<'_, DeviceTable> {
    devices.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            warn!(error = %e, "Failed to write frame");
            break;
        }
    }
}
