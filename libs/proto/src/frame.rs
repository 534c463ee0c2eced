//! Frame envelope and NDJSON framing.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::messages::{Request, Response};

/// Upper bound for a single encoded frame, newline included.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Errors from reading or writing frames.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid frame: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("frame exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

/// Recipient of a request inside a worker process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Target {
    /// The worker process itself.
    Worker,
    /// A device hosted by the worker.
    Device { device_ref: String },
}

impl Target {
    pub fn device(device_ref: impl Into<String>) -> Self {
        Target::Device {
            device_ref: device_ref.into(),
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Worker => write!(f, "worker"),
            Target::Device { device_ref } => write!(f, "device:{}", device_ref),
        }
    }
}

/// One line on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// First frame a worker sends after connecting.
    Hello {
        worker_name: String,
        protocol: u32,
        backend: String,
        otr_only: bool,
    },

    /// Coordinator accepted the hello; the worker is now registered.
    Welcome { worker_name: String },

    /// Coordinator refused the hello and will close the connection.
    Rejected { reason: String },

    /// A request expecting exactly one reply with the same id.
    Request {
        id: u64,
        target: Target,
        body: Request,
    },

    /// Reply to the request with the same id.
    Reply { id: u64, body: Response },

    /// Fire-and-forget request; never answered.
    Cast { target: Target, body: Request },
}

/// Reads frames from a byte stream, one JSON document per line.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    buf: String,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
            buf: String::new(),
        }
    }

    /// Reads the next frame. `Ok(None)` means the peer closed the stream.
    ///
    /// Blank lines are skipped.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, ProtoError> {
        loop {
            self.buf.clear();
            let read = self.inner.read_line(&mut self.buf).await?;
            if read == 0 {
                return Ok(None);
            }
            if read > MAX_FRAME_BYTES {
                return Err(ProtoError::TooLarge {
                    limit: MAX_FRAME_BYTES,
                });
            }

            let line = self.buf.trim();
            if line.is_empty() {
                continue;
            }

            return serde_json::from_str(line)
                .map(Some)
                .map_err(ProtoError::Decode);
        }
    }
}

/// Writes one frame followed by a newline and flushes.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), ProtoError> {
    let mut line = serde_json::to_vec(frame).map_err(ProtoError::Encode)?;
    if line.len() + 1 > MAX_FRAME_BYTES {
        return Err(ProtoError::TooLarge {
            limit: MAX_FRAME_BYTES,
        });
    }
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}
