//! # devpool-proto
//!
//! The protocol spoken between the pool agent's coordinator and a worker
//! process. Frames are newline-delimited JSON over a single TCP stream that
//! the worker opens towards the coordinator.
//!
//! ```text
//! worker                         coordinator
//!   | -- hello {worker_name} -->     |
//!   | <-- welcome ---------------    |
//!   | <-- request {id, target} --    |
//!   | -- reply {id} ------------>    |
//!   | <-- cast {target} ---------    |   (no reply)
//! ```
//!
//! A `target` addresses either the worker itself or one of the devices it
//! hosts, by the `device_ref` the worker handed out when it spawned it.

mod frame;
mod messages;

pub use frame::{write_frame, Frame, FrameReader, ProtoError, Target, MAX_FRAME_BYTES};
pub use messages::{
    AssetsVersion, MessageInfo, ParseValueError, Reaction, Request, Response,
};

/// Current protocol version, checked during the hello handshake.
pub const PROTOCOL_VERSION: u32 = 1;
