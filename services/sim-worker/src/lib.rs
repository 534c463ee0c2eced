//! # devpool-sim-worker
//!
//! A worker process that hosts simulated devices. The pool agent launches
//! it with the coordinator address on the command line; the worker connects
//! back, registers under its name and serves device requests until it is
//! stopped or the coordinator goes away.
//!
//! The same [`run`] entry point backs the `sim-worker` binary and the
//! in-process workers used by the agent's integration tests.

pub mod devices;
pub mod error;
pub mod logging;
pub mod session;

pub use devices::{DeviceTable, SimDevice};
pub use error::SimError;
pub use session::{run, Exit, WorkerOptions};
