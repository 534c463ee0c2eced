//! # devpool-id
//!
//! Typed identifiers shared by the device pool agent and its workers.
//!
//! Every identifier is `{prefix}_{ulid}`:
//! - `dev_01HV4Z2WQXKJNM8GPQY6VBKC3D` names a leased device; it is the
//!   handle callers hold and the key the pool uses for the device's slot
//! - `wrk_01HV4Z3MXNKPQR9HSTZ7WCLD4E` names a worker process; it is passed
//!   to the worker on its command line and used for its log file
//!
//! The prefix keeps a device handle from being mistaken for a worker name,
//! and the ULID keeps listings roughly ordered by creation time.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
