//! devpool agent library
//!
//! Keeps a warm pool of worker processes, attaches leased devices to them
//! and reaps leases nobody touched within their TTL.
//!
//! ## Architecture
//!
//! ```text
//! DeviceService
//! ├── LeaseRegistry     (handles, sliding TTLs, reaper)
//! │   └── HostPool      (warm slots, sizing, capacity)
//! │       └── WorkerProcess(name)  (launch, ping loop, restart, shutdown)
//! └── Coordinator       (TCP rendezvous, request correlation)
//! ```
//!
//! Every remote call goes through [`rpc::call`], which bounds it with a
//! timeout.
//!
//! ## Modules
//!
//! - `coordinator`: worker registration and the socket transport
//! - `rpc`: endpoint capability and the bounded call facade
//! - `worker`: one worker process and its lifecycle
//! - `device`: the device RPC surface
//! - `pool`: the host pool
//! - `lease`: the lease registry and reaper
//! - `service`: the service facade

pub mod config;
pub mod coordinator;
pub mod device;
pub mod error;
pub mod launcher;
pub mod lease;
pub mod pending;
pub mod pool;
pub mod rpc;
pub mod service;
pub mod worker;

// Re-export commonly used types
pub use config::{Config, LeaseConfig, PoolConfig, WorkerConfig};
pub use coordinator::Coordinator;
pub use device::{ActionOutcome, Device, DeviceAction, LoginCredentials};
pub use error::{DeviceError, PoolError, RpcError, ServiceError, WorkerError};
pub use launcher::{LaunchSpec, Launcher, ProcessHandle, ProcessLauncher};
pub use lease::{LeaseRegistry, Ttl};
pub use pool::{CachedDevice, HostPool, PoolStats};
pub use service::{DeviceInfo, DeviceService};
pub use worker::{Liveness, WorkerProcess};
