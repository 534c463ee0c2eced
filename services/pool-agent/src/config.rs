//! Configuration for the pool agent.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::lease::Ttl;

/// Pool agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of workers (and therefore leased devices).
    pub max_devices: usize,

    /// Warm pool target as a percentage of `max_devices`.
    pub normal_load_factor: u32,

    /// Refill threshold as a percentage of `max_devices`.
    pub min_load_factor: u32,

    /// TTL for leases created without an explicit one. `u64::MAX` never expires.
    pub default_ttl_ms: u64,

    /// Timeout for device calls in seconds.
    pub rpc_timeout_secs: u64,

    /// Worker health-check interval in seconds.
    pub ping_interval_secs: u64,

    /// Reaper period in seconds.
    pub reap_interval_secs: u64,

    /// How long a launched worker has to register, in seconds.
    pub lifecycle_timeout_secs: u64,

    /// Pause after a successful login, in milliseconds.
    pub login_settle_ms: u64,

    /// Backend type passed to workers.
    pub backend_type: String,

    /// Whether workers run in otr-only mode.
    pub otr_only: bool,

    /// Worker executable.
    pub worker_bin: PathBuf,

    /// Directory holding one log file per worker.
    pub log_dir: PathBuf,

    /// Coordinator bind address.
    pub coordinator_addr: SocketAddr,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_devices: 10,
            normal_load_factor: 50,
            min_load_factor: 20,
            default_ttl_ms: 600_000,
            rpc_timeout_secs: 100,
            ping_interval_secs: 20,
            reap_interval_secs: 120,
            lifecycle_timeout_secs: 90,
            login_settle_ms: 2_000,
            backend_type: "staging".to_string(),
            otr_only: true,
            worker_bin: PathBuf::from("sim-worker"),
            log_dir: PathBuf::from("target/logcat"),
            coordinator_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            max_devices: env_or("DEVPOOL_MAX_DEVICES", defaults.max_devices)?,
            normal_load_factor: env_or("DEVPOOL_NORMAL_LOAD_FACTOR", defaults.normal_load_factor)?,
            min_load_factor: env_or("DEVPOOL_MIN_LOAD_FACTOR", defaults.min_load_factor)?,
            default_ttl_ms: env_or("DEVPOOL_DEFAULT_TTL_MS", defaults.default_ttl_ms)?,
            rpc_timeout_secs: env_or("DEVPOOL_RPC_TIMEOUT_SECS", defaults.rpc_timeout_secs)?,
            ping_interval_secs: env_or("DEVPOOL_PING_INTERVAL_SECS", defaults.ping_interval_secs)?,
            reap_interval_secs: env_or("DEVPOOL_REAP_INTERVAL_SECS", defaults.reap_interval_secs)?,
            lifecycle_timeout_secs: env_or(
                "DEVPOOL_LIFECYCLE_TIMEOUT_SECS",
                defaults.lifecycle_timeout_secs,
            )?,
            login_settle_ms: env_or("DEVPOOL_LOGIN_SETTLE_MS", defaults.login_settle_ms)?,
            backend_type: std::env::var("DEVPOOL_BACKEND").unwrap_or(defaults.backend_type),
            otr_only: env_or("DEVPOOL_OTR_ONLY", defaults.otr_only)?,
            worker_bin: std::env::var("DEVPOOL_WORKER_BIN")
                .map(PathBuf::from)
                .unwrap_or(defaults.worker_bin),
            log_dir: std::env::var("DEVPOOL_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.log_dir),
            coordinator_addr: env_or("DEVPOOL_COORDINATOR_ADDR", defaults.coordinator_addr)?,
            log_level: std::env::var("DEVPOOL_LOG_LEVEL").unwrap_or(defaults.log_level),
        };

        config.validate()?;
        Ok(config)
    }

    /// Checks the sizing knobs and the periods driving background loops.
    pub fn validate(&self) -> Result<()> {
        if self.max_devices == 0 {
            bail!("DEVPOOL_MAX_DEVICES must be at least 1");
        }
        for (name, secs) in [
            ("DEVPOOL_RPC_TIMEOUT_SECS", self.rpc_timeout_secs),
            ("DEVPOOL_PING_INTERVAL_SECS", self.ping_interval_secs),
            ("DEVPOOL_REAP_INTERVAL_SECS", self.reap_interval_secs),
            ("DEVPOOL_LIFECYCLE_TIMEOUT_SECS", self.lifecycle_timeout_secs),
        ] {
            if secs == 0 {
                bail!("{} must be at least 1", name);
            }
        }
        for (name, factor) in [
            ("DEVPOOL_NORMAL_LOAD_FACTOR", self.normal_load_factor),
            ("DEVPOOL_MIN_LOAD_FACTOR", self.min_load_factor),
        ] {
            if factor > 100 {
                bail!("{} must be between 0 and 100, got {}", name, factor);
            }
        }
        if self.log_dir.as_os_str().is_empty() {
            bail!("DEVPOOL_LOG_DIR must not be empty");
        }
        Ok(())
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            log_dir: self.log_dir.clone(),
            backend_type: self.backend_type.clone(),
            otr_only: self.otr_only,
            lifecycle_timeout: Duration::from_secs(self.lifecycle_timeout_secs),
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            ..WorkerConfig::default()
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_size: self.max_devices,
            normal_load_factor: self.normal_load_factor,
            min_load_factor: self.min_load_factor,
            action_timeout: Duration::from_secs(self.rpc_timeout_secs),
            login_settle_delay: Duration::from_millis(self.login_settle_ms),
            worker: self.worker_config(),
            ..PoolConfig::default()
        }
    }

    pub fn lease_config(&self) -> LeaseConfig {
        let reap_interval = Duration::from_secs(self.reap_interval_secs);
        LeaseConfig {
            default_ttl: Ttl::from_millis(self.default_ttl_ms),
            reap_interval,
            first_reap_delay: reap_interval / 2,
            ..LeaseConfig::default()
        }
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {}: '{}'", key, raw)),
        Err(_) => Ok(default),
    }
}

/// Settings shared by every worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub log_dir: PathBuf,
    pub backend_type: String,
    pub otr_only: bool,
    /// Registration deadline after launch.
    pub lifecycle_timeout: Duration,
    /// Bound on the graceful stop issued by a restart.
    pub stop_timeout: Duration,
    pub ping_interval: Duration,
    pub echo_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("target/logcat"),
            backend_type: "staging".to_string(),
            otr_only: true,
            lifecycle_timeout: Duration::from_secs(90),
            stop_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(20),
            echo_timeout: crate::rpc::ECHO_TIMEOUT,
        }
    }
}

/// Host pool sizing and device creation settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_size: usize,
    pub normal_load_factor: u32,
    pub min_load_factor: u32,
    /// Worker launches allowed to run at once.
    pub spawn_concurrency: usize,
    /// Device creations allowed to run at once.
    pub device_concurrency: usize,
    /// Default timeout of device calls.
    pub action_timeout: Duration,
    pub login_settle_delay: Duration,
    pub worker: WorkerConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            normal_load_factor: 50,
            min_load_factor: 20,
            spawn_concurrency: optimal_spawn_concurrency(),
            device_concurrency: 2,
            action_timeout: Duration::from_secs(100),
            login_settle_delay: Duration::from_secs(2),
            worker: WorkerConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Warm pool target: `max(1, M * normal / 100)`.
    pub fn normal_size(&self) -> usize {
        derived_size(self.max_size, self.normal_load_factor)
    }

    /// Refill threshold: `max(1, M * min / 100)`.
    pub fn min_size(&self) -> usize {
        derived_size(self.max_size, self.min_load_factor)
    }
}

fn derived_size(max_size: usize, factor: u32) -> usize {
    (max_size * factor as usize / 100).max(1)
}

/// Leaves a couple of cores free on bigger machines.
fn optimal_spawn_concurrency() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    if cores > 3 {
        cores - 2
    } else {
        2
    }
}

/// Lease registry settings.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub default_ttl: Ttl,
    pub reap_interval: Duration,
    pub first_reap_delay: Duration,
    /// How long an explicit batch release waits for completion.
    pub release_timeout: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            default_ttl: Ttl::Finite(Duration::from_secs(600)),
            reap_interval: Duration::from_secs(120),
            first_reap_delay: Duration::from_secs(60),
            release_timeout: Duration::from_secs(100),
        }
    }
}
