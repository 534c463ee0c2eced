//! Logging initialization for the simulated worker.
//!
//! The agent redirects stdout and stderr into the per-worker log file, so
//! plain compact lines on stdout are all that is needed.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize compact logging to stdout.
pub fn init() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_ansi(false)
                .with_writer(std::io::stdout),
        )
        .try_init()?;

    Ok(())
}
