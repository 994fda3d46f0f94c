//! Tracing initialization (fmt subscriber + env filter).
//!
//! Log levels are controlled through the standard `RUST_LOG` environment
//! variable; the default is `info`.

use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Initialize tracing with console output.
///
/// Idempotent in the sense that a second call returns an error from
/// `try_init` rather than panicking, so tests can call it freely.
pub fn init_telemetry() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    info!("Telemetry initialized");
    Ok(())
}
