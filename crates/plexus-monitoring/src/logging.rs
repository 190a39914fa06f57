//! Structured-logging installation from the kernel's logger configuration.
//!
//! Call [`init_logging`] once at process start. Pretty output is for
//! development terminals; the default is JSON lines for log shippers.
//! Re-initialization is a no-op (the first subscriber wins), matching the
//! configure-once policy of the other globals.

use tracing::warn;
use tracing_subscriber::EnvFilter;

use plexus_kernel::config::LoggerConfig;

/// Install the global tracing subscriber. Returns `false` when a subscriber
/// was already installed.
pub fn init_logging(config: &LoggerConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_filter()));

    let installed = if config.pretty_print {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .pretty()
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
    };

    match installed {
        Ok(()) => true,
        Err(_) => {
            warn!("Logging already initialized; keeping the existing subscriber");
            false
        }
    }
}
