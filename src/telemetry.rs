//! Tracing subscriber setup

use tracing_subscriber::EnvFilter;

use crate::config::LoggingSettings;
use crate::error::HandoffError;

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `logging.level` when set. Calling this twice returns
/// an error instead of panicking.
pub fn init_tracing(settings: &LoggingSettings) -> Result<(), HandoffError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .map_err(|e| HandoffError::Config(format!("logging.level: {e}")))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let installed = if settings.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| HandoffError::Config(format!("tracing already initialised: {e}")))?;

    tracing::info!(level = %settings.level, json = settings.json, "Tracing initialised");
    Ok(())
}
