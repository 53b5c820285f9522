use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggerConfig};

/// Initialize structured logging with tracing-subscriber.
///
/// `RUST_LOG` overrides the configured level. Logs go to stderr so that the
/// `stdout` output stays clean. Calling this twice keeps the first subscriber.
pub fn init(config: &LoggerConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let result = match config.format {
        LogFormat::Plain => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if result.is_err() {
        tracing::debug!("logging already initialized");
    }
}
