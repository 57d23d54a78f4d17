use tracing_subscriber::EnvFilter;

use crate::config::{ProcessConfig, DEFAULT_LOG_LEVEL};

/// Compact human-readable logs on stderr; stdout belongs to the protocol.
///
/// Filter precedence: `HORTD_LOG`, then `RUST_LOG`, then `warn`.
pub fn init(config: &ProcessConfig) {
    let filter = config
        .log_filter
        .as_deref()
        .and_then(|f| EnvFilter::try_new(f).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_LEVEL));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact();

    // A second init (tests) is a no-op.
    let _ = subscriber.try_init();
}
