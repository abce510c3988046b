use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::LogFormat;

const DEFAULT_FILTER: &str = "info,shipgate=info";

/// Logs go to stderr; stdout carries command output only.
pub fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let base = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(filter);
    // A second init (tests) is not an error worth failing over.
    let _ = match format {
        LogFormat::Json => registry.with(base.json()).try_init(),
        LogFormat::Text => registry.with(base.compact()).try_init(),
    };
}
