//! Logging configuration using tracing.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Level precedence: `--log-level`, then the config file, then `info`.
/// `RUST_LOG` overrides all of them when set.
pub fn resolve_level<'a>(cli: Option<&'a str>, config: &'a str) -> &'a str {
    match cli {
        Some(level) if !level.trim().is_empty() => level,
        _ if !config.trim().is_empty() => config,
        _ => "info",
    }
}

/// Initialize logging with the specified level
pub fn init(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialise logging: {e}"))
}
