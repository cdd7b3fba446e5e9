//! Process-wide `tracing` setup for hosts and plugins.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Environment variable holding the filter directives.
pub const LOG_ENV: &str = "RUST_LOG";

const DEFAULT_DIRECTIVES: &str = "info";

/// Installs a formatting subscriber filtered by `RUST_LOG`, `info` when unset
/// or unparsable. Fails if a global subscriber is already installed.
pub fn init() -> anyhow::Result<()> {
    let directives = std::env::var(LOG_ENV).unwrap_or_else(|_| DEFAULT_DIRECTIVES.into());
    init_with(&directives)
}

/// Like `init`, with explicit filter directives.
pub fn init_with(directives: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(directives).or_else(|_| EnvFilter::try_new(DEFAULT_DIRECTIVES))?;
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()?;
    Ok(())
}
