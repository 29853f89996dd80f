//! Logging setup.
//!
//! Structured logging through `tracing-subscriber`: a console fmt layer
//! filtered by `RUST_LOG` (falling back to the `log_level` config key) plus,
//! when Slack forwarding is configured, the [`SlackLayer`] from
//! [`crate::slack`].

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::slack::SlackLayer;

/// Initialise the global subscriber. `RUST_LOG` wins over the configured
/// level.
pub fn init_telemetry(log_level: &str, slack: Option<SlackLayer>) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_lowercase()));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(slack)
        .try_init()?;
    Ok(())
}
