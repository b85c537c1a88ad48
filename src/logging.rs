//! Logging setup
//!
//! Libraries only emit `tracing` events; whoever embeds the sink installs a
//! subscriber. `RUST_LOG` wins over the default filter.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install a formatted subscriber. Does nothing if one is already installed.
pub fn init(default_filter: &str) {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );

    if tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_err()
    {
        tracing::debug!("Subscriber already installed");
    }
}
