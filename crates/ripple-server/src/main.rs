//! # Ripple
//!
//! Real-time publish/subscribe hub with channel semantics.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! ripple
//!
//! # Run with a config file
//! RIPPLE_CONFIG=/etc/ripple/ripple.toml ripple
//!
//! # Run with environment overrides
//! RIPPLE_PORT=8080 RIPPLE_HOST=0.0.0.0 ripple
//! ```

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ripple=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ripple_server::Config::load()?;
    tracing::info!(
        "Starting Ripple on {}:{}",
        config.server.host,
        config.server.port
    );

    ripple_server::run_server(config).await
}
