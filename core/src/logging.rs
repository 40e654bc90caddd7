//! Default tracing initialisers.
//!
//! Log level defaults to INFO and is adjustable through `RUST_LOG`
//! (eg/ `RUST_LOG=arara_core=debug,arara_data=warn`).

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise standard non-JSON logging.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::filter::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with(tracing_subscriber::fmt::layer())
        .init()
}

/// Initialise JSON logging for aggregators.
pub fn init_json_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::filter::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with(tracing_subscriber::fmt::layer().json().flatten_event(true))
        .init()
}
