//! Logging setup

use crate::config::CatalogConfig;
use tracing_subscriber::{filter::EnvFilter, fmt};

/// Install a `fmt` subscriber. RUST_LOG wins over `config.log_level`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging(config: &CatalogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = fmt().with_env_filter(filter).with_target(true).try_init();
}
