use anyhow::Context;
use tracing::info;

use onemux_runtime::{Runtime, config, logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => config::load_config_from_file(&path)
            .with_context(|| format!("loading configuration from {path}"))?,
        None => config::load_config().context("loading configuration")?,
    };

    let _log_guard = logging::init(&config.logging);
    info!(connections = config.connections.len(), "onemux starting");

    Runtime::new(config).run().await
}
