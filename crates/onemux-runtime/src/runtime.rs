//! Runtime orchestration: wires the router to the configured connections
//! and drives it until shutdown.

use std::sync::Arc;

use tracing::info;

use onemux_core::ProxyHooks;
use onemux_proxy::ProxyRouter;

use crate::config::OnemuxConfig;
use crate::store::default_hooks;

/// The running proxy service.
pub struct Runtime {
    router: Arc<ProxyRouter>,
}

impl Runtime {
    /// Creates a runtime with the default in-memory hooks.
    pub fn new(config: OnemuxConfig) -> Self {
        Self::with_hooks(config, default_hooks())
    }

    /// Creates a runtime with externally provided hook implementations.
    pub fn with_hooks(config: OnemuxConfig, hooks: ProxyHooks) -> Self {
        let router = ProxyRouter::new(config.connections, hooks);
        Self { router }
    }

    /// The router, for embedding in a larger service.
    pub fn router(&self) -> &Arc<ProxyRouter> {
        &self.router
    }

    /// Applies a freshly loaded configuration to the live router: route
    /// table, port listeners and the target sets of running connections.
    pub async fn apply_config(&self, config: OnemuxConfig) {
        self.router.reload(config.connections).await;
    }

    /// Serves until ctrl-c, then shuts everything down.
    pub async fn run(&self) -> anyhow::Result<()> {
        self.router.serve();
        tokio::signal::ctrl_c().await?;
        info!("shutdown signal received");
        self.router.shutdown().await;
        Ok(())
    }
}
