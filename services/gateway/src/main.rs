use std::sync::Arc;

use anyhow::{Context, Result};
use rally_session::SessionRegistry;
use tokio::net::TcpListener;

use gateway::agent::AgentFactory;
use gateway::config::GatewayConfig;
use gateway::observability;
use gateway::router::{PingRouter, Router};
use gateway::serialize::JsonSerializer;
use gateway::server;

#[tokio::main]
async fn main() -> Result<()> {
    let metrics_handle = observability::init_observability();
    let config = GatewayConfig::from_env_or_yaml()?;

    tokio::spawn(observability::serve_metrics(
        metrics_handle,
        config.metrics_bind,
    ));

    let registry = SessionRegistry::new();
    let factory = Arc::new(
        AgentFactory::from_config(&config, Arc::new(JsonSerializer), registry)
            .context("build agent factory")?,
    );
    let router: Arc<dyn Router> = Arc::new(PingRouter);

    let listener = TcpListener::bind(config.listen_bind)
        .await
        .with_context(|| format!("bind {}", config.listen_bind))?;
    tracing::info!(addr = %config.listen_bind, "gateway listening");
    server::serve(listener, factory, router).await
}
