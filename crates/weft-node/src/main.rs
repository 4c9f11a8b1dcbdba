use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use weft_node::config::NodeAgentConfig;
use weft_node::{
    CoordinatorClient, HttpCoordinatorClient, HubConfig, NodeConfig, NodeConnector,
    SystemLinkControl,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,weft_node=debug")),
        )
        .init();

    let cfg = NodeAgentConfig::parse();
    tracing::info!(config = ?cfg, "starting weft node agent");

    let node_config = NodeConfig {
        interface_name: cfg.interface.clone(),
        private_key: cfg.private_key.clone(),
        address: cfg.address.clone(),
        hub: HubConfig {
            public_key: cfg.hub_public_key.clone(),
            endpoint: cfg.hub_endpoint.clone(),
            allowed_ips: cfg.hub_allowed_ips.clone(),
            persistent_keepalive: (cfg.keepalive_secs > 0).then_some(cfg.keepalive_secs),
        },
    };

    let coordinator: Option<Arc<dyn CoordinatorClient>> = match &cfg.coordinator_url {
        Some(url) => Some(Arc::new(
            HttpCoordinatorClient::new(url.clone(), Duration::from_secs(10))
                .context("build coordinator client")?,
        )),
        None => None,
    };

    let connector = NodeConnector::new(node_config, Arc::new(SystemLinkControl), coordinator)
        .context("validate node configuration")?
        .with_retry_policy(
            cfg.max_retries,
            Duration::from_secs(2),
            Duration::from_secs(60),
            Duration::from_secs(cfg.connection_timeout_secs),
        );

    let report = connector.connect().await.context("connect to hub")?;
    tracing::info!(
        interface = %report.interface,
        attempts = report.attempts,
        node_id = report.node_id.as_deref().unwrap_or("-"),
        "tunnel established"
    );

    let interval = Duration::from_secs(cfg.health_interval_secs);
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let health = connector.check().await;
                tracing::info!(
                    event = "weft.node.health",
                    status = ?health.status,
                    can_ping_hub = ?health.can_ping_hub,
                    handshake_age_s = ?health.handshake_age_s,
                    uptime_s = ?health.uptime_s,
                    "tunnel health"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
        }
    }

    connector.disconnect().await;
    Ok(())
}
