use anyhow::Context;
use clap::Parser;
use ipnet::Ipv4Net;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use weft_buffer::{PartitionDetector, PartitionMonitor, PeriodicFlush, ResultBuffer, UpstreamSink};
use weft_core::token::LeaseSigner;
use weft_hub::config::HubConfig;
use weft_hub::lease::LeaseIssuer;
use weft_hub::peers::{HubIdentity, PeerRegistry};
use weft_hub::pool::IpPool;
use weft_hub::provision::{HubInfo, ProvisioningService};
use weft_hub::reaper::{LeaseReaper, ReaperLoop};
use weft_hub::stats::{
    BufferStatsProvider, LeaseExpirationStatsProvider, LeaseRevocationStatsProvider,
    PartitionStatsProvider, PoolStatsProvider,
};
use weft_hub::wg::SystemWgControl;
use weft_hub::{AppState, HubServer};
use weft_monitor::{
    AlertThresholds, AuditLogger, CrashDetector, FileAuditLog, HealthAggregator, MonitorState,
    MonitoringFacade, Timeline,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,weft_hub=debug")),
        )
        .init();

    let cfg = HubConfig::parse();
    tracing::info!(config = ?cfg, "starting weft hub");

    let bind: SocketAddr = cfg.bind.parse().context("parse bind addr")?;
    let overlay: Ipv4Net = cfg.overlay_cidr.parse().context("parse overlay CIDR")?;
    let hub_address: Ipv4Net = cfg.hub_address.parse().context("parse hub address")?;
    let reserved: Vec<Ipv4Addr> = cfg
        .reserved_ips
        .iter()
        .map(|raw| raw.trim().parse().context("parse reserved IP"))
        .collect::<anyhow::Result<_>>()?;

    // Monitoring plane.
    let thresholds = AlertThresholds::global();
    let timeline = Arc::new(Timeline::new(cfg.timeline_max_events));
    let audit = Arc::new(AuditLogger::new(Arc::new(
        FileAuditLog::new(&cfg.audit_log_dir, cfg.audit_max_bytes, cfg.audit_backup_count)
            .context("open audit log directory")?,
    )));
    let health = Arc::new(HealthAggregator::new(thresholds.clone()));
    let facade = Arc::new(MonitoringFacade::new(
        timeline.clone(),
        audit.clone(),
        health.clone(),
    ));

    // Hub core.
    let pool = Arc::new(IpPool::new(overlay, &reserved).context("build IP pool")?);
    let control = Arc::new(SystemWgControl);
    let registry = Arc::new(PeerRegistry::new(
        cfg.interface.clone(),
        cfg.config_path.clone(),
        HubIdentity {
            private_key: cfg.hub_private_key.clone(),
            address: hub_address,
            listen_port: cfg.listen_port,
        },
        control.clone(),
    ));
    let provisioning = Arc::new(ProvisioningService::new(
        pool.clone(),
        registry.clone(),
        HubInfo {
            public_key: cfg.hub_public_key.clone(),
            endpoint: cfg.hub_endpoint.clone(),
        },
        None,
        Some(facade.clone()),
    ));

    let store = Arc::new(weft_core::store::MemoryStore::new());
    let leases = Arc::new(LeaseIssuer::new(
        store.clone(),
        LeaseSigner::from_secret(&cfg.secret_key),
        Some(facade.clone()),
    ));
    let reaper = Arc::new(LeaseReaper::new(store, Some(facade.clone())));
    let crash_detector = Arc::new(CrashDetector::new(
        chrono::Duration::seconds(cfg.crash_stale_after_secs as i64),
        chrono::Duration::minutes(10),
    ));

    // Partition-tolerant buffering.
    if let Some(parent) = std::path::Path::new(&cfg.buffer_path).parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("create buffer directory")?;
    }
    let buffer = Arc::new(
        ResultBuffer::open(&cfg.buffer_path, cfg.buffer_capacity, cfg.buffer_max_retries)
            .await
            .context("open result buffer")?,
    );
    let sink = Arc::new(
        UpstreamSink::new(
            cfg.upstream_url.clone(),
            Duration::from_secs(cfg.health_check_timeout_secs),
        )
        .context("build upstream sink")?,
    );
    let detector = Arc::new(
        PartitionDetector::new(
            cfg.upstream_url.clone(),
            Duration::from_secs(cfg.health_check_timeout_secs),
            buffer.clone(),
            sink.clone(),
            None,
        )
        .context("build partition detector")?,
    );

    // Health registry.
    health.register("ip_pool", Arc::new(PoolStatsProvider(pool.clone())));
    health.register("result_buffer", Arc::new(BufferStatsProvider(buffer.clone())));
    health.register(
        "partition_detection",
        Arc::new(PartitionStatsProvider(detector.clone())),
    );
    health.register(
        "lease_revocation",
        Arc::new(LeaseRevocationStatsProvider(leases.clone())),
    );
    health.register(
        "lease_expiration",
        Arc::new(LeaseExpirationStatsProvider(reaper.clone())),
    );
    health.register("node_crash_detection", crash_detector.clone());

    // Background loops.
    let monitor = PartitionMonitor::start(
        detector.clone(),
        Duration::from_secs(cfg.health_check_interval_secs),
    );
    let flush = PeriodicFlush::start(
        buffer.clone(),
        sink.clone(),
        Duration::from_secs(cfg.flush_interval_secs),
    );
    let lease_sweep = ReaperLoop::start(
        reaper,
        Duration::from_secs(cfg.lease_sweep_interval_secs),
    );

    let wg_monitor = Arc::new(weft_hub::monitoring::WgMonitor::new(
        registry.clone(),
        control.clone(),
    ));

    let app = weft_hub::router(AppState {
        pool,
        registry,
        provisioning,
        leases,
        control,
        monitor: wg_monitor,
        detector: Some(detector),
    })
    .merge(weft_monitor::router(MonitorState {
        health,
        timeline,
        thresholds,
        facade,
    }));

    let server = HubServer::start(app, bind).await?;
    tracing::info!(addr = %server.addr, "hub control API listening");

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    tracing::info!("shutting down");

    server.shutdown().await?;
    monitor.stop().await;
    flush.stop().await;
    lease_sweep.stop().await;
    Ok(())
}
