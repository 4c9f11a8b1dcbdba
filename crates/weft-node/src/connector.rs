//! Node connector: brings the local interface up, establishes the tunnel to
//! the hub with bounded exponential-backoff retries, and reports tunnel
//! health.
//!
//! State machine: `Disconnected -> Applying -> Verifying -> Connected`,
//! dropping back to `Degraded`/`Disconnected` as probes fail or the link is
//! torn down.

use crate::wg::{parse_handshake_age, HubPeer, LinkControl};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use weft_core::model::PeerConfiguration;

/// Handshake older than this marks the tunnel degraded.
const STALE_HANDSHAKE_SECS: u64 = 180;

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("missing required configuration fields: {}", missing.join(", "))]
    ConfigValidation { missing: Vec<String> },
    #[error("connection timeout after {0:.1}s")]
    Timeout(f64),
    #[error("max retries exceeded ({attempts} attempts); last error: {last_error}")]
    Connection { attempts: u32, last_error: String },
}

/// Node-side tunnel configuration, typically assembled from the hub's
/// provisioning response plus the locally held private key.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub interface_name: String,
    pub private_key: String,
    /// Local overlay address with prefix, e.g. `10.0.0.2/24`.
    pub address: String,
    pub hub: HubConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    pub public_key: String,
    pub endpoint: String,
    pub allowed_ips: String,
    #[serde(default)]
    pub persistent_keepalive: Option<u16>,
}

impl NodeConfig {
    /// Build the node config from an issued [`PeerConfiguration`].
    pub fn from_peer_configuration(
        config: &PeerConfiguration,
        interface_name: impl Into<String>,
        private_key: impl Into<String>,
    ) -> Self {
        let prefix = config.allowed_ips.prefix_len();
        Self {
            interface_name: interface_name.into(),
            private_key: private_key.into(),
            address: format!("{}/{}", config.assigned_ip, prefix),
            hub: HubConfig {
                public_key: config.hub_public_key.clone(),
                endpoint: config.hub_endpoint.clone(),
                allowed_ips: config.allowed_ips.to_string(),
                persistent_keepalive: Some(config.persistent_keepalive),
            },
        }
    }

    fn validate(&self) -> Result<(), ConnectorError> {
        let mut missing = Vec::new();
        let mut require = |name: &str, value: &str| {
            if value.trim().is_empty() {
                missing.push(name.to_string());
            }
        };

        require("interface_name", &self.interface_name);
        require("private_key", &self.private_key);
        require("address", &self.address);
        require("hub.public_key", &self.hub.public_key);
        require("hub.endpoint", &self.hub.endpoint);
        require("hub.allowed_ips", &self.hub.allowed_ips);

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConnectorError::ConfigValidation { missing })
        }
    }

    fn hub_host(&self) -> &str {
        self.hub
            .endpoint
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&self.hub.endpoint)
    }
}

/// Optional coordinator registration performed after a successful connect.
#[async_trait]
pub trait CoordinatorClient: Send + Sync {
    async fn register_node(&self, registration: &NodeRegistration) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeRegistration {
    pub wireguard_address: String,
    pub interface_name: String,
    pub hub_endpoint: String,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorState {
    Disconnected,
    Applying,
    Verifying,
    Connected,
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeHealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Disconnected,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: NodeHealthStatus,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_ping_hub: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handshake_age_s: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_s: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectReport {
    pub interface: String,
    pub connected_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub attempts: u32,
}

#[derive(Debug, Default)]
struct ConnectorStatus {
    state: Option<ConnectorState>,
    connected_at: Option<DateTime<Utc>>,
    node_id: Option<String>,
}

impl std::fmt::Debug for NodeConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConnector")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

pub struct NodeConnector {
    config: NodeConfig,
    link: Arc<dyn LinkControl>,
    coordinator: Option<Arc<dyn CoordinatorClient>>,
    max_retries: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    connection_timeout: Duration,
    status: Mutex<ConnectorStatus>,
}

impl NodeConnector {
    pub fn new(
        config: NodeConfig,
        link: Arc<dyn LinkControl>,
        coordinator: Option<Arc<dyn CoordinatorClient>>,
    ) -> Result<Self, ConnectorError> {
        config.validate()?;
        Ok(Self {
            config,
            link,
            coordinator,
            max_retries: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            connection_timeout: Duration::from_secs(30),
            status: Mutex::new(ConnectorStatus::default()),
        })
    }

    pub fn with_retry_policy(
        mut self,
        max_retries: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
        connection_timeout: Duration,
    ) -> Self {
        self.max_retries = max_retries;
        self.initial_backoff = initial_backoff;
        self.max_backoff = max_backoff;
        self.connection_timeout = connection_timeout;
        self
    }

    pub fn state(&self) -> ConnectorState {
        self.status
            .lock()
            .expect("connector status poisoned")
            .state
            .unwrap_or(ConnectorState::Disconnected)
    }

    fn set_state(&self, state: ConnectorState) {
        self.status.lock().expect("connector status poisoned").state = Some(state);
    }

    fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            ConnectorState::Connected | ConnectorState::Degraded
        )
    }

    /// Connect to the hub with exponential-backoff retries.
    ///
    /// A probe that exceeds `connection_timeout` short-circuits the retry
    /// loop and surfaces [`ConnectorError::Timeout`] immediately; stacking a
    /// retry budget on top of an already-elapsed timeout only delays the
    /// operator signal.
    pub async fn connect(&self) -> Result<ConnectReport, ConnectorError> {
        tracing::info!(
            event = "weft.node.connecting",
            interface = %self.config.interface_name,
            hub = %self.config.hub.endpoint,
            "connecting to hub"
        );

        let mut last_error = String::new();

        for attempt in 0..=self.max_retries {
            self.set_state(ConnectorState::Applying);
            match self.apply_config().await {
                Ok(()) => {
                    self.set_state(ConnectorState::Verifying);
                    match tokio::time::timeout(self.connection_timeout, self.probe_hub()).await {
                        Err(_elapsed) => {
                            self.set_state(ConnectorState::Disconnected);
                            tracing::warn!(
                                event = "weft.node.connect_timeout",
                                attempt = attempt + 1,
                                "connection attempt timed out"
                            );
                            return Err(ConnectorError::Timeout(
                                self.connection_timeout.as_secs_f64(),
                            ));
                        }
                        Ok(true) => {
                            let connected_at = Utc::now();
                            {
                                let mut status =
                                    self.status.lock().expect("connector status poisoned");
                                status.state = Some(ConnectorState::Connected);
                                status.connected_at = Some(connected_at);
                            }

                            let node_id = self.register().await;
                            if let Some(node_id) = &node_id {
                                self.status
                                    .lock()
                                    .expect("connector status poisoned")
                                    .node_id = Some(node_id.clone());
                            }

                            tracing::info!(
                                event = "weft.node.connected",
                                interface = %self.config.interface_name,
                                attempts = attempt + 1,
                                "connected to hub"
                            );
                            return Ok(ConnectReport {
                                interface: self.config.interface_name.clone(),
                                connected_at,
                                node_id,
                                attempts: attempt + 1,
                            });
                        }
                        Ok(false) => {
                            last_error = "connectivity verification failed".to_string();
                        }
                    }
                }
                Err(err) => {
                    last_error = err.to_string();
                    tracing::warn!(
                        event = "weft.node.apply_failed",
                        attempt = attempt + 1,
                        error = %err,
                        "failed to apply interface configuration"
                    );
                }
            }

            if attempt < self.max_retries {
                let backoff = self.backoff(attempt);
                tracing::info!(
                    event = "weft.node.retrying",
                    attempt = attempt + 2,
                    backoff_s = backoff.as_secs_f64(),
                    "retrying connection"
                );
                tokio::time::sleep(backoff).await;
            }
        }

        self.set_state(ConnectorState::Disconnected);
        let attempts = self.max_retries + 1;
        tracing::error!(
            event = "weft.node.connect_failed",
            attempts,
            last_error = %last_error,
            "exhausted connection attempts"
        );
        Err(ConnectorError::Connection {
            attempts,
            last_error,
        })
    }

    /// Tunnel health: reachability, handshake freshness, uptime.
    pub async fn check(&self) -> HealthReport {
        let (connected_at, node_id) = {
            let status = self.status.lock().expect("connector status poisoned");
            (status.connected_at, status.node_id.clone())
        };

        if !self.is_connected() {
            return HealthReport {
                status: NodeHealthStatus::Disconnected,
                connected: false,
                can_ping_hub: None,
                handshake_age_s: None,
                uptime_s: None,
                node_id,
            };
        }

        let can_ping = self
            .link
            .ping(self.config.hub_host(), 1, Duration::from_secs(2))
            .await;

        let handshake_age_s = match self.link.show(&self.config.interface_name).await {
            Ok(output) => parse_handshake_age(&output),
            Err(err) => {
                tracing::debug!(
                    event = "weft.node.show_failed",
                    error = %err,
                    "wg show failed during health check"
                );
                None
            }
        };

        let uptime_s = connected_at
            .map(|t| ((Utc::now() - t).num_milliseconds() as f64 / 1000.0).max(0.0));

        let status = if !can_ping {
            NodeHealthStatus::Unhealthy
        } else if handshake_age_s.is_some_and(|age| age > STALE_HANDSHAKE_SECS) {
            NodeHealthStatus::Degraded
        } else {
            NodeHealthStatus::Healthy
        };

        self.set_state(match status {
            NodeHealthStatus::Healthy => ConnectorState::Connected,
            _ => ConnectorState::Degraded,
        });

        HealthReport {
            status,
            connected: true,
            can_ping_hub: Some(can_ping),
            handshake_age_s,
            uptime_s,
            node_id,
        }
    }

    /// Tear the tunnel down. Teardown errors are logged, never raised; the
    /// connector state resets regardless.
    pub async fn disconnect(&self) {
        if !self.is_connected() {
            tracing::warn!(
                event = "weft.node.disconnect_noop",
                "not connected, nothing to disconnect"
            );
            return;
        }

        let interface = &self.config.interface_name;
        if let Err(err) = self.link.link_down(interface).await {
            tracing::error!(
                event = "weft.node.teardown_error",
                interface = %interface,
                error = %err,
                "failed to bring link down"
            );
        }
        if let Err(err) = self.link.delete_interface(interface).await {
            tracing::error!(
                event = "weft.node.teardown_error",
                interface = %interface,
                error = %err,
                "failed to delete interface"
            );
        }

        let mut status = self.status.lock().expect("connector status poisoned");
        status.state = Some(ConnectorState::Disconnected);
        status.connected_at = None;

        tracing::info!(
            event = "weft.node.disconnected",
            interface = %interface,
            "disconnected from hub"
        );
    }

    async fn apply_config(&self) -> anyhow::Result<()> {
        let interface = &self.config.interface_name;

        self.link.create_interface(interface).await?;
        self.link
            .set_private_key(interface, &self.config.private_key)
            .await?;
        self.link
            .set_hub_peer(
                interface,
                &HubPeer {
                    public_key: self.config.hub.public_key.clone(),
                    endpoint: self.config.hub.endpoint.clone(),
                    allowed_ips: self.config.hub.allowed_ips.clone(),
                    persistent_keepalive: self.config.hub.persistent_keepalive,
                },
            )
            .await?;
        self.link
            .add_address(interface, &self.config.address)
            .await?;
        self.link.link_up(interface).await?;
        Ok(())
    }

    async fn probe_hub(&self) -> bool {
        self.link
            .ping(self.config.hub_host(), 3, Duration::from_secs(5))
            .await
    }

    async fn register(&self) -> Option<String> {
        let coordinator = self.coordinator.as_ref()?;

        let registration = NodeRegistration {
            wireguard_address: self.config.address.clone(),
            interface_name: self.config.interface_name.clone(),
            hub_endpoint: self.config.hub.endpoint.clone(),
            registered_at: Utc::now(),
        };

        match coordinator.register_node(&registration).await {
            Ok(node_id) => {
                tracing::info!(
                    event = "weft.node.registered",
                    node_id = %node_id,
                    "registered with coordinator"
                );
                Some(node_id)
            }
            Err(err) => {
                tracing::warn!(
                    event = "weft.node.registration_failed",
                    error = %err,
                    "coordinator registration failed; continuing unregistered"
                );
                None
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt));
        exp.min(self.max_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct ScriptedLink {
        ping_script: Mutex<VecDeque<bool>>,
        ping_hangs: bool,
        apply_failures: AtomicU32,
        show_output: Mutex<String>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedLink {
        fn pings(results: &[bool]) -> Self {
            Self {
                ping_script: Mutex::new(results.iter().copied().collect()),
                ..Self::default()
            }
        }

        fn hanging() -> Self {
            Self {
                ping_hangs: true,
                ..Self::default()
            }
        }

        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LinkControl for ScriptedLink {
        async fn create_interface(&self, _interface: &str) -> anyhow::Result<()> {
            if self.apply_failures.load(Ordering::SeqCst) > 0 {
                self.apply_failures.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("RTNETLINK answers: operation not permitted");
            }
            self.record("create");
            Ok(())
        }

        async fn set_private_key(&self, _i: &str, _k: &str) -> anyhow::Result<()> {
            self.record("private-key");
            Ok(())
        }

        async fn set_hub_peer(&self, _i: &str, _h: &HubPeer) -> anyhow::Result<()> {
            self.record("peer");
            Ok(())
        }

        async fn add_address(&self, _i: &str, _a: &str) -> anyhow::Result<()> {
            self.record("address");
            Ok(())
        }

        async fn link_up(&self, _i: &str) -> anyhow::Result<()> {
            self.record("up");
            Ok(())
        }

        async fn link_down(&self, _i: &str) -> anyhow::Result<()> {
            self.record("down");
            Ok(())
        }

        async fn delete_interface(&self, _i: &str) -> anyhow::Result<()> {
            self.record("delete");
            Ok(())
        }

        async fn ping(&self, _host: &str, _count: u32, _timeout: Duration) -> bool {
            if self.ping_hangs {
                std::future::pending::<()>().await;
                unreachable!()
            }
            self.ping_script.lock().unwrap().pop_front().unwrap_or(false)
        }

        async fn show(&self, _interface: &str) -> anyhow::Result<String> {
            Ok(self.show_output.lock().unwrap().clone())
        }
    }

    fn config() -> NodeConfig {
        NodeConfig {
            interface_name: "wg0".to_string(),
            private_key: "NODE_PRIVATE=".to_string(),
            address: "10.0.0.2/24".to_string(),
            hub: HubConfig {
                public_key: "HUB_PUBLIC=".to_string(),
                endpoint: "203.0.113.10:51820".to_string(),
                allowed_ips: "10.0.0.0/24".to_string(),
                persistent_keepalive: Some(25),
            },
        }
    }

    fn connector(link: Arc<ScriptedLink>) -> NodeConnector {
        NodeConnector::new(config(), link, None)
            .unwrap()
            .with_retry_policy(
                2,
                Duration::from_millis(1),
                Duration::from_millis(4),
                Duration::from_millis(200),
            )
    }

    #[test]
    fn missing_fields_fail_construction_with_names() {
        let mut cfg = config();
        cfg.private_key = String::new();
        cfg.hub.endpoint = "  ".to_string();

        let err = NodeConnector::new(cfg, Arc::new(ScriptedLink::default()), None).unwrap_err();
        match err {
            ConnectorError::ConfigValidation { missing } => {
                assert_eq!(missing, vec!["private_key", "hub.endpoint"]);
            }
            other => panic!("expected ConfigValidation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn connect_applies_commands_in_order() -> anyhow::Result<()> {
        let link = Arc::new(ScriptedLink::pings(&[true]));
        let connector = connector(link.clone());

        let report = connector.connect().await?;
        assert_eq!(report.attempts, 1);
        assert_eq!(report.interface, "wg0");
        assert_eq!(connector.state(), ConnectorState::Connected);
        assert_eq!(
            link.calls(),
            vec!["create", "private-key", "peer", "address", "up"]
        );
        Ok(())
    }

    #[tokio::test]
    async fn probe_failures_retry_then_succeed() -> anyhow::Result<()> {
        let link = Arc::new(ScriptedLink::pings(&[false, false, true]));
        let connector = connector(link);

        let report = connector.connect().await?;
        assert_eq!(report.attempts, 3);
        Ok(())
    }

    #[tokio::test]
    async fn exhaustion_reports_attempt_count_and_last_error() {
        let link = Arc::new(ScriptedLink::pings(&[false, false, false]));
        let connector = connector(link);

        let err = connector.connect().await.unwrap_err();
        match err {
            ConnectorError::Connection {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("verification failed"));
            }
            other => panic!("expected Connection, got {other:?}"),
        }
        assert_eq!(connector.state(), ConnectorState::Disconnected);
    }

    #[tokio::test]
    async fn apply_errors_are_retried_as_well() -> anyhow::Result<()> {
        let link = Arc::new(ScriptedLink::pings(&[true]));
        link.apply_failures.store(1, Ordering::SeqCst);
        let connector = connector(link);

        let report = connector.connect().await?;
        assert_eq!(report.attempts, 2);
        Ok(())
    }

    #[tokio::test]
    async fn probe_timeout_short_circuits_retries() {
        let link = Arc::new(ScriptedLink::hanging());
        let connector = connector(link);

        let started = std::time::Instant::now();
        let err = connector.connect().await.unwrap_err();
        assert!(matches!(err, ConnectorError::Timeout(_)));
        // One timeout window, not (retries + 1) of them.
        assert!(started.elapsed() < Duration::from_millis(600));
    }

    #[tokio::test]
    async fn health_classification_rules() -> anyhow::Result<()> {
        let link = Arc::new(ScriptedLink::pings(&[true, true, true, false]));
        let connector = connector(link.clone());

        // Before connecting: disconnected.
        let report = connector.check().await;
        assert_eq!(report.status, NodeHealthStatus::Disconnected);
        assert!(!report.connected);

        connector.connect().await?;

        // Fresh handshake, hub answers: healthy.
        *link.show_output.lock().unwrap() =
            "latest handshake: 30 seconds ago\n".to_string();
        let report = connector.check().await;
        assert_eq!(report.status, NodeHealthStatus::Healthy);
        assert_eq!(report.handshake_age_s, Some(30));
        assert!(report.uptime_s.is_some());

        // Stale handshake: degraded.
        *link.show_output.lock().unwrap() =
            "latest handshake: 4 minutes ago\n".to_string();
        let report = connector.check().await;
        assert_eq!(report.status, NodeHealthStatus::Degraded);
        assert_eq!(connector.state(), ConnectorState::Degraded);

        // Hub not answering: unhealthy (ping script exhausted -> false).
        let report = connector.check().await;
        assert_eq!(report.status, NodeHealthStatus::Unhealthy);
        Ok(())
    }

    #[tokio::test]
    async fn disconnect_tears_down_and_resets() -> anyhow::Result<()> {
        let link = Arc::new(ScriptedLink::pings(&[true]));
        let connector = connector(link.clone());
        connector.connect().await?;

        connector.disconnect().await;
        assert_eq!(connector.state(), ConnectorState::Disconnected);
        let calls = link.calls();
        assert!(calls.ends_with(&["down".to_string(), "delete".to_string()]));

        let report = connector.check().await;
        assert_eq!(report.status, NodeHealthStatus::Disconnected);
        Ok(())
    }

    struct FixedCoordinator;

    #[async_trait]
    impl CoordinatorClient for FixedCoordinator {
        async fn register_node(&self, registration: &NodeRegistration) -> anyhow::Result<String> {
            assert_eq!(registration.interface_name, "wg0");
            Ok("node-42".to_string())
        }
    }

    #[tokio::test]
    async fn registration_result_lands_in_reports() -> anyhow::Result<()> {
        let link = Arc::new(ScriptedLink::pings(&[true, true]));
        let connector = NodeConnector::new(config(), link, Some(Arc::new(FixedCoordinator)))
            .unwrap()
            .with_retry_policy(
                0,
                Duration::from_millis(1),
                Duration::from_millis(1),
                Duration::from_millis(200),
            );

        let report = connector.connect().await?;
        assert_eq!(report.node_id.as_deref(), Some("node-42"));

        let health = connector.check().await;
        assert_eq!(health.node_id.as_deref(), Some("node-42"));
        Ok(())
    }
}
