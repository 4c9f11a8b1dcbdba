//! Peer provisioning: the composed join transaction.
//!
//! Validates the join request, allocates an address, installs the peer on
//! the hub interface, and assembles the configuration handed back to the
//! node. On a hub failure the allocated address is released so no partial
//! state survives a failed join.

use crate::peers::{PeerRegistry, PeerRegistryError};
use crate::pool::{IpPool, PoolError};
use chrono::Utc;
use ipnet::Ipv4Net;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use weft_core::model::{NodeCapabilities, PeerConfiguration, PeerEntry, ProvisioningRecord};
use weft_core::store::{Store, StoreError};
use weft_monitor::MonitoringFacade;

pub const DEFAULT_KEEPALIVE_SECS: u16 = 25;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("invalid provisioning request: {}", errors.join("; "))]
    Validation { errors: Vec<String> },
    #[error("peer {node_id} already provisioned")]
    DuplicatePeer {
        node_id: String,
        existing: Box<PeerConfiguration>,
    },
    #[error(transparent)]
    PoolExhausted(PoolError),
    #[error("peer {0} not provisioned")]
    NotFound(String),
    #[error(transparent)]
    Hub(#[from] PeerRegistryError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("internal provisioning error: {0}")]
    Internal(String),
}

/// Join request from a node.
#[derive(Debug, Clone, Deserialize)]
pub struct ProvisioningRequest {
    pub node_id: String,
    pub wireguard_public_key: String,
    pub capabilities: NodeCapabilities,
    pub version: String,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// Hub identity as seen by joining nodes.
#[derive(Debug, Clone)]
pub struct HubInfo {
    pub public_key: String,
    pub endpoint: String,
}

pub struct ProvisioningService {
    pool: Arc<IpPool>,
    registry: Arc<PeerRegistry>,
    hub: HubInfo,
    store: Option<Arc<dyn Store>>,
    facade: Option<Arc<MonitoringFacade>>,
    // Provisioning lock; also the duplicate-detection record of issued
    // configurations.
    records: Mutex<HashMap<String, PeerConfiguration>>,
    node_id_re: Regex,
    wg_key_re: Regex,
    version_re: Regex,
}

impl ProvisioningService {
    pub fn new(
        pool: Arc<IpPool>,
        registry: Arc<PeerRegistry>,
        hub: HubInfo,
        store: Option<Arc<dyn Store>>,
        facade: Option<Arc<MonitoringFacade>>,
    ) -> Self {
        Self {
            pool,
            registry,
            hub,
            store,
            facade,
            records: Mutex::new(HashMap::new()),
            node_id_re: Regex::new(r"^[a-zA-Z0-9_-]{1,128}$").expect("static regex"),
            wg_key_re: Regex::new(r"^[A-Za-z0-9+/]{42,44}={0,2}$").expect("static regex"),
            version_re: Regex::new(r"^\d+\.\d+\.\d+$").expect("static regex"),
        }
    }

    /// Provision a node: validate, allocate, install on the hub, and return
    /// the complete peer configuration.
    pub async fn provision(
        &self,
        request: &ProvisioningRequest,
    ) -> Result<PeerConfiguration, ProvisionError> {
        if let Err(errors) = self.validate(request) {
            if let Some(facade) = &self.facade {
                facade
                    .on_provision_denied(&request.node_id, &errors.join("; "))
                    .await;
            }
            return Err(ProvisionError::Validation { errors });
        }

        let mut records = self.records.lock().await;

        if let Some(existing) = records.get(&request.node_id) {
            return Err(ProvisionError::DuplicatePeer {
                node_id: request.node_id.clone(),
                existing: Box::new(existing.clone()),
            });
        }

        let assigned_ip = self.pool.allocate(&request.node_id).map_err(|err| match err {
            PoolError::Exhausted { .. } => ProvisionError::PoolExhausted(err),
            other => ProvisionError::Internal(other.to_string()),
        })?;

        let host_net = Ipv4Net::new(assigned_ip, 32).expect("/32 prefix is valid");
        let entry = PeerEntry {
            public_key: request.wireguard_public_key.clone(),
            allowed_ips: vec![host_net],
            endpoint: None,
            persistent_keepalive: Some(DEFAULT_KEEPALIVE_SECS),
            preshared_key: None,
        };

        if let Err(err) = self.registry.add_peer(&request.node_id, entry).await {
            // Compensate: the join failed, so neither the peer entry nor the
            // address may survive. On a reload failure the entry did land in
            // the registry; removing it is best-effort (the removal's own
            // reload may fail the same way, the map and file still update).
            if matches!(err, PeerRegistryError::ReloadFailed { .. }) {
                if let Err(remove_err) = self.registry.remove_peer(&request.node_id).await {
                    if !matches!(remove_err, PeerRegistryError::ReloadFailed { .. }) {
                        tracing::error!(
                            event = "weft.provision.compensation_failed",
                            node_id = %request.node_id,
                            error = %remove_err,
                            "failed to remove peer after hub failure"
                        );
                    }
                }
            }
            if let Err(release_err) = self.pool.release(&request.node_id) {
                tracing::error!(
                    event = "weft.provision.compensation_failed",
                    node_id = %request.node_id,
                    error = %release_err,
                    "failed to release IP after hub failure"
                );
            }
            return Err(ProvisionError::Hub(err));
        }

        let network = self.pool.network().trunc();
        let config = PeerConfiguration {
            node_id: request.node_id.clone(),
            assigned_ip,
            subnet_mask: network.netmask().to_string(),
            hub_public_key: self.hub.public_key.clone(),
            hub_endpoint: self.hub.endpoint.clone(),
            allowed_ips: network,
            persistent_keepalive: DEFAULT_KEEPALIVE_SECS,
            dns_servers: vec![hub_ip(network)],
            provisioned_at: Utc::now(),
        };

        if let Some(store) = &self.store {
            let record = ProvisioningRecord {
                node_id: request.node_id.clone(),
                assigned_ip,
                wireguard_public_key: request.wireguard_public_key.clone(),
                provisioned_at: config.provisioned_at,
                capabilities: request.capabilities.clone(),
            };
            if let Err(err) = store.insert_provisioning_record(record).await {
                self.unwind_join(&request.node_id).await;
                return Err(ProvisionError::Store(err));
            }
        }

        records.insert(request.node_id.clone(), config.clone());
        drop(records);

        if let Some(facade) = &self.facade {
            facade.on_peer_provisioned(&request.node_id, assigned_ip).await;
        }
        tracing::info!(
            event = "weft.provision.completed",
            node_id = %request.node_id,
            assigned_ip = %assigned_ip,
            "node provisioned"
        );
        Ok(config)
    }

    /// Tear a peer down: remove from the hub, return its address, drop the
    /// record.
    pub async fn deprovision(&self, node_id: &str) -> Result<(), ProvisionError> {
        let mut records = self.records.lock().await;

        if !records.contains_key(node_id) {
            return Err(ProvisionError::NotFound(node_id.to_string()));
        }

        self.registry.remove_peer(node_id).await?;

        if let Err(err) = self.pool.release(node_id) {
            tracing::warn!(
                event = "weft.provision.release_failed",
                node_id,
                error = %err,
                "IP release failed during deprovision"
            );
        }

        if let Some(store) = &self.store {
            if let Err(err) = store.remove_provisioning_record(node_id).await {
                tracing::warn!(
                    event = "weft.provision.record_removal_failed",
                    node_id,
                    error = %err,
                    "store record removal failed during deprovision"
                );
            }
        }

        records.remove(node_id);
        drop(records);

        if let Some(facade) = &self.facade {
            facade.on_peer_deprovisioned(node_id).await;
        }
        tracing::info!(
            event = "weft.provision.deprovisioned",
            node_id,
            "node deprovisioned"
        );
        Ok(())
    }

    pub async fn configuration(&self, node_id: &str) -> Option<PeerConfiguration> {
        let records = self.records.lock().await;
        records.get(node_id).cloned()
    }

    fn validate(&self, request: &ProvisioningRequest) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !self.node_id_re.is_match(&request.node_id) {
            errors.push(
                "node_id must be 1-128 alphanumeric characters, dashes, or underscores"
                    .to_string(),
            );
        }
        if !self.wg_key_re.is_match(&request.wireguard_public_key) {
            errors.push("wireguard_public_key must be a valid base64-encoded key".to_string());
        }
        if !self.version_re.is_match(&request.version) {
            errors.push("version must be semantic (MAJOR.MINOR.PATCH)".to_string());
        }
        if request.capabilities.cpu_cores < 1 {
            errors.push("capabilities.cpu_cores must be at least 1".to_string());
        }
        if request.capabilities.memory_mb < 512 {
            errors.push("capabilities.memory_mb must be at least 512".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    async fn unwind_join(&self, node_id: &str) {
        if let Err(err) = self.registry.remove_peer(node_id).await {
            tracing::error!(
                event = "weft.provision.compensation_failed",
                node_id,
                error = %err,
                "failed to remove peer after store failure"
            );
        }
        if let Err(err) = self.pool.release(node_id) {
            tracing::error!(
                event = "weft.provision.compensation_failed",
                node_id,
                error = %err,
                "failed to release IP after store failure"
            );
        }
    }
}

/// Hub's own overlay address: first host of the network.
fn hub_ip(network: Ipv4Net) -> std::net::Ipv4Addr {
    network.hosts().next().unwrap_or_else(|| network.addr())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peers::HubIdentity;
    use crate::wg::test_support::StubWgControl;
    use std::net::Ipv4Addr;
    use tempfile::TempDir;

    const VALID_KEY_A: &str = "jKlMnOpQrStUvWxYzAbCdEfGhIjKlMnOpQrStUvWxYz=";
    const VALID_KEY_B: &str = "AbCdEfGhIjKlMnOpQrStUvWxYzAbCdEfGhIjKlMnOpQ=";

    struct Fixture {
        _dir: TempDir,
        pool: Arc<IpPool>,
        registry: Arc<PeerRegistry>,
        service: ProvisioningService,
    }

    fn fixture(cidr: &str, reserved: &[&str]) -> Fixture {
        fixture_with_control(cidr, reserved, Arc::new(StubWgControl::default()))
    }

    fn fixture_with_control(
        cidr: &str,
        reserved: &[&str],
        control: Arc<StubWgControl>,
    ) -> Fixture {
        let dir = TempDir::new().unwrap();
        let network: Ipv4Net = cidr.parse().unwrap();
        let reserved: Vec<Ipv4Addr> = reserved.iter().map(|s| s.parse().unwrap()).collect();
        let pool = Arc::new(IpPool::new(network, &reserved).unwrap());
        let registry = Arc::new(PeerRegistry::new(
            "wg0",
            dir.path().join("wg0.conf"),
            HubIdentity {
                private_key: "HUB_PRIVATE=".to_string(),
                address: "10.0.0.1/24".parse().unwrap(),
                listen_port: 51820,
            },
            control,
        ));
        let service = ProvisioningService::new(
            pool.clone(),
            registry.clone(),
            HubInfo {
                public_key: "HUB_PUBLIC_KEY=".to_string(),
                endpoint: "hub.example.com:51820".to_string(),
            },
            None,
            None,
        );
        Fixture {
            _dir: dir,
            pool,
            registry,
            service,
        }
    }

    fn request(node_id: &str, key: &str) -> ProvisioningRequest {
        ProvisioningRequest {
            node_id: node_id.to_string(),
            wireguard_public_key: key.to_string(),
            capabilities: NodeCapabilities {
                cpu_cores: 8,
                memory_mb: 16384,
                gpu_count: 1,
                gpu_memory_mb: 8192,
                storage_mb: 100_000,
                models: vec![],
            },
            version: "1.0.0".to_string(),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn join_then_deprovision_round_trip() -> anyhow::Result<()> {
        let fx = fixture("10.0.0.0/24", &["10.0.0.1"]);

        let config = fx.service.provision(&request("n-1", VALID_KEY_A)).await?;
        assert_eq!(config.assigned_ip, "10.0.0.2".parse::<Ipv4Addr>()?);
        assert_eq!(config.subnet_mask, "255.255.255.0");
        assert_eq!(config.allowed_ips.to_string(), "10.0.0.0/24");
        assert_eq!(config.persistent_keepalive, 25);
        assert_eq!(config.dns_servers, vec!["10.0.0.1".parse::<Ipv4Addr>()?]);
        assert_eq!(config.hub_endpoint, "hub.example.com:51820");

        let written = std::fs::read_to_string(fx.registry.config_path())?;
        assert!(written.contains(VALID_KEY_A));

        fx.service.deprovision("n-1").await?;
        let written = std::fs::read_to_string(fx.registry.config_path())?;
        assert!(!written.contains(VALID_KEY_A));
        assert_eq!(fx.pool.stats().allocated, 0);
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_peer_returns_existing_configuration() -> anyhow::Result<()> {
        let fx = fixture("10.0.0.0/24", &["10.0.0.1"]);
        let first = fx.service.provision(&request("n-1", VALID_KEY_A)).await?;

        let err = fx
            .service
            .provision(&request("n-1", VALID_KEY_A))
            .await
            .unwrap_err();
        match err {
            ProvisionError::DuplicatePeer { existing, .. } => {
                assert_eq!(existing.assigned_ip, first.assigned_ip);
            }
            other => panic!("expected DuplicatePeer, got {other:?}"),
        }
        // Only one address consumed.
        assert_eq!(fx.pool.stats().allocated, 1);
        Ok(())
    }

    #[tokio::test]
    async fn exhaustion_surfaces_and_adds_no_peer() -> anyhow::Result<()> {
        let fx = fixture("10.0.0.0/29", &["10.0.0.1"]);

        for (i, expected) in ["10.0.0.2", "10.0.0.3", "10.0.0.4", "10.0.0.5", "10.0.0.6"]
            .iter()
            .enumerate()
        {
            // Distinct well-formed keys per node.
            let key = format!("{}{}=", &VALID_KEY_A[..42], i);
            let config = fx.service.provision(&request(&format!("n-{i}"), &key)).await?;
            assert_eq!(config.assigned_ip, expected.parse::<Ipv4Addr>()?);
        }

        let err = fx
            .service
            .provision(&request("n-overflow", VALID_KEY_B))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::PoolExhausted(_)));
        assert_eq!(fx.registry.peer_count().await, 5);
        Ok(())
    }

    #[tokio::test]
    async fn validation_failures_are_collected() {
        let fx = fixture("10.0.0.0/24", &[]);
        let mut req = request("bad node id!", "not-a-key");
        req.version = "1.0".to_string();

        let err = fx.service.provision(&req).await.unwrap_err();
        match err {
            ProvisionError::Validation { errors } => {
                assert_eq!(errors.len(), 3);
            }
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn hub_failure_releases_the_ip() -> anyhow::Result<()> {
        let fx = fixture_with_control(
            "10.0.0.0/24",
            &["10.0.0.1"],
            Arc::new(StubWgControl::failing("no such device")),
        );

        let err = fx
            .service
            .provision(&request("n-1", VALID_KEY_A))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Hub(PeerRegistryError::ReloadFailed { .. })));

        // No partial state: neither the peer entry nor the allocation
        // survived the failed join.
        assert_eq!(fx.pool.stats().allocated, 0);
        assert_eq!(fx.registry.peer_count().await, 0);
        assert!(fx.service.configuration("n-1").await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn deprovision_unknown_node_is_not_found() {
        let fx = fixture("10.0.0.0/24", &[]);
        assert!(matches!(
            fx.service.deprovision("ghost").await,
            Err(ProvisionError::NotFound(_))
        ));
    }
}
