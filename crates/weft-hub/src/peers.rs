//! Hub peer registry and WireGuard config writer.
//!
//! The registry is the exclusive owner of the hub's interface configuration:
//! nothing else writes the config file or invokes the reload. Every mutation
//! rewrites the file atomically (sibling temp file, mode 0600, fsync, rename)
//! and reloads the live interface with `wg syncconf`, all under one lock.

use crate::wg::WgControl;
use ipnet::Ipv4Net;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use weft_core::model::{PeerEntry, MAX_KEEPALIVE_SECS};

#[derive(Debug, Error)]
pub enum PeerRegistryError {
    #[error("peer {0} not found")]
    NotFound(String),
    #[error("peer {peer_id} has empty allowed_ips")]
    EmptyAllowedIps { peer_id: String },
    #[error("public key already registered to peer {peer_id}")]
    PublicKeyInUse { peer_id: String },
    #[error("keepalive {0}s exceeds {MAX_KEEPALIVE_SECS}s")]
    KeepaliveOutOfRange(u16),
    #[error("failed to reload interface {interface}: {stderr}")]
    ReloadFailed { interface: String, stderr: String },
    #[error("failed to write config: {0}")]
    Write(#[from] std::io::Error),
}

/// Hub-side identity rendered into the `[Interface]` block.
#[derive(Clone)]
pub struct HubIdentity {
    pub private_key: String,
    pub address: Ipv4Net,
    pub listen_port: u16,
}

impl std::fmt::Debug for HubIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubIdentity")
            .field("private_key", &"<redacted>")
            .field("address", &self.address)
            .field("listen_port", &self.listen_port)
            .finish()
    }
}

/// Registry state: insertion-ordered so renders are diffable.
#[derive(Debug, Default)]
struct RegistryInner {
    peers: Vec<(String, PeerEntry)>,
}

pub struct PeerRegistry {
    interface: String,
    config_path: PathBuf,
    identity: HubIdentity,
    control: Arc<dyn WgControl>,
    inner: Mutex<RegistryInner>,
}

impl PeerRegistry {
    pub fn new(
        interface: impl Into<String>,
        config_path: impl Into<PathBuf>,
        identity: HubIdentity,
        control: Arc<dyn WgControl>,
    ) -> Self {
        Self {
            interface: interface.into(),
            config_path: config_path.into(),
            identity,
            control,
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Add or update a peer, rewrite the config, and reload the interface.
    ///
    /// Re-adding an existing `peer_id` updates its entry in place. A reload
    /// failure is surfaced but the map and file keep the new state; recovery
    /// is an operator action.
    pub async fn add_peer(
        &self,
        peer_id: &str,
        entry: PeerEntry,
    ) -> Result<(), PeerRegistryError> {
        if entry.allowed_ips.is_empty() {
            return Err(PeerRegistryError::EmptyAllowedIps {
                peer_id: peer_id.to_string(),
            });
        }
        if let Some(keepalive) = entry.persistent_keepalive {
            if keepalive > MAX_KEEPALIVE_SECS {
                return Err(PeerRegistryError::KeepaliveOutOfRange(keepalive));
            }
        }

        let mut inner = self.inner.lock().await;

        if let Some((other_id, _)) = inner
            .peers
            .iter()
            .find(|(id, p)| id != peer_id && p.public_key == entry.public_key)
        {
            return Err(PeerRegistryError::PublicKeyInUse {
                peer_id: other_id.clone(),
            });
        }

        match inner.peers.iter_mut().find(|(id, _)| id == peer_id) {
            Some((_, existing)) => *existing = entry,
            None => inner.peers.push((peer_id.to_string(), entry)),
        }

        let total = inner.peers.len();
        self.sync_to_disk(&inner).await?;
        tracing::info!(
            event = "weft.peers.added",
            peer_id,
            total_peers = total,
            "peer added to hub configuration"
        );
        Ok(())
    }

    /// Remove a peer, rewrite the config, and reload the interface.
    pub async fn remove_peer(&self, peer_id: &str) -> Result<(), PeerRegistryError> {
        let mut inner = self.inner.lock().await;

        let before = inner.peers.len();
        inner.peers.retain(|(id, _)| id != peer_id);
        if inner.peers.len() == before {
            return Err(PeerRegistryError::NotFound(peer_id.to_string()));
        }

        let remaining = inner.peers.len();
        self.sync_to_disk(&inner).await?;
        tracing::info!(
            event = "weft.peers.removed",
            peer_id,
            remaining_peers = remaining,
            "peer removed from hub configuration"
        );
        Ok(())
    }

    /// Probe the peer's first allowed-IPs host address with one ICMP echo.
    ///
    /// Returns `false` on timeout; errors only for unknown peers.
    pub async fn verify_connectivity(
        &self,
        peer_id: &str,
        timeout: Duration,
    ) -> Result<bool, PeerRegistryError> {
        let target = {
            let inner = self.inner.lock().await;
            let (_, entry) = inner
                .peers
                .iter()
                .find(|(id, _)| id == peer_id)
                .ok_or_else(|| PeerRegistryError::NotFound(peer_id.to_string()))?;
            entry.allowed_ips[0].addr()
        };

        let reachable = self.control.ping(target, timeout).await;
        if reachable {
            tracing::debug!(event = "weft.peers.reachable", peer_id, ip = %target, "peer reachable");
        } else {
            tracing::warn!(
                event = "weft.peers.unreachable",
                peer_id,
                ip = %target,
                timeout_s = timeout.as_secs(),
                "peer did not answer probe"
            );
        }
        Ok(reachable)
    }

    pub async fn get(&self, peer_id: &str) -> Option<PeerEntry> {
        let inner = self.inner.lock().await;
        inner
            .peers
            .iter()
            .find(|(id, _)| id == peer_id)
            .map(|(_, entry)| entry.clone())
    }

    pub async fn list(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner.peers.iter().map(|(id, _)| id.clone()).collect()
    }

    pub async fn entries(&self) -> Vec<(String, PeerEntry)> {
        let inner = self.inner.lock().await;
        inner.peers.clone()
    }

    pub async fn peer_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.peers.len()
    }

    async fn sync_to_disk(&self, inner: &RegistryInner) -> Result<(), PeerRegistryError> {
        let rendered = render_config(&self.identity, &inner.peers);
        write_atomic(&self.config_path, &rendered).await?;

        self.control
            .sync_conf(&self.interface, &self.config_path)
            .await
            .map_err(|err| {
                tracing::error!(
                    event = "weft.peers.reload_failed",
                    interface = %self.interface,
                    error = %err,
                    "wg syncconf failed; on-disk and in-memory state kept"
                );
                PeerRegistryError::ReloadFailed {
                    interface: self.interface.clone(),
                    stderr: err.to_string(),
                }
            })
    }
}

/// Render the full interface config: one `[Interface]` block, then one
/// `[Peer]` block per entry in insertion order, each preceded by a
/// `# Peer ID:` comment.
pub fn render_config(identity: &HubIdentity, peers: &[(String, PeerEntry)]) -> String {
    let mut out = String::new();
    out.push_str("[Interface]\n");
    let _ = writeln!(out, "PrivateKey = {}", identity.private_key);
    let _ = writeln!(out, "Address = {}", identity.address);
    let _ = writeln!(out, "ListenPort = {}", identity.listen_port);

    for (peer_id, entry) in peers {
        out.push('\n');
        let _ = writeln!(out, "# Peer ID: {peer_id}");
        out.push_str("[Peer]\n");
        let _ = writeln!(out, "PublicKey = {}", entry.public_key);
        let allowed = entry
            .allowed_ips
            .iter()
            .map(|net| net.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(out, "AllowedIPs = {allowed}");
        if let Some(endpoint) = &entry.endpoint {
            let _ = writeln!(out, "Endpoint = {endpoint}");
        }
        if let Some(keepalive) = entry.persistent_keepalive {
            let _ = writeln!(out, "PersistentKeepalive = {keepalive}");
        }
        if let Some(psk) = &entry.preshared_key {
            let _ = writeln!(out, "PresharedKey = {psk}");
        }
    }

    out
}

/// Write `content` to `path` atomically: sibling temp file, 0600, fsync,
/// rename. Readers never observe a partial file.
async fn write_atomic(path: &Path, content: &str) -> Result<(), std::io::Error> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("weft.conf");
    let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));

    let mut file = tokio::fs::File::create(&tmp_path).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600)).await?;
    }

    let write_result = async {
        file.write_all(content.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, path).await
    }
    .await;

    if write_result.is_err() {
        let _ = tokio::fs::remove_file(&tmp_path).await;
    }
    write_result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wg::test_support::StubWgControl;
    use tempfile::TempDir;

    fn identity() -> HubIdentity {
        HubIdentity {
            private_key: "HUB_PRIVATE_KEY_B64=".to_string(),
            address: "10.0.0.1/24".parse().unwrap(),
            listen_port: 51820,
        }
    }

    fn entry(key: &str, cidr: &str) -> PeerEntry {
        PeerEntry {
            public_key: key.to_string(),
            allowed_ips: vec![cidr.parse().unwrap()],
            endpoint: None,
            persistent_keepalive: Some(25),
            preshared_key: None,
        }
    }

    fn registry(dir: &TempDir, control: Arc<StubWgControl>) -> PeerRegistry {
        PeerRegistry::new(
            "wg0",
            dir.path().join("wg0.conf"),
            identity(),
            control,
        )
    }

    #[tokio::test]
    async fn add_peer_writes_interface_and_peer_blocks() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let control = Arc::new(StubWgControl::default());
        let registry = registry(&dir, control.clone());

        registry.add_peer("n-1", entry("PEER_KEY_A=", "10.0.0.2/32")).await?;

        let written = std::fs::read_to_string(dir.path().join("wg0.conf"))?;
        assert!(written.starts_with("[Interface]\n"));
        assert!(written.contains("ListenPort = 51820"));
        assert!(written.contains("# Peer ID: n-1"));
        assert!(written.contains("PublicKey = PEER_KEY_A="));
        assert!(written.contains("AllowedIPs = 10.0.0.2/32"));
        assert!(written.contains("PersistentKeepalive = 25"));
        assert_eq!(control.sync_count(), 1);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(dir.path().join("wg0.conf"))?
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        Ok(())
    }

    #[tokio::test]
    async fn readding_peer_updates_entry_in_place() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let control = Arc::new(StubWgControl::default());
        let registry = registry(&dir, control);

        registry.add_peer("n-1", entry("PEER_KEY_A=", "10.0.0.2/32")).await?;
        registry.add_peer("n-2", entry("PEER_KEY_B=", "10.0.0.3/32")).await?;

        let mut updated = entry("PEER_KEY_A=", "10.0.0.2/32");
        updated.endpoint = Some("203.0.113.9:51820".to_string());
        registry.add_peer("n-1", updated).await?;

        assert_eq!(registry.list().await, vec!["n-1", "n-2"]);
        let written = std::fs::read_to_string(registry.config_path())?;
        assert!(written.contains("Endpoint = 203.0.113.9:51820"));
        assert_eq!(written.matches("# Peer ID: n-1").count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn remove_peer_drops_block_and_unknown_is_not_found() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let control = Arc::new(StubWgControl::default());
        let registry = registry(&dir, control);

        registry.add_peer("n-1", entry("PEER_KEY_A=", "10.0.0.2/32")).await?;
        registry.remove_peer("n-1").await?;

        let written = std::fs::read_to_string(registry.config_path())?;
        assert!(!written.contains("PEER_KEY_A="));
        assert!(registry.list().await.is_empty());

        assert!(matches!(
            registry.remove_peer("n-1").await,
            Err(PeerRegistryError::NotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn empty_allowed_ips_rejected_before_any_mutation() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let control = Arc::new(StubWgControl::default());
        let registry = registry(&dir, control.clone());

        let mut bad = entry("PEER_KEY_A=", "10.0.0.2/32");
        bad.allowed_ips.clear();
        assert!(matches!(
            registry.add_peer("n-1", bad).await,
            Err(PeerRegistryError::EmptyAllowedIps { .. })
        ));
        assert_eq!(control.sync_count(), 0);
        assert!(registry.list().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_public_key_for_other_peer_rejected() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let control = Arc::new(StubWgControl::default());
        let registry = registry(&dir, control);

        registry.add_peer("n-1", entry("PEER_KEY_A=", "10.0.0.2/32")).await?;
        let err = registry
            .add_peer("n-2", entry("PEER_KEY_A=", "10.0.0.3/32"))
            .await
            .unwrap_err();
        assert!(matches!(err, PeerRegistryError::PublicKeyInUse { peer_id } if peer_id == "n-1"));
        Ok(())
    }

    #[tokio::test]
    async fn reload_failure_keeps_new_state() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let control = Arc::new(StubWgControl::failing("interface does not exist"));
        let registry = registry(&dir, control);

        let err = registry
            .add_peer("n-1", entry("PEER_KEY_A=", "10.0.0.2/32"))
            .await
            .unwrap_err();
        assert!(matches!(err, PeerRegistryError::ReloadFailed { .. }));

        // No rollback: the peer stays registered and on disk.
        assert_eq!(registry.list().await, vec!["n-1"]);
        let written = std::fs::read_to_string(registry.config_path())?;
        assert!(written.contains("PEER_KEY_A="));
        Ok(())
    }

    #[tokio::test]
    async fn verify_connectivity_pings_first_allowed_host() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let control = Arc::new(StubWgControl::default());
        control.set_reachable("10.0.0.2".parse().unwrap());
        let registry = registry(&dir, control.clone());

        registry.add_peer("n-1", entry("PEER_KEY_A=", "10.0.0.2/32")).await?;
        registry.add_peer("n-2", entry("PEER_KEY_B=", "10.0.0.3/32")).await?;

        assert!(registry.verify_connectivity("n-1", Duration::from_secs(2)).await?);
        assert!(!registry.verify_connectivity("n-2", Duration::from_secs(2)).await?);
        assert!(matches!(
            registry.verify_connectivity("ghost", Duration::from_secs(2)).await,
            Err(PeerRegistryError::NotFound(_))
        ));
        Ok(())
    }
}
