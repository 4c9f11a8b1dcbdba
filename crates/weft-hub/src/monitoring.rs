//! Hub-side WireGuard interface monitoring.
//!
//! Parses `wg show` output into per-peer link status (handshake freshness,
//! transfer counters), joins it with the registry to resolve peer ids, and
//! derives the summary served by the health endpoint.

use crate::peers::PeerRegistry;
use crate::wg::WgControl;
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::OnceLock;

/// Handshake older than this counts the peer as disconnected.
const CONNECTED_HANDSHAKE_SECS: u64 = 180;

#[derive(Debug, Clone, Serialize)]
pub struct PeerLinkStatus {
    /// Registry peer id, when the public key is known to the hub.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    pub public_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub allowed_ips: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handshake_age_s: Option<u64>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub connected: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct InterfaceReport {
    pub interface: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listening_port: Option<u16>,
    pub peer_count: usize,
    pub connected_peers: usize,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peers: Option<Vec<PeerLinkStatus>>,
}

/// One point-in-time interface measurement kept in the history ring.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSample {
    pub collected_at: chrono::DateTime<chrono::Utc>,
    pub peer_count: usize,
    pub connected_peers: usize,
    pub total_rx_bytes: u64,
    pub total_tx_bytes: u64,
}

pub struct WgMonitor {
    registry: Arc<PeerRegistry>,
    control: Arc<dyn WgControl>,
    history: std::sync::Mutex<std::collections::VecDeque<MetricsSample>>,
    max_history: usize,
}

impl WgMonitor {
    pub fn new(registry: Arc<PeerRegistry>, control: Arc<dyn WgControl>) -> Self {
        Self {
            registry,
            control,
            history: std::sync::Mutex::new(std::collections::VecDeque::new()),
            max_history: 1000,
        }
    }

    /// Collect the live interface report. Errors when the WireGuard stack
    /// cannot report on the interface at all.
    pub async fn collect(&self, include_peers: bool) -> anyhow::Result<InterfaceReport> {
        let output = self.control.show(self.registry.interface()).await?;
        let parsed = parse_wg_show(&output);

        let entries = self.registry.entries().await;
        let peer_id_for = |public_key: &str| {
            entries
                .iter()
                .find(|(_, entry)| entry.public_key == public_key)
                .map(|(id, _)| id.clone())
        };

        let peers: Vec<PeerLinkStatus> = parsed
            .peers
            .into_iter()
            .map(|raw| {
                let connected = raw
                    .handshake_age_s
                    .is_some_and(|age| age <= CONNECTED_HANDSHAKE_SECS);
                PeerLinkStatus {
                    peer_id: peer_id_for(&raw.public_key),
                    public_key: raw.public_key,
                    endpoint: raw.endpoint,
                    allowed_ips: raw.allowed_ips,
                    handshake_age_s: raw.handshake_age_s,
                    rx_bytes: raw.rx_bytes,
                    tx_bytes: raw.tx_bytes,
                    connected,
                }
            })
            .collect();

        let peer_count = self.registry.peer_count().await;
        let connected_peers = peers.iter().filter(|p| p.connected).count();
        let status = if peer_count == 0 || connected_peers == peer_count {
            "healthy"
        } else if connected_peers > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        Ok(InterfaceReport {
            interface: self.registry.interface().to_string(),
            listening_port: parsed.listening_port,
            peer_count,
            connected_peers,
            status,
            peers: include_peers.then_some(peers),
        })
    }

    /// Collect one sample and append it to the bounded history.
    pub async fn sample(&self) -> anyhow::Result<MetricsSample> {
        let report = self.collect(true).await?;
        let peers = report.peers.unwrap_or_default();

        let sample = MetricsSample {
            collected_at: chrono::Utc::now(),
            peer_count: report.peer_count,
            connected_peers: report.connected_peers,
            total_rx_bytes: peers.iter().map(|p| p.rx_bytes).sum(),
            total_tx_bytes: peers.iter().map(|p| p.tx_bytes).sum(),
        };

        let mut history = self.history.lock().expect("monitor history poisoned");
        if history.len() == self.max_history {
            history.pop_front();
        }
        history.push_back(sample.clone());
        Ok(sample)
    }

    /// Most recent samples, newest last. `limit` trims from the front.
    pub fn metrics_history(&self, limit: Option<usize>) -> Vec<MetricsSample> {
        let history = self.history.lock().expect("monitor history poisoned");
        let skip = limit
            .map(|l| history.len().saturating_sub(l))
            .unwrap_or(0);
        history.iter().skip(skip).cloned().collect()
    }
}

#[derive(Debug, Default)]
struct RawPeer {
    public_key: String,
    endpoint: Option<String>,
    allowed_ips: Vec<String>,
    handshake_age_s: Option<u64>,
    rx_bytes: u64,
    tx_bytes: u64,
}

#[derive(Debug, Default)]
struct ParsedShow {
    listening_port: Option<u16>,
    peers: Vec<RawPeer>,
}

fn parse_wg_show(output: &str) -> ParsedShow {
    let mut parsed = ParsedShow::default();
    let mut current: Option<RawPeer> = None;

    for line in output.lines() {
        let line = line.trim();

        if let Some(key) = line.strip_prefix("peer:") {
            if let Some(done) = current.take() {
                parsed.peers.push(done);
            }
            current = Some(RawPeer {
                public_key: key.trim().to_string(),
                ..RawPeer::default()
            });
            continue;
        }

        if let Some(port) = line.strip_prefix("listening port:") {
            parsed.listening_port = port.trim().parse().ok();
            continue;
        }

        let Some(peer) = current.as_mut() else {
            continue;
        };

        if let Some(endpoint) = line.strip_prefix("endpoint:") {
            peer.endpoint = Some(endpoint.trim().to_string());
        } else if let Some(ips) = line.strip_prefix("allowed ips:") {
            peer.allowed_ips = ips
                .split(',')
                .map(|ip| ip.trim().to_string())
                .filter(|ip| !ip.is_empty())
                .collect();
        } else if line.starts_with("latest handshake:") {
            peer.handshake_age_s = parse_handshake_line(line);
        } else if let Some(transfer) = line.strip_prefix("transfer:") {
            if let Some((rx, tx)) = parse_transfer_line(transfer) {
                peer.rx_bytes = rx;
                peer.tx_bytes = tx;
            }
        }
    }

    if let Some(done) = current.take() {
        parsed.peers.push(done);
    }
    parsed
}

/// Sum every `<N> <unit>` term in a handshake line, so compound ages like
/// `1 hour, 2 minutes, 5 seconds ago` resolve correctly.
fn parse_handshake_line(line: &str) -> Option<u64> {
    static TERM: OnceLock<Regex> = OnceLock::new();
    let re = TERM.get_or_init(|| {
        Regex::new(r"(\d+)\s+(hour|minute|second)s?").expect("static regex")
    });

    let mut total = 0u64;
    let mut matched = false;
    for caps in re.captures_iter(line) {
        let value: u64 = caps[1].parse().ok()?;
        let scale = match &caps[2] {
            "hour" => 3600,
            "minute" => 60,
            _ => 1,
        };
        total += value * scale;
        matched = true;
    }
    matched.then_some(total)
}

/// `"1.21 MiB received, 820.50 KiB sent"` into `(rx_bytes, tx_bytes)`.
fn parse_transfer_line(text: &str) -> Option<(u64, u64)> {
    let (rx_part, tx_part) = text.split_once(',')?;
    let rx = parse_size(rx_part.trim().strip_suffix("received")?.trim())?;
    let tx = parse_size(tx_part.trim().strip_suffix("sent")?.trim())?;
    Some((rx, tx))
}

fn parse_size(text: &str) -> Option<u64> {
    let (value, unit) = text.split_once(' ')?;
    let value: f64 = value.parse().ok()?;
    let scale: u64 = match unit {
        "B" => 1,
        "KiB" => 1 << 10,
        "MiB" => 1 << 20,
        "GiB" => 1 << 30,
        "TiB" => 1u64 << 40,
        _ => return None,
    };
    Some((value * scale as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHOW_OUTPUT: &str = "\
interface: wg0
  public key: HUB_PUBLIC_KEY=
  private key: (hidden)
  listening port: 51820

peer: PEER_KEY_A=
  endpoint: 203.0.113.7:40122
  allowed ips: 10.0.0.2/32
  latest handshake: 45 seconds ago
  transfer: 1.21 MiB received, 820.50 KiB sent
  persistent keepalive: every 25 seconds

peer: PEER_KEY_B=
  allowed ips: 10.0.0.3/32, 10.0.1.0/24
  latest handshake: 1 hour, 2 minutes, 5 seconds ago
  transfer: 0 B received, 0 B sent
";

    #[test]
    fn parses_interface_and_peer_sections() {
        let parsed = parse_wg_show(SHOW_OUTPUT);
        assert_eq!(parsed.listening_port, Some(51820));
        assert_eq!(parsed.peers.len(), 2);

        let a = &parsed.peers[0];
        assert_eq!(a.public_key, "PEER_KEY_A=");
        assert_eq!(a.endpoint.as_deref(), Some("203.0.113.7:40122"));
        assert_eq!(a.allowed_ips, vec!["10.0.0.2/32"]);
        assert_eq!(a.handshake_age_s, Some(45));
        assert_eq!(a.rx_bytes, (1.21 * 1048576.0) as u64);
        assert_eq!(a.tx_bytes, (820.5 * 1024.0) as u64);

        let b = &parsed.peers[1];
        assert_eq!(b.endpoint, None);
        assert_eq!(b.allowed_ips.len(), 2);
        assert_eq!(b.handshake_age_s, Some(3725));
        assert_eq!(b.rx_bytes, 0);
    }

    #[test]
    fn peer_without_handshake_has_unknown_age() {
        let output = "peer: KEY=\n  allowed ips: 10.0.0.9/32\n";
        let parsed = parse_wg_show(output);
        assert_eq!(parsed.peers[0].handshake_age_s, None);
    }

    #[test]
    fn transfer_units_scale() {
        assert_eq!(parse_size("512 B"), Some(512));
        assert_eq!(parse_size("2 KiB"), Some(2048));
        assert_eq!(parse_size("1 GiB"), Some(1 << 30));
        assert_eq!(parse_size("3 parsecs"), None);
    }

    #[tokio::test]
    async fn report_joins_registry_and_history_is_bounded_by_limit() -> anyhow::Result<()> {
        use crate::peers::{HubIdentity, PeerRegistry};
        use crate::wg::test_support::StubWgControl;
        use tempfile::TempDir;
        use weft_core::model::PeerEntry;

        let dir = TempDir::new()?;
        let control = Arc::new(StubWgControl::default());
        let registry = Arc::new(PeerRegistry::new(
            "wg0",
            dir.path().join("wg0.conf"),
            HubIdentity {
                private_key: "HUB_PRIVATE=".to_string(),
                address: "10.0.0.1/24".parse()?,
                listen_port: 51820,
            },
            control.clone(),
        ));
        registry
            .add_peer(
                "n-1",
                PeerEntry {
                    public_key: "PEER_KEY_A=".to_string(),
                    allowed_ips: vec!["10.0.0.2/32".parse()?],
                    endpoint: None,
                    persistent_keepalive: Some(25),
                    preshared_key: None,
                },
            )
            .await?;

        control.set_show_output(
            "interface: wg0\n  listening port: 51820\n\npeer: PEER_KEY_A=\n  \
             allowed ips: 10.0.0.2/32\n  latest handshake: 10 seconds ago\n  \
             transfer: 1 KiB received, 2 KiB sent\n",
        );

        let monitor = WgMonitor::new(registry, control);
        let report = monitor.collect(true).await?;
        assert_eq!(report.status, "healthy");
        assert_eq!(report.connected_peers, 1);
        let peers = report.peers.unwrap();
        assert_eq!(peers[0].peer_id.as_deref(), Some("n-1"));

        for _ in 0..3 {
            monitor.sample().await?;
        }
        assert_eq!(monitor.metrics_history(None).len(), 3);
        let limited = monitor.metrics_history(Some(2));
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].total_rx_bytes, 1024);
        assert_eq!(limited[0].total_tx_bytes, 2048);
        Ok(())
    }
}
