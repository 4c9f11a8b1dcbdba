//! Node-side interface plumbing: `ip`/`wg`/`ping` invocations and the
//! handshake-age parser.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use regex::Regex;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Hub peer parameters applied to the local interface.
#[derive(Debug, Clone)]
pub struct HubPeer {
    pub public_key: String,
    pub endpoint: String,
    pub allowed_ips: String,
    pub persistent_keepalive: Option<u16>,
}

/// Everything the connector needs from the host network stack.
#[async_trait]
pub trait LinkControl: Send + Sync {
    async fn create_interface(&self, interface: &str) -> anyhow::Result<()>;
    async fn set_private_key(&self, interface: &str, private_key: &str) -> anyhow::Result<()>;
    async fn set_hub_peer(&self, interface: &str, hub: &HubPeer) -> anyhow::Result<()>;
    async fn add_address(&self, interface: &str, address: &str) -> anyhow::Result<()>;
    async fn link_up(&self, interface: &str) -> anyhow::Result<()>;
    async fn link_down(&self, interface: &str) -> anyhow::Result<()>;
    async fn delete_interface(&self, interface: &str) -> anyhow::Result<()>;

    /// `count` ICMP echoes; `false` on any failure or timeout.
    async fn ping(&self, host: &str, count: u32, timeout: Duration) -> bool;

    /// Raw `wg show <interface>` output.
    async fn show(&self, interface: &str) -> anyhow::Result<String>;
}

/// Production implementation shelling out to `ip`, `wg`, and `ping`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLinkControl;

#[async_trait]
impl LinkControl for SystemLinkControl {
    async fn create_interface(&self, interface: &str) -> anyhow::Result<()> {
        run("ip", &["link", "add", "dev", interface, "type", "wireguard"]).await
    }

    async fn set_private_key(&self, interface: &str, private_key: &str) -> anyhow::Result<()> {
        // The key goes over stdin so it never appears in a process list.
        let mut child = Command::new("wg")
            .args(["set", interface, "private-key", "/dev/stdin"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("spawn wg set private-key")?;

        let mut stdin = child.stdin.take().context("take wg stdin")?;
        stdin
            .write_all(private_key.as_bytes())
            .await
            .context("write private key")?;
        stdin.shutdown().await.context("close wg stdin")?;

        let output = child.wait_with_output().await.context("wait wg set")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("wg set private-key failed: {}", stderr.trim()));
        }
        Ok(())
    }

    async fn set_hub_peer(&self, interface: &str, hub: &HubPeer) -> anyhow::Result<()> {
        let keepalive = hub.persistent_keepalive.map(|secs| secs.to_string());
        let mut args: Vec<&str> = vec![
            "set",
            interface,
            "peer",
            hub.public_key.as_str(),
            "endpoint",
            hub.endpoint.as_str(),
            "allowed-ips",
            hub.allowed_ips.as_str(),
        ];
        if let Some(keepalive) = keepalive.as_deref() {
            args.push("persistent-keepalive");
            args.push(keepalive);
        }
        run("wg", &args).await
    }

    async fn add_address(&self, interface: &str, address: &str) -> anyhow::Result<()> {
        run("ip", &["address", "add", address, "dev", interface]).await
    }

    async fn link_up(&self, interface: &str) -> anyhow::Result<()> {
        run("ip", &["link", "set", interface, "up"]).await
    }

    async fn link_down(&self, interface: &str) -> anyhow::Result<()> {
        run("ip", &["link", "set", interface, "down"]).await
    }

    async fn delete_interface(&self, interface: &str) -> anyhow::Result<()> {
        run("ip", &["link", "delete", interface]).await
    }

    async fn ping(&self, host: &str, count: u32, timeout: Duration) -> bool {
        let count_arg = count.to_string();
        let timeout_arg = timeout.as_secs().max(1).to_string();
        let child = Command::new("ping")
            .args(["-c", count_arg.as_str(), "-W", timeout_arg.as_str(), host])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();

        let mut child = match child {
            Ok(child) => child,
            Err(err) => {
                tracing::warn!(
                    event = "weft.node.ping_spawn_failed",
                    host,
                    error = %err,
                    "could not spawn ping"
                );
                return false;
            }
        };

        // Guard slightly past ping's own timeout so the wait is bounded even
        // if the subprocess wedges.
        let guard = timeout * count.max(1) + Duration::from_secs(2);
        match tokio::time::timeout(guard, child.wait()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(_)) => false,
            Err(_) => {
                let _ = child.kill().await;
                let _ = child.wait().await;
                false
            }
        }
    }

    async fn show(&self, interface: &str) -> anyhow::Result<String> {
        let output = Command::new("wg")
            .args(["show", interface])
            .stdin(Stdio::null())
            .output()
            .await
            .context("spawn wg show")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("wg show exited {}: {}", output.status, stderr.trim()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

async fn run(program: &str, args: &[&str]) -> anyhow::Result<()> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("spawn {program} {}", args.join(" ")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!(
            "{program} {} exited {}: {}",
            args.join(" "),
            output.status,
            stderr.trim()
        ));
    }
    Ok(())
}

/// Extract the latest handshake age in seconds from `wg show` output.
pub fn parse_handshake_age(wg_output: &str) -> Option<u64> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| {
        Regex::new(r"latest handshake:\s+(\d+)\s+(second|minute)s?\s+ago").expect("static regex")
    });

    let caps = re.captures(wg_output)?;
    let value: u64 = caps.get(1)?.as_str().parse().ok()?;
    match caps.get(2)?.as_str() {
        "minute" => Some(value * 60),
        _ => Some(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_seconds_and_minutes() {
        let output = "\
interface: wg0
  public key: abc=
peer: def=
  endpoint: 203.0.113.1:51820
  latest handshake: 45 seconds ago
  transfer: 1.21 MiB received, 820.5 KiB sent
";
        assert_eq!(parse_handshake_age(output), Some(45));

        let output = "peer: def=\n  latest handshake: 3 minutes ago\n";
        assert_eq!(parse_handshake_age(output), Some(180));

        let output = "peer: def=\n  latest handshake: 1 minute ago\n";
        assert_eq!(parse_handshake_age(output), Some(60));

        let output = "peer: def=\n  latest handshake: 1 second ago\n";
        assert_eq!(parse_handshake_age(output), Some(1));
    }

    #[test]
    fn missing_handshake_yields_none() {
        assert_eq!(parse_handshake_age("interface: wg0\n"), None);
        assert_eq!(
            parse_handshake_age("latest handshake: 2 hours, 5 minutes ago"),
            None
        );
    }
}
