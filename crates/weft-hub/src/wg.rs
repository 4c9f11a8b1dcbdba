//! WireGuard and ICMP control-plane commands on the hub host.
//!
//! The registry talks to the live interface through [`WgControl`] so the
//! reload/probe mechanics stay swappable in tests. [`SystemWgControl`] shells
//! out to the real `wg` and `ping` binaries.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

#[async_trait]
pub trait WgControl: Send + Sync {
    /// Apply `config_path` to the live interface without dropping sessions.
    /// An error means the reload failed; the caller decides what to do with
    /// the already-written file.
    async fn sync_conf(&self, interface: &str, config_path: &Path) -> anyhow::Result<()>;

    /// One ICMP echo to `target`. `false` on timeout or non-zero exit.
    async fn ping(&self, target: Ipv4Addr, timeout: Duration) -> bool;

    /// Raw `wg show <interface>` output, used for the health summary.
    async fn show(&self, interface: &str) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemWgControl;

#[async_trait]
impl WgControl for SystemWgControl {
    async fn sync_conf(&self, interface: &str, config_path: &Path) -> anyhow::Result<()> {
        let output = Command::new("wg")
            .arg("syncconf")
            .arg(interface)
            .arg(config_path)
            .stdin(Stdio::null())
            .output()
            .await
            .context("spawn wg syncconf")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("wg syncconf exited {}: {}", output.status, stderr.trim()));
        }
        Ok(())
    }

    async fn ping(&self, target: Ipv4Addr, timeout: Duration) -> bool {
        let timeout_secs = timeout.as_secs().max(1);
        let child = Command::new("ping")
            .arg("-c")
            .arg("1")
            .arg("-W")
            .arg(timeout_secs.to_string())
            .arg(target.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();

        let mut child = match child {
            Ok(child) => child,
            Err(err) => {
                tracing::warn!(
                    event = "weft.wg.ping_spawn_failed",
                    target = %target,
                    error = %err,
                    "could not spawn ping"
                );
                return false;
            }
        };

        // Wall-clock guard one second past the probe timeout so a wedged
        // subprocess cannot hang the caller.
        match tokio::time::timeout(timeout + Duration::from_secs(1), child.wait()).await {
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
            .arg("show")
            .arg(interface)
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

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory [`WgControl`]: records syncconf calls, answers pings from a
    /// configured reachable set, serves canned `wg show` output.
    #[derive(Debug, Default)]
    pub struct StubWgControl {
        sync_calls: AtomicUsize,
        fail_sync: Option<String>,
        reachable: Mutex<HashSet<Ipv4Addr>>,
        show_output: Mutex<Option<String>>,
    }

    impl StubWgControl {
        pub fn failing(stderr: &str) -> Self {
            Self {
                fail_sync: Some(stderr.to_string()),
                ..Self::default()
            }
        }

        pub fn sync_count(&self) -> usize {
            self.sync_calls.load(Ordering::SeqCst)
        }

        pub fn set_reachable(&self, ip: Ipv4Addr) {
            self.reachable.lock().unwrap().insert(ip);
        }

        pub fn set_show_output(&self, output: &str) {
            *self.show_output.lock().unwrap() = Some(output.to_string());
        }
    }

    #[async_trait]
    impl WgControl for StubWgControl {
        async fn sync_conf(&self, _interface: &str, _config_path: &Path) -> anyhow::Result<()> {
            self.sync_calls.fetch_add(1, Ordering::SeqCst);
            match &self.fail_sync {
                Some(stderr) => Err(anyhow!("{stderr}")),
                None => Ok(()),
            }
        }

        async fn ping(&self, target: Ipv4Addr, _timeout: Duration) -> bool {
            self.reachable.lock().unwrap().contains(&target)
        }

        async fn show(&self, interface: &str) -> anyhow::Result<String> {
            let canned = self.show_output.lock().unwrap().clone();
            Ok(canned.unwrap_or_else(|| format!("interface: {interface}\n")))
        }
    }
}
