//! Result delivery sinks.
//!
//! Both the direct path (upstream reachable) and the buffer drain deliver
//! through a [`ResultSink`]; the production implementation posts each
//! envelope to the upstream coordinator's per-task result endpoint.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;

/// One task result on its way upstream.
#[derive(Debug, Clone, Serialize)]
pub struct ResultEnvelope {
    pub task_id: String,
    pub agent_id: String,
    pub lease_token: String,
    pub result: Value,
    pub metadata: Option<Value>,
}

#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Cheap connectivity hint consulted by the periodic flush loop.
    async fn is_connected(&self) -> bool;

    /// Deliver one result. When called from a flush pass, an error leaves
    /// the row pending with an incremented retry count.
    async fn deliver(&self, envelope: &ResultEnvelope) -> anyhow::Result<()>;
}

/// Posts results to `{upstream}/tasks/{task_id}/result`; any non-2xx outcome
/// is a delivery error.
pub struct UpstreamSink {
    base_url: String,
    client: reqwest::Client,
}

impl UpstreamSink {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build upstream http client")?;
        Ok(Self { base_url, client })
    }
}

#[async_trait]
impl ResultSink for UpstreamSink {
    async fn is_connected(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    async fn deliver(&self, envelope: &ResultEnvelope) -> anyhow::Result<()> {
        let url = format!("{}/tasks/{}/result", self.base_url, envelope.task_id);
        let body = json!({
            "task_id": envelope.task_id,
            "agent_id": envelope.agent_id,
            "lease_token": envelope.lease_token,
            "result": envelope.result,
            "metadata": envelope.metadata,
        });

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("upstream rejected result: HTTP {status}"));
        }
        Ok(())
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use super::*;
    use std::sync::Mutex;

    enum Mode {
        Accept,
        Reject,
        RejectTask(String),
    }

    /// Records delivered task ids; configurable acceptance.
    pub struct RecordingSink {
        mode: Mode,
        connected: bool,
        delivered: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        pub fn accepting() -> Self {
            Self {
                mode: Mode::Accept,
                connected: true,
                delivered: Mutex::new(Vec::new()),
            }
        }

        pub fn rejecting() -> Self {
            Self {
                mode: Mode::Reject,
                connected: false,
                delivered: Mutex::new(Vec::new()),
            }
        }

        pub fn rejecting_task(task_id: &str) -> Self {
            Self {
                mode: Mode::RejectTask(task_id.to_string()),
                connected: true,
                delivered: Mutex::new(Vec::new()),
            }
        }

        pub fn delivered(&self) -> Vec<String> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ResultSink for RecordingSink {
        async fn is_connected(&self) -> bool {
            self.connected
        }

        async fn deliver(&self, envelope: &ResultEnvelope) -> anyhow::Result<()> {
            match &self.mode {
                Mode::Accept => {}
                Mode::Reject => return Err(anyhow!("sink offline")),
                Mode::RejectTask(task_id) if *task_id == envelope.task_id => {
                    return Err(anyhow!("sink rejected {task_id}"));
                }
                Mode::RejectTask(_) => {}
            }
            self.delivered
                .lock()
                .unwrap()
                .push(envelope.task_id.clone());
            Ok(())
        }
    }
}
