//! HTTP coordinator client used for post-connect registration.

use crate::connector::{CoordinatorClient, NodeRegistration};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    node_id: String,
}

pub struct HttpCoordinatorClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpCoordinatorClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build coordinator http client")?;
        Ok(Self { base_url, client })
    }
}

#[async_trait]
impl CoordinatorClient for HttpCoordinatorClient {
    async fn register_node(&self, registration: &NodeRegistration) -> anyhow::Result<String> {
        let url = format!("{}/nodes/register", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(registration)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("registration rejected: HTTP {status}"));
        }

        let body: RegisterResponse = resp.json().await.context("decode registration response")?;
        Ok(body.node_id)
    }
}
