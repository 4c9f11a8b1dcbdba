//! Adapters exposing hub subsystems to the health aggregator.

use crate::lease::LeaseIssuer;
use crate::pool::IpPool;
use crate::reaper::LeaseReaper;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use weft_buffer::{PartitionDetector, ResultBuffer};
use weft_monitor::StatsProvider;

pub struct PoolStatsProvider(pub Arc<IpPool>);

#[async_trait]
impl StatsProvider for PoolStatsProvider {
    async fn stats(&self) -> anyhow::Result<Value> {
        Ok(serde_json::to_value(self.0.stats())?)
    }
}

pub struct BufferStatsProvider(pub Arc<ResultBuffer>);

#[async_trait]
impl StatsProvider for BufferStatsProvider {
    async fn stats(&self) -> anyhow::Result<Value> {
        Ok(serde_json::to_value(self.0.metrics().await?)?)
    }
}

pub struct PartitionStatsProvider(pub Arc<PartitionDetector>);

#[async_trait]
impl StatsProvider for PartitionStatsProvider {
    async fn stats(&self) -> anyhow::Result<Value> {
        Ok(self.0.statistics().await)
    }
}

pub struct LeaseRevocationStatsProvider(pub Arc<LeaseIssuer>);

#[async_trait]
impl StatsProvider for LeaseRevocationStatsProvider {
    async fn stats(&self) -> anyhow::Result<Value> {
        Ok(self.0.revocation_stats())
    }
}

pub struct LeaseExpirationStatsProvider(pub Arc<LeaseReaper>);

#[async_trait]
impl StatsProvider for LeaseExpirationStatsProvider {
    async fn stats(&self) -> anyhow::Result<Value> {
        Ok(self.0.expiration_stats())
    }
}
