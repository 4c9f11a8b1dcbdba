//! Pull-based composite health snapshot.
//!
//! Subsystems register a [`StatsProvider`]; the aggregator calls each one,
//! wraps the result in `{available, error?, ...stats}`, and derives the
//! overall status from a fixed rule order plus the configurable thresholds.

use crate::thresholds::AlertThresholds;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex};

/// Uniform stats contribution. Implementations return a JSON object; a
/// returned error marks the subsystem unavailable in the snapshot.
#[async_trait]
pub trait StatsProvider: Send + Sync {
    async fn stats(&self) -> anyhow::Result<Value>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

pub struct HealthAggregator {
    thresholds: Arc<AlertThresholds>,
    registry: Mutex<Vec<(String, Arc<dyn StatsProvider>)>>,
}

impl HealthAggregator {
    pub fn new(thresholds: Arc<AlertThresholds>) -> Self {
        Self {
            thresholds,
            registry: Mutex::new(Vec::new()),
        }
    }

    /// Register (or replace) a subsystem provider under `name`.
    pub fn register(&self, name: &str, provider: Arc<dyn StatsProvider>) {
        let mut registry = self.registry.lock().expect("health registry poisoned");
        match registry.iter_mut().find(|(n, _)| n == name) {
            Some((_, existing)) => *existing = provider,
            None => registry.push((name.to_string(), provider)),
        }
    }

    pub fn unregister(&self, name: &str) {
        let mut registry = self.registry.lock().expect("health registry poisoned");
        registry.retain(|(n, _)| n != name);
    }

    pub fn registered(&self) -> Vec<String> {
        let registry = self.registry.lock().expect("health registry poisoned");
        registry.iter().map(|(n, _)| n.clone()).collect()
    }

    /// Collect a full snapshot: overall status, counts, and one
    /// `{available, error?, ...stats}` block per registered subsystem.
    pub async fn collect_snapshot(&self) -> Value {
        let providers: Vec<(String, Arc<dyn StatsProvider>)> = {
            let registry = self.registry.lock().expect("health registry poisoned");
            registry.clone()
        };

        let mut results: Map<String, Value> = Map::new();
        let mut available = 0usize;

        for (name, provider) in &providers {
            let block = match provider.stats().await {
                Ok(stats) => {
                    available += 1;
                    let mut block = Map::new();
                    block.insert("available".to_string(), Value::Bool(true));
                    if let Value::Object(fields) = stats {
                        block.extend(fields);
                    }
                    Value::Object(block)
                }
                Err(err) => {
                    tracing::warn!(
                        event = "weft.health.subsystem_unavailable",
                        subsystem = %name,
                        error = %err,
                        "failed to collect subsystem stats"
                    );
                    json!({ "available": false, "error": err.to_string() })
                }
            };
            results.insert(name.clone(), block);
        }

        let status = self.derive_status(&results, available, providers.len());

        let mut snapshot = Map::new();
        snapshot.insert("status".to_string(), json!(status));
        snapshot.insert("timestamp".to_string(), json!(Utc::now()));
        snapshot.insert("subsystems_available".to_string(), json!(available));
        snapshot.insert("subsystems_total".to_string(), json!(providers.len()));
        snapshot.extend(results);
        Value::Object(snapshot)
    }

    /// Rule order matters: partition beats availability beats thresholds.
    fn derive_status(
        &self,
        results: &Map<String, Value>,
        available: usize,
        total: usize,
    ) -> HealthStatus {
        let partition_degraded = results
            .get("partition_detection")
            .filter(|block| block["available"] == json!(true))
            .and_then(|block| block.get("current_state"))
            .is_some_and(|state| state == "degraded");
        if partition_degraded {
            return HealthStatus::Unhealthy;
        }

        if available == 0 {
            return HealthStatus::Unhealthy;
        }
        if available < total {
            return HealthStatus::Degraded;
        }

        let thresholds = self.thresholds.get();
        let metric = |subsystem: &str, field: &str| -> Option<f64> {
            results
                .get(subsystem)
                .filter(|block| block["available"] == json!(true))
                .and_then(|block| block.get(field))
                .and_then(Value::as_f64)
        };

        let breached = metric("result_buffer", "util_pct")
            .is_some_and(|v| v > thresholds.buffer_utilization)
            || metric("node_crash_detection", "recent_crashes")
                .is_some_and(|v| v >= f64::from(thresholds.crash_count))
            || metric("lease_revocation", "revocation_rate")
                .is_some_and(|v| v > thresholds.revocation_rate)
            || metric("ip_pool", "util_pct").is_some_and(|v| v > thresholds.ip_pool_utilization);

        if breached {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}
