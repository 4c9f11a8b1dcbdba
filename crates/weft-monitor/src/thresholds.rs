//! Runtime-configurable alert thresholds for health derivation.
//!
//! One instance per process; handlers and the aggregator share it through
//! [`AlertThresholds::global`]. `get` hands out a copy, `update` is partial
//! (unknown keys ignored, one bad value rejects the whole update).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex, OnceLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ThresholdError {
    #[error("invalid value for {field}: {reason}")]
    OutOfRange { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    /// Buffer utilization % above which status degrades.
    pub buffer_utilization: f64,
    /// Recent crash count at or above which status degrades.
    pub crash_count: u32,
    /// Lease revocation rate % above which status degrades.
    pub revocation_rate: f64,
    /// IP pool utilization % above which status degrades.
    pub ip_pool_utilization: f64,
    pub updated_at: DateTime<Utc>,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            buffer_utilization: 80.0,
            crash_count: 3,
            revocation_rate: 50.0,
            ip_pool_utilization: 90.0,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
pub struct AlertThresholds {
    config: Mutex<ThresholdConfig>,
}

static GLOBAL: OnceLock<Arc<AlertThresholds>> = OnceLock::new();

impl AlertThresholds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide instance. Tests that mutate thresholds should construct
    /// their own instance instead.
    pub fn global() -> Arc<AlertThresholds> {
        GLOBAL.get_or_init(|| Arc::new(AlertThresholds::new())).clone()
    }

    /// Current configuration, by copy.
    pub fn get(&self) -> ThresholdConfig {
        *self.config.lock().expect("thresholds lock poisoned")
    }

    /// Partial update from a JSON object. Unknown keys are silently ignored;
    /// any value failing bounds validation rejects the whole update.
    pub fn update(
        &self,
        updates: &serde_json::Map<String, Value>,
    ) -> Result<ThresholdConfig, ThresholdError> {
        let mut config = self.config.lock().expect("thresholds lock poisoned");
        let mut candidate = *config;

        for (key, value) in updates {
            match key.as_str() {
                "buffer_utilization" => {
                    candidate.buffer_utilization = percent(value, "buffer_utilization")?;
                }
                "crash_count" => {
                    candidate.crash_count = count(value, "crash_count")?;
                }
                "revocation_rate" => {
                    candidate.revocation_rate = percent(value, "revocation_rate")?;
                }
                "ip_pool_utilization" => {
                    candidate.ip_pool_utilization = percent(value, "ip_pool_utilization")?;
                }
                _ => {}
            }
        }

        candidate.updated_at = Utc::now();
        *config = candidate;
        Ok(candidate)
    }

    /// Restore defaults. Test isolation and operational recovery hook.
    pub fn reset_to_defaults(&self) -> ThresholdConfig {
        let mut config = self.config.lock().expect("thresholds lock poisoned");
        *config = ThresholdConfig::default();
        *config
    }
}

fn percent(value: &Value, field: &'static str) -> Result<f64, ThresholdError> {
    let n = value.as_f64().ok_or_else(|| ThresholdError::OutOfRange {
        field,
        reason: "expected a number".to_string(),
    })?;
    if !(0.0..=100.0).contains(&n) {
        return Err(ThresholdError::OutOfRange {
            field,
            reason: format!("{n} outside [0, 100]"),
        });
    }
    Ok(n)
}

fn count(value: &Value, field: &'static str) -> Result<u32, ThresholdError> {
    let n = value.as_u64().ok_or_else(|| ThresholdError::OutOfRange {
        field,
        reason: "expected a non-negative integer".to_string(),
    })?;
    u32::try_from(n).map_err(|_| ThresholdError::OutOfRange {
        field,
        reason: format!("{n} too large"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> serde_json::Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn defaults_match_health_derivation() {
        let t = AlertThresholds::new().get();
        assert_eq!(t.buffer_utilization, 80.0);
        assert_eq!(t.crash_count, 3);
        assert_eq!(t.revocation_rate, 50.0);
        assert_eq!(t.ip_pool_utilization, 90.0);
    }

    #[test]
    fn partial_update_keeps_other_fields() {
        let thresholds = AlertThresholds::new();
        let updated = thresholds
            .update(&map(json!({"buffer_utilization": 95.0})))
            .unwrap();
        assert_eq!(updated.buffer_utilization, 95.0);
        assert_eq!(updated.crash_count, 3);
        assert_eq!(thresholds.get().buffer_utilization, 95.0);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let thresholds = AlertThresholds::new();
        let updated = thresholds
            .update(&map(json!({"unknown_key": 1, "crash_count": 5})))
            .unwrap();
        assert_eq!(updated.crash_count, 5);
    }

    #[test]
    fn one_bad_value_rejects_the_whole_update() {
        let thresholds = AlertThresholds::new();
        let err = thresholds
            .update(&map(json!({"crash_count": 5, "revocation_rate": 150.0})))
            .unwrap_err();
        assert!(matches!(err, ThresholdError::OutOfRange { field: "revocation_rate", .. }));
        // Nothing applied.
        assert_eq!(thresholds.get().crash_count, 3);
    }

    #[test]
    fn reset_restores_defaults() {
        let thresholds = AlertThresholds::new();
        thresholds
            .update(&map(json!({"ip_pool_utilization": 10.0})))
            .unwrap();
        thresholds.reset_to_defaults();
        assert_eq!(thresholds.get().ip_pool_utilization, 90.0);
    }
}
