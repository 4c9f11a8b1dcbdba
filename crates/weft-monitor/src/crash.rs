//! Node crash detection from heartbeat staleness.
//!
//! Nodes report heartbeats; a sweep marks any node silent past the staleness
//! bound as crashed. Crash history lives in a bounded deque and feeds the
//! `node_crash_detection` block of the health snapshot.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

pub const DEFAULT_MAX_CRASH_HISTORY: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct CrashEvent {
    pub peer_id: String,
    pub detected_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct CrashState {
    heartbeats: HashMap<String, DateTime<Utc>>,
    crashes: VecDeque<CrashEvent>,
}

pub struct CrashDetector {
    /// Heartbeat silence beyond this marks a node crashed.
    stale_after: Duration,
    /// Window for the `recent_crashes` statistic.
    recent_window: Duration,
    max_history: usize,
    state: Mutex<CrashState>,
}

impl CrashDetector {
    pub fn new(stale_after: Duration, recent_window: Duration) -> Self {
        Self {
            stale_after,
            recent_window,
            max_history: DEFAULT_MAX_CRASH_HISTORY,
            state: Mutex::new(CrashState::default()),
        }
    }

    pub fn record_heartbeat(&self, peer_id: &str) {
        let mut state = self.state.lock().expect("crash state poisoned");
        state.heartbeats.insert(peer_id.to_string(), Utc::now());
    }

    pub fn forget(&self, peer_id: &str) {
        let mut state = self.state.lock().expect("crash state poisoned");
        state.heartbeats.remove(peer_id);
    }

    /// Mark nodes whose last heartbeat predates the staleness bound as
    /// crashed and drop them from monitoring. Returns the new crash events.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<CrashEvent> {
        let mut state = self.state.lock().expect("crash state poisoned");

        let crashed: Vec<(String, DateTime<Utc>)> = state
            .heartbeats
            .iter()
            .filter(|(_, &last)| now - last > self.stale_after)
            .map(|(id, &last)| (id.clone(), last))
            .collect();

        let mut events = Vec::with_capacity(crashed.len());
        for (peer_id, last_heartbeat_at) in crashed {
            state.heartbeats.remove(&peer_id);
            let event = CrashEvent {
                peer_id: peer_id.clone(),
                detected_at: now,
                last_heartbeat_at,
            };
            if state.crashes.len() == self.max_history {
                state.crashes.pop_front();
            }
            state.crashes.push_back(event.clone());
            tracing::warn!(
                event = "weft.crash.detected",
                peer_id = %peer_id,
                last_heartbeat_at = %last_heartbeat_at,
                "node heartbeat stale; marking crashed"
            );
            events.push(event);
        }

        events
    }

    pub fn crash_statistics(&self) -> Value {
        let now = Utc::now();
        let state = self.state.lock().expect("crash state poisoned");
        let recent = state
            .crashes
            .iter()
            .filter(|c| now - c.detected_at <= self.recent_window)
            .count();

        json!({
            "total_crashes": state.crashes.len(),
            "recent_crashes": recent,
            "monitored_nodes": state.heartbeats.len(),
        })
    }

    pub fn crash_history(&self) -> Vec<CrashEvent> {
        let state = self.state.lock().expect("crash state poisoned");
        state.crashes.iter().cloned().collect()
    }
}

#[async_trait::async_trait]
impl crate::health::StatsProvider for CrashDetector {
    async fn stats(&self) -> anyhow::Result<Value> {
        Ok(self.crash_statistics())
    }
}
