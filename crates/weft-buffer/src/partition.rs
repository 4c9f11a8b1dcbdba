//! Upstream partition detection and degraded-mode gating.
//!
//! A single `/health` endpoint models upstream liveness. The first failed
//! check enters degraded mode: new work is refused, in-progress tasks keep
//! running, and results land in the buffer. The first success after that
//! records the recovery and drives a buffer flush.

use crate::buffer::ResultBuffer;
use crate::sink::ResultSink;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const DEFAULT_MAX_EVENT_HISTORY: usize = 100;

#[derive(Debug, Error)]
pub enum PartitionError {
    #[error(
        "cannot accept new tasks: upstream is partitioned; existing tasks continue, \
         new work is rejected until recovery"
    )]
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionEventType {
    PartitionDetected,
    PartitionRecovered,
}

#[derive(Debug, Clone, Serialize)]
pub struct PartitionEvent {
    pub event_type: PartitionEventType,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consecutive_failures: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition_duration_seconds: Option<f64>,
}

#[derive(Debug, Default)]
struct DetectorState {
    degraded: bool,
    partition_count: u64,
    consecutive_failures: u64,
    partition_start: Option<DateTime<Utc>>,
    in_progress: HashSet<String>,
    events: VecDeque<PartitionEvent>,
}

#[derive(Debug, Deserialize)]
struct UpstreamHealth {
    status: String,
}

pub struct PartitionDetector {
    upstream_url: String,
    client: reqwest::Client,
    buffer: Arc<ResultBuffer>,
    sink: Arc<dyn ResultSink>,
    max_event_history: usize,
    state: Mutex<DetectorState>,
    // Serializes health checks so a slow probe cannot stack.
    check_lock: tokio::sync::Mutex<()>,
}

impl PartitionDetector {
    pub fn new(
        upstream_url: impl Into<String>,
        timeout: Duration,
        buffer: Arc<ResultBuffer>,
        sink: Arc<dyn ResultSink>,
        max_event_history: Option<usize>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            upstream_url: upstream_url.into().trim_end_matches('/').to_string(),
            client,
            buffer,
            sink,
            max_event_history: max_event_history.unwrap_or(DEFAULT_MAX_EVENT_HISTORY),
            state: Mutex::new(DetectorState::default()),
            check_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Probe upstream health once. Returns `true` when partitioned.
    pub async fn check(&self) -> bool {
        let _serialized = self.check_lock.lock().await;

        match self.probe_upstream().await {
            Ok(()) => {
                let recovered = self.handle_success();
                if recovered {
                    self.flush_after_recovery().await;
                }
                false
            }
            Err(reason) => {
                self.handle_failure(&reason);
                true
            }
        }
    }

    async fn probe_upstream(&self) -> Result<(), String> {
        let url = format!("{}/health", self.upstream_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| err.to_string())?;

        let status = resp.status();
        if status.as_u16() != 200 {
            return Err(format!("HTTP {status}"));
        }

        let health: UpstreamHealth = resp
            .json()
            .await
            .map_err(|err| format!("invalid health response: {err}"))?;
        if health.status != "healthy" {
            return Err(format!("unhealthy status: {}", health.status));
        }
        Ok(())
    }

    fn handle_failure(&self, reason: &str) {
        let mut state = self.state.lock().expect("detector lock poisoned");
        state.consecutive_failures += 1;

        if !state.degraded {
            state.degraded = true;
            state.partition_count += 1;
            state.partition_start = Some(Utc::now());

            let failures = state.consecutive_failures;
            push_event(
                &mut state,
                self.max_event_history,
                PartitionEvent {
                    event_type: PartitionEventType::PartitionDetected,
                    timestamp: Utc::now(),
                    error_message: Some(reason.to_string()),
                    consecutive_failures: Some(failures),
                    partition_duration_seconds: None,
                },
            );

            tracing::warn!(
                event = "weft.partition.detected",
                partition_count = state.partition_count,
                error = %reason,
                "upstream partition detected; entering degraded mode"
            );
        }
    }

    /// Returns true when this success ended a partition.
    fn handle_success(&self) -> bool {
        let mut state = self.state.lock().expect("detector lock poisoned");
        state.consecutive_failures = 0;

        if !state.degraded {
            return false;
        }

        let duration = state
            .partition_start
            .map(|start| ((Utc::now() - start).num_milliseconds() as f64 / 1000.0).max(0.0));
        state.degraded = false;
        state.partition_start = None;

        push_event(
            &mut state,
            self.max_event_history,
            PartitionEvent {
                event_type: PartitionEventType::PartitionRecovered,
                timestamp: Utc::now(),
                error_message: None,
                consecutive_failures: None,
                partition_duration_seconds: duration,
            },
        );

        tracing::info!(
            event = "weft.partition.recovered",
            duration_s = duration,
            "upstream partition recovered; exiting degraded mode"
        );
        true
    }

    async fn flush_after_recovery(&self) {
        match self.buffer.flush(self.sink.as_ref()).await {
            Ok(flushed) => {
                tracing::info!(
                    event = "weft.partition.recovery_flush",
                    flushed,
                    "flushed buffered results after recovery"
                );
            }
            Err(err) => {
                tracing::warn!(
                    event = "weft.partition.recovery_flush_failed",
                    error = %err,
                    "recovery flush failed; periodic flush will retry"
                );
            }
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.state.lock().expect("detector lock poisoned").degraded
    }

    /// Gate for new work: rejected while degraded.
    pub fn accept_new_task(&self, task_id: &str) -> Result<(), PartitionError> {
        let state = self.state.lock().expect("detector lock poisoned");
        if state.degraded {
            return Err(PartitionError::Degraded);
        }
        tracing::debug!(event = "weft.partition.task_accepted", task_id, "accepted new task");
        Ok(())
    }

    /// Tasks that started before the partition may complete during it.
    pub fn can_complete_task(&self, task_id: &str) -> bool {
        let state = self.state.lock().expect("detector lock poisoned");
        state.in_progress.contains(task_id) || !state.degraded
    }

    pub fn register_task_start(&self, task_id: &str) {
        let mut state = self.state.lock().expect("detector lock poisoned");
        state.in_progress.insert(task_id.to_string());
    }

    pub fn register_task_complete(&self, task_id: &str) {
        let mut state = self.state.lock().expect("detector lock poisoned");
        state.in_progress.remove(task_id);
    }

    pub fn in_progress_tasks(&self) -> Vec<String> {
        let state = self.state.lock().expect("detector lock poisoned");
        state.in_progress.iter().cloned().collect()
    }

    pub fn events(&self) -> Vec<PartitionEvent> {
        let state = self.state.lock().expect("detector lock poisoned");
        state.events.iter().cloned().collect()
    }

    pub async fn statistics(&self) -> serde_json::Value {
        let buffered = self.buffer.size().await.unwrap_or(0);

        let state = self.state.lock().expect("detector lock poisoned");
        let detected = state
            .events
            .iter()
            .filter(|e| e.event_type == PartitionEventType::PartitionDetected)
            .count();
        let recovered: Vec<&PartitionEvent> = state
            .events
            .iter()
            .filter(|e| e.event_type == PartitionEventType::PartitionRecovered)
            .collect();
        let total_duration: f64 = recovered
            .iter()
            .filter_map(|e| e.partition_duration_seconds)
            .sum();
        let current_duration = if state.degraded {
            state
                .partition_start
                .map(|start| ((Utc::now() - start).num_milliseconds() as f64 / 1000.0).max(0.0))
                .unwrap_or(0.0)
        } else {
            0.0
        };

        json!({
            "total_partitions": detected,
            "total_recoveries": recovered.len(),
            "total_partition_duration_seconds": total_duration,
            "current_state": if state.degraded { "degraded" } else { "normal" },
            "current_partition_duration_seconds": current_duration,
            "buffered_results_count": buffered,
            "in_progress_tasks_count": state.in_progress.len(),
        })
    }
}

fn push_event(state: &mut DetectorState, max: usize, event: PartitionEvent) {
    if state.events.len() == max {
        state.events.pop_front();
    }
    state.events.push_back(event);
}

/// Handle for the background health-check loop.
pub struct PartitionMonitor {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl PartitionMonitor {
    /// Spawn the polling loop. Per-iteration errors are contained inside
    /// `check`; the loop only ends on shutdown.
    pub fn start(detector: Arc<PartitionDetector>, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    return;
                }

                detector.check().await;

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown_rx.changed() => {}
                }
            }
        });

        Self { shutdown_tx, join }
    }

    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.join.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::UpstreamSink;
    use axum::response::IntoResponse;
    use axum::{extract::State, routing::get, routing::post, Json, Router};
    use serde_json::Value;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    #[derive(Clone)]
    struct UpstreamState {
        healthy: Arc<AtomicBool>,
        received: Arc<Mutex<Vec<String>>>,
    }

    /// Loopback coordinator: a health endpoint plus a result collector.
    async fn spawn_upstream(healthy: bool) -> (SocketAddr, UpstreamState) {
        let state = UpstreamState {
            healthy: Arc::new(AtomicBool::new(healthy)),
            received: Arc::new(Mutex::new(Vec::new())),
        };

        let app = Router::new()
            .route(
                "/health",
                get(|State(state): State<UpstreamState>| async move {
                    if state.healthy.load(Ordering::SeqCst) {
                        Json(json!({"status": "healthy"})).into_response()
                    } else {
                        (
                            axum::http::StatusCode::SERVICE_UNAVAILABLE,
                            Json(json!({"status": "down"})),
                        )
                            .into_response()
                    }
                }),
            )
            .route(
                "/tasks/:task_id/result",
                post(
                    |State(state): State<UpstreamState>,
                     axum::extract::Path(task_id): axum::extract::Path<String>,
                     Json(_body): Json<Value>| async move {
                        state.received.lock().unwrap().push(task_id);
                        axum::http::StatusCode::OK
                    },
                ),
            )
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, state)
    }

    async fn detector_against(
        addr: SocketAddr,
        dir: &TempDir,
    ) -> (Arc<PartitionDetector>, Arc<ResultBuffer>) {
        let base = format!("http://{addr}");
        let buffer = Arc::new(
            ResultBuffer::open(dir.path().join("buffer.db"), 100, 3)
                .await
                .unwrap(),
        );
        let sink = Arc::new(UpstreamSink::new(base.clone(), Duration::from_secs(2)).unwrap());
        let detector = Arc::new(
            PartitionDetector::new(base, Duration::from_secs(2), buffer.clone(), sink, None)
                .unwrap(),
        );
        (detector, buffer)
    }

    #[tokio::test]
    async fn degraded_write_through_and_recovery_flush() -> anyhow::Result<()> {
        let (addr, upstream) = spawn_upstream(false).await;
        let dir = TempDir::new()?;
        let (detector, buffer) = detector_against(addr, &dir).await;

        // Unreachable health -> degraded, new work refused.
        assert!(detector.check().await);
        assert!(detector.is_degraded());
        assert!(matches!(
            detector.accept_new_task("t-new"),
            Err(PartitionError::Degraded)
        ));

        // In-flight work continues and its results buffer up.
        detector.register_task_start("t0");
        assert!(detector.can_complete_task("t0"));
        assert!(!detector.can_complete_task("t-unknown"));
        for i in 0..3 {
            buffer
                .enqueue(&format!("t{i}"), "agent-1", "tok", json!({"i": i}), None)
                .await?;
        }

        // Recovery: detector records the event and drains the buffer in
        // insertion order.
        upstream.healthy.store(true, Ordering::SeqCst);
        assert!(!detector.check().await);
        assert!(!detector.is_degraded());
        assert_eq!(buffer.size().await?, 0);
        assert_eq!(
            upstream.received.lock().unwrap().clone(),
            vec!["t0", "t1", "t2"]
        );

        let events = detector.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, PartitionEventType::PartitionDetected);
        assert!(events[0].error_message.is_some());
        assert_eq!(events[1].event_type, PartitionEventType::PartitionRecovered);
        assert!(events[1].partition_duration_seconds.is_some());

        assert!(detector.accept_new_task("t-new").is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn repeated_failures_count_one_partition() -> anyhow::Result<()> {
        let (addr, _upstream) = spawn_upstream(false).await;
        let dir = TempDir::new()?;
        let (detector, _) = detector_against(addr, &dir).await;

        for _ in 0..3 {
            assert!(detector.check().await);
        }

        let stats = detector.statistics().await;
        assert_eq!(stats["total_partitions"], json!(1));
        assert_eq!(stats["current_state"], json!("degraded"));
        assert_eq!(stats["total_recoveries"], json!(0));
        Ok(())
    }

    #[tokio::test]
    async fn unhealthy_body_counts_as_failure() -> anyhow::Result<()> {
        // Listener that answers 200 but with a non-healthy body.
        let app = Router::new().route(
            "/health",
            get(|| async { Json(json!({"status": "booting"})) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let dir = TempDir::new()?;
        let (detector, _) = detector_against(addr, &dir).await;
        assert!(detector.check().await);
        assert!(detector.is_degraded());

        let events = detector.events();
        assert!(events[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("booting"));
        Ok(())
    }

    #[tokio::test]
    async fn connection_refused_counts_as_failure() -> anyhow::Result<()> {
        // Bind then drop the listener so the port refuses connections.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        drop(listener);

        let dir = TempDir::new()?;
        let (detector, _) = detector_against(addr, &dir).await;
        assert!(detector.check().await);
        assert!(detector.is_degraded());
        Ok(())
    }
}
