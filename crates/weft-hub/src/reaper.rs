//! Lease expiration sweeps.
//!
//! Active leases whose expiry passed without completion are deactivated and
//! their tasks requeued, so abandoned work becomes leasable again.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use weft_core::store::{Store, StoreError};
use weft_monitor::MonitoringFacade;

#[derive(Debug, Default)]
struct ReaperCounters {
    leases_expired_total: u64,
    last_sweep_at: Option<DateTime<Utc>>,
}

pub struct LeaseReaper {
    store: Arc<dyn Store>,
    facade: Option<Arc<MonitoringFacade>>,
    counters: Mutex<ReaperCounters>,
}

impl LeaseReaper {
    pub fn new(store: Arc<dyn Store>, facade: Option<Arc<MonitoringFacade>>) -> Self {
        Self {
            store,
            facade,
            counters: Mutex::new(ReaperCounters::default()),
        }
    }

    /// One sweep: reap everything lapsed, record the events. Returns the
    /// number of leases reaped.
    pub async fn sweep_once(&self) -> Result<usize, StoreError> {
        let now = Utc::now();
        let reaped = self.store.reap_expired_leases(now).await?;

        for lease in &reaped {
            tracing::warn!(
                event = "weft.reaper.lease_expired",
                lease_id = %lease.lease_id,
                task_id = %lease.task_id,
                peer_id = %lease.peer_id,
                "lease expired; task requeued"
            );
            if let Some(facade) = &self.facade {
                facade.on_lease_expired(lease.lease_id, lease.task_id, &lease.peer_id);
            }
        }

        let mut counters = self.counters.lock().expect("reaper counters poisoned");
        counters.leases_expired_total += reaped.len() as u64;
        counters.last_sweep_at = Some(now);

        Ok(reaped.len())
    }

    /// Counters for the `lease_expiration` health block.
    pub fn expiration_stats(&self) -> Value {
        let counters = self.counters.lock().expect("reaper counters poisoned");
        json!({
            "leases_expired_total": counters.leases_expired_total,
            "last_sweep_at": counters.last_sweep_at,
        })
    }
}

/// Handle for the background sweep loop.
pub struct ReaperLoop {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ReaperLoop {
    pub fn start(reaper: Arc<LeaseReaper>, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    return;
                }

                if let Err(err) = reaper.sweep_once().await {
                    tracing::warn!(
                        event = "weft.reaper.sweep_error",
                        error = %err,
                        "lease sweep failed"
                    );
                }

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
    use chrono::Duration as ChronoDuration;
    use uuid::Uuid;
    use weft_core::model::{RequiredResources, TaskComplexity, TaskLease, TaskRecord, TaskStatus};
    use weft_core::store::MemoryStore;

    async fn seed_expired_lease(store: &MemoryStore) -> (Uuid, Uuid) {
        let task_id = Uuid::new_v4();
        store
            .insert_task(TaskRecord {
                task_id,
                status: TaskStatus::Queued,
                complexity: TaskComplexity::Low,
                required: RequiredResources::default(),
                payload: serde_json::json!({}),
            })
            .await
            .unwrap();

        let now = Utc::now();
        let lease_id = Uuid::new_v4();
        store
            .create_lease(TaskLease {
                lease_id,
                task_id,
                peer_id: "peer-a".to_string(),
                token: "tok".to_string(),
                issued_at: now - ChronoDuration::minutes(10),
                expires_at: now - ChronoDuration::minutes(5),
                is_active: true,
            })
            .await
            .unwrap();
        (task_id, lease_id)
    }

    #[tokio::test]
    async fn sweep_requeues_expired_work_and_counts() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let (task_id, _) = seed_expired_lease(&store).await;

        let reaper = LeaseReaper::new(store.clone(), None);
        assert_eq!(reaper.sweep_once().await?, 1);
        assert_eq!(
            store.get_task(task_id).await?.unwrap().status,
            TaskStatus::Queued
        );

        // Nothing left to reap; totals accumulate.
        assert_eq!(reaper.sweep_once().await?, 0);
        let stats = reaper.expiration_stats();
        assert_eq!(stats["leases_expired_total"], serde_json::json!(1));
        assert!(stats["last_sweep_at"].is_string());
        Ok(())
    }

    #[tokio::test]
    async fn loop_sweeps_and_stops_cleanly() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let (task_id, _) = seed_expired_lease(&store).await;

        let reaper = Arc::new(LeaseReaper::new(store.clone(), None));
        let handle = ReaperLoop::start(reaper, Duration::from_millis(10));

        for _ in 0..50 {
            if store.get_task(task_id).await?.unwrap().status == TaskStatus::Queued {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            store.get_task(task_id).await?.unwrap().status,
            TaskStatus::Queued
        );

        handle.stop().await;
        Ok(())
    }
}
