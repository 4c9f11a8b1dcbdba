//! Opaque task/lease store contract.
//!
//! Relational persistence of tasks, leases, and provisioning records lives
//! outside the core; services touch it only through this trait. The bundled
//! [`MemoryStore`] backs tests and single-process deployments.

use crate::model::{ProvisioningRecord, TaskLease, TaskRecord, TaskStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn get_task(&self, task_id: Uuid) -> Result<Option<TaskRecord>, StoreError>;

    async fn insert_task(&self, task: TaskRecord) -> Result<(), StoreError>;

    async fn set_task_status(&self, task_id: Uuid, status: TaskStatus) -> Result<(), StoreError>;

    /// Persist a lease and flip its task `Queued -> Leased` in one
    /// transaction. Fails with `Conflict` if the task is no longer queued or
    /// already carries a current lease.
    async fn create_lease(&self, lease: TaskLease) -> Result<(), StoreError>;

    async fn get_lease(&self, lease_id: Uuid) -> Result<Option<TaskLease>, StoreError>;

    async fn active_lease_for_task(
        &self,
        task_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskLease>, StoreError>;

    /// Cut a lease short: `expires_at = now`, task back to `Queued`.
    /// Idempotent on leases that have already lapsed. Returns the updated
    /// lease.
    async fn expire_lease(
        &self,
        lease_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<TaskLease, StoreError>;

    /// Sweep leases whose expiry has passed while still flagged active:
    /// deactivate each and requeue its task if it is still `Leased`.
    /// Returns the leases that were reaped.
    async fn reap_expired_leases(&self, now: DateTime<Utc>)
        -> Result<Vec<TaskLease>, StoreError>;

    async fn insert_provisioning_record(
        &self,
        record: ProvisioningRecord,
    ) -> Result<(), StoreError>;

    async fn remove_provisioning_record(&self, node_id: &str) -> Result<(), StoreError>;
}

#[derive(Default)]
struct MemoryInner {
    tasks: HashMap<Uuid, TaskRecord>,
    leases: HashMap<Uuid, TaskLease>,
    provisioning: HashMap<String, ProvisioningRecord>,
}

/// In-memory store. Single mutex over the whole state; fine for the scales
/// this backs.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_task(&self, task_id: Uuid) -> Result<Option<TaskRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.tasks.get(&task_id).cloned())
    }

    async fn insert_task(&self, task: TaskRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.tasks.contains_key(&task.task_id) {
            return Err(StoreError::Conflict(format!(
                "task {} already exists",
                task.task_id
            )));
        }
        inner.tasks.insert(task.task_id, task);
        Ok(())
    }

    async fn set_task_status(&self, task_id: Uuid, status: TaskStatus) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let task = inner
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| StoreError::NotFound(format!("task {task_id}")))?;
        task.status = status;
        Ok(())
    }

    async fn create_lease(&self, lease: TaskLease) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;

        let now = Utc::now();
        let has_current = inner
            .leases
            .values()
            .any(|l| l.task_id == lease.task_id && l.is_current(now));
        if has_current {
            return Err(StoreError::Conflict(format!(
                "task {} already has an active lease",
                lease.task_id
            )));
        }

        let task = inner
            .tasks
            .get_mut(&lease.task_id)
            .ok_or_else(|| StoreError::NotFound(format!("task {}", lease.task_id)))?;
        if task.status != TaskStatus::Queued {
            return Err(StoreError::Conflict(format!(
                "task {} is not queued",
                lease.task_id
            )));
        }

        task.status = TaskStatus::Leased;
        inner.leases.insert(lease.lease_id, lease);
        Ok(())
    }

    async fn get_lease(&self, lease_id: Uuid) -> Result<Option<TaskLease>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.leases.get(&lease_id).cloned())
    }

    async fn active_lease_for_task(
        &self,
        task_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskLease>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .leases
            .values()
            .find(|l| l.task_id == task_id && l.is_current(now))
            .cloned())
    }

    async fn expire_lease(
        &self,
        lease_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<TaskLease, StoreError> {
        let mut inner = self.inner.lock().await;

        let (task_id, was_current) = {
            let lease = inner
                .leases
                .get_mut(&lease_id)
                .ok_or_else(|| StoreError::NotFound(format!("lease {lease_id}")))?;
            let was_current = lease.is_current(now);
            if was_current {
                lease.expires_at = now;
            }
            (lease.task_id, was_current)
        };

        if was_current {
            if let Some(task) = inner.tasks.get_mut(&task_id) {
                task.status = TaskStatus::Queued;
            }
        }

        Ok(inner.leases[&lease_id].clone())
    }

    async fn reap_expired_leases(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskLease>, StoreError> {
        let mut inner = self.inner.lock().await;

        let expired: Vec<Uuid> = inner
            .leases
            .values()
            .filter(|l| l.is_active && l.expires_at <= now)
            .map(|l| l.lease_id)
            .collect();

        let mut reaped = Vec::with_capacity(expired.len());
        for lease_id in expired {
            let (task_id, lease) = {
                let lease = inner.leases.get_mut(&lease_id).expect("lease exists");
                lease.is_active = false;
                (lease.task_id, lease.clone())
            };

            if let Some(task) = inner.tasks.get_mut(&task_id) {
                if task.status == TaskStatus::Leased {
                    task.status = TaskStatus::Queued;
                }
            }
            reaped.push(lease);
        }

        Ok(reaped)
    }

    async fn insert_provisioning_record(
        &self,
        record: ProvisioningRecord,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.provisioning.insert(record.node_id.clone(), record);
        Ok(())
    }

    async fn remove_provisioning_record(&self, node_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.provisioning.remove(node_id);
        Ok(())
    }
}
