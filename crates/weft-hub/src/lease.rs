//! Task lease issuance.
//!
//! Matches a node's capability snapshot against the task's floor, mints a
//! signed lease token scaled by task complexity, and flips the task to
//! `Leased` in one store transaction. Revocation cuts the lease short and
//! requeues the task.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;
use weft_core::model::{NodeCapabilities, RequiredResources, TaskLease, TaskStatus};
use weft_core::store::{Store, StoreError};
use weft_core::token::{LeaseClaims, LeaseSigner, LeaseTokenError};
use weft_monitor::MonitoringFacade;

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("task {0} is not available for leasing")]
    TaskNotAvailable(String),
    #[error("{message}")]
    CapabilityMismatch {
        message: String,
        required: RequiredResources,
        provided: NodeCapabilities,
    },
    #[error("lease {0} not found")]
    LeaseNotFound(Uuid),
    #[error("lease issuance failed: {0}")]
    Issuance(String),
    #[error(transparent)]
    Token(#[from] LeaseTokenError),
}

/// Request for a lease on one task.
#[derive(Debug, Clone, Deserialize)]
pub struct LeaseRequest {
    pub task_id: Uuid,
    pub peer_id: String,
    pub node_capabilities: NodeCapabilities,
}

/// Issued lease plus the task payload the node should execute.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedLease {
    #[serde(flatten)]
    pub lease: TaskLease,
    pub task_payload: Value,
}

#[derive(Debug, Default)]
struct Counters {
    issued: u64,
    revoked: u64,
}

pub struct LeaseIssuer {
    store: Arc<dyn Store>,
    signer: LeaseSigner,
    facade: Option<Arc<MonitoringFacade>>,
    counters: std::sync::Mutex<Counters>,
}

impl LeaseIssuer {
    pub fn new(
        store: Arc<dyn Store>,
        signer: LeaseSigner,
        facade: Option<Arc<MonitoringFacade>>,
    ) -> Self {
        Self {
            store,
            signer,
            facade,
            counters: std::sync::Mutex::new(Counters::default()),
        }
    }

    /// Issue a lease for `request.task_id` to `request.peer_id`.
    pub async fn issue(&self, request: &LeaseRequest) -> Result<IssuedLease, LeaseError> {
        let task = self
            .store
            .get_task(request.task_id)
            .await
            .map_err(store_error)?
            .ok_or_else(|| LeaseError::TaskNotAvailable(format!("task {} not found", request.task_id)))?;

        if task.status != TaskStatus::Queued {
            return Err(LeaseError::TaskNotAvailable(format!(
                "task {} is not available (status: {:?})",
                task.task_id, task.status
            )));
        }

        if let Err(message) = match_capabilities(&task.required, &request.node_capabilities) {
            if let Some(facade) = &self.facade {
                facade
                    .on_lease_denied(task.task_id, &request.peer_id, &message)
                    .await;
            }
            return Err(LeaseError::CapabilityMismatch {
                message,
                required: task.required.clone(),
                provided: request.node_capabilities.clone(),
            });
        }

        let issued_at = Utc::now();
        let expires_at = issued_at + task.complexity.lease_duration();
        let token = self
            .signer
            .issue(task.task_id, &request.peer_id, issued_at, expires_at)?;

        let lease = TaskLease {
            lease_id: Uuid::new_v4(),
            task_id: task.task_id,
            peer_id: request.peer_id.clone(),
            token,
            issued_at,
            expires_at,
            is_active: true,
        };

        match self.store.create_lease(lease.clone()).await {
            Ok(()) => {}
            Err(StoreError::Conflict(msg)) => return Err(LeaseError::TaskNotAvailable(msg)),
            Err(StoreError::NotFound(msg)) => return Err(LeaseError::TaskNotAvailable(msg)),
            Err(StoreError::Backend(err)) => return Err(LeaseError::Issuance(err.to_string())),
        }

        self.counters.lock().expect("lease counters poisoned").issued += 1;

        if let Some(facade) = &self.facade {
            facade
                .on_lease_issued(lease.task_id, &lease.peer_id, lease.lease_id, lease.expires_at)
                .await;
        }
        tracing::info!(
            event = "weft.lease.issued",
            task_id = %lease.task_id,
            peer_id = %lease.peer_id,
            lease_id = %lease.lease_id,
            expires_at = %lease.expires_at,
            "lease issued"
        );

        Ok(IssuedLease {
            lease,
            task_payload: task.payload,
        })
    }

    /// Verify a lease token with the issuing key.
    pub fn verify(&self, token: &str) -> Result<LeaseClaims, LeaseTokenError> {
        self.signer.verify(token)
    }

    /// Revoke a lease: expire it now and push its task back to the queue.
    /// Idempotent on leases that have already lapsed.
    pub async fn revoke(&self, lease_id: Uuid, reason: &str) -> Result<TaskLease, LeaseError> {
        let now = Utc::now();
        let lease = match self.store.expire_lease(lease_id, now).await {
            Ok(lease) => lease,
            Err(StoreError::NotFound(_)) => return Err(LeaseError::LeaseNotFound(lease_id)),
            Err(err) => return Err(store_error(err)),
        };

        // Only count revocations that actually cut a live lease short.
        if lease.expires_at == now {
            self.counters.lock().expect("lease counters poisoned").revoked += 1;
            if let Some(facade) = &self.facade {
                facade
                    .on_lease_revoked(lease.lease_id, lease.task_id, &lease.peer_id, reason)
                    .await;
            }
            tracing::info!(
                event = "weft.lease.revoked",
                lease_id = %lease.lease_id,
                task_id = %lease.task_id,
                reason,
                "lease revoked"
            );
        }

        Ok(lease)
    }

    /// Issuance/revocation counters for the health aggregator.
    pub fn revocation_stats(&self) -> Value {
        let counters = self.counters.lock().expect("lease counters poisoned");
        let rate = if counters.issued > 0 {
            counters.revoked as f64 / counters.issued as f64 * 100.0
        } else {
            0.0
        };
        json!({
            "leases_issued": counters.issued,
            "leases_revoked": counters.revoked,
            "revocation_rate": rate,
        })
    }
}

fn store_error(err: StoreError) -> LeaseError {
    LeaseError::Issuance(err.to_string())
}

/// Capability floor check, in deficit order: CPU, memory, GPU presence, GPU
/// memory, storage.
fn match_capabilities(
    required: &RequiredResources,
    provided: &NodeCapabilities,
) -> Result<(), String> {
    if provided.cpu_cores < required.cpu_cores {
        return Err(format!(
            "Insufficient CPU cores: required {}, provided {}",
            required.cpu_cores, provided.cpu_cores
        ));
    }
    if provided.memory_mb < required.memory_mb {
        return Err(format!(
            "Insufficient memory: required {}MB, provided {}MB",
            required.memory_mb, provided.memory_mb
        ));
    }
    if required.gpu_required {
        if !provided.has_gpu() {
            return Err("GPU required but not available on node".to_string());
        }
        if provided.gpu_memory_mb < required.gpu_memory_mb {
            return Err(format!(
                "Insufficient GPU memory: required {}MB, provided {}MB",
                required.gpu_memory_mb, provided.gpu_memory_mb
            ));
        }
    }
    if provided.storage_mb < required.storage_mb {
        return Err(format!(
            "Insufficient storage: required {}MB, provided {}MB",
            required.storage_mb, provided.storage_mb
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::model::{TaskComplexity, TaskRecord};
    use weft_core::store::MemoryStore;

    fn node_caps(cpu: u32, memory: u64) -> NodeCapabilities {
        NodeCapabilities {
            cpu_cores: cpu,
            memory_mb: memory,
            gpu_count: 0,
            gpu_memory_mb: 0,
            storage_mb: 0,
            models: vec![],
        }
    }

    async fn seeded_issuer(complexity: TaskComplexity) -> (LeaseIssuer, Arc<MemoryStore>, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let task_id = Uuid::new_v4();
        store
            .insert_task(TaskRecord {
                task_id,
                status: TaskStatus::Queued,
                complexity,
                required: RequiredResources {
                    cpu_cores: 2,
                    memory_mb: 4096,
                    storage_mb: 0,
                    gpu_required: false,
                    gpu_memory_mb: 0,
                },
                payload: json!({"kind": "inference"}),
            })
            .await
            .unwrap();

        let issuer = LeaseIssuer::new(
            store.clone(),
            LeaseSigner::from_secret("weft-test-secret"),
            None,
        );
        (issuer, store, task_id)
    }

    #[tokio::test]
    async fn issue_leases_queued_task_with_complexity_band() -> anyhow::Result<()> {
        let (issuer, store, task_id) = seeded_issuer(TaskComplexity::Medium).await;

        let issued = issuer
            .issue(&LeaseRequest {
                task_id,
                peer_id: "QmPeerAbc".to_string(),
                node_capabilities: node_caps(8, 16384),
            })
            .await?;

        let ttl = issued.lease.expires_at - issued.lease.issued_at;
        assert_eq!(ttl.num_minutes(), 10);
        assert_eq!(issued.task_payload, json!({"kind": "inference"}));
        assert_eq!(
            store.get_task(task_id).await?.unwrap().status,
            TaskStatus::Leased
        );

        // Token round-trip: claims carry the lease identity and expiry.
        let claims = issuer.verify(&issued.lease.token)?;
        assert_eq!(claims.task_id, task_id);
        assert_eq!(claims.peer_id, "QmPeerAbc");
        assert_eq!(claims.exp, issued.lease.expires_at.timestamp());

        // Same task again: no longer queued.
        let err = issuer
            .issue(&LeaseRequest {
                task_id,
                peer_id: "QmPeerOther".to_string(),
                node_capabilities: node_caps(8, 16384),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LeaseError::TaskNotAvailable(_)));
        Ok(())
    }

    #[tokio::test]
    async fn complexity_scales_ttl() -> anyhow::Result<()> {
        for (complexity, minutes) in [
            (TaskComplexity::Low, 5),
            (TaskComplexity::Medium, 10),
            (TaskComplexity::High, 15),
        ] {
            let (issuer, _, task_id) = seeded_issuer(complexity).await;
            let issued = issuer
                .issue(&LeaseRequest {
                    task_id,
                    peer_id: "peer-a".to_string(),
                    node_capabilities: node_caps(8, 16384),
                })
                .await?;
            assert_eq!(
                (issued.lease.expires_at - issued.lease.issued_at).num_minutes(),
                minutes
            );
        }
        Ok(())
    }

    #[tokio::test]
    async fn capability_deficit_leaves_task_queued() -> anyhow::Result<()> {
        let (issuer, store, task_id) = seeded_issuer(TaskComplexity::Medium).await;

        let err = issuer
            .issue(&LeaseRequest {
                task_id,
                peer_id: "peer-a".to_string(),
                node_capabilities: node_caps(1, 1024),
            })
            .await
            .unwrap_err();

        match err {
            LeaseError::CapabilityMismatch {
                message,
                required,
                provided,
            } => {
                assert!(message.contains("Insufficient CPU cores"));
                assert_eq!(required.cpu_cores, 2);
                assert_eq!(provided.cpu_cores, 1);
            }
            other => panic!("expected CapabilityMismatch, got {other:?}"),
        }

        assert_eq!(
            store.get_task(task_id).await?.unwrap().status,
            TaskStatus::Queued
        );
        Ok(())
    }

    #[tokio::test]
    async fn gpu_requirement_checks_presence_then_memory() {
        let required = RequiredResources {
            cpu_cores: 1,
            memory_mb: 0,
            storage_mb: 0,
            gpu_required: true,
            gpu_memory_mb: 8192,
        };

        let no_gpu = node_caps(4, 8192);
        assert!(match_capabilities(&required, &no_gpu)
            .unwrap_err()
            .contains("GPU required"));

        let small_gpu = NodeCapabilities {
            gpu_count: 1,
            gpu_memory_mb: 4096,
            ..node_caps(4, 8192)
        };
        assert!(match_capabilities(&required, &small_gpu)
            .unwrap_err()
            .contains("Insufficient GPU memory"));
    }

    #[tokio::test]
    async fn revoke_requeues_and_counts_once() -> anyhow::Result<()> {
        let (issuer, store, task_id) = seeded_issuer(TaskComplexity::Low).await;
        let issued = issuer
            .issue(&LeaseRequest {
                task_id,
                peer_id: "peer-a".to_string(),
                node_capabilities: node_caps(8, 16384),
            })
            .await?;

        let revoked = issuer.revoke(issued.lease.lease_id, "node crashed").await?;
        assert!(revoked.expires_at <= Utc::now());
        assert_eq!(
            store.get_task(task_id).await?.unwrap().status,
            TaskStatus::Queued
        );

        // Idempotent second revoke does not double-count.
        issuer.revoke(issued.lease.lease_id, "again").await?;
        let stats = issuer.revocation_stats();
        assert_eq!(stats["leases_issued"], json!(1));
        assert_eq!(stats["leases_revoked"], json!(1));
        assert_eq!(stats["revocation_rate"], json!(100.0));

        assert!(matches!(
            issuer.revoke(Uuid::new_v4(), "missing").await,
            Err(LeaseError::LeaseNotFound(_))
        ));
        Ok(())
    }
}
