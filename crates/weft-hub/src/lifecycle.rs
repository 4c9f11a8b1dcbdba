//! Task lifecycle orchestration.
//!
//! Composes the pieces a dispatch-and-complete cycle touches: the partition
//! gate for new work, capability validation against the node's token, lease
//! issuance, and result delivery that falls back to the durable buffer
//! whenever upstream cannot take the result directly.

use crate::lease::{IssuedLease, LeaseError, LeaseIssuer, LeaseRequest};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;
use weft_buffer::{BufferError, PartitionDetector, PartitionError, ResultBuffer, ResultEnvelope, ResultSink};
use weft_core::capability::{CapabilityError, CapabilityValidator};
use weft_core::model::{
    CapabilityToken, NodeUsage, RequiredResources, TaskComplexity, TaskRecord, TaskRequirements,
    TaskStatus,
};
use weft_core::store::{Store, StoreError};
use weft_monitor::MonitoringFacade;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Partitioned(#[from] PartitionError),
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error(transparent)]
    Lease(#[from] LeaseError),
    #[error("task {0} not found")]
    TaskNotFound(Uuid),
    #[error("lease token rejected: {0}")]
    Token(String),
    #[error("result for task {task_id} not delivered or buffered: {reason}")]
    Delivery { task_id: Uuid, reason: String },
    #[error("store error: {0}")]
    Store(String),
}

impl From<StoreError> for LifecycleError {
    fn from(err: StoreError) -> Self {
        LifecycleError::Store(err.to_string())
    }
}

/// Dispatch request: the lease plus the node's claims for validation.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub lease: LeaseRequest,
    /// Fine-grained requirements checked against the capability token when
    /// both are present.
    pub requirements: Option<TaskRequirements>,
    pub capability_token: Option<CapabilityToken>,
    pub usage: NodeUsage,
}

/// A completed task's result on its way upstream.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task_id: Uuid,
    pub agent_id: String,
    pub lease_token: String,
    pub result: Value,
    pub metadata: Option<Value>,
}

pub struct TaskLifecycle {
    store: Arc<dyn Store>,
    issuer: Arc<LeaseIssuer>,
    validator: CapabilityValidator,
    detector: Arc<PartitionDetector>,
    buffer: Arc<ResultBuffer>,
    sink: Arc<dyn ResultSink>,
    facade: Option<Arc<MonitoringFacade>>,
}

impl TaskLifecycle {
    pub fn new(
        store: Arc<dyn Store>,
        issuer: Arc<LeaseIssuer>,
        detector: Arc<PartitionDetector>,
        buffer: Arc<ResultBuffer>,
        sink: Arc<dyn ResultSink>,
        facade: Option<Arc<MonitoringFacade>>,
    ) -> Self {
        Self {
            store,
            issuer,
            validator: CapabilityValidator::new(),
            detector,
            buffer,
            sink,
            facade,
        }
    }

    /// Create and queue a new task.
    pub async fn create_task(
        &self,
        complexity: TaskComplexity,
        required: RequiredResources,
        payload: Value,
    ) -> Result<TaskRecord, LifecycleError> {
        let task = TaskRecord {
            task_id: Uuid::new_v4(),
            status: TaskStatus::Queued,
            complexity,
            required,
            payload,
        };
        self.store.insert_task(task.clone()).await?;

        if let Some(facade) = &self.facade {
            facade.on_task_created(task.task_id);
        }
        tracing::info!(
            event = "weft.lifecycle.task_created",
            task_id = %task.task_id,
            "task created and queued"
        );
        Ok(task)
    }

    /// Dispatch a task: partition gate, capability validation, lease.
    pub async fn dispatch(&self, request: &DispatchRequest) -> Result<IssuedLease, LifecycleError> {
        let task_key = request.lease.task_id.to_string();
        self.detector.accept_new_task(&task_key)?;

        if let (Some(requirements), Some(token)) =
            (&request.requirements, &request.capability_token)
        {
            if let Err(err) =
                self.validator
                    .validate_and_raise(requirements, token, &request.usage)
            {
                if let Some(facade) = &self.facade {
                    facade
                        .on_lease_denied(request.lease.task_id, &request.lease.peer_id, &err.to_string())
                        .await;
                }
                return Err(err.into());
            }
        }

        let issued = self.issuer.issue(&request.lease).await?;

        self.detector.register_task_start(&task_key);
        if let Some(facade) = &self.facade {
            facade.on_task_started(issued.lease.task_id, &issued.lease.peer_id);
        }
        Ok(issued)
    }

    /// Accept a completed task's result.
    ///
    /// The lease token must verify and name the task. Delivery goes straight
    /// upstream when the detector reports normal operation; while degraded
    /// (or when the direct send fails) the result lands in the durable
    /// buffer for the flush paths to drain.
    pub async fn complete(&self, result: TaskResult) -> Result<(), LifecycleError> {
        let claims = self
            .issuer
            .verify(&result.lease_token)
            .map_err(|err| LifecycleError::Token(err.to_string()))?;
        if claims.task_id != result.task_id {
            return Err(LifecycleError::Token(format!(
                "token is for task {}, not {}",
                claims.task_id, result.task_id
            )));
        }

        let task_key = result.task_id.to_string();
        if !self.detector.can_complete_task(&task_key) {
            return Err(PartitionError::Degraded.into());
        }

        let task = self
            .store
            .get_task(result.task_id)
            .await?
            .ok_or(LifecycleError::TaskNotFound(result.task_id))?;

        self.deliver_or_buffer(&result).await?;

        self.store
            .set_task_status(task.task_id, TaskStatus::Completed)
            .await?;
        self.detector.register_task_complete(&task_key);

        if let Some(facade) = &self.facade {
            facade.on_task_completed(result.task_id, &result.agent_id);
        }
        tracing::info!(
            event = "weft.lifecycle.task_completed",
            task_id = %result.task_id,
            agent_id = %result.agent_id,
            "task completed"
        );
        Ok(())
    }

    /// Record a task failure.
    pub async fn fail(
        &self,
        task_id: Uuid,
        peer_id: Option<&str>,
        reason: &str,
    ) -> Result<(), LifecycleError> {
        self.store
            .set_task_status(task_id, TaskStatus::Failed)
            .await?;
        self.detector.register_task_complete(&task_id.to_string());

        if let Some(facade) = &self.facade {
            facade.on_task_failed(task_id, peer_id, reason);
        }
        tracing::warn!(
            event = "weft.lifecycle.task_failed",
            task_id = %task_id,
            reason,
            "task failed"
        );
        Ok(())
    }

    async fn deliver_or_buffer(&self, result: &TaskResult) -> Result<(), LifecycleError> {
        let envelope = ResultEnvelope {
            task_id: result.task_id.to_string(),
            agent_id: result.agent_id.clone(),
            lease_token: result.lease_token.clone(),
            result: result.result.clone(),
            metadata: result.metadata.clone(),
        };

        if !self.detector.is_degraded() {
            match self.sink.deliver(&envelope).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(
                        event = "weft.lifecycle.direct_delivery_failed",
                        task_id = %result.task_id,
                        error = %err,
                        "direct delivery failed; buffering result"
                    );
                }
            }
        }

        self.buffer
            .enqueue(
                &envelope.task_id,
                &envelope.agent_id,
                &envelope.lease_token,
                envelope.result.clone(),
                envelope.metadata.clone(),
            )
            .await
            .map(|_| ())
            .map_err(|err| match err {
                BufferError::Full { .. } | BufferError::DuplicateTask(_) => {
                    LifecycleError::Delivery {
                        task_id: result.task_id,
                        reason: err.to_string(),
                    }
                }
                BufferError::Backend(err) => LifecycleError::Delivery {
                    task_id: result.task_id,
                    reason: err.to_string(),
                },
            })
    }

}
