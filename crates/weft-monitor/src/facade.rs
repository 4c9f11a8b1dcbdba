//! Monitoring facade: the single place the control plane reports lifecycle
//! and security events to.
//!
//! Every hook is fire-and-forget. A broken sink is logged and swallowed so
//! observability can never fail the operation that produced the event.

use crate::audit::{AuditEvent, AuditEventKind, AuditLogger, AuditResult};
use crate::health::HealthAggregator;
use crate::timeline::{Timeline, TimelineEventType};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::net::Ipv4Addr;
use std::sync::Arc;
use uuid::Uuid;

pub struct MonitoringFacade {
    timeline: Arc<Timeline>,
    audit: Arc<AuditLogger>,
    health: Arc<HealthAggregator>,
}

impl MonitoringFacade {
    pub fn new(
        timeline: Arc<Timeline>,
        audit: Arc<AuditLogger>,
        health: Arc<HealthAggregator>,
    ) -> Self {
        Self {
            timeline,
            audit,
            health,
        }
    }

    pub fn timeline(&self) -> &Arc<Timeline> {
        &self.timeline
    }

    pub fn audit(&self) -> &Arc<AuditLogger> {
        &self.audit
    }

    pub fn health(&self) -> &Arc<HealthAggregator> {
        &self.health
    }

    pub fn on_task_created(&self, task_id: Uuid) {
        self.timeline.record(
            TimelineEventType::TaskCreated,
            Some(task_id.to_string()),
            None,
            None,
            None,
        );
        self.timeline.record(
            TimelineEventType::TaskQueued,
            Some(task_id.to_string()),
            None,
            None,
            None,
        );
    }

    pub fn on_task_started(&self, task_id: Uuid, peer_id: &str) {
        self.timeline.record(
            TimelineEventType::TaskStarted,
            Some(task_id.to_string()),
            Some(peer_id.to_string()),
            None,
            None,
        );
    }

    pub fn on_task_completed(&self, task_id: Uuid, peer_id: &str) {
        self.timeline.record(
            TimelineEventType::TaskCompleted,
            Some(task_id.to_string()),
            Some(peer_id.to_string()),
            None,
            None,
        );
    }

    pub fn on_task_failed(&self, task_id: Uuid, peer_id: Option<&str>, reason: &str) {
        let mut meta = Map::new();
        meta.insert("reason".to_string(), json!(reason));
        self.timeline.record(
            TimelineEventType::TaskFailed,
            Some(task_id.to_string()),
            peer_id.map(str::to_string),
            None,
            Some(meta),
        );
    }

    /// A lease lapsed without completion; the task went back to the queue.
    pub fn on_lease_expired(&self, lease_id: Uuid, task_id: Uuid, peer_id: &str) {
        let mut meta = Map::new();
        meta.insert("lease_id".to_string(), json!(lease_id));
        self.timeline.record(
            TimelineEventType::LeaseExpired,
            Some(task_id.to_string()),
            Some(peer_id.to_string()),
            None,
            Some(meta),
        );
        self.timeline.record(
            TimelineEventType::TaskExpired,
            Some(task_id.to_string()),
            Some(peer_id.to_string()),
            None,
            None,
        );
        self.timeline.record(
            TimelineEventType::TaskRequeued,
            Some(task_id.to_string()),
            Some(peer_id.to_string()),
            None,
            None,
        );
    }

    pub async fn on_lease_issued(
        &self,
        task_id: Uuid,
        peer_id: &str,
        lease_id: Uuid,
        expires_at: DateTime<Utc>,
    ) {
        let mut meta = Map::new();
        meta.insert("lease_id".to_string(), json!(lease_id));
        meta.insert("expires_at".to_string(), json!(expires_at));
        self.timeline.record(
            TimelineEventType::LeaseIssued,
            Some(task_id.to_string()),
            Some(peer_id.to_string()),
            None,
            Some(meta.clone()),
        );
        self.timeline.record(
            TimelineEventType::TaskLeased,
            Some(task_id.to_string()),
            Some(peer_id.to_string()),
            None,
            None,
        );

        self.audit_event(
            AuditEventKind::TokenIssued,
            peer_id,
            "lease_issuance",
            Some(task_id.to_string()),
            AuditResult::Success,
            "lease issued",
            meta,
        )
        .await;
    }

    pub async fn on_lease_denied(&self, task_id: Uuid, peer_id: &str, reason: &str) {
        self.audit_event(
            AuditEventKind::AuthorizationFailure,
            peer_id,
            "lease_issuance",
            Some(task_id.to_string()),
            AuditResult::Denied,
            reason,
            Map::new(),
        )
        .await;
    }

    pub async fn on_lease_revoked(
        &self,
        lease_id: Uuid,
        task_id: Uuid,
        peer_id: &str,
        reason: &str,
    ) {
        let mut meta = Map::new();
        meta.insert("lease_id".to_string(), json!(lease_id));
        meta.insert("reason".to_string(), json!(reason));
        self.timeline.record(
            TimelineEventType::LeaseRevoked,
            Some(task_id.to_string()),
            Some(peer_id.to_string()),
            None,
            Some(meta.clone()),
        );
        self.timeline.record(
            TimelineEventType::TaskRequeued,
            Some(task_id.to_string()),
            Some(peer_id.to_string()),
            None,
            None,
        );

        self.audit_event(
            AuditEventKind::TokenRevoked,
            peer_id,
            "lease_revocation",
            Some(task_id.to_string()),
            AuditResult::Success,
            reason,
            meta,
        )
        .await;
    }

    pub async fn on_peer_provisioned(&self, node_id: &str, assigned_ip: Ipv4Addr) {
        let mut meta = Map::new();
        meta.insert("assigned_ip".to_string(), json!(assigned_ip));
        self.audit_event(
            AuditEventKind::AuthorizationSuccess,
            node_id,
            "peer_provision",
            None,
            AuditResult::Success,
            "peer provisioned",
            meta,
        )
        .await;
    }

    pub async fn on_provision_denied(&self, node_id: &str, reason: &str) {
        self.audit_event(
            AuditEventKind::AuthorizationFailure,
            node_id,
            "peer_provision",
            None,
            AuditResult::Denied,
            reason,
            Map::new(),
        )
        .await;
    }

    pub async fn on_peer_deprovisioned(&self, node_id: &str) {
        self.audit_event(
            AuditEventKind::AuthorizationSuccess,
            node_id,
            "peer_deprovision",
            None,
            AuditResult::Success,
            "peer deprovisioned",
            Map::new(),
        )
        .await;
    }

    pub fn on_node_crashed(&self, peer_id: &str) {
        self.timeline.record(
            TimelineEventType::NodeCrashed,
            None,
            Some(peer_id.to_string()),
            None,
            None,
        );
    }

    /// Facade liveness for `/swarm/monitoring/status`.
    pub fn status(&self) -> Value {
        json!({
            "status": "operational",
            "registered_health_subsystems": self.health.registered(),
            "timeline_events": self.timeline.count(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn audit_event(
        &self,
        kind: AuditEventKind,
        peer_id: &str,
        action: &str,
        resource: Option<String>,
        result: AuditResult,
        reason: &str,
        metadata: Map<String, Value>,
    ) {
        let event = match AuditEvent::new(kind, peer_id, action, resource, result, reason, metadata)
        {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(
                    event = "weft.monitor.audit_event_invalid",
                    error = %err,
                    "dropped invalid audit event"
                );
                return;
            }
        };

        if let Err(err) = self.audit.log(event).await {
            tracing::warn!(
                event = "weft.monitor.audit_sink_failed",
                error = %err,
                "audit sink failed; event dropped"
            );
        }
    }
}
