//! `/swarm/*` dashboard routes.

use crate::facade::MonitoringFacade;
use crate::health::HealthAggregator;
use crate::thresholds::AlertThresholds;
use crate::timeline::{Timeline, TimelineQuery};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;

#[derive(Clone)]
pub struct MonitorState {
    pub health: Arc<HealthAggregator>,
    pub timeline: Arc<Timeline>,
    pub thresholds: Arc<AlertThresholds>,
    pub facade: Arc<MonitoringFacade>,
}

pub fn router(state: MonitorState) -> Router {
    Router::new()
        .route("/swarm/health", get(swarm_health))
        .route("/swarm/timeline", get(swarm_timeline))
        .route(
            "/swarm/alerts/thresholds",
            get(get_thresholds).put(put_thresholds),
        )
        .route("/swarm/monitoring/status", get(monitoring_status))
        .with_state(state)
}

async fn swarm_health(State(state): State<MonitorState>) -> Json<Value> {
    Json(state.health.collect_snapshot().await)
}

async fn swarm_timeline(
    State(state): State<MonitorState>,
    Query(query): Query<TimelineQuery>,
) -> Json<Value> {
    let limit = query.limit.unwrap_or(100);
    let offset = query.offset.unwrap_or(0);
    let (events, total) = state.timeline.query(&query);
    Json(json!({
        "events": events,
        "total": total,
        "limit": limit,
        "offset": offset,
    }))
}

async fn get_thresholds(State(state): State<MonitorState>) -> Json<Value> {
    Json(json!(state.thresholds.get()))
}

async fn put_thresholds(
    State(state): State<MonitorState>,
    Json(updates): Json<Map<String, Value>>,
) -> impl IntoResponse {
    match state.thresholds.update(&updates) {
        Ok(updated) => (StatusCode::OK, Json(json!(updated))),
        Err(err) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": err.to_string() })),
        ),
    }
}

async fn monitoring_status(State(state): State<MonitorState>) -> Json<Value> {
    Json(state.facade.status())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditLogger, AuditStorage};
    use crate::health::StatsProvider;
    use async_trait::async_trait;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    struct NullAudit;

    #[async_trait]
    impl AuditStorage for NullAudit {
        async fn store(&self, _event: &crate::audit::AuditEvent) -> anyhow::Result<()> {
            Ok(())
        }

        async fn query(
            &self,
            _query: &crate::audit::AuditQuery,
        ) -> anyhow::Result<Vec<crate::audit::AuditEvent>> {
            Ok(Vec::new())
        }
    }

    struct FixedStats(Value);

    #[async_trait]
    impl StatsProvider for FixedStats {
        async fn stats(&self) -> anyhow::Result<Value> {
            Ok(self.0.clone())
        }
    }

    fn state() -> MonitorState {
        let thresholds = Arc::new(AlertThresholds::new());
        let health = Arc::new(HealthAggregator::new(thresholds.clone()));
        let timeline = Arc::new(Timeline::default());
        let audit = Arc::new(AuditLogger::new(Arc::new(NullAudit)));
        let facade = Arc::new(MonitoringFacade::new(
            timeline.clone(),
            audit,
            health.clone(),
        ));
        MonitorState {
            health,
            timeline,
            thresholds,
            facade,
        }
    }

    async fn get_json(router: &Router, uri: &str) -> (StatusCode, Value) {
        let response = router
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri(uri)
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn threshold_roundtrip_over_http() {
        let state = state();
        let app = router(state);

        let (status, body) = get_json(&app, "/swarm/alerts/thresholds").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["buffer_utilization"], json!(80.0));

        let response = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("PUT")
                    .uri("/swarm/alerts/thresholds")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(r#"{"buffer_utilization": 95.0}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let (_, body) = get_json(&app, "/swarm/alerts/thresholds").await;
        assert_eq!(body["buffer_utilization"], json!(95.0));
    }

    #[tokio::test]
    async fn out_of_range_threshold_is_422() {
        let app = router(state());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("PUT")
                    .uri("/swarm/alerts/thresholds")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(r#"{"revocation_rate": 200}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn timeline_endpoint_paginates() {
        let state = state();
        for i in 0..5 {
            state.timeline.record(
                crate::timeline::TimelineEventType::TaskCreated,
                Some(format!("t{i}")),
                None,
                None,
                None,
            );
        }
        let app = router(state);

        let (status, body) = get_json(&app, "/swarm/timeline?limit=2&offset=1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], json!(5));
        assert_eq!(body["limit"], json!(2));
        assert_eq!(body["offset"], json!(1));
        assert_eq!(body["events"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn health_and_status_endpoints_respond() {
        let state = state();
        state
            .health
            .register("ip_pool", Arc::new(FixedStats(json!({"util_pct": 5}))));
        let app = router(state);

        let (status, body) = get_json(&app, "/swarm/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("healthy"));
        assert_eq!(body["ip_pool"]["util_pct"], json!(5));

        let (status, body) = get_json(&app, "/swarm/monitoring/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("operational"));
        assert_eq!(body["registered_health_subsystems"], json!(["ip_pool"]));
    }
}
