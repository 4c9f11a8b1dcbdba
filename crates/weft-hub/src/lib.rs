//! Hub control service.
//!
//! Owns the IP pool, the peer registry, provisioning, and lease issuance,
//! and exposes them over the control HTTP API (`/wireguard/*`,
//! `/tasks/lease`). The hub binary merges in the monitoring routes and runs
//! the partition/flush background loops.

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::{net::TcpListener, sync::watch, task::JoinHandle};

pub mod config;
pub mod lease;
pub mod lifecycle;
pub mod monitoring;
pub mod peers;
pub mod pool;
pub mod provision;
pub mod reaper;
pub mod stats;
pub mod wg;

use lease::{LeaseError, LeaseIssuer, LeaseRequest};
use monitoring::WgMonitor;
use peers::{PeerRegistry, PeerRegistryError};
use pool::IpPool;
use provision::{ProvisionError, ProvisioningRequest, ProvisioningService};
use weft_buffer::PartitionDetector;
use wg::WgControl;

#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<IpPool>,
    pub registry: Arc<PeerRegistry>,
    pub provisioning: Arc<ProvisioningService>,
    pub leases: Arc<LeaseIssuer>,
    pub control: Arc<dyn WgControl>,
    pub monitor: Arc<WgMonitor>,
    /// Present when the hub runs with partition detection; gates new leases.
    pub detector: Option<Arc<PartitionDetector>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/wireguard/provision", post(provision_peer))
        .route("/wireguard/peers", get(list_peers))
        .route("/wireguard/peers/:node_id", delete(deprovision_peer))
        .route("/wireguard/pool/stats", get(pool_stats))
        .route("/wireguard/health", get(wireguard_health))
        .route("/tasks/lease", post(issue_lease))
        .with_state(state)
}

async fn provision_peer(
    State(state): State<AppState>,
    Json(request): Json<ProvisioningRequest>,
) -> ApiResult<Json<Value>> {
    let config = state.provisioning.provision(&request).await?;
    Ok(Json(json!({
        "status": "success",
        "config": config,
    })))
}

async fn list_peers(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.registry.list().await)
}

async fn deprovision_peer(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.provisioning.deprovision(&node_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn pool_stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.pool.stats()))
}

#[derive(Debug, Deserialize)]
struct HealthParams {
    #[serde(default)]
    include_peers: bool,
}

async fn wireguard_health(
    State(state): State<AppState>,
    Query(params): Query<HealthParams>,
) -> ApiResult<Json<Value>> {
    // The live interface is the source of truth; if `wg` cannot report on
    // it, the WireGuard stack is absent or down.
    match state.monitor.collect(params.include_peers).await {
        Ok(report) => Ok(Json(json!(report))),
        Err(err) => {
            tracing::warn!(
                event = "weft.hub.wireguard_unavailable",
                error = %err,
                "wg show failed"
            );
            Err(ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "error": "wireguard stack unavailable" }),
            ))
        }
    }
}

async fn issue_lease(
    State(state): State<AppState>,
    Json(request): Json<LeaseRequest>,
) -> ApiResult<impl IntoResponse> {
    if let Some(detector) = &state.detector {
        if let Err(err) = detector.accept_new_task(&request.task_id.to_string()) {
            return Err(ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "error": err.to_string() }),
            ));
        }
    }

    let issued = state.leases.issue(&request).await?;
    Ok((StatusCode::CREATED, Json(json!(issued))))
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: Value,
}

impl ApiError {
    fn new(status: StatusCode, body: Value) -> Self {
        Self { status, body }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<ProvisionError> for ApiError {
    fn from(err: ProvisionError) -> Self {
        match &err {
            ProvisionError::Validation { errors } => ApiError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                json!({ "error": "validation failed", "details": errors }),
            ),
            ProvisionError::DuplicatePeer { existing, .. } => ApiError::new(
                StatusCode::CONFLICT,
                json!({ "error": err.to_string(), "existing_configuration": existing }),
            ),
            ProvisionError::PoolExhausted(_) => {
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, json!({ "error": err.to_string() }))
            }
            ProvisionError::NotFound(_) => {
                ApiError::new(StatusCode::NOT_FOUND, json!({ "error": err.to_string() }))
            }
            ProvisionError::Hub(PeerRegistryError::ReloadFailed { .. }) => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": err.to_string() }),
            ),
            _ => internal(&err),
        }
    }
}

impl From<LeaseError> for ApiError {
    fn from(err: LeaseError) -> Self {
        match &err {
            LeaseError::TaskNotAvailable(_) => {
                ApiError::new(StatusCode::CONFLICT, json!({ "error": err.to_string() }))
            }
            LeaseError::CapabilityMismatch {
                message,
                required,
                provided,
            } => ApiError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                json!({
                    "error": message,
                    "required_capabilities": required,
                    "provided_capabilities": provided,
                }),
            ),
            LeaseError::LeaseNotFound(_) => {
                ApiError::new(StatusCode::NOT_FOUND, json!({ "error": err.to_string() }))
            }
            _ => internal(&err),
        }
    }
}

fn internal<E: std::fmt::Display>(err: &E) -> ApiError {
    tracing::error!(
        event = "weft.hub.internal_error",
        error = %err,
        "hub internal error"
    );
    ApiError::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({ "error": "internal error" }),
    )
}

/// Running HTTP server with graceful shutdown, usable with any composed
/// router.
#[derive(Debug)]
pub struct HubServer {
    pub addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<anyhow::Result<()>>,
}

impl HubServer {
    pub async fn start(app: Router, bind: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("bind hub to {bind}"))?;
        let addr = listener.local_addr().context("hub local_addr")?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut server_shutdown = shutdown_rx.clone();
        let join = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async move {
                    while !*server_shutdown.borrow() {
                        if server_shutdown.changed().await.is_err() {
                            break;
                        }
                    }
                })
                .await
                .context("serve hub")?;
            Ok(())
        });

        Ok(Self {
            addr,
            shutdown_tx,
            join,
        })
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.join.await.context("join hub server task")??;
        Ok(())
    }
}
