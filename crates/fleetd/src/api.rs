//! HTTP API for the control plane
//!
//! Probes and Prometheus metrics at the root, the operator surface under
//! `/api/v1`.

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use fleet_lib::{
    Alert, Allocation, AllocationId, AllocationReceipt, AllocationRequest, Cluster,
    ClusterHealthReport, ClusterSummary, DecommissionTicket, DrainReport, FleetError, GpuUsage,
    HealthStatus, Node, NodeId, NodeState, NodeSummary, NodeUsage, ProvisionRequest,
    TelemetrySample,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;

/// Alerts returned when no limit is given
const DEFAULT_ALERT_LIMIT: usize = 50;

/// Shared application state
pub struct AppState {
    pub cluster: Cluster,
    ready: AtomicBool,
}

impl AppState {
    pub fn new(cluster: Cluster) -> Self {
        Self {
            cluster,
            ready: AtomicBool::new(false),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Engine error rendered as `{ "error": <kind>, "message": <text> }`
#[derive(Debug)]
pub struct ApiError(FleetError);

impl From<FleetError> for ApiError {
    fn from(err: FleetError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            FleetError::NotFound { .. } | FleetError::UnknownNode(_) => StatusCode::NOT_FOUND,
            FleetError::InvalidTransition { .. }
            | FleetError::NodeBusy { .. }
            | FleetError::DuplicateHostname(_)
            | FleetError::InsufficientCapacity { .. } => StatusCode::CONFLICT,
            FleetError::InvalidRequest(_) | FleetError::ConfirmationRequired(_) => {
                StatusCode::BAD_REQUEST
            }
        };

        let body = Json(json!({
            "error": self.0.kind(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn parse_node_id(raw: &str) -> ApiResult<NodeId> {
    raw.parse()
        .map_err(|_| FleetError::InvalidRequest(format!("invalid node id '{}'", raw)).into())
}

fn parse_allocation_id(raw: &str) -> ApiResult<AllocationId> {
    raw.parse()
        .map_err(|_| FleetError::InvalidRequest(format!("invalid allocation id '{}'", raw)).into())
}

/// Liveness: 200 unless the cluster is critical
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let report = state.cluster.health_report();

    let status_code = match report.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Critical => StatusCode::SERVICE_UNAVAILABLE,
    };

    (
        status_code,
        Json(json!({
            "status": report.status,
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let ready = state.is_ready();
    let status_code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(json!({ "ready": ready })))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %err, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

async fn cluster_health(State(state): State<Arc<AppState>>) -> Json<ClusterHealthReport> {
    Json(state.cluster.health_report())
}

async fn cluster_summary(State(state): State<Arc<AppState>>) -> Json<ClusterSummary> {
    Json(state.cluster.telemetry().cluster_summary())
}

#[derive(Debug, Deserialize)]
pub struct NodesQuery {
    pub state: Option<String>,
}

async fn list_nodes(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NodesQuery>,
) -> ApiResult<Json<Vec<NodeUsage>>> {
    let filter = query
        .state
        .as_deref()
        .map(str::parse::<NodeState>)
        .transpose()
        .map_err(FleetError::InvalidRequest)?;

    let nodes = state
        .cluster
        .registry()
        .snapshot()
        .into_iter()
        .filter(|usage| filter.map_or(true, |s| usage.node.state == s))
        .collect();
    Ok(Json(nodes))
}

/// Node with its GPU reservations and leases
#[derive(Debug, Serialize, Deserialize)]
pub struct NodeDetail {
    pub node: Node,
    pub gpus: GpuUsage,
    pub allocations: Vec<Allocation>,
    pub unhealthy: bool,
}

async fn get_node(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<NodeDetail>> {
    let id = parse_node_id(&id)?;
    let cluster = &state.cluster;

    Ok(Json(NodeDetail {
        node: cluster.registry().get(id)?,
        gpus: cluster.registry().gpu_usage(id)?,
        allocations: cluster.allocator().allocations_on(id),
        unhealthy: cluster.monitor().is_unhealthy(id),
    }))
}

async fn node_summary(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<NodeSummary>> {
    let id = parse_node_id(&id)?;
    Ok(Json(state.cluster.telemetry().summary(id)?))
}

async fn provision_node(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ProvisionRequest>,
) -> ApiResult<(StatusCode, Json<Node>)> {
    let id = state.cluster.lifecycle().request_provision(request).await?;
    let node = state.cluster.registry().get(id)?;
    info!(node_id = %id, hostname = %node.hostname, "Provisioning accepted");
    Ok((StatusCode::ACCEPTED, Json(node)))
}

async fn drain_node(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<DrainReport>> {
    let id = parse_node_id(&id)?;
    Ok(Json(state.cluster.lifecycle().drain(id)?))
}

async fn maintenance_node(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Node>> {
    let id = parse_node_id(&id)?;
    Ok(Json(state.cluster.lifecycle().set_maintenance(id)?))
}

async fn ready_node(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Node>> {
    let id = parse_node_id(&id)?;
    Ok(Json(state.cluster.lifecycle().return_to_service(id)?))
}

async fn offline_node(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Node>> {
    let id = parse_node_id(&id)?;
    Ok(Json(state.cluster.lifecycle().mark_offline(id)?))
}

async fn request_decommission(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<DecommissionTicket>> {
    let id = parse_node_id(&id)?;
    Ok(Json(state.cluster.lifecycle().request_decommission(id)?))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfirmDecommission {
    pub ticket: Uuid,
    #[serde(default)]
    pub force: bool,
}

async fn confirm_decommission(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ConfirmDecommission>,
) -> ApiResult<Json<Node>> {
    let id = parse_node_id(&id)?;
    Ok(Json(state.cluster.lifecycle().confirm_decommission(
        id,
        body.ticket,
        body.force,
    )?))
}

async fn ingest_telemetry(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(sample): Json<TelemetrySample>,
) -> ApiResult<StatusCode> {
    let id = parse_node_id(&id)?;
    state.cluster.ingest(id, sample)?;
    Ok(StatusCode::ACCEPTED)
}

async fn list_allocations(State(state): State<Arc<AppState>>) -> Json<Vec<Allocation>> {
    Json(state.cluster.allocator().list())
}

async fn allocate(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AllocationRequest>,
) -> ApiResult<(StatusCode, Json<AllocationReceipt>)> {
    let receipt = state.cluster.allocator().allocate(&request)?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

async fn release_allocation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Allocation>> {
    let id = parse_allocation_id(&id)?;
    Ok(Json(state.cluster.allocator().release(id)?))
}

#[derive(Debug, Deserialize)]
pub struct AlertsQuery {
    pub limit: Option<usize>,
}

async fn list_alerts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AlertsQuery>,
) -> Json<Vec<Alert>> {
    let limit = query.limit.unwrap_or(DEFAULT_ALERT_LIMIT);
    Json(state.cluster.recent_alerts(limit))
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/cluster/health", get(cluster_health))
        .route("/api/v1/cluster/summary", get(cluster_summary))
        .route("/api/v1/nodes", get(list_nodes).post(provision_node))
        .route("/api/v1/nodes/:id", get(get_node))
        .route("/api/v1/nodes/:id/summary", get(node_summary))
        .route("/api/v1/nodes/:id/telemetry", post(ingest_telemetry))
        .route("/api/v1/nodes/:id/drain", post(drain_node))
        .route("/api/v1/nodes/:id/maintenance", post(maintenance_node))
        .route("/api/v1/nodes/:id/ready", post(ready_node))
        .route("/api/v1/nodes/:id/offline", post(offline_node))
        .route("/api/v1/nodes/:id/decommission", post(request_decommission))
        .route(
            "/api/v1/nodes/:id/decommission/confirm",
            post(confirm_decommission),
        )
        .route("/api/v1/allocations", get(list_allocations).post(allocate))
        .route("/api/v1/allocations/:id", delete(release_allocation))
        .route("/api/v1/alerts", get(list_alerts))
        .with_state(state)
}

/// Bind the API listener. Failing here keeps the daemon from reporting ready.
pub async fn bind(port: u16) -> anyhow::Result<TcpListener> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind API port {}", port))?;
    info!(addr = %addr, "API listener bound");
    Ok(listener)
}

/// Serve the API on an already bound listener
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);
    axum::serve(listener, app)
        .await
        .context("API server terminated")?;

    Ok(())
}
