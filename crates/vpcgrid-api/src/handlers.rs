//! REST API handlers.
//!
//! Each handler calls into the `NetworkService` and returns JSON responses.

use std::net::Ipv4Addr;
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::warn;

use vpcgrid_lifecycle::LifecycleError;
use vpcgrid_reconcile::{CompletionToken, ResyncReport};
use vpcgrid_service::{ServiceError, Submitted};
use vpcgrid_state::{AclEntry, NatRule, NetworkOffering};

use crate::ApiState;

/// How long `?wait=true` holds a response for the resync.
const RESYNC_WAIT: Duration = Duration::from_secs(30);

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn status_for(err: &ServiceError) -> StatusCode {
    match err {
        ServiceError::NotFound { .. } => StatusCode::NOT_FOUND,
        ServiceError::InvalidCidr(_)
        | ServiceError::InvalidRequest(_)
        | ServiceError::ServiceNotSupported { .. } => StatusCode::BAD_REQUEST,
        ServiceError::DuplicateRule { .. } | ServiceError::IpInUse { .. } => StatusCode::CONFLICT,
        ServiceError::Lifecycle(LifecycleError::InvalidTransition { .. }) => StatusCode::CONFLICT,
        ServiceError::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
        ServiceError::Timeout(_) | ServiceError::Lifecycle(LifecycleError::ProvisioningTimeout { .. }) => {
            StatusCode::GATEWAY_TIMEOUT
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn service_error(err: ServiceError) -> Response {
    let status = status_for(&err);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        warn!(error = %err, "request failed");
    }
    error_response(&err.to_string(), status)
}

fn respond<T: Serialize>(result: Result<T, ServiceError>, status: StatusCode) -> Response {
    match result {
        Ok(data) => (status, ApiResponse::ok(data)).into_response(),
        Err(e) => service_error(e),
    }
}

// ── Rule submissions ───────────────────────────────────────────

#[derive(Deserialize, Default)]
pub struct WaitQuery {
    #[serde(default)]
    pub wait: bool,
}

/// A mutation and the resync that carries it to the router.
#[derive(Serialize)]
struct Submission<T: Serialize> {
    result: T,
    resync_generation: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    resync: Option<ResyncReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resync_error: Option<String>,
}

async fn submission<T: Serialize>(
    submitted: Submitted<T>,
    wait: bool,
) -> Submission<T> {
    let Submitted { value, completion } = submitted;
    let generation = completion.generation();
    let (resync, resync_error) = if wait {
        wait_for(completion).await
    } else {
        (None, None)
    };
    Submission {
        result: value,
        resync_generation: generation,
        resync,
        resync_error,
    }
}

async fn wait_for(completion: CompletionToken) -> (Option<ResyncReport>, Option<String>) {
    match completion.wait_timeout(RESYNC_WAIT).await {
        Some(Ok(report)) => (Some(report), None),
        Some(Err(e)) => (None, Some(e.to_string())),
        None => (None, Some("timed out waiting for resync".to_string())),
    }
}

async fn respond_submitted<T: Serialize>(
    result: Result<Submitted<T>, ServiceError>,
    wait: bool,
    status: StatusCode,
) -> Response {
    match result {
        Ok(submitted) => (status, ApiResponse::ok(submission(submitted, wait).await)).into_response(),
        Err(e) => service_error(e),
    }
}

// ── Health ─────────────────────────────────────────────────────

/// GET /health
pub async fn health() -> impl IntoResponse {
    ApiResponse::ok("ok")
}

// ── VPCs ───────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateVpcRequest {
    pub name: String,
    pub zone_id: String,
    pub cidr: String,
}

/// GET /api/v1/vpcs
pub async fn list_vpcs(State(state): State<ApiState>) -> Response {
    respond(state.service.list_vpcs(), StatusCode::OK)
}

/// POST /api/v1/vpcs
pub async fn create_vpc(
    State(state): State<ApiState>,
    Json(req): Json<CreateVpcRequest>,
) -> Response {
    respond(
        state.service.create_vpc(&req.name, &req.zone_id, &req.cidr),
        StatusCode::CREATED,
    )
}

/// GET /api/v1/vpcs/:id
pub async fn get_vpc(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    respond(state.service.get_vpc(&id), StatusCode::OK)
}

/// GET /api/v1/vpcs/:id/routers
pub async fn list_routers(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    respond(state.service.list_routers(&id), StatusCode::OK)
}

/// GET /api/v1/vpcs/:id/public-ips
pub async fn list_public_ips(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    respond(state.service.list_public_ips(&id), StatusCode::OK)
}

/// POST /api/v1/vpcs/:id/resync
pub async fn resync_vpc(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<WaitQuery>,
) -> Response {
    let completion = match state.service.resync(&id) {
        Ok(completion) => completion,
        Err(e) => return service_error(e),
    };
    let submitted = Submitted {
        value: id,
        completion,
    };
    (StatusCode::ACCEPTED, ApiResponse::ok(submission(submitted, query.wait).await)).into_response()
}

// ── Networks ───────────────────────────────────────────────────

/// Built-in offering a tier is created with.
#[derive(Deserialize, Default, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum OfferingName {
    #[default]
    Default,
    NoLb,
}

impl From<OfferingName> for NetworkOffering {
    fn from(name: OfferingName) -> Self {
        match name {
            OfferingName::Default => NetworkOffering::default_vpc(),
            OfferingName::NoLb => NetworkOffering::no_lb(),
        }
    }
}

#[derive(Deserialize)]
pub struct CreateNetworkRequest {
    pub name: String,
    pub gateway: String,
    pub netmask: String,
    #[serde(default)]
    pub offering: OfferingName,
}

/// GET /api/v1/vpcs/:id/networks
pub async fn list_networks(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    respond(state.service.list_networks(&id), StatusCode::OK)
}

/// POST /api/v1/vpcs/:id/networks
pub async fn create_network(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<WaitQuery>,
    Json(req): Json<CreateNetworkRequest>,
) -> Response {
    let result = state
        .service
        .create_network(&id, &req.name, &req.gateway, &req.netmask, req.offering.into())
        .await;
    respond_submitted(result, query.wait, StatusCode::CREATED).await
}

/// GET /api/v1/networks/:id
pub async fn get_network(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    respond(state.service.get_network(&id), StatusCode::OK)
}

/// DELETE /api/v1/networks/:id
pub async fn delete_network(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<WaitQuery>,
) -> Response {
    let result = state.service.delete_network(&id).map(|s| Submitted {
        value: "deleted",
        completion: s.completion,
    });
    respond_submitted(result, query.wait, StatusCode::OK).await
}

// ── VMs ────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct DeployVmRequest {
    pub name: String,
}

/// GET /api/v1/networks/:id/vms
pub async fn list_vms(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    respond(state.service.list_vms(&id), StatusCode::OK)
}

/// POST /api/v1/networks/:id/vms
pub async fn deploy_vm(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<DeployVmRequest>,
) -> Response {
    respond(state.service.deploy_vm(&id, &req.name).await, StatusCode::CREATED)
}

// ── Public IPs ─────────────────────────────────────────────────

/// POST /api/v1/networks/:id/public-ips
pub async fn acquire_public_ip(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    respond(state.service.acquire_public_ip(&id), StatusCode::CREATED)
}

/// DELETE /api/v1/public-ips/:address
pub async fn release_public_ip(
    State(state): State<ApiState>,
    Path(address): Path<Ipv4Addr>,
) -> Response {
    respond(
        state.service.release_public_ip(address).map(|()| "released"),
        StatusCode::OK,
    )
}

// ── Rules ──────────────────────────────────────────────────────

/// GET /api/v1/networks/:id/rules
pub async fn list_rules(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    respond(state.service.list_rules(&id), StatusCode::OK)
}

/// POST /api/v1/networks/:id/nat-rules
pub async fn add_nat_rule(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<WaitQuery>,
    Json(rule): Json<NatRule>,
) -> Response {
    respond_submitted(state.service.add_nat_rule(&id, rule), query.wait, StatusCode::CREATED).await
}

/// POST /api/v1/networks/:id/acl-entries
pub async fn add_acl_entry(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<WaitQuery>,
    Json(entry): Json<AclEntry>,
) -> Response {
    respond_submitted(state.service.add_acl_entry(&id, entry), query.wait, StatusCode::CREATED).await
}

/// DELETE /api/v1/rules/:id
pub async fn remove_rule(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<WaitQuery>,
) -> Response {
    respond_submitted(state.service.remove_rule(&id), query.wait, StatusCode::OK).await
}

// ── Routers ────────────────────────────────────────────────────

/// POST /api/v1/routers/:id/stop
pub async fn stop_router(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<WaitQuery>,
) -> Response {
    respond_submitted(state.service.stop_router(&id).await, query.wait, StatusCode::OK).await
}

/// POST /api/v1/routers/:id/start
pub async fn start_router(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let result = state.service.start_router(&id).await.map(|ready| Submitted {
        value: ready.router,
        completion: ready.resync,
    });
    respond_submitted(result, false, StatusCode::OK).await
}

/// DELETE /api/v1/routers/:id
pub async fn destroy_router(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<WaitQuery>,
) -> Response {
    respond_submitted(state.service.destroy_router(&id).await, query.wait, StatusCode::OK).await
}
