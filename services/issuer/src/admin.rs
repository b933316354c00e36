//! Admin API for requests, credentials, listeners and proxies
//!
//! Endpoints:
//! - POST   /admin/requests: open a request (quota enforced)
//! - GET    /admin/requests: list requests
//! - POST   /admin/requests/{id}/approve: claim a credential and start its listener
//! - POST   /admin/requests/{id}/reject
//! - POST   /admin/requests/{id}/revoke: reset sessions, stop listener, free credential
//! - POST   /admin/requests/{id}/relisten: restart the listener of an approved request
//! - GET    /admin/credentials: credentials without secrets
//! - GET    /admin/listeners: running listeners
//! - POST   /admin/listeners/{credential_id}/stop
//! - GET    /admin/proxies: live pool view, passwords masked
//! - GET    /admin/proxies/stats
//! - POST   /admin/proxies/import: plain-text proxy list
//! - POST   /admin/proxies/{id}/active: {"active": bool}
//! - DELETE /admin/proxies/{id}

use std::sync::Arc;
use std::time::Instant;

use account_store::{
    Credential, CredentialId, CredentialStatus, ProxyId, RequestId, RequesterId,
};
use axum::Router;
use axum::extract::{MatchedPath, Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use issuance::RequestOrchestrator;
use proxy_pool::ProxyRegistry;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ApiError;

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    orchestrator: Arc<RequestOrchestrator>,
    registry: Arc<ProxyRegistry>,
}

impl AdminState {
    pub fn new(orchestrator: Arc<RequestOrchestrator>, registry: Arc<ProxyRegistry>) -> Self {
        Self {
            orchestrator,
            registry,
        }
    }
}

/// Build the admin router with all management endpoints.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/requests", get(list_requests).post(create_request))
        .route("/admin/requests/{id}/approve", post(approve))
        .route("/admin/requests/{id}/reject", post(reject))
        .route("/admin/requests/{id}/revoke", post(revoke))
        .route("/admin/requests/{id}/relisten", post(relisten))
        .route("/admin/credentials", get(list_credentials))
        .route("/admin/listeners", get(list_listeners))
        .route("/admin/listeners/{credential_id}/stop", post(stop_listener))
        .route("/admin/proxies", get(list_proxies))
        .route("/admin/proxies/stats", get(proxy_stats))
        .route("/admin/proxies/import", post(import_proxies))
        .route("/admin/proxies/{id}/active", post(set_proxy_active))
        .route("/admin/proxies/{id}", delete(remove_proxy))
        .route_layer(middleware::from_fn(track_latency))
        .with_state(state)
}

fn json(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn to_value<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

async fn track_latency(request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| "unmatched".into());
    let started = Instant::now();
    let response = next.run(request).await;
    crate::metrics::record_admin_request(
        &route,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}

#[derive(Deserialize)]
struct CreateRequestBody {
    requester_id: RequesterId,
    #[serde(default)]
    risk_score: Option<f64>,
}

/// POST /admin/requests: open a Pending request.
async fn create_request(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<CreateRequestBody>,
) -> Result<Response, ApiError> {
    let request = state
        .orchestrator
        .create_request(body.requester_id, body.risk_score)
        .await?;
    Ok(json(StatusCode::CREATED, to_value(&request)))
}

/// GET /admin/requests: every request, newest last.
async fn list_requests(State(state): State<AdminState>) -> Result<Response, ApiError> {
    let requests = state.orchestrator.store().requests().await?;
    Ok(json(
        StatusCode::OK,
        serde_json::json!({ "requests": to_value(&requests) }),
    ))
}

/// POST /admin/requests/{id}/approve
///
/// 503 with "no free credentials" leaves the request Pending.
async fn approve(
    State(state): State<AdminState>,
    Path(id): Path<RequestId>,
) -> Result<Response, ApiError> {
    let approval = state.orchestrator.approve(id).await?;
    info!(request_id = id, credential_id = approval.credential_id, "approved via admin API");
    Ok(json(StatusCode::OK, to_value(&approval)))
}

async fn reject(
    State(state): State<AdminState>,
    Path(id): Path<RequestId>,
) -> Result<Response, ApiError> {
    let request = state.orchestrator.reject(id).await?;
    Ok(json(StatusCode::OK, to_value(&request)))
}

async fn revoke(
    State(state): State<AdminState>,
    Path(id): Path<RequestId>,
) -> Result<Response, ApiError> {
    let request = state.orchestrator.revoke(id).await?;
    Ok(json(StatusCode::OK, to_value(&request)))
}

async fn relisten(
    State(state): State<AdminState>,
    Path(id): Path<RequestId>,
) -> Result<Response, ApiError> {
    let approval = state.orchestrator.relisten(id).await?;
    Ok(json(StatusCode::OK, to_value(&approval)))
}

/// Credential as shown to operators. Never carries the API hash or session reference.
#[derive(Serialize)]
struct CredentialView {
    id: CredentialId,
    status: CredentialStatus,
    phone: Option<String>,
    platform_user_id: Option<i64>,
    display_name: Option<String>,
    is_premium: bool,
    proxy_id: Option<ProxyId>,
    has_session: bool,
    error_text: Option<String>,
}

impl From<&Credential> for CredentialView {
    fn from(c: &Credential) -> Self {
        Self {
            id: c.id,
            status: c.status,
            phone: c.phone.clone(),
            platform_user_id: c.platform_user_id,
            display_name: c.display_name.clone(),
            is_premium: c.is_premium,
            proxy_id: c.proxy_id,
            has_session: c.session_ref.as_deref().is_some_and(|s| !s.is_empty()),
            error_text: c.error_text.clone(),
        }
    }
}

/// GET /admin/credentials
async fn list_credentials(State(state): State<AdminState>) -> Result<Response, ApiError> {
    let credentials = state.orchestrator.store().credentials().await?;
    let views: Vec<CredentialView> = credentials.iter().map(CredentialView::from).collect();
    Ok(json(
        StatusCode::OK,
        serde_json::json!({ "credentials": to_value(&views) }),
    ))
}

/// GET /admin/listeners
async fn list_listeners(State(state): State<AdminState>) -> Response {
    let listeners = state.orchestrator.manager().active().await;
    json(
        StatusCode::OK,
        serde_json::json!({ "listeners": to_value(&listeners) }),
    )
}

/// POST /admin/listeners/{credential_id}/stop: 404 when nothing was running.
async fn stop_listener(
    State(state): State<AdminState>,
    Path(credential_id): Path<CredentialId>,
) -> Result<Response, ApiError> {
    if !state.orchestrator.stop_listener(credential_id).await {
        return Err(ApiError::NotFound(format!(
            "no listener running for credential {credential_id}"
        )));
    }
    Ok(json(
        StatusCode::OK,
        serde_json::json!({ "credential_id": credential_id, "status": "stopped" }),
    ))
}

/// GET /admin/proxies: the in-memory pool view, passwords masked.
///
/// Health and counters are live values, not the persisted record fields.
async fn list_proxies(State(state): State<AdminState>) -> Response {
    let proxies = state.orchestrator.pool().snapshot().await;
    json(
        StatusCode::OK,
        serde_json::json!({ "proxies": to_value(&proxies) }),
    )
}

async fn proxy_stats(State(state): State<AdminState>) -> Response {
    let stats = state.orchestrator.pool().stats().await;
    json(StatusCode::OK, to_value(&stats))
}

/// POST /admin/proxies/import: one proxy per line; bad lines are reported, not fatal.
async fn import_proxies(
    State(state): State<AdminState>,
    body: String,
) -> Result<Response, ApiError> {
    let report = state.registry.import(&body).await?;
    Ok(json(StatusCode::OK, to_value(&report)))
}

#[derive(Deserialize)]
struct ActiveBody {
    active: bool,
}

async fn set_proxy_active(
    State(state): State<AdminState>,
    Path(id): Path<ProxyId>,
    axum::Json(body): axum::Json<ActiveBody>,
) -> Result<Response, ApiError> {
    let record = state.registry.set_active(id, body.active).await?;
    Ok(json(
        StatusCode::OK,
        serde_json::json!({
            "id": record.id,
            "proxy": record.endpoint.masked(),
            "is_active": record.is_active,
        }),
    ))
}

/// DELETE /admin/proxies/{id}: unbinds every credential using it.
async fn remove_proxy(
    State(state): State<AdminState>,
    Path(id): Path<ProxyId>,
) -> Result<Response, ApiError> {
    let record = state.registry.remove(id).await?;
    Ok(json(
        StatusCode::OK,
        serde_json::json!({ "id": record.id, "status": "removed" }),
    ))
}
