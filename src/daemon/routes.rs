//! REST API route handlers
//!
//! Each handler moves its engine call onto the blocking pool, since the store
//! and the collaborators do synchronous file and process I/O.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::error::{PoolError, StoreError, TunnelHubError};
use crate::service::{PeerRequest, PeerService};
use crate::store::{PeerPatch, PeerRecord};
use crate::traffic::TrafficSample;

// Error codes carried in `ApiError::code`
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
pub const PEER_NOT_FOUND: i32 = -12;
pub const PEER_ALREADY_EXISTS: i32 = -13;
pub const ADDRESS_IN_USE: i32 = -14;
pub const ROUTE_CONFLICT: i32 = -15;
pub const POOL_EXHAUSTED: i32 = -16;
pub const COLLABORATOR_FAILED: i32 = -17;

/// Shared application state for route handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<PeerService>,
    /// Where `POST /api/v1/setup` writes the hub config
    pub hub_config_path: PathBuf,
}

/// API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub code: i32,
    pub message: String,
}

impl From<TunnelHubError> for ApiError {
    fn from(err: TunnelHubError) -> Self {
        let code = match &err {
            TunnelHubError::InvalidInput { .. } => INVALID_PARAMS,
            TunnelHubError::Pool(PoolError::PoolExhausted { .. }) => POOL_EXHAUSTED,
            TunnelHubError::Pool(_) => INVALID_PARAMS,
            TunnelHubError::Store(StoreError::NotFound { .. }) => PEER_NOT_FOUND,
            TunnelHubError::Store(StoreError::DuplicateIdentifier { .. }) => PEER_ALREADY_EXISTS,
            TunnelHubError::Store(StoreError::DuplicateAddress { .. }) => ADDRESS_IN_USE,
            TunnelHubError::Route(_) => ROUTE_CONFLICT,
            TunnelHubError::Collaborator(_) => COLLABORATOR_FAILED,
            _ => INTERNAL_ERROR,
        };
        if code == INTERNAL_ERROR {
            tracing::error!("Request failed: {}", err);
        }
        ApiError {
            code,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.code {
            INVALID_PARAMS => StatusCode::BAD_REQUEST,
            PEER_NOT_FOUND => StatusCode::NOT_FOUND,
            PEER_ALREADY_EXISTS | ADDRESS_IN_USE | ROUTE_CONFLICT => StatusCode::CONFLICT,
            POOL_EXHAUSTED => StatusCode::SERVICE_UNAVAILABLE,
            COLLABORATOR_FAILED => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(self)).into_response()
    }
}

/// Build the API router with all routes
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/setup", post(handle_setup))
        .route("/api/v1/peers", get(handle_list_peers).post(handle_add_peer))
        .route(
            "/api/v1/peers/:id",
            get(handle_get_peer)
                .patch(handle_update_peer)
                .delete(handle_remove_peer),
        )
        .route("/api/v1/peers/:id/rekey", post(handle_rekey_peer))
        .route("/api/v1/endpoints/rotate", post(handle_rotate_endpoints))
        .route("/api/v1/routes", get(handle_routes))
        .route("/api/v1/traffic", get(handle_traffic))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Run an engine call on the blocking pool
async fn run_blocking<T, F>(state: &AppState, call: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&PeerService) -> crate::Result<T> + Send + 'static,
{
    let service = Arc::clone(&state.service);
    tokio::task::spawn_blocking(move || call(&service))
        .await
        .map_err(|e| ApiError {
            code: INTERNAL_ERROR,
            message: format!("Worker task failed: {}", e),
        })?
        .map_err(ApiError::from)
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// A peer record without its private key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSummary {
    pub id: u64,
    pub user_id: String,
    pub public_key: String,
    pub ip: String,
    pub allowed_ips: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub persistent_keepalive: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertise_routes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accept_routes: Option<String>,
}

impl From<PeerRecord> for PeerSummary {
    fn from(peer: PeerRecord) -> Self {
        Self {
            id: peer.id,
            user_id: peer.user_id,
            public_key: peer.public_key,
            ip: peer.ip.to_string(),
            allowed_ips: peer.allowed_ips,
            endpoint: peer.endpoint,
            persistent_keepalive: peer.persistent_keepalive,
            advertise_routes: peer.advertise_routes,
            accept_routes: peer.accept_routes,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetupResponse {
    pub path: String,
    pub config: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListPeersResponse {
    pub peers: Vec<PeerSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PeerConfigResponse {
    pub peer: PeerSummary,
    pub config: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RemovePeerResponse {
    pub removed: bool,
    pub user_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RotateEndpointsResponse {
    pub endpoint: String,
    pub updated: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RoutesResponse {
    pub routes: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TrafficResponse {
    pub samples: Vec<TrafficSample>,
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/v1/setup - Render the hub config and write it out
pub async fn handle_setup(State(state): State<AppState>) -> Result<Json<SetupResponse>, ApiError> {
    let path = state.hub_config_path.clone();
    let target = path.clone();
    let config = run_blocking(&state, move |svc| svc.write_hub_config(&target)).await?;

    Ok(Json(SetupResponse {
        path: path.display().to_string(),
        config,
    }))
}

/// GET /api/v1/peers - List provisioned peers
pub async fn handle_list_peers(
    State(state): State<AppState>,
) -> Result<Json<ListPeersResponse>, ApiError> {
    let peers = run_blocking(&state, |svc| svc.list()).await?;
    Ok(Json(ListPeersResponse {
        peers: peers.into_iter().map(PeerSummary::from).collect(),
    }))
}

/// POST /api/v1/peers - Provision a peer and return its config
pub async fn handle_add_peer(
    State(state): State<AppState>,
    Json(request): Json<PeerRequest>,
) -> Result<Json<PeerConfigResponse>, ApiError> {
    let (peer, config) = run_blocking(&state, move |svc| {
        let peer = svc.provision(request)?;
        let config = svc.render_peer(&peer.user_id)?;
        Ok((peer, config))
    })
    .await?;

    Ok(Json(PeerConfigResponse {
        peer: peer.into(),
        config,
    }))
}

/// GET /api/v1/peers/:id - Fetch a peer's config
pub async fn handle_get_peer(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PeerConfigResponse>, ApiError> {
    let (peer, config) = run_blocking(&state, move |svc| {
        let peer = svc.get(&id)?;
        let config = svc.render_peer(&id)?;
        Ok((peer, config))
    })
    .await?;

    Ok(Json(PeerConfigResponse {
        peer: peer.into(),
        config,
    }))
}

/// PATCH /api/v1/peers/:id - Update selected fields of a peer
pub async fn handle_update_peer(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<PeerPatch>,
) -> Result<Json<PeerSummary>, ApiError> {
    if patch.is_empty() {
        return Err(ApiError {
            code: INVALID_PARAMS,
            message: "No fields to update".to_string(),
        });
    }

    let peer = run_blocking(&state, move |svc| svc.update(&id, patch)).await?;
    Ok(Json(peer.into()))
}

/// DELETE /api/v1/peers/:id - Remove a peer
pub async fn handle_remove_peer(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RemovePeerResponse>, ApiError> {
    let removed = run_blocking(&state, move |svc| svc.remove(&id)).await?;
    Ok(Json(RemovePeerResponse {
        removed: true,
        user_id: removed.user_id,
    }))
}

/// POST /api/v1/peers/:id/rekey - Replace a peer's keys
pub async fn handle_rekey_peer(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PeerConfigResponse>, ApiError> {
    let (peer, config) = run_blocking(&state, move |svc| {
        let peer = svc.rekey(&id)?;
        let config = svc.render_peer(&id)?;
        Ok((peer, config))
    })
    .await?;

    Ok(Json(PeerConfigResponse {
        peer: peer.into(),
        config,
    }))
}

/// POST /api/v1/endpoints/rotate - Point all peers at the current hub endpoint
pub async fn handle_rotate_endpoints(
    State(state): State<AppState>,
) -> Result<Json<RotateEndpointsResponse>, ApiError> {
    let (endpoint, updated) = run_blocking(&state, |svc| {
        let updated = svc.rotate_endpoints()?;
        Ok((svc.hub().endpoint(), updated))
    })
    .await?;

    Ok(Json(RotateEndpointsResponse { endpoint, updated }))
}

/// GET /api/v1/routes - Routes advertised by peers
pub async fn handle_routes(State(state): State<AppState>) -> Result<Json<RoutesResponse>, ApiError> {
    let routes = run_blocking(&state, |svc| svc.find_routes()).await?;
    Ok(Json(RoutesResponse { routes }))
}

/// GET /api/v1/traffic - Live counters per peer
pub async fn handle_traffic(
    State(state): State<AppState>,
) -> Result<Json<TrafficResponse>, ApiError> {
    let samples = run_blocking(&state, |svc| svc.traffic_report()).await?;
    Ok(Json(TrafficResponse { samples }))
}
