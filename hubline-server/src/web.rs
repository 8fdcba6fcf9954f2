//! HTTP surface: the hub WebSocket endpoint and a small REST API.
//!
//! The WebSocket endpoint (`/hub`) classifies the caller from the bearer
//! credential and hands the socket to [`crate::hub`]. The REST API exposes
//! presence and group management; write endpoints require a bearer token.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use hubline_sdk::protocol::{ErrorBody, ErrorCode, Group, GroupMessage, Identity, OnlineUser};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::auth::{self, Claims};
use crate::config::ServerConfig;
use crate::group::ChatError;
use crate::server::SharedState;

/// Hard cap on one history page.
const MAX_HISTORY_PAGE: usize = 500;

pub fn router(state: Arc<SharedState>) -> Router {
    let cors = cors_layer(&state.config);
    Router::new()
        .route("/hub", get(ws_upgrade))
        .route("/api/v1/health", get(api_health))
        .route("/api/v1/presence", get(api_presence))
        .route("/api/v1/groups", get(api_my_groups).post(api_create_group))
        .route("/api/v1/groups/{id}/join", post(api_join_group))
        .route("/api/v1/groups/{id}/messages", get(api_group_messages))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);
    if config.cors_origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer
            .allow_origin(AllowOrigin::list(
                config.cors_origins.iter().filter_map(|o| o.parse().ok()),
            ))
            .allow_credentials(true)
    }
}

// ── WebSocket handler ──────────────────────────────────────────────────

#[derive(Deserialize)]
struct HubQuery {
    access_token: Option<String>,
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<HubQuery>,
    headers: HeaderMap,
    State(state): State<Arc<SharedState>>,
) -> impl IntoResponse {
    let claims = auth::resolve(query.access_token.as_deref(), bearer(&headers));
    ws.on_upgrade(move |socket| crate::hub::handle_socket(socket, state, claims))
}

// ── REST errors ────────────────────────────────────────────────────────

struct ApiError(StatusCode, ErrorBody);

impl ApiError {
    fn unauthorized() -> Self {
        Self(
            StatusCode::UNAUTHORIZED,
            ErrorBody::new(ErrorCode::Unauthorized, "bearer token required"),
        )
    }
}

impl From<ChatError> for ApiError {
    fn from(e: ChatError) -> Self {
        let body = ErrorBody::from(e);
        let status = match body.code {
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::Invalid => StatusCode::BAD_REQUEST,
            ErrorCode::Transient => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        };
        Self(status, body)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(self.1)).into_response()
    }
}

fn require_caller(headers: &HeaderMap) -> Result<Claims, ApiError> {
    auth::resolve(None, bearer(headers)).ok_or_else(ApiError::unauthorized)
}

// ── REST types ─────────────────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    connections: usize,
    online_users: usize,
    visitors: usize,
    groups: usize,
    uptime_secs: u64,
}

#[derive(Serialize)]
struct PresenceResponse {
    online: Vec<OnlineUser>,
    visitor_count: usize,
}

#[derive(Deserialize)]
struct CreateGroupRequest {
    name: Option<String>,
    #[serde(default)]
    members: Vec<Identity>,
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

// ── REST handlers ──────────────────────────────────────────────────────

async fn api_health(State(state): State<Arc<SharedState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        connections: state.registry.connection_count(),
        online_users: state.registry.online_count(),
        visitors: state.registry.visitor_count(),
        groups: state.coordinator.group_count(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

async fn api_presence(State(state): State<Arc<SharedState>>) -> Json<PresenceResponse> {
    let (online, visitor_count) = state.presence.roster();
    Json(PresenceResponse {
        online,
        visitor_count,
    })
}

async fn api_my_groups(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<Group>>, ApiError> {
    let caller = require_caller(&headers)?;
    Ok(Json(state.coordinator.groups_for_user(&caller.identity())?))
}

async fn api_create_group(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
    Json(req): Json<CreateGroupRequest>,
) -> Result<(StatusCode, Json<Group>), ApiError> {
    let caller = require_caller(&headers)?;
    let mut members: std::collections::BTreeSet<Identity> = req.members.into_iter().collect();
    members.insert(caller.identity());

    let (group, _) = state
        .coordinator
        .create_group(req.name.as_deref(), members)
        .await?;
    Ok((StatusCode::CREATED, Json(group)))
}

async fn api_join_group(
    State(state): State<Arc<SharedState>>,
    Path(group_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Group>, ApiError> {
    let caller = require_caller(&headers)?;
    state
        .coordinator
        .join_group(&group_id, &caller.identity())
        .await?;
    state
        .coordinator
        .group(&group_id)
        .await
        .map(Json)
        .ok_or_else(|| ChatError::GroupNotFound(group_id).into())
}

async fn api_group_messages(
    State(state): State<Arc<SharedState>>,
    Path(group_id): Path<String>,
    Query(query): Query<HistoryQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<GroupMessage>>, ApiError> {
    let caller = require_caller(&headers)?;
    let limit = query
        .limit
        .unwrap_or(state.config.history_limit)
        .clamp(1, MAX_HISTORY_PAGE);
    let messages = state
        .coordinator
        .history(&group_id, &caller.identity(), limit)
        .await?;
    Ok(Json(messages))
}
