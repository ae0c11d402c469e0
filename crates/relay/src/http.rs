//! HTTP surface: health, device-code pairing, direct credential issue, and
//! the two websocket admission paths.

use std::sync::Arc;

use axum::{
    extract::{Path, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::TokenRole;
use crate::pairing::PollOutcome;
use crate::registry::{ConnRole, RelayState};
use crate::ws::handle_socket;

pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/pair", post(pair_begin))
        .route("/pair/verify", post(pair_verify))
        .route("/pair/:code", get(pair_poll))
        .route("/devices", post(issue_device))
        .route("/ws/workstation", get(ws_workstation))
        .route("/ws/viewer", get(ws_viewer))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn health(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    Json(state.health())
}

async fn ws_workstation(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, ConnRole::Workstation))
}

async fn ws_viewer(ws: WebSocketUpgrade, State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, ConnRole::Viewer))
}

async fn pair_begin(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    let code = state.pairing.begin();
    Json(json!({
        "code": code,
        "verification_url": format!("{}/pair/{}", state.config.base_url, code),
        "expires_in": state.pairing.ttl().as_secs(),
    }))
}

async fn pair_poll(
    State(state): State<Arc<RelayState>>,
    Path(code): Path<String>,
) -> impl IntoResponse {
    match state.pairing.poll(&code) {
        PollOutcome::Ready(credential) => {
            (StatusCode::OK, Json(json!({ "token": credential }))).into_response()
        }
        PollOutcome::Pending => {
            (StatusCode::ACCEPTED, Json(json!({ "status": "pending" }))).into_response()
        }
        PollOutcome::Gone => StatusCode::GONE.into_response(),
    }
}

#[derive(Deserialize)]
struct PairVerifyRequest {
    code: String,
}

async fn pair_verify(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    Json(request): Json<PairVerifyRequest>,
) -> impl IntoResponse {
    let Some(user) = viewer_principal(&state, &headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    if !state.pairing.is_pending(&request.code) {
        return StatusCode::GONE.into_response();
    }
    let credential = state.auth.issue_workstation(&user);
    if state.pairing.verify(&request.code, credential) {
        (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response()
    } else {
        StatusCode::GONE.into_response()
    }
}

/// Direct credential issue for an already-authenticated viewer.
async fn issue_device(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let Some(user) = viewer_principal(&state, &headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let credential = state.auth.issue_workstation(&user);
    (StatusCode::OK, Json(json!({ "token": credential }))).into_response()
}

fn viewer_principal(state: &RelayState, headers: &HeaderMap) -> Option<String> {
    let token = headers
        .get("authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")?;
    let principal = state.auth.verify(token)?;
    (principal.role == TokenRole::Viewer).then_some(principal.user)
}
