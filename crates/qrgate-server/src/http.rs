//! HTTP request handlers
//!
//! Session creation for waiting clients, the completion contract used by the
//! companion app, and on-demand QR images.

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use qrgate_auth::{render_png, IssuerError, Transition};
use qrgate_core::protocol::{
    CompleteRequest, CreateSessionRequest, CreateSessionResponse, StatusResponse, TokenRequest,
};
use qrgate_core::{LoginVariant, SessionStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::state::AppState;

/// Error type returned by API handlers
type ApiError = (StatusCode, String);

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Waiting client
        .route("/auth/qr/generate", post(generate_handler))
        .route("/auth/qr/refresh", post(refresh_handler))
        .route("/auth/qr/cancel", post(cancel_handler))
        .route("/auth/qr/status", get(status_handler))
        .route("/auth/qr/image", get(image_handler))
        // Companion app
        .route("/auth/qr/scan", post(scan_handler))
        .route("/auth/qr/complete", post(complete_handler))
        // Realtime channel
        .route("/ws/qr-auth", get(crate::websocket::qr_auth_ws_handler))
        // Server info
        .route("/api/info", get(server_info_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Map issuer failures to responses without exposing internal detail
fn issuer_error(err: IssuerError) -> ApiError {
    debug!("Issuer rejected request: {}", err);
    match err {
        IssuerError::NotFound => (StatusCode::NOT_FOUND, "Session not found".to_string()),
        IssuerError::TerminalState(_) => (StatusCode::GONE, "Session is no longer active".to_string()),
        IssuerError::AlreadyCompleted => (StatusCode::CONFLICT, "Session already completed".to_string()),
        IssuerError::InvalidCredential => (StatusCode::BAD_REQUEST, "Invalid credential".to_string()),
        IssuerError::Resource(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "Too many pending sessions".to_string(),
        ),
    }
}

// ============================================================================
// Waiting Client Handlers
// ============================================================================

/// Create a new QR session
async fn generate_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>, ApiError> {
    if request.client_session_id.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "clientSessionId is required".to_string()));
    }

    let grant = state
        .issuer
        .create_session(&request.client_session_id, &request.device_metadata)
        .await
        .map_err(issuer_error)?;
    Ok(Json(grant.into()))
}

/// Replace a live session with a fresh code
async fn refresh_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TokenRequest>,
) -> Result<Json<CreateSessionResponse>, ApiError> {
    let grant = state
        .issuer
        .refresh(&request.token)
        .await
        .map_err(issuer_error)?;
    Ok(Json(grant.into()))
}

/// Response for completion-style calls
#[derive(Debug, Serialize, Deserialize)]
pub struct TransitionResponse {
    /// Status after the call
    pub status: SessionStatus,
    /// Whether this call changed the status
    pub changed: bool,
}

async fn transition_response(
    state: &AppState,
    token: &str,
    transition: Transition,
) -> Result<Json<TransitionResponse>, ApiError> {
    let snapshot = state.issuer.status(token).await.map_err(issuer_error)?;
    Ok(Json(TransitionResponse {
        status: snapshot.status,
        changed: transition == Transition::Applied,
    }))
}

/// Cancel a session
async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TokenRequest>,
) -> Result<Json<TransitionResponse>, ApiError> {
    let transition = state
        .issuer
        .cancel(&request.token)
        .await
        .map_err(issuer_error)?;
    transition_response(&state, &request.token, transition).await
}

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    token: String,
}

/// Poll a session's status
async fn status_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TokenQuery>,
) -> Result<Json<StatusResponse>, ApiError> {
    let snapshot = state
        .issuer
        .status(&query.token)
        .await
        .map_err(issuer_error)?;
    Ok(Json(StatusResponse::from(&snapshot)))
}

/// Query parameters for QR image rendering
#[derive(Debug, Deserialize)]
pub struct QrQuery {
    token: String,
    /// QR code size in pixels (server default when absent)
    #[serde(default)]
    size: Option<u32>,
}

/// Render the QR code of a live session as PNG
async fn image_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<QrQuery>,
) -> Result<Response, ApiError> {
    let uri = state
        .issuer
        .login_uri(&query.token)
        .await
        .map_err(issuer_error)?;

    let size = query.size.unwrap_or(state.config.qr_size).clamp(64, 1024);
    let png = render_png(&uri, size).map_err(|e| {
        warn!("QR rendering failed: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, "Rendering failed".to_string())
    })?;

    Ok((StatusCode::OK, [(header::CONTENT_TYPE, "image/png")], png).into_response())
}

// ============================================================================
// Companion App Handlers
// ============================================================================

/// Record a scan from the companion app
async fn scan_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TokenRequest>,
) -> Result<Json<TransitionResponse>, ApiError> {
    let transition = state
        .issuer
        .mark_scanned(&request.token)
        .await
        .map_err(issuer_error)?;
    transition_response(&state, &request.token, transition).await
}

/// Submit the credential for a scanned session
async fn complete_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CompleteRequest>,
) -> Result<Json<TransitionResponse>, ApiError> {
    state
        .issuer
        .complete_authentication(&request.token, request.credential)
        .await
        .map_err(issuer_error)?;
    transition_response(&state, &request.token, Transition::Applied).await
}

// ============================================================================
// Server Info
// ============================================================================

/// Server information response
#[derive(Debug, Serialize)]
pub struct ServerInfo {
    /// Server version
    pub version: String,
    /// Sessions not yet terminal
    pub live_sessions: usize,
    /// Session lifetime in seconds
    pub session_ttl: u64,
    /// Login flow configured for hosts
    pub login_variant: LoginVariant,
}

/// Get server information
async fn server_info_handler(State(state): State<Arc<AppState>>) -> Json<ServerInfo> {
    Json(ServerInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        live_sessions: state.issuer.live_sessions().await,
        session_ttl: state.config.session_ttl_secs,
        login_variant: state.config.login_variant,
    })
}
