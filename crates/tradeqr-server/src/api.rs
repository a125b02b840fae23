//! HTTP API endpoints

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, warn};
use tradeqr_core::types::UserId;
use tradeqr_core::{
    CreateSessionRequest, DomainParams, ErrorCategory, SessionError, SessionManager, SessionState,
    SessionView,
};
use uuid::Uuid;

use crate::identity::{extract_bearer_token, IdentityProvider};
use crate::metrics::ServiceMetrics;

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub identity: Arc<dyn IdentityProvider>,
    pub metrics: Arc<ServiceMetrics>,
    pub trust_forwarded_for: bool,
}

/// Create API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/sessions", post(create_session))
        .route("/v1/sessions/join/:code", post(join_session))
        .route("/v1/sessions/:id", get(get_session).delete(cancel_session))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// ============================================================================
// Wire types
// ============================================================================

/// Session as rendered to one caller.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionBody {
    pub id: Uuid,
    /// Only the creator sees the code, and only while it can still be redeemed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pairing_code: Option<String>,
    pub creator_id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub joiner_id: Option<UserId>,
    #[serde(flatten)]
    pub params: DomainParams,
    pub state: SessionState,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<SessionView> for SessionBody {
    fn from(view: SessionView) -> Self {
        let session = view.session;
        let pairing_code = (view.is_creator && session.state == SessionState::Waiting)
            .then_some(session.pairing_code);

        Self {
            id: session.id,
            pairing_code,
            creator_id: session.creator_id,
            joiner_id: session.joiner_id,
            params: session.params,
            state: session.state,
            expires_at: session.expires_at,
            created_at: session.created_at,
            updated_at: session.updated_at,
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /v1/sessions - Create a pairing session
async fn create_session(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let start = Instant::now();

    let creator = match authenticate(&state, &headers).await {
        Ok(user) => user,
        Err(response) => return response,
    };

    let request = if body.iter().all(u8::is_ascii_whitespace) {
        CreateSessionRequest::default()
    } else {
        match serde_json::from_slice::<CreateSessionRequest>(&body) {
            Ok(request) => request,
            Err(e) => {
                debug!("Rejected create body: {}", e);
                state.metrics.error_counts.inc();
                return error_body(StatusCode::BAD_REQUEST, "Invalid JSON body");
            }
        }
    };

    let origin = client_origin(&headers, connect_info.map(|ci| ci.0), state.trust_forwarded_for);

    let response = match state.sessions.create(&creator, &origin, request).await {
        Ok(view) => {
            state.metrics.sessions_created.inc();
            let body = json!({
                "success": true,
                "isCreator": true,
                "session": SessionBody::from(view),
            });
            (StatusCode::CREATED, Json(body)).into_response()
        }
        Err(e) => error_response(&state, e),
    };

    observe(&state, start);
    response
}

/// POST /v1/sessions/join/{code} - Redeem a pairing code
async fn join_session(
    State(state): State<AppState>,
    Path(code): Path<String>,
    headers: HeaderMap,
) -> Response {
    let start = Instant::now();

    let joiner = match authenticate(&state, &headers).await {
        Ok(user) => user,
        Err(response) => return response,
    };

    let response = match state.sessions.join(&joiner, &code).await {
        Ok(view) => {
            state.metrics.sessions_joined.inc();
            let body = json!({
                "success": true,
                "isCreator": false,
                "session": SessionBody::from(view),
            });
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => error_response(&state, e),
    };

    observe(&state, start);
    response
}

/// GET /v1/sessions/{id} - Read a session as one of its participants
async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let start = Instant::now();

    let caller = match authenticate(&state, &headers).await {
        Ok(user) => user,
        Err(response) => return response,
    };

    let id = match parse_session_id(&state, &id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    let response = match state.sessions.get(id, &caller).await {
        Ok(view) => {
            let is_creator = view.is_creator;
            let body = json!({
                "session": SessionBody::from(view),
                "isCreator": is_creator,
            });
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => error_response(&state, e),
    };

    observe(&state, start);
    response
}

/// DELETE /v1/sessions/{id} - Cancel a session (creator only)
async fn cancel_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let start = Instant::now();

    let caller = match authenticate(&state, &headers).await {
        Ok(user) => user,
        Err(response) => return response,
    };

    let id = match parse_session_id(&state, &id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    let response = match state.sessions.cancel(id, &caller).await {
        Ok(cancellation) => {
            if cancellation.applied {
                state.metrics.sessions_cancelled.inc();
            }
            let body = json!({
                "success": true,
                "message": "Session cancelled successfully",
            });
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => error_response(&state, e),
    };

    observe(&state, start);
    response
}

async fn health_handler() -> Response {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
    .into_response()
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics.export_prometheus() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<UserId, Response> {
    let token = extract_bearer_token(headers.get(header::AUTHORIZATION));
    let user = match token {
        Some(token) => state.identity.resolve(token).await,
        None => None,
    };

    user.ok_or_else(|| {
        state.metrics.error_counts.inc();
        error_body(StatusCode::UNAUTHORIZED, "Unauthorized")
    })
}

fn parse_session_id(state: &AppState, raw: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(raw).map_err(|_| {
        state.metrics.error_counts.inc();
        error_body(StatusCode::BAD_REQUEST, "Invalid session ID")
    })
}

/// Network origin used for rate limiting.
///
/// Forwarding headers are only honoured when the deployment says a proxy
/// sets them; otherwise any client could pick its own origin.
pub fn client_origin(headers: &HeaderMap, peer: Option<SocketAddr>, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        let real_ip = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());

        if let Some(origin) = forwarded.or(real_ip) {
            return origin.to_string();
        }
    }

    peer.map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .to_string()
}

pub fn status_for(error: &SessionError) -> StatusCode {
    match error {
        SessionError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        SessionError::Validation(_) | SessionError::SelfJoinForbidden => StatusCode::BAD_REQUEST,
        SessionError::AlreadyCompleted => StatusCode::BAD_REQUEST,
        SessionError::CodeNotFound | SessionError::SessionNotFound => StatusCode::NOT_FOUND,
        SessionError::SessionExpired => StatusCode::GONE,
        SessionError::SessionNotJoinable | SessionError::SessionFull => StatusCode::CONFLICT,
        SessionError::NotAParticipant | SessionError::OnlyCreatorMayCancel => StatusCode::FORBIDDEN,
        SessionError::Generation(_) | SessionError::Store(_) | SessionError::RateLimiter(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_response(state: &AppState, err: SessionError) -> Response {
    state.metrics.error_counts.inc();
    let status = status_for(&err);

    if !err.is_public() {
        error!(error = %err, "Request failed");
        return error_body(status, "internal error");
    }
    match err.category() {
        ErrorCategory::StateConflict => warn!(error = %err, "Rejected session transition"),
        _ => debug!(error = %err, "Rejected request"),
    }

    let mut response = error_body(status, &err.to_string());
    if let SessionError::RateLimitExceeded { retry_after_secs } = err {
        state.metrics.rate_limit_hits.inc();
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
    }
    response
}

fn error_body(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn observe(state: &AppState, start: Instant) {
    state
        .metrics
        .request_latency
        .observe(start.elapsed().as_secs_f64());
}
