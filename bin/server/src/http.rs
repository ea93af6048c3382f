//! JSON HTTP facade over the session manager.
//!
//! Endpoints map one to one onto the manager's operations. No pages
//! and no session cookies; callers authenticate by holding a token.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use gatepass_access::{AccessError, ClosedBy, SessionManager, SessionState, SessionStore};
use gatepass_core::SessionId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Builds the API router over a session manager.
pub fn router<S: SessionStore + 'static>(manager: Arc<SessionManager<S>>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/tokens", post(issue_token))
        .route("/api/access", post(open_access))
        .route("/api/access/{id}", get(session_status))
        .route("/api/access/{selector}/close", post(close_access))
        .with_state(manager)
}

/// Request body for issuing a token.
#[derive(Debug, Deserialize)]
struct IssueTokenRequest {
    identity: String,
}

/// Response body for a freshly issued token.
///
/// The only time the token value leaves the server.
#[derive(Debug, Serialize)]
struct IssueTokenResponse {
    token: String,
    issued_at: DateTime<Utc>,
}

/// Request body for opening access.
#[derive(Debug, Deserialize)]
struct OpenAccessRequest {
    token: String,
    duration_secs: i64,
    subject_address: String,
}

/// Response body for an opened session.
#[derive(Debug, Serialize)]
struct OpenAccessResponse {
    session_id: SessionId,
    expires_at: DateTime<Utc>,
}

/// Request body for closing access.
#[derive(Debug, Deserialize)]
struct CloseAccessRequest {
    #[serde(default = "default_requested_by")]
    requested_by: String,
}

fn default_requested_by() -> String {
    "user".to_string()
}

/// Response body for a closed session.
#[derive(Debug, Serialize)]
struct CloseAccessResponse {
    session_id: SessionId,
    state: SessionState,
    closed_at: Option<DateTime<Utc>>,
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn issue_token<S: SessionStore + 'static>(
    State(manager): State<Arc<SessionManager<S>>>,
    Json(req): Json<IssueTokenRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let token = manager.issue_token(&req.identity).await?;

    Ok((
        StatusCode::CREATED,
        Json(IssueTokenResponse {
            token: token.value,
            issued_at: token.issued_at,
        }),
    ))
}

async fn open_access<S: SessionStore + 'static>(
    State(manager): State<Arc<SessionManager<S>>>,
    Json(req): Json<OpenAccessRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let opened = manager
        .open_access(&req.token, req.duration_secs, &req.subject_address)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(OpenAccessResponse {
            session_id: opened.session_id,
            expires_at: opened.expires_at,
        }),
    ))
}

async fn close_access<S: SessionStore + 'static>(
    State(manager): State<Arc<SessionManager<S>>>,
    Path(selector): Path<String>,
    Json(req): Json<CloseAccessRequest>,
) -> Result<impl IntoResponse, ApiError> {
    // Only callers close through this endpoint; the expiry closer is
    // reserved for the scheduler.
    let closed_by = match ClosedBy::parse(&req.requested_by) {
        Some(ClosedBy::Expiry) | None => {
            return Err(ApiError::InvalidCloser {
                value: req.requested_by,
            });
        }
        Some(closer) => closer,
    };

    let closed = manager.close_access(&selector, closed_by).await?;

    Ok(Json(CloseAccessResponse {
        session_id: closed.id,
        state: closed.state,
        closed_at: closed.closed_at,
    }))
}

async fn session_status<S: SessionStore + 'static>(
    State(manager): State<Arc<SessionManager<S>>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id: SessionId = id
        .parse()
        .map_err(|_| ApiError::Access(AccessError::SessionNotFound))?;
    let status = manager.status(id).await?;

    Ok(Json(status))
}

/// API errors.
#[derive(Debug)]
enum ApiError {
    InvalidCloser { value: String },
    Access(AccessError),
}

impl From<AccessError> for ApiError {
    fn from(e: AccessError) -> Self {
        Self::Access(e)
    }
}

/// Serialized error envelope.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::InvalidCloser { value } => (
                StatusCode::BAD_REQUEST,
                format!("requested_by must be 'user' or 'admin', got '{value}'"),
            ),
            Self::Access(AccessError::Store(e)) => {
                tracing::error!(error = %e, "session store error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
            Self::Access(e) => (status_for(&e), e.to_string()),
        };

        (status, Json(ErrorBody { error: message })).into_response()
    }
}

fn status_for(e: &AccessError) -> StatusCode {
    match e {
        AccessError::TokenNotFound | AccessError::SessionNotFound => StatusCode::NOT_FOUND,
        AccessError::TokenAlreadyConsumed { .. }
        | AccessError::AlreadyOpen { .. }
        | AccessError::StateConflict { .. } => StatusCode::CONFLICT,
        AccessError::DurationOutOfRange { .. } => StatusCode::BAD_REQUEST,
        AccessError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatepass_access::{InMemorySessionStore, SessionLimits};
    use gatepass_notify::{DispatcherConfig, NotificationDispatcher, RecordingPublisher};

    fn test_manager() -> Arc<SessionManager<InMemorySessionStore>> {
        let store = Arc::new(InMemorySessionStore::new());
        let (dispatcher, _handle) = NotificationDispatcher::start(
            Arc::new(RecordingPublisher::new()),
            DispatcherConfig {
                alive_interval_secs: 0,
                ..DispatcherConfig::default()
            },
        );
        Arc::new(SessionManager::new(
            store,
            dispatcher,
            SessionLimits {
                min_duration_secs: 1,
                max_duration_secs: 86400,
            },
        ))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        serde_json::from_slice(&bytes).expect("parse body")
    }

    #[test]
    fn error_statuses_match_their_variants() {
        assert_eq!(status_for(&AccessError::TokenNotFound), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(&AccessError::SessionNotFound),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&AccessError::TokenAlreadyConsumed {
                state: SessionState::Closed
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&AccessError::AlreadyOpen {
                address: "8.8.8.8".to_string()
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&AccessError::StateConflict {
                current: SessionState::Closed
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&AccessError::DurationOutOfRange {
                requested: 10,
                min: 3600,
                max: 43200
            }),
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn issue_open_and_status_roundtrip() {
        let manager = test_manager();

        let response = issue_token(
            State(manager.clone()),
            Json(IssueTokenRequest {
                identity: "user@example.com".to_string(),
            }),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        let issued = body_json(response).await;
        let token = issued["token"].as_str().expect("token value").to_string();

        let response = open_access(
            State(manager.clone()),
            Json(OpenAccessRequest {
                token,
                duration_secs: 600,
                subject_address: "8.8.8.8".to_string(),
            }),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        let opened = body_json(response).await;
        let session_id = opened["session_id"].as_str().expect("session id").to_string();

        let response = session_status(State(manager), Path(session_id))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let status = body_json(response).await;
        assert_eq!(status["state"], "open");
        assert_eq!(status["is_expired"], false);
    }

    #[tokio::test]
    async fn unknown_token_maps_to_not_found() {
        let manager = test_manager();

        let response = open_access(
            State(manager),
            Json(OpenAccessRequest {
                token: "bogus".to_string(),
                duration_secs: 600,
                subject_address: "8.8.8.8".to_string(),
            }),
        )
        .await
        .into_response();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"], "token not found");
    }

    #[tokio::test]
    async fn close_rejects_the_expiry_closer() {
        let manager = test_manager();

        let response = close_access(
            State(manager),
            Path("anything".to_string()),
            Json(CloseAccessRequest {
                requested_by: "expiry".to_string(),
            }),
        )
        .await
        .into_response();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn double_close_maps_to_conflict() {
        let manager = test_manager();

        let token = manager.issue_token("user").await.expect("issue");
        manager
            .open_access(&token.value, 600, "8.8.8.8")
            .await
            .expect("open");

        let close = |requested_by: &str| {
            close_access(
                State(manager.clone()),
                Path(token.value.clone()),
                Json(CloseAccessRequest {
                    requested_by: requested_by.to_string(),
                }),
            )
        };

        let response = close("user").await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["state"], "closed");

        let response = close("user").await.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = body_json(response).await;
        assert!(
            body["error"]
                .as_str()
                .expect("error message")
                .contains("already closed")
        );
    }

    #[tokio::test]
    async fn malformed_session_id_maps_to_not_found() {
        let manager = test_manager();

        let response = session_status(State(manager), Path("not-an-id".to_string()))
            .await
            .into_response();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
