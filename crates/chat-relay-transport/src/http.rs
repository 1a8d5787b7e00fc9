//! HTTP routes over a [`SessionManager`].

use std::any::Any;

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chat_relay_core::SessionId;
use chat_relay_session::{InitOutcome, SessionManager};
use tower_http::{catch_panic::CatchPanicLayer, cors::CorsLayer, trace::TraceLayer};

use crate::{
    error::ApiError,
    protocol::{
        ActionResponse, DisconnectRequest, ErrorBody, HealthResponse, InitRequest, QrCodeResponse,
        SendRequest, SendResponse, SessionView, SessionsResponse, StatusResponse,
    },
};

/// Build the control-plane router.
///
/// # Example
/// ```ignore
/// let app = router(manager);
/// axum::serve(listener, app).await?;
/// ```
#[must_use]
pub fn router(manager: SessionManager) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/init", post(init))
        .route("/qr-code/{session_id}", get(qr_code))
        .route("/status/{session_id}", get(status))
        .route("/send", post(send))
        .route("/disconnect", post(disconnect))
        .route("/sessions", get(sessions))
        .fallback(not_found)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(manager)
}

fn required(value: Option<String>, name: &str) -> Result<String, ApiError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest(format!("{name} is required")))
}

fn session_id(value: Option<String>) -> Result<SessionId, ApiError> {
    Ok(SessionId::new(required(value, "sessionId")?)?)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse::ok())
}

async fn init(
    State(manager): State<SessionManager>,
    body: Result<Json<InitRequest>, JsonRejection>,
) -> Result<Json<ActionResponse>, ApiError> {
    let Json(req) = body?;
    let id = session_id(req.session_id)?;

    let message = match manager.init_session(id.clone(), req.chatbot_id).await {
        InitOutcome::Started => "Session initialization started",
        InitOutcome::AlreadyActive => "Session already active",
    };
    Ok(Json(ActionResponse::ok(id, message)))
}

async fn qr_code(
    State(manager): State<SessionManager>,
    Path(raw): Path<String>,
) -> Result<Json<QrCodeResponse>, ApiError> {
    let id = SessionId::new(raw)?;
    let qr_code = manager
        .get_qr_code(&id)
        .await
        .ok_or_else(|| ApiError::NotFound("QR code not available".to_string()))?;

    Ok(Json(QrCodeResponse {
        success: true,
        session_id: id,
        qr_code,
    }))
}

async fn status(
    State(manager): State<SessionManager>,
    Path(raw): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let id = SessionId::new(raw)?;
    let info = manager
        .get_session_info(&id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("Session not found: {id}")))?;

    Ok(Json(StatusResponse {
        success: true,
        session: info.into(),
    }))
}

async fn send(
    State(manager): State<SessionManager>,
    body: Result<Json<SendRequest>, JsonRejection>,
) -> Result<Json<SendResponse>, ApiError> {
    let Json(req) = body?;
    let (Some(raw_id), Some(to), Some(message)) = (req.session_id, req.to, req.message) else {
        return Err(ApiError::BadRequest(
            "sessionId, to and message are required".to_string(),
        ));
    };
    let id = session_id(Some(raw_id))?;
    let to = required(Some(to), "to")?;

    let sent = manager.send_message(&id, &to, &message).await?;
    Ok(Json(SendResponse {
        success: true,
        message_id: Some(sent.message_id),
        error: None,
    }))
}

async fn disconnect(
    State(manager): State<SessionManager>,
    body: Result<Json<DisconnectRequest>, JsonRejection>,
) -> Result<Json<ActionResponse>, ApiError> {
    let Json(req) = body?;
    let id = session_id(req.session_id)?;

    manager.disconnect(&id).await;
    Ok(Json(ActionResponse::ok(id, "Session disconnected")))
}

async fn sessions(State(manager): State<SessionManager>) -> Json<SessionsResponse> {
    let sessions = manager
        .get_all_sessions()
        .await
        .into_iter()
        .map(SessionView::from)
        .collect();

    Json(SessionsResponse {
        success: true,
        sessions,
    })
}

async fn not_found() -> ApiError {
    ApiError::NotFound("Not found".to_string())
}

#[allow(clippy::needless_pass_by_value)]
fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    tracing::error!(panic = detail, "Request handler panicked");

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody::new("Internal server error")),
    )
        .into_response()
}
