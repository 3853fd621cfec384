//! HTTP surface.
//!
//! Maps the API operations onto the store, dispatcher, response state
//! machine, and tmux pass-throughs. Handlers keep the original wire
//! contract: structured `{"error": ...}` bodies with a status per error
//! class, and bare JSON payloads on success.

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::config::Config;
use crate::push::Dispatcher;
use crate::respond::{respond, RespondError};
use crate::store::{NotificationFields, Store, Subscription};
use crate::tmux::{self, Tmux, TmuxError};

/// Default page size for the notification listing.
const DEFAULT_LIST_LIMIT: usize = 50;

/// Shared handler context, constructed once at startup. Tests build
/// their own with isolated stores and a mock push service.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub dispatcher: Arc<Dispatcher>,
    pub tmux: Arc<Tmux>,
    /// Base64url `applicationServerKey` served to subscribing browsers.
    pub vapid_public_key: String,
}

type ApiResponse = (StatusCode, Json<Value>);

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/subscribe", post(subscribe))
        .route("/api/unsubscribe", post(unsubscribe))
        .route("/api/notify", post(notify))
        .route("/api/respond", post(respond_to_notification))
        .route("/api/test-notify", post(test_notify))
        .route("/api/notifications", get(list_notifications))
        .route("/api/vapid-public-key", get(vapid_public_key))
        .route("/api/directories", get(directories))
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route("/api/sessions/kill", post(kill_session))
        .route("/health", get(health))
        .with_state(state)
}

fn error(status: StatusCode, message: impl Into<String>) -> ApiResponse {
    (status, Json(json!({ "error": message.into() })))
}

fn ok(body: Value) -> ApiResponse {
    (StatusCode::OK, Json(body))
}

fn str_field<'a>(body: &'a Value, key: &str) -> &'a str {
    body.get(key).and_then(Value::as_str).unwrap_or_default()
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "pane-push" }))
}

async fn vapid_public_key(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "publicKey": state.vapid_public_key }))
}

async fn subscribe(State(state): State<AppState>, Json(body): Json<Value>) -> ApiResponse {
    if str_field(&body, "endpoint").is_empty() {
        return error(StatusCode::BAD_REQUEST, "Missing endpoint");
    }
    let sub: Subscription = match serde_json::from_value(body) {
        Ok(sub) => sub,
        Err(_) => return error(StatusCode::BAD_REQUEST, "Malformed subscription"),
    };

    match state.store.upsert_subscription(sub) {
        Ok(()) => ok(json!({ "ok": true })),
        Err(e) => {
            log::error!("[Server] Subscribe failed: {e:#}");
            error(StatusCode::INTERNAL_SERVER_ERROR, "storage failure")
        }
    }
}

async fn unsubscribe(State(state): State<AppState>, Json(body): Json<Value>) -> ApiResponse {
    let endpoint = str_field(&body, "endpoint");
    match state.store.remove_subscription(endpoint) {
        Ok(removed) => ok(json!({ "ok": true, "removed": removed })),
        Err(e) => {
            log::error!("[Server] Unsubscribe failed: {e:#}");
            error(StatusCode::INTERNAL_SERVER_ERROR, "storage failure")
        }
    }
}

/// Event ingestion. Requires the shared secret; records the
/// notification, then fans it out to every subscriber.
async fn notify(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> ApiResponse {
    let presented = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if presented != state.config.api_key {
        return error(StatusCode::FORBIDDEN, "Invalid API key");
    }

    let title = body.get("title").and_then(Value::as_str).unwrap_or("Claude Code");
    let message = str_field(&body, "message");
    let event_type = str_field(&body, "event_type");
    let tmux_pane = str_field(&body, "tmux_pane");
    let session_id = str_field(&body, "session_id");

    let id = match state.store.add_notification(NotificationFields {
        title: title.to_string(),
        message: message.to_string(),
        event_type: event_type.to_string(),
        tmux_pane: Some(tmux_pane.to_string()),
        session_id: Some(session_id.to_string()),
    }) {
        Ok(id) => id,
        Err(e) => {
            log::error!("[Server] Failed to record notification: {e:#}");
            return error(StatusCode::INTERNAL_SERVER_ERROR, "storage failure");
        }
    };

    // A notification is actionable when a response can be routed back
    // to a pane.
    let actionable = event_type == "Notification" && !tmux_pane.is_empty();
    let sent = state
        .dispatcher
        .dispatch(
            title,
            message,
            json!({
                "event_type": event_type,
                "notification_id": id,
                "actionable": actionable,
            }),
        )
        .await;

    ok(json!({ "ok": true, "sent_to": sent, "notification_id": id }))
}

async fn respond_to_notification(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResponse {
    let id = str_field(&body, "notification_id");
    let action = str_field(&body, "action");
    let text = body.get("text").and_then(Value::as_str);

    match respond(&state.store, state.tmux.as_ref(), id, action, text).await {
        Ok(outcome) => ok(json!({
            "ok": true,
            "action": outcome.action.as_str(),
            "tmux_pane": outcome.tmux_pane,
        })),
        Err(e) => {
            let status = respond_error_status(&e);
            if status.is_server_error() {
                log::error!("[Server] Respond failed: {e}");
            }
            error(status, e.to_string())
        }
    }
}

fn respond_error_status(err: &RespondError) -> StatusCode {
    match err {
        RespondError::InvalidAction | RespondError::NoTarget | RespondError::MissingText => {
            StatusCode::BAD_REQUEST
        }
        RespondError::NotFound => StatusCode::NOT_FOUND,
        RespondError::AlreadyResponded => StatusCode::CONFLICT,
        RespondError::Tool(_) | RespondError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Unauthenticated test push, wired to the UI's "send a test
/// notification" button.
async fn test_notify(State(state): State<AppState>) -> ApiResponse {
    let title = "Test Notification";
    let message = "If you see this, push notifications are working!";

    if let Err(e) = state.store.add_notification(NotificationFields {
        title: title.to_string(),
        message: message.to_string(),
        event_type: "test".to_string(),
        ..Default::default()
    }) {
        log::error!("[Server] Failed to record test notification: {e:#}");
        return error(StatusCode::INTERNAL_SERVER_ERROR, "storage failure");
    }

    let sent = state
        .dispatcher
        .dispatch(title, message, json!({ "event_type": "test" }))
        .await;
    ok(json!({ "ok": true, "sent_to": sent }))
}

#[derive(Deserialize)]
struct ListQuery {
    limit: Option<usize>,
}

async fn list_notifications(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResponse {
    match state.store.notifications(query.limit.unwrap_or(DEFAULT_LIST_LIMIT)) {
        Ok(list) => ok(json!(list)),
        Err(e) => {
            log::error!("[Server] Failed to read history: {e:#}");
            error(StatusCode::INTERNAL_SERVER_ERROR, "storage failure")
        }
    }
}

async fn directories(State(state): State<AppState>) -> Json<Value> {
    let dirs: Vec<Value> = state
        .config
        .allowed_session_dirs()
        .iter()
        .map(|path| {
            json!({
                "name": path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
                "path": path.to_string_lossy(),
            })
        })
        .collect();
    Json(json!(dirs))
}

async fn list_sessions(State(state): State<AppState>) -> ApiResponse {
    match state.tmux.list_sessions().await {
        Ok(sessions) => ok(json!(sessions)),
        Err(e) => tool_error(e),
    }
}

/// Create a detached session in an allow-listed directory. The
/// allow-list check runs before anything is spawned.
async fn create_session(State(state): State<AppState>, Json(body): Json<Value>) -> ApiResponse {
    let path = str_field(&body, "path");
    if path.is_empty() {
        return error(StatusCode::BAD_REQUEST, "Missing path");
    }

    let target = std::path::PathBuf::from(path);
    if !state.config.allowed_session_dirs().contains(&target) {
        return error(StatusCode::FORBIDDEN, "Path not in configured directories");
    }
    if !target.is_dir() {
        return error(StatusCode::BAD_REQUEST, "Path does not exist or is not a directory");
    }

    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if !tmux::is_valid_session_name(&name) {
        return error(
            StatusCode::BAD_REQUEST,
            "Directory name contains invalid characters for a session name",
        );
    }

    match state
        .tmux
        .new_session(&name, path, &state.config.session_command)
        .await
    {
        Ok(()) => ok(json!({ "ok": true, "name": name, "path": path })),
        Err(e) => tool_error(e),
    }
}

async fn kill_session(State(state): State<AppState>, Json(body): Json<Value>) -> ApiResponse {
    let name = str_field(&body, "name");
    if !tmux::is_valid_session_name(name) {
        return error(StatusCode::BAD_REQUEST, "Invalid session name");
    }

    match state.tmux.kill_session(name).await {
        Ok(()) => ok(json!({ "ok": true, "killed": name })),
        Err(e) => tool_error(e),
    }
}

fn tool_error(e: TmuxError) -> ApiResponse {
    log::error!("[Server] tmux error: {e}");
    error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}
