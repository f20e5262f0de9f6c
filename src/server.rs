//! HTTP surface for the polling client.
//!
//! Thin JSON handlers over the coordinator, the store, and the chat module.
//! Pipeline errors never surface here; they are observable only through
//! `/api/sync-status`.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::chat;
use crate::claude::{CompletionClient, LlmError};
use crate::config::Config;
use crate::db::IntelDb;
use crate::google_api::{self, token_store};
use crate::sync::{CredentialStore, SyncCoordinator, SyncError, SyncStatus};

pub struct AppState {
    pub config: RwLock<Config>,
    pub coordinator: Arc<SyncCoordinator>,
    pub model: Arc<dyn CompletionClient>,
    pub credentials: Arc<dyn CredentialStore>,
    pub current_user: RwLock<Option<String>>,
    pub db_path: PathBuf,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/login", get(login))
        .route("/login/google/authorized", get(login_callback))
        .route("/sync-emails", post(start_sync))
        .route("/api/force-refresh", post(start_sync))
        .route("/api/sync-status", get(sync_status))
        .route("/api/reset-database", post(reset_database))
        .route("/api/insights", get(insights))
        .route("/api/chat", post(chat_handler))
        .route("/api/preferences", post(save_preferences))
        .route("/api/disconnect", post(disconnect))
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// Resolve the acting user: login session first, then the stored token.
fn current_user(state: &AppState) -> Option<String> {
    if let Some(user) = state.current_user.read().clone() {
        return Some(user);
    }
    let peeked = token_store::peek_account_email();
    if let Some(ref email) = peeked {
        *state.current_user.write() = Some(email.clone());
    }
    peeked
}

fn open_db(state: &AppState) -> Result<IntelDb, Response> {
    IntelDb::open_at(state.db_path.clone())
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

// ============================================================================
// Auth routes
// ============================================================================

async fn login(State(state): State<Arc<AppState>>) -> Response {
    let config = state.config.read().clone();
    if config.google.client_id.is_empty() {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "google client is not configured",
        );
    }
    let redirect_uri = callback_uri(&config);
    let url = google_api::auth_url(&config.google, &redirect_uri);
    Json(json!({ "auth_url": url })).into_response()
}

#[derive(Deserialize)]
struct CallbackParams {
    code: Option<String>,
    error: Option<String>,
}

async fn login_callback(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
) -> Response {
    if let Some(denied) = params.error {
        return error_response(StatusCode::UNAUTHORIZED, format!("consent denied: {}", denied));
    }
    let Some(code) = params.code else {
        return error_response(StatusCode::BAD_REQUEST, "missing authorization code");
    };

    let config = state.config.read().clone();
    let redirect_uri = callback_uri(&config);
    match google_api::exchange_code(&config.google, &code, &redirect_uri).await {
        Ok(credential) => {
            if let Err(e) = state.credentials.save(&credential) {
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
            }
            let email = credential
                .account
                .clone()
                .unwrap_or_else(|| "authenticated".to_string());
            *state.current_user.write() = Some(email.clone());
            log::info!("User logged in: {}", email);
            Json(json!({ "email": email })).into_response()
        }
        Err(e) => error_response(StatusCode::UNAUTHORIZED, e.to_string()),
    }
}

fn callback_uri(config: &Config) -> String {
    format!("http://{}/login/google/authorized", config.listen_addr)
}

// ============================================================================
// Sync routes
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
struct SyncParams {
    window_days: Option<u32>,
    force_full: Option<bool>,
}

async fn start_sync(
    State(state): State<Arc<AppState>>,
    params: Option<Query<SyncParams>>,
) -> Response {
    let Some(user) = current_user(&state) else {
        return error_response(StatusCode::UNAUTHORIZED, "not logged in");
    };
    let credential = match state.credentials.load() {
        Ok(credential) => credential,
        Err(e) => {
            return error_response(
                StatusCode::UNAUTHORIZED,
                format!("gmail not connected: {}", e),
            )
        }
    };

    let params = params.map(|Query(p)| p).unwrap_or_default();
    let config = state.config.read().clone();
    let requested = params.window_days.unwrap_or(config.email_days_back);
    let force_full = params.force_full.unwrap_or(false);
    let last_sync = state.coordinator.status(&user).last_sync;
    let window_days = pick_window(requested, force_full, last_sync, Utc::now());

    match state.coordinator.start(&user, credential, window_days) {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "started", "window_days": window_days })),
        )
            .into_response(),
        Err(SyncError::AlreadyRunning) => {
            error_response(StatusCode::CONFLICT, "sync already in progress")
        }
        Err(SyncError::CredentialInvalid) => error_response(
            StatusCode::UNAUTHORIZED,
            "credential invalid, please reconnect gmail",
        ),
    }
}

/// Shrink the window to the days since the last sync unless a full sync was
/// forced. First syncs always use the requested window.
fn pick_window(
    requested: u32,
    force_full: bool,
    last_sync: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> u32 {
    if force_full {
        return requested.max(1);
    }
    match last_sync {
        Some(last) => {
            let since = (now - last).num_days().max(0) as u32 + 1;
            since.min(requested.max(1))
        }
        None => requested.max(1),
    }
}

async fn sync_status(State(state): State<Arc<AppState>>) -> Response {
    let Some(user) = current_user(&state) else {
        return error_response(StatusCode::UNAUTHORIZED, "not logged in");
    };
    let status = state.coordinator.status(&user);
    Json(status_payload(&status)).into_response()
}

/// The polling shape: `{is_syncing, progress, phase, last_sync, error?}`.
fn status_payload(status: &SyncStatus) -> Value {
    let mut payload = json!({
        "is_syncing": status.is_syncing(),
        "progress": status.progress,
        "phase": status.phase,
        "last_sync": status.last_sync.map(|t| t.to_rfc3339()),
        "user_email": status.user_email,
    });
    if let Some(ref error) = status.error {
        payload["error"] = json!(error);
    }
    if let Some(ref result) = status.result {
        payload["result"] = serde_json::to_value(result).unwrap_or(Value::Null);
    }
    payload
}

// ============================================================================
// Data routes
// ============================================================================

async fn reset_database(State(state): State<Arc<AppState>>) -> Response {
    let Some(user) = current_user(&state) else {
        return error_response(StatusCode::UNAUTHORIZED, "not logged in");
    };
    let mut db = match open_db(&state) {
        Ok(db) => db,
        Err(response) => return response,
    };
    match db.reset(&user) {
        Ok(()) => {
            state.coordinator.clear(&user);
            Json(json!({ "success": true })).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn insights(State(state): State<Arc<AppState>>) -> Response {
    let Some(user) = current_user(&state) else {
        return error_response(StatusCode::UNAUTHORIZED, "not logged in");
    };
    let db = match open_db(&state) {
        Ok(db) => db,
        Err(response) => return response,
    };
    match db.insights(&user) {
        Ok(report) => Json(report).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Deserialize)]
struct ChatRequest {
    message: String,
}

async fn chat_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Response {
    let Some(user) = current_user(&state) else {
        return error_response(StatusCode::UNAUTHORIZED, "not logged in");
    };
    if request.message.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "message is empty");
    }

    let summary = {
        let db = match open_db(&state) {
            Ok(db) => db,
            Err(response) => return response,
        };
        match db.intelligence_summary(&user) {
            Ok(summary) => summary,
            Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    };

    match chat::answer(Arc::clone(&state.model), &user, &summary, &request.message).await {
        Ok(response) => Json(json!({ "response": response })).into_response(),
        Err(LlmError::MissingApiKey) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "chat unavailable: no API key configured",
        ),
        Err(e) => error_response(StatusCode::BAD_GATEWAY, e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
struct PreferencesRequest {
    email_days_back: Option<u32>,
    max_results: Option<u32>,
}

async fn save_preferences(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PreferencesRequest>,
) -> Response {
    let current = state.config.read().clone();
    let updated = crate::config::update_config(&current, |config| {
        if let Some(days) = request.email_days_back {
            config.email_days_back = days.max(1);
        }
        if let Some(max) = request.max_results {
            config.max_results = max.clamp(1, 500);
        }
    });

    match updated {
        Ok(config) => {
            *state.config.write() = config;
            Json(json!({ "success": true })).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "error": e })),
        )
            .into_response(),
    }
}

async fn disconnect(State(state): State<Arc<AppState>>) -> Response {
    if let Err(e) = token_store::delete_token() {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }
    *state.current_user.write() = None;
    log::info!("Gmail disconnected");
    Json(json!({ "success": true })).into_response()
}

// ============================================================================
// Tests
// ============================================================================
