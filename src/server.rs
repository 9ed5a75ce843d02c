//! HTTP conversation boundary.
//!
//! Exposes the pipeline to a chat UI as a JSON API. Each session lives
//! behind its own async mutex: requests for one session queue up and run
//! one at a time, while different sessions proceed concurrently.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/sessions` | Start a session |
//! | `GET`  | `/sessions/{id}` | State, pending extraction and turn history |
//! | `DELETE` | `/sessions/{id}` | End a session and drop its uploads |
//! | `GET`  | `/sessions/{id}/turns/{n}/image` | Source image of turn `n` |
//! | `POST` | `/sessions/{id}/ask` | Submit a typed question |
//! | `POST` | `/sessions/{id}/image` | Upload a base64 image for extraction |
//! | `POST` | `/sessions/{id}/audio` | Upload base64 audio for transcription |
//! | `POST` | `/sessions/{id}/confirm` | Confirm the extraction; `{"text": ...}` replaces it first |
//! | `POST` | `/sessions/{id}/cancel` | Discard the pending extraction |
//! | `POST` | `/sessions/{id}/feedback` | Mark a solution accurate or inaccurate |
//!
//! Request bodies are capped at `[server].max_body_bytes`. Sessions idle
//! for longer than `[server].session_ttl_secs` are dropped the next time
//! they are looked up or a new session is created; a session with a
//! request in flight is never dropped.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "awaiting_confirmation", "message": "confirm or cancel the pending extraction first" } }
//! ```

use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::config::{Config, ServerConfig};
use crate::extract::{sniff_image_mime, ExtractError};
use crate::pipeline::{Feedback, Orchestrator, TurnOutcome};
use crate::session::{Session, SessionError};

/// A session plus the time it was last looked up.
struct SessionSlot {
    session: Mutex<Session>,
    /// Milliseconds since [`AppState::started`].
    last_seen: AtomicU64,
}

type SessionMap = RwLock<HashMap<Uuid, Arc<SessionSlot>>>;

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
    sessions: Arc<SessionMap>,
    started: Instant,
    ttl: Option<Duration>,
}

impl AppState {
    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Idle past the TTL and not busy with a request.
    fn is_expired(&self, slot: &SessionSlot, now_ms: u64) -> bool {
        let Some(ttl) = self.ttl else {
            return false;
        };
        let idle = now_ms.saturating_sub(slot.last_seen.load(Ordering::Relaxed));
        idle >= ttl.as_millis() as u64 && slot.session.try_lock().is_ok()
    }
}

/// Bind to `[server].bind` and serve until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let orchestrator = Arc::new(Orchestrator::from_config(config)?);
    run_server_with_orchestrator(config, orchestrator).await
}

/// Serve an already-built orchestrator, e.g. one wired to a custom
/// completion client.
pub async fn run_server_with_orchestrator(config: &Config, orchestrator: Arc<Orchestrator>) -> anyhow::Result<()> {
    let app = router(orchestrator, &config.server);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "math mentor listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Build the router around an existing orchestrator.
pub fn router(orchestrator: Arc<Orchestrator>, server: &ServerConfig) -> Router {
    let state = AppState {
        orchestrator,
        sessions: Arc::new(RwLock::new(HashMap::new())),
        started: Instant::now(),
        ttl: (server.session_ttl_secs > 0).then(|| Duration::from_secs(server.session_ttl_secs)),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/sessions", post(handle_create_session))
        .route("/sessions/{id}", get(handle_get_session).delete(handle_delete_session))
        .route("/sessions/{id}/turns/{turn}/image", get(handle_turn_image))
        .route("/sessions/{id}/ask", post(handle_ask))
        .route("/sessions/{id}/image", post(handle_image))
        .route("/sessions/{id}/audio", post(handle_audio))
        .route("/sessions/{id}/confirm", post(handle_confirm))
        .route("/sessions/{id}/cancel", post(handle_cancel))
        .route("/sessions/{id}/feedback", post(handle_feedback))
        .layer(DefaultBodyLimit::max(server.max_body_bytes))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::NOT_FOUND, "not_found", message)
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        let message = err.to_string();
        match err {
            SessionError::NoPendingExtraction => AppError::new(StatusCode::CONFLICT, "no_pending_extraction", message),
            SessionError::AwaitingConfirmation => AppError::new(StatusCode::CONFLICT, "awaiting_confirmation", message),
            SessionError::EmptyInput | SessionError::FeedbackNotEligible(_) => bad_request(message),
            SessionError::UnknownTurn(_) => not_found(message),
            SessionError::Memory(_) => AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "memory_error", message),
            SessionError::Extract(ExtractError::Unsupported(_)) => {
                AppError::new(StatusCode::UNSUPPORTED_MEDIA_TYPE, "unsupported_media", message)
            }
            SessionError::Extract(ExtractError::MissingCredentials(_)) => {
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, "missing_credentials", message)
            }
            SessionError::Extract(_) => AppError::new(StatusCode::BAD_GATEWAY, "extraction_failed", message),
        }
    }
}

async fn session(state: &AppState, id: Uuid) -> Result<Arc<SessionSlot>, AppError> {
    let missing = || not_found(format!("session {} not found", id));
    let slot = state.sessions.read().await.get(&id).cloned().ok_or_else(missing)?;

    let now = state.now_ms();
    if state.is_expired(&slot, now) {
        state.sessions.write().await.remove(&id);
        tracing::info!(session = %id, "session expired");
        return Err(missing());
    }
    slot.last_seen.store(now, Ordering::Relaxed);
    Ok(slot)
}

async fn evict_idle(state: &AppState) {
    let now = state.now_ms();
    let mut sessions = state.sessions.write().await;
    let before = sessions.len();
    sessions.retain(|_, slot| !state.is_expired(slot, now));
    let evicted = before - sessions.len();
    if evicted > 0 {
        tracing::info!(evicted, remaining = sessions.len(), "expired idle sessions");
    }
}

fn decode_base64(field: &str, data: &str) -> Result<Vec<u8>, AppError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| bad_request(format!("{} is not valid base64: {}", field, e)))?;
    if bytes.is_empty() {
        return Err(bad_request(format!("{} must not be empty", field)));
    }
    Ok(bytes)
}

// ============ Handlers ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[derive(Serialize)]
struct CreatedSession {
    id: Uuid,
}

async fn handle_create_session(State(state): State<AppState>) -> (StatusCode, Json<CreatedSession>) {
    evict_idle(&state).await;

    let session = Session::new();
    let id = session.id();
    let slot = SessionSlot {
        session: Mutex::new(session),
        last_seen: AtomicU64::new(state.now_ms()),
    };
    state.sessions.write().await.insert(id, Arc::new(slot));
    tracing::info!(session = %id, "session created");
    (StatusCode::CREATED, Json(CreatedSession { id }))
}

async fn handle_get_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Response, AppError> {
    let slot = session(&state, id).await?;
    let guard = slot.session.lock().await;
    Ok(Json(&*guard).into_response())
}

async fn handle_delete_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<StatusCode, AppError> {
    match state.sessions.write().await.remove(&id) {
        Some(_) => {
            tracing::info!(session = %id, "session deleted");
            Ok(StatusCode::NO_CONTENT)
        }
        None => Err(not_found(format!("session {} not found", id))),
    }
}

async fn handle_turn_image(
    State(state): State<AppState>,
    Path((id, turn)): Path<(Uuid, usize)>,
) -> Result<Response, AppError> {
    let slot = session(&state, id).await?;
    let guard = slot.session.lock().await;
    let image = guard
        .turn(turn)?
        .source_image
        .clone()
        .ok_or_else(|| not_found(format!("turn {} has no image", turn)))?;
    let mime = sniff_image_mime(&image).unwrap_or("application/octet-stream");
    Ok(([(header::CONTENT_TYPE, mime)], image).into_response())
}

#[derive(Deserialize)]
struct AskRequest {
    text: String,
}

async fn handle_ask(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<AskRequest>,
) -> Result<Json<TurnOutcome>, AppError> {
    let slot = session(&state, id).await?;
    let mut guard = slot.session.lock().await;
    let outcome = state.orchestrator.submit_text(&mut guard, &req.text).await?;
    Ok(Json(outcome))
}

#[derive(Deserialize)]
struct ImageRequest {
    image_base64: String,
}

#[derive(Serialize)]
struct ExtractionResponse {
    extracted_text: String,
}

async fn handle_image(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ImageRequest>,
) -> Result<Json<ExtractionResponse>, AppError> {
    let image = decode_base64("image_base64", &req.image_base64)?;
    let slot = session(&state, id).await?;
    let mut guard = slot.session.lock().await;
    let extracted_text = state.orchestrator.begin_image(&mut guard, image).await?;
    Ok(Json(ExtractionResponse { extracted_text }))
}

#[derive(Deserialize)]
struct AudioRequest {
    audio_base64: String,
    filename: String,
}

async fn handle_audio(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<AudioRequest>,
) -> Result<Json<ExtractionResponse>, AppError> {
    let audio = decode_base64("audio_base64", &req.audio_base64)?;
    let slot = session(&state, id).await?;
    let mut guard = slot.session.lock().await;
    let extracted_text = state
        .orchestrator
        .begin_audio(&mut guard, audio, &req.filename)
        .await?;
    Ok(Json(ExtractionResponse { extracted_text }))
}

#[derive(Deserialize)]
struct ConfirmRequest {
    /// Corrected text; omit to accept the extraction as is.
    #[serde(default)]
    text: Option<String>,
}

async fn handle_confirm(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ConfirmRequest>,
) -> Result<Json<TurnOutcome>, AppError> {
    let slot = session(&state, id).await?;
    let mut guard = slot.session.lock().await;
    if let Some(text) = req.text {
        state.orchestrator.edit_pending(&mut guard, &text)?;
    }
    let outcome = state.orchestrator.confirm_pending(&mut guard).await?;
    Ok(Json(outcome))
}

async fn handle_cancel(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<StatusCode, AppError> {
    let slot = session(&state, id).await?;
    let mut guard = slot.session.lock().await;
    state.orchestrator.cancel_pending(&mut guard)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct FeedbackRequest {
    turn: usize,
    feedback: Feedback,
}

async fn handle_feedback(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<FeedbackRequest>,
) -> Result<StatusCode, AppError> {
    let slot = session(&state, id).await?;
    let mut guard = slot.session.lock().await;
    state
        .orchestrator
        .feedback(&mut guard, req.turn, req.feedback)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_and_code(err: SessionError) -> (StatusCode, &'static str) {
        let app: AppError = err.into();
        (app.status, app.code)
    }

    #[test]
    fn test_session_error_mapping() {
        assert_eq!(
            status_and_code(SessionError::AwaitingConfirmation),
            (StatusCode::CONFLICT, "awaiting_confirmation")
        );
        assert_eq!(
            status_and_code(SessionError::UnknownTurn(4)),
            (StatusCode::NOT_FOUND, "not_found")
        );
        assert_eq!(
            status_and_code(SessionError::Extract(ExtractError::Unsupported("x".into()))),
            (StatusCode::UNSUPPORTED_MEDIA_TYPE, "unsupported_media")
        );
        assert_eq!(
            status_and_code(SessionError::Extract(ExtractError::Primary("x".into()))),
            (StatusCode::BAD_GATEWAY, "extraction_failed")
        );
    }

    #[test]
    fn test_decode_base64() {
        assert_eq!(decode_base64("f", "aGk=").ok(), Some(b"hi".to_vec()));
        assert!(decode_base64("f", "***").is_err());
        assert!(decode_base64("f", "").is_err());
    }
}
