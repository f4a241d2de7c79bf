use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use axum::{
    Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    middleware::from_fn,
    response::{
        Json,
        sse::{Event as SseEvent, KeepAlive, Sse},
    },
    routing::{get, post, put},
};
use chat_flow::{
    ChatError, InMemorySessionStorage, SessionEvent, SessionHandle, SessionSnapshot,
    SessionStorage, TableAgent, TurnRunner, UploadReceiver,
};
use futures_util::Stream;
use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    agent::RigTableAgent,
    config::ServiceConfig,
    models::{
        AnswerRequest, ApiKeyRequest, CreateSessionResponse, ErrorDialogResponse,
        QuestionRequest, TurnResponse, UploadResponse,
    },
    telemetry::correlation_id_middleware,
};

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<Value>)>;
type ApiError = (StatusCode, Json<Value>);

fn bad_request_error(message: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

fn not_found_error(message: &str, id: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": message,
            "session_id": id
        })),
    )
}

fn conflict_error(message: &str, id: &str) -> ApiError {
    (
        StatusCode::CONFLICT,
        Json(json!({
            "error": message,
            "session_id": id
        })),
    )
}

fn internal_error(message: &str, details: &str) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": message,
            "details": details
        })),
    )
}

fn chat_error(err: ChatError) -> ApiError {
    match &err {
        ChatError::SessionNotFound(id) => not_found_error("Session not found", id),
        ChatError::TurnInProgress(id) => conflict_error("A question is already being answered", id),
        ChatError::InvalidUpload(reason) => bad_request_error(reason),
        ChatError::UploadWrite { .. } | ChatError::StorageError(_) => {
            error!("Operational failure: {}", err);
            internal_error("Internal error", &err.to_string())
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub session_storage: Arc<dyn SessionStorage>,
    pub turn_runner: TurnRunner,
    pub uploads: UploadReceiver,
    pub event_capacity: usize,
    pub max_upload_bytes: usize,
}

impl AppState {
    pub fn new(config: &ServiceConfig, agent: Arc<dyn TableAgent>) -> Self {
        let session_storage: Arc<dyn SessionStorage> = Arc::new(InMemorySessionStorage::new());
        let turn_runner =
            TurnRunner::new(session_storage.clone(), agent).with_settings(config.turn_settings());

        Self {
            session_storage,
            turn_runner,
            uploads: UploadReceiver::new(config.upload_dir.clone()),
            event_capacity: config.event_capacity,
            max_upload_bytes: config.max_upload_bytes,
        }
    }
}

pub fn create_app(config: &ServiceConfig) -> Router {
    let agent = Arc::new(RigTableAgent::from_config(config));
    build_router(AppState::new(config, agent))
}

pub fn build_router(app_state: AppState) -> Router {
    let body_limit = app_state.max_upload_bytes;

    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/sessions", post(create_session))
        .route(
            "/sessions/{session_id}",
            get(get_session).delete(close_session),
        )
        .route("/sessions/{session_id}/api-key", put(set_api_key))
        .route("/sessions/{session_id}/question", put(set_question))
        .route("/sessions/{session_id}/upload", post(upload_file))
        .route("/sessions/{session_id}/answer", post(answer))
        .route(
            "/sessions/{session_id}/error-dialog/toggle",
            post(toggle_error_dialog),
        )
        .route("/sessions/{session_id}/events", get(stream_events))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(from_fn(correlation_id_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "Dataframe Chat Service",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Upload a CSV file and ask questions about it in natural language",
        "endpoints": {
            "POST /sessions": "Open a chat session",
            "GET /sessions/{session_id}": "Current session state",
            "DELETE /sessions/{session_id}": "Close a chat session",
            "PUT /sessions/{session_id}/api-key": "Set the LLM provider API key",
            "PUT /sessions/{session_id}/question": "Set the question being typed",
            "POST /sessions/{session_id}/upload": "Upload one CSV file (multipart)",
            "POST /sessions/{session_id}/answer": "Answer the current question",
            "POST /sessions/{session_id}/error-dialog/toggle": "Open or close the error dialog",
            "GET /sessions/{session_id}/events": "Server-sent session events",
            "GET /health": "Health check"
        }
    }))
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn load_session(state: &AppState, session_id: &str) -> Result<Arc<SessionHandle>, ApiError> {
    match state.session_storage.get(session_id).await {
        Ok(Some(session)) => Ok(session),
        Ok(None) => Err(not_found_error("Session not found", session_id)),
        Err(e) => Err(chat_error(e)),
    }
}

async fn create_session(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<CreateSessionResponse>), ApiError> {
    let session = Arc::new(SessionHandle::with_event_capacity(
        Uuid::new_v4().to_string(),
        state.event_capacity,
    ));
    let response = CreateSessionResponse {
        session_id: session.id().to_string(),
        created_at: session.created_at().to_rfc3339(),
    };

    state.session_storage.save(session).await.map_err(chat_error)?;
    info!(session_id = %response.session_id, "session opened");

    Ok((StatusCode::CREATED, Json(response)))
}

async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<SessionSnapshot> {
    let session = load_session(&state, &session_id).await?;
    Ok(Json(session.snapshot()))
}

async fn close_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    load_session(&state, &session_id).await?;
    state
        .session_storage
        .delete(&session_id)
        .await
        .map_err(chat_error)?;
    info!(session_id = %session_id, "session closed");
    Ok(StatusCode::NO_CONTENT)
}

async fn set_api_key(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<ApiKeyRequest>,
) -> ApiResult<SessionSnapshot> {
    let session = load_session(&state, &session_id).await?;
    session.set_api_key(request.api_key.trim());
    Ok(Json(session.snapshot()))
}

async fn set_question(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<QuestionRequest>,
) -> ApiResult<SessionSnapshot> {
    let session = load_session(&state, &session_id).await?;
    session.set_question(request.question);
    Ok(Json(session.snapshot()))
}

async fn upload_file(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    mut multipart: Multipart,
) -> ApiResult<UploadResponse> {
    let session = load_session(&state, &session_id).await?;

    let mut upload: Option<(String, Bytes)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request_error(&e.body_text()))?
    {
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };
        if upload.is_some() {
            return Err(bad_request_error("Exactly one file must be uploaded"));
        }
        validate_csv_name(&file_name)?;
        let data = field
            .bytes()
            .await
            .map_err(|e| bad_request_error(&e.body_text()))?;
        upload = Some((file_name, data));
    }
    let (file_name, data) =
        upload.ok_or_else(|| bad_request_error("Exactly one file must be uploaded"))?;

    state
        .uploads
        .receive(&session, &file_name, data.as_ref())
        .await
        .map_err(chat_error)?;

    Ok(Json(UploadResponse {
        file_name,
        bytes: data.len(),
        session: session.snapshot(),
    }))
}

fn validate_csv_name(file_name: &str) -> Result<(), ApiError> {
    let is_csv = std::path::Path::new(file_name)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
    if is_csv {
        Ok(())
    } else {
        Err(bad_request_error("Only .csv files are accepted"))
    }
}

async fn answer(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    body: Bytes,
) -> ApiResult<TurnResponse> {
    let request: AnswerRequest = if body.iter().all(u8::is_ascii_whitespace) {
        AnswerRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| bad_request_error(&e.to_string()))?
    };

    let session = load_session(&state, &session_id).await?;

    // The turn runs on its own task so a client disconnect cannot cancel it halfway.
    let runner = state.turn_runner.clone();
    let handle = session.clone();
    let outcome = tokio::spawn(async move { runner.submit(&handle, request.question).await })
        .await
        .map_err(|e| internal_error("Turn task failed", &e.to_string()))?
        .map_err(chat_error)?;

    Ok(Json(TurnResponse {
        outcome,
        session: session.snapshot(),
    }))
}

async fn toggle_error_dialog(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<ErrorDialogResponse> {
    let session = load_session(&state, &session_id).await?;
    Ok(Json(ErrorDialogResponse {
        is_error_dialog_open: session.toggle_error_dialog(),
    }))
}

fn to_sse(event: &SessionEvent) -> SseEvent {
    let payload = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    SseEvent::default().event(event.name()).data(payload)
}

async fn stream_events(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let session = load_session(&state, &session_id).await?;
    let mut rx = session.subscribe();
    let initial = SessionEvent::StateChanged {
        state: session.snapshot(),
    };

    // Only the receiver is captured; closing the session ends the stream.
    let event_stream = stream! {
        yield Ok(to_sse(&initial));
        loop {
            match rx.recv().await {
                Ok(event) => yield Ok(to_sse(&event)),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        session_id = %session_id,
                        skipped,
                        "sse subscriber lagged behind; dropping old events"
                    );
                    continue;
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Ok(Sse::new(event_stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(10))
            .text("keepalive"),
    ))
}
