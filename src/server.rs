//! HTTP event transport.
//!
//! Requests arrive as JSON posts named after their event; progress and
//! response events leave through a server-sent-event stream. Posting a
//! request only dispatches it: the reply carries the request and operation
//! IDs, and the outcome arrives on `/events` as a `*-response` event.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/events/query-document-request` | Dispatch a document query |
//! | `POST` | `/events/inference-completion-request` | Dispatch a plain completion |
//! | `POST` | `/events/add-document-request` | Dispatch a document import |
//! | `GET`  | `/events` | SSE stream of progress and response events |
//! | `GET`  | `/operations` | In-flight operation IDs |
//! | `POST` | `/operations/{id}/cancel` | Cancel one operation |
//! | `POST` | `/operations/cancel` | Cancel every operation |
//! | `GET`  | `/history` | Recent document questions |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "validation", "message": "indexId must not be empty" } }
//! ```
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so a desktop webview
//! can talk to the server directly.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::{Any, CorsLayer};

use crate::app::{App, Ticket};
use crate::config::Config;
use crate::error::PipelineError;
use crate::models::{StoredInference, StoredQuestion};
use crate::progress::{BroadcastSink, Channel, EventSink};
use crate::search::{DocumentFilter, DocumentSummary};

/// Events buffered per SSE subscriber before it starts lagging.
const EVENT_BUFFER: usize = 256;

/// Shared state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub app: Arc<App>,
    pub events: Arc<BroadcastSink>,
}

/// Starts the server on `[server].bind` and runs until Ctrl-C. In-flight
/// operations are cancelled on the way out.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let events = Arc::new(BroadcastSink::new(EVENT_BUFFER));
    let sink: Arc<dyn EventSink> = events.clone();
    let app = Arc::new(App::from_config(config, sink).await?);

    let state = AppState {
        app: app.clone(),
        events,
    };

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "listening");
    println!("dq server listening on http://{}", config.server.bind);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            app.shutdown();
        })
        .await?;

    Ok(())
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/events", get(handle_events))
        .route("/events/query-document-request", post(handle_query))
        .route("/events/inference-completion-request", post(handle_completion))
        .route("/events/add-document-request", post(handle_add_document))
        .route("/operations", get(handle_operations))
        .route("/operations/cancel", post(handle_cancel_all))
        .route("/operations/{id}/cancel", post(handle_cancel))
        .route("/history", get(handle_history))
        .route("/history/inference", get(handle_inference_history))
        .route("/documents", get(handle_documents))
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
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        let status = match err {
            PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn internal(err: anyhow::Error) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: format!("{:#}", err),
    }
}

// ============ GET /health ============

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

// ============ POST /events/*-request ============

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Dispatched {
    request_id: String,
    operation_id: String,
}

fn accepted(ticket: Ticket) -> (StatusCode, Json<Dispatched>) {
    let body = Dispatched {
        request_id: ticket.request_id.clone(),
        operation_id: ticket.operation_id.clone(),
    };
    // The run reports through the event stream; the handle is not awaited.
    drop(ticket);
    (StatusCode::ACCEPTED, Json(body))
}

// Bodies are taken raw so that one that isn't JSON still produces a
// validation response on the event stream.

async fn handle_query(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<Dispatched>), AppError> {
    Ok(accepted(state.app.submit_body(Channel::QueryDocument, &body)?))
}

async fn handle_completion(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<Dispatched>), AppError> {
    Ok(accepted(
        state.app.submit_body(Channel::InferenceCompletion, &body)?,
    ))
}

async fn handle_add_document(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<Dispatched>), AppError> {
    Ok(accepted(state.app.submit_body(Channel::AddDocument, &body)?))
}

// ============ GET /events ============

async fn handle_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.events.subscribe();
    let stream = stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    let sse = Event::default()
                        .event(event.name())
                        .data(event.payload().to_string());
                    return Some((Ok(sse), receiver));
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event subscriber lagging, events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ============ Operations ============

#[derive(Serialize)]
struct OperationsResponse {
    operations: Vec<String>,
}

async fn handle_operations(State(state): State<AppState>) -> Json<OperationsResponse> {
    Json(OperationsResponse {
        operations: state.app.active_operations(),
    })
}

#[derive(Serialize)]
struct CancelResponse {
    cancelled: usize,
}

async fn handle_cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, AppError> {
    if state.app.cancel(&id) {
        Ok(Json(CancelResponse { cancelled: 1 }))
    } else {
        Err(not_found(format!("no operation in flight with ID: {}", id)))
    }
}

async fn handle_cancel_all(State(state): State<AppState>) -> Json<CancelResponse> {
    Json(CancelResponse {
        cancelled: state.app.cancel_all(),
    })
}

// ============ GET /history ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryParams {
    document_id: Option<String>,
    limit: Option<i64>,
}

#[derive(Serialize)]
struct HistoryResponse {
    questions: Vec<StoredQuestion>,
}

async fn handle_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryResponse>, AppError> {
    let questions = state
        .app
        .recent_questions(params.document_id.as_deref(), params.limit.unwrap_or(20))
        .await
        .map_err(internal)?;
    Ok(Json(HistoryResponse { questions }))
}

#[derive(Deserialize)]
struct InferenceHistoryParams {
    limit: Option<i64>,
}

#[derive(Serialize)]
struct InferenceHistoryResponse {
    inferences: Vec<StoredInference>,
}

async fn handle_inference_history(
    State(state): State<AppState>,
    Query(params): Query<InferenceHistoryParams>,
) -> Result<Json<InferenceHistoryResponse>, AppError> {
    let inferences = state
        .app
        .recent_inferences(params.limit.unwrap_or(20))
        .await
        .map_err(internal)?;
    Ok(Json(InferenceHistoryResponse { inferences }))
}

// ============ GET /documents ============

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct DocumentsParams {
    index: Option<String>,
    title: String,
    meta_text_desc: String,
    meta_key_words: String,
    date_from: String,
    date_to: String,
    size: Option<usize>,
}

impl DocumentsParams {
    fn into_parts(self) -> (Option<String>, DocumentFilter) {
        let filter = DocumentFilter {
            title: self.title,
            meta_text_desc: self.meta_text_desc,
            meta_key_words: self.meta_key_words,
            date_from: self.date_from,
            date_to: self.date_to,
            size: self.size,
        };
        (self.index, filter)
    }
}

#[derive(Serialize)]
struct DocumentsResponse {
    documents: Vec<DocumentSummary>,
}

async fn handle_documents(
    State(state): State<AppState>,
    Query(params): Query<DocumentsParams>,
) -> Result<Json<DocumentsResponse>, AppError> {
    let (index, filter) = params.into_parts();
    let documents = state
        .app
        .find_documents(index.as_deref(), &filter)
        .await
        .map_err(internal)?;
    Ok(Json(DocumentsResponse { documents }))
}
