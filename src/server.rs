//! HTTP API server.
//!
//! Exposes the chat pipeline and the admin surface over a JSON HTTP API.
//! The chat stream endpoint replies with Server-Sent Events; everything
//! else is plain JSON.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/chat/stream` | Run a chat turn, streamed as SSE events |
//! | `GET`  | `/chat/sessions` | List the caller's sessions |
//! | `GET`  | `/chat/history/{id}` | Messages of one session |
//! | `PUT`  | `/chat/sessions/{id}` | Rename a session |
//! | `DELETE` | `/chat/sessions/{id}` | Delete a session and its messages |
//! | `POST` | `/admin/documents` | Index a chunked document (admin) |
//! | `GET`  | `/admin/documents` | Paginated document listing (admin) |
//! | `DELETE` | `/admin/documents/{id}` | Remove a document and its passages (admin) |
//! | `GET`  | `/admin/stats` | Corpus and cache counters (admin) |
//! | `GET`  | `/admin/cache/stats` | Semantic cache snapshot (admin) |
//! | `POST` | `/admin/cache/clear` | Drop every cache entry (admin) |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Identity
//!
//! The caller is identified by the `x-user-id` header, which must match a
//! row in the `users` table (rows are created via the `user add` CLI
//! command). A missing or unknown id is a 401; a non-admin caller on an
//! `/admin` route is a 403. Upstream authentication is assumed to sit in
//! front of this service.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "forbidden", "message": "session belongs to another user" } }
//! ```
//!
//! Error codes: `bad_request` (400), `unauthorized` (401), `forbidden` (403),
//! `not_found` (404), `internal` (500). Failures after the SSE stream has
//! started are reported in-band as an `error` event instead.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser-based
//! clients.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use futures::stream::Stream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::cache::SemanticCache;
use crate::chat::{ChatPipeline, ChatRequest, PrepareError};
use crate::classify::QueryClassifier;
use crate::config::Config;
use crate::db;
use crate::embedding::create_embedder;
use crate::generate::RagGenerator;
use crate::index::VectorIndex;
use crate::llm::OpenAiChatModel;
use crate::migrate::run_migrations;
use crate::models::StreamEvent;
use crate::rewrite::QueryRewriter;
use crate::store::{self, User};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pool: sqlx::SqlitePool,
    pipeline: Arc<ChatPipeline>,
    cache: Arc<SemanticCache>,
    index: Arc<VectorIndex>,
}

/// Starts the HTTP server: connects the database, runs migrations, wires
/// the pipeline, and serves until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(&config.db).await?;
    run_migrations(&pool).await?;

    let state = build_state(config, pool)?;
    let app = build_router(state);

    let bind_addr = &config.server.bind;
    tracing::info!(addr = %bind_addr, "server listening");

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Wire the pipeline collaborators onto an existing pool.
pub fn build_state(config: &Config, pool: sqlx::SqlitePool) -> anyhow::Result<AppState> {
    let embedder = create_embedder(&config.embedding)?;
    tracing::info!(
        model = embedder.model_name(),
        dims = embedder.dims(),
        "embedding provider ready"
    );
    let model = Arc::new(OpenAiChatModel::new(&config.llm)?);

    let index = Arc::new(VectorIndex::new(pool.clone(), embedder.clone()));
    let cache = Arc::new(SemanticCache::new(pool.clone(), embedder, &config.cache));

    let pipeline = ChatPipeline::new(
        pool.clone(),
        cache.clone(),
        config.cache.enabled,
        QueryClassifier::new(model.clone()),
        QueryRewriter::new(model.clone(), &config.rewrite),
        RagGenerator::new(model, index.clone(), &config.llm.scope),
        config.retrieval.k,
    );

    Ok(AppState {
        pool,
        pipeline: Arc::new(pipeline),
        cache,
        index,
    })
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/chat/stream", post(handle_chat_stream))
        .route("/chat/sessions", get(handle_list_sessions))
        .route("/chat/history/{id}", get(handle_session_history))
        .route("/chat/sessions/{id}", put(handle_rename_session))
        .route("/chat/sessions/{id}", delete(handle_delete_session))
        .route("/admin/documents", post(handle_upload_document))
        .route("/admin/documents", get(handle_list_documents))
        .route("/admin/documents/{id}", delete(handle_delete_document))
        .route("/admin/stats", get(handle_stats))
        .route("/admin/cache/stats", get(handle_cache_stats))
        .route("/admin/cache/clear", post(handle_cache_clear))
        .route("/health", get(handle_health))
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

/// Internal error type that converts into an Axum HTTP response.
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

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn unauthorized(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        code: "unauthorized".to_string(),
        message: message.into(),
    }
}

fn forbidden(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::FORBIDDEN,
        code: "forbidden".to_string(),
        message: message.into(),
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
    tracing::error!(error = %err, "request failed");
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: err.to_string(),
    }
}

fn prepare_error(err: PrepareError) -> AppError {
    match err {
        PrepareError::EmptyQuery => bad_request("query must not be empty"),
        PrepareError::SessionNotFound => not_found("session not found"),
        PrepareError::Forbidden => forbidden("session belongs to another user"),
        PrepareError::Internal(e) => internal(e),
    }
}

// ============ Identity ============

/// Resolve the caller from the `x-user-id` header.
async fn require_user(state: &AppState, headers: &HeaderMap) -> Result<User, AppError> {
    let user_id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| unauthorized("missing x-user-id header"))?;

    store::get_user(&state.pool, user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| unauthorized("unknown user"))
}

async fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<User, AppError> {
    let user = require_user(state, headers).await?;
    if !user.is_admin() {
        return Err(forbidden("admin role required"));
    }
    Ok(user)
}

/// Ownership gate shared by the session read/write handlers.
async fn require_session_owner(
    state: &AppState,
    user: &User,
    session_id: &str,
) -> Result<(), AppError> {
    let owner = store::session_owner(&state.pool, session_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found("session not found"))?;
    if owner != user.id {
        return Err(forbidden("session belongs to another user"));
    }
    Ok(())
}

// ============ POST /chat/stream ============

/// Handler for `POST /chat/stream`.
///
/// Rejections (bad request, unknown session, foreign session) happen before
/// the stream starts and use the JSON error contract. Once the SSE response
/// begins, the turn runs in a spawned task and terminal failures arrive as
/// an in-band `error` event.
async fn handle_chat_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let user = require_user(&state, &headers).await?;

    let turn = state
        .pipeline
        .prepare(&user.id, request)
        .await
        .map_err(prepare_error)?;

    let (tx, rx) = mpsc::channel::<StreamEvent>(64);
    let pipeline = state.pipeline.clone();
    tokio::spawn(async move {
        if let Err(e) = pipeline.execute(turn, tx.clone()).await {
            tracing::error!(error = %e, "chat turn failed");
            let _ = tx
                .send(StreamEvent::Error {
                    message: e.to_string(),
                })
                .await;
        }
    });

    let stream = ReceiverStream::new(rx).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok::<Event, Infallible>(Event::default().data(data))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ============ Sessions ============

async fn handle_list_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    let user = require_user(&state, &headers).await?;
    let sessions = store::list_sessions(&state.pool, &user.id)
        .await
        .map_err(internal)?;
    Ok(Json(serde_json::json!({ "sessions": sessions })))
}

async fn handle_session_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let user = require_user(&state, &headers).await?;
    require_session_owner(&state, &user, &session_id).await?;

    let messages = store::session_history(&state.pool, &session_id)
        .await
        .map_err(internal)?;
    Ok(Json(serde_json::json!({
        "session_id": session_id,
        "messages": messages,
    })))
}

#[derive(Deserialize)]
struct RenameRequest {
    title: String,
}

async fn handle_rename_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Json(request): Json<RenameRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let user = require_user(&state, &headers).await?;
    require_session_owner(&state, &user, &session_id).await?;

    let title = request.title.trim();
    if title.is_empty() {
        return Err(bad_request("title must not be empty"));
    }

    store::update_session_title(&state.pool, &session_id, title)
        .await
        .map_err(internal)?;
    Ok(Json(serde_json::json!({ "updated": true })))
}

async fn handle_delete_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let user = require_user(&state, &headers).await?;
    require_session_owner(&state, &user, &session_id).await?;

    store::delete_session(&state.pool, &session_id)
        .await
        .map_err(internal)?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

// ============ Admin: documents ============

#[derive(Deserialize)]
struct UploadRequest {
    filename: String,
    /// Pre-chunked document text. Chunking happens client-side or in an
    /// ingestion job; the server embeds and indexes.
    chunks: Vec<String>,
}

async fn handle_upload_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<UploadRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    require_admin(&state, &headers).await?;

    if request.filename.trim().is_empty() {
        return Err(bad_request("filename must not be empty"));
    }
    if request.chunks.is_empty() || request.chunks.iter().all(|c| c.trim().is_empty()) {
        return Err(bad_request("chunks must not be empty"));
    }

    let document_id = Uuid::new_v4().to_string();
    let indexed = state
        .index
        .upsert_chunks(&document_id, &request.filename, &request.chunks)
        .await
        .map_err(internal)?;

    store::insert_document(&state.pool, &document_id, &request.filename, indexed as i64)
        .await
        .map_err(internal)?;

    tracing::info!(document = %document_id, filename = %request.filename, chunks = indexed, "indexed document");
    Ok(Json(serde_json::json!({
        "id": document_id,
        "filename": request.filename,
        "chunk_count": indexed,
    })))
}

#[derive(Deserialize)]
struct ListDocumentsQuery {
    search: Option<String>,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    50
}

async fn handle_list_documents(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListDocumentsQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    require_admin(&state, &headers).await?;

    let limit = query.limit.clamp(1, 200);
    let offset = query.offset.max(0);
    let search = query.search.as_deref().filter(|s| !s.trim().is_empty());

    let documents = store::list_documents(&state.pool, search, limit, offset)
        .await
        .map_err(internal)?;
    let total = store::document_count(&state.pool, search)
        .await
        .map_err(internal)?;

    Ok(Json(serde_json::json!({
        "documents": documents,
        "total": total,
        "limit": limit,
        "offset": offset,
    })))
}

async fn handle_delete_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(document_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    require_admin(&state, &headers).await?;

    if store::get_document(&state.pool, &document_id)
        .await
        .map_err(internal)?
        .is_none()
    {
        return Err(not_found("document not found"));
    }

    let removed = state
        .index
        .delete_document(&document_id)
        .await
        .map_err(internal)?;
    store::delete_document_record(&state.pool, &document_id)
        .await
        .map_err(internal)?;

    tracing::info!(document = %document_id, passages = removed, "deleted document");
    Ok(Json(serde_json::json!({
        "deleted": true,
        "passages_removed": removed,
    })))
}

// ============ Admin: stats and cache ============

async fn handle_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    require_admin(&state, &headers).await?;

    let documents = store::document_count(&state.pool, None)
        .await
        .map_err(internal)?;
    let passages = state.index.passage_count().await.map_err(internal)?;
    let cache = state.cache.stats().await.map_err(internal)?;

    Ok(Json(serde_json::json!({
        "documents": documents,
        "passages": passages,
        "cache_entries": cache.total_entries,
    })))
}

async fn handle_cache_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    require_admin(&state, &headers).await?;
    let stats = state.cache.stats().await.map_err(internal)?;
    Ok(Json(serde_json::to_value(stats).unwrap_or_default()))
}

async fn handle_cache_clear(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    require_admin(&state, &headers).await?;
    let removed = state.cache.clear().await.map_err(internal)?;
    Ok(Json(serde_json::json!({ "removed": removed })))
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
