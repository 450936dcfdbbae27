//! HTTP API server.
//!
//! Exposes project management, ingestion, hybrid search, streaming chat, and
//! crawl orchestration over a JSON HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/projects` | Create a project |
//! | `GET`  | `/projects` | List projects |
//! | `POST` | `/ingest` | Ingest a PDF, text blob, or web page into a project |
//! | `POST` | `/crawl` | Create and run a breadth-first crawl job |
//! | `POST` | `/search` | Hybrid dense+sparse search with RRF, rerank, CRAG |
//! | `POST` | `/chat/stream` | Grounded chat completion, streamed as SSE |
//! | `GET`  | `/documents/:id` | Retrieve a document and its chunks |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `embeddings_disabled` (400),
//! `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so browser-based clients
//! can call the API directly.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::chat;
use crate::config::Config;
use crate::crawl::{self, build_engine_selector};
use crate::db;
use crate::get::{get_document, DocumentResponse};
use crate::ingest;
use crate::models::Project;
use crate::progress::NoProgress;
use crate::projects;
use crate::retrieval::{IdentityReformulation, PipelineCoordinator, SearchResponse};

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    pool: SqlitePool,
}

/// Starts the HTTP server.
///
/// Binds to the address configured in `[server].bind`, opens the database
/// pool once, and registers all route handlers. Runs until the process is
/// terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let pool = db::connect(config).await?;

    let state = AppState {
        config: Arc::new(config.clone()),
        pool,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/projects", post(handle_create_project))
        .route("/projects", get(handle_list_projects))
        .route("/ingest", post(handle_ingest))
        .route("/crawl", post(handle_crawl))
        .route("/search", post(handle_search))
        .route("/chat/stream", post(handle_chat_stream))
        .route("/documents/{id}", get(handle_get_document))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    println!("knowledgetree server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
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

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
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

/// Constructs a 400 error specifically for when semantic search is
/// requested but embeddings are disabled.
fn embeddings_disabled(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "embeddings_disabled".to_string(),
        message: message.into(),
    }
}

fn internal_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

fn classify_err(e: anyhow::Error) -> AppError {
    let msg = e.to_string();
    if msg.contains("not found") {
        not_found(msg)
    } else if msg.contains("embeddings") {
        embeddings_disabled(msg)
    } else {
        internal_error(msg)
    }
}

// ============ POST /projects, GET /projects ============

#[derive(Deserialize)]
struct CreateProjectRequest {
    name: String,
}

async fn handle_create_project(
    State(state): State<AppState>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<Json<Project>, AppError> {
    if req.name.trim().is_empty() {
        return Err(bad_request("name must not be empty"));
    }
    let project = projects::create_project(&state.pool, &req.name)
        .await
        .map_err(classify_err)?;
    Ok(Json(project))
}

#[derive(Serialize)]
struct ListProjectsResponse {
    projects: Vec<Project>,
}

async fn handle_list_projects(
    State(state): State<AppState>,
) -> Result<Json<ListProjectsResponse>, AppError> {
    let projects = projects::list_projects(&state.pool)
        .await
        .map_err(classify_err)?;
    Ok(Json(ListProjectsResponse { projects }))
}

// ============ POST /ingest ============

#[derive(Deserialize)]
struct IngestRequest {
    project_id: String,
    /// `"pdf"`, `"text"`, or `"web"`.
    source_kind: String,
    /// File path (pdf/text) or URL (web).
    locator: String,
}

async fn handle_ingest(
    State(state): State<AppState>,
    Json(req): Json<IngestRequest>,
) -> Result<Json<crate::models::Document>, AppError> {
    if req.locator.trim().is_empty() {
        return Err(bad_request("locator must not be empty"));
    }

    let reporter = NoProgress;
    let doc = ingest::run_ingest(
        &state.config,
        &req.project_id,
        &req.source_kind,
        &req.locator,
        &reporter,
    )
    .await
    .map_err(classify_err)?;

    Ok(Json(doc))
}

// ============ POST /crawl ============

#[derive(Deserialize)]
struct CrawlRequest {
    project_id: String,
    url: String,
    #[serde(default)]
    max_depth: Option<i64>,
    #[serde(default)]
    max_pages: Option<i64>,
    #[serde(default)]
    engine: Option<String>,
}

async fn handle_crawl(
    State(state): State<AppState>,
    Json(req): Json<CrawlRequest>,
) -> Result<Json<crate::models::Document>, AppError> {
    if req.url.trim().is_empty() {
        return Err(bad_request("url must not be empty"));
    }

    let job = crawl::create_crawl_job(
        &state.pool,
        &req.project_id,
        &req.url,
        req.max_depth.unwrap_or(state.config.agent.max_depth),
        req.max_pages.unwrap_or(state.config.agent.max_pages),
        req.engine.as_deref(),
    )
    .await
    .map_err(classify_err)?;

    let selector = build_engine_selector(&state.config);
    let reporter = NoProgress;
    let doc = ingest::ingest_crawl_job(&state.config, &state.pool, &reporter, &selector, &job)
        .await
        .map_err(classify_err)?;

    Ok(Json(doc))
}

// ============ POST /search ============

#[derive(Deserialize)]
struct SearchRequest {
    project_id: String,
    query: String,
    #[serde(default = "default_search_limit")]
    limit: i64,
}

fn default_search_limit() -> i64 {
    10
}

async fn handle_search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }

    let coordinator = PipelineCoordinator::new(&state.pool, &state.config);
    let response = coordinator
        .search_with_reranking(&req.project_id, &req.query, req.limit, &IdentityReformulation)
        .await
        .map_err(classify_err)?;

    Ok(Json(response))
}

// ============ POST /chat/stream ============

#[derive(Deserialize)]
struct ChatRequest {
    project_id: String,
    query: String,
    #[serde(default = "default_search_limit")]
    limit: i64,
}

async fn handle_chat_stream(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<impl futures::Stream<Item = Result<axum::response::sse::Event, std::convert::Infallible>>>, AppError>
{
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }

    let coordinator = PipelineCoordinator::new(&state.pool, &state.config);
    let response = coordinator
        .search_with_reranking(&req.project_id, &req.query, req.limit, &IdentityReformulation)
        .await
        .map_err(classify_err)?;

    let stream = chat::stream_chat_response(req.query, response.results, (*state.config).clone());
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ============ GET /documents/:id ============

async fn handle_get_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DocumentResponse>, AppError> {
    if id.trim().is_empty() {
        return Err(bad_request("id must not be empty"));
    }

    let doc = get_document(&state.config, &id).await.map_err(classify_err)?;
    Ok(Json(doc))
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
