//! HTTP API for retrieval and ticket processing.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Server version and index readiness |
//! | `POST` | `/retrieve` | Retrieve evidence for a `QueryData` payload |
//! | `POST` | `/tickets` | Run the full ticket pipeline |
//! | `GET`  | `/escalations` | Open escalations (`?all=true` for history) |
//! | `POST` | `/escalations/{ticket_id}/resolve` | Close a ticket's escalation |
//! | `POST` | `/index/reload` | Reload the persisted index from disk |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query reformulation must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404),
//! `index_incompatible` (409), `index_corrupt` (409, missing or damaged
//! index files), `index_unavailable` (503),
//! `embedding_unavailable` (502), `internal` (500).
//!
//! A reload that fails leaves the previously served index in place.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use helpdesk_harness_core::error::{EmbeddingError, IndexError, RetrievalError};
use helpdesk_harness_core::index::SharedIndex;
use helpdesk_harness_core::models::{QueryData, RetrievalResult};

use crate::config::Config;
use crate::embedding::create_embedder;
use crate::index_store::load_index;
use crate::pipeline::{new_ticket_id, TicketOutcome, TicketPipeline};
use crate::{db, migrate, results};

/// Shared state handed to every route handler.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    index: SharedIndex,
    pipeline: Arc<TicketPipeline>,
    /// Results database; `None` serves without recording outcomes.
    pool: Option<SqlitePool>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        index: SharedIndex,
        pipeline: Arc<TicketPipeline>,
        pool: Option<SqlitePool>,
    ) -> Self {
        Self {
            config,
            index,
            pipeline,
            pool,
        }
    }
}

/// Wire up the embedder, index, pipeline and results database from
/// configuration. A missing or corrupt index is logged and left unset so
/// the server can still come up and be reloaded later.
pub async fn build_state(config: &Config) -> anyhow::Result<AppState> {
    let config = Arc::new(config.clone());
    let embedder = create_embedder(&config.embedding)?;

    let index = SharedIndex::new();
    match load_index(&config.index.dir) {
        Ok(loaded) => {
            index.install(loaded);
        }
        Err(e) => warn!(error = %e, dir = %config.index.dir.display(), "serving without an index"),
    }

    let pipeline = TicketPipeline::from_config(&config, index.clone(), embedder)?;

    let pool = db::connect(&config).await?;
    migrate::apply_schema(&pool).await?;

    Ok(AppState::new(config, index, Arc::new(pipeline), Some(pool)))
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/retrieve", post(handle_retrieve))
        .route("/tickets", post(handle_ticket))
        .route("/escalations", get(handle_list_escalations))
        .route("/escalations/{ticket_id}/resolve", post(handle_resolve))
        .route("/index/reload", post(handle_reload))
        .layer(cors)
        .with_state(state)
}

/// Starts the HTTP server on `[server].bind` and runs until terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let state = build_state(config).await?;
    let app = router(state);

    let bind_addr = &config.server.bind;
    info!(bind = %bind_addr, "helpdesk server listening");
    println!("Helpdesk server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
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

fn internal(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
}

impl From<IndexError> for AppError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::Unset | IndexError::EmptyCorpus => AppError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "index_unavailable",
                err.to_string(),
            ),
            IndexError::Embedding(e) => e.into(),
            IndexError::Corrupt { .. } => AppError::new(
                StatusCode::CONFLICT,
                "index_corrupt",
                format!("{}; run `hdx index build` to rebuild the index", err),
            ),
        }
    }
}

impl From<EmbeddingError> for AppError {
    fn from(err: EmbeddingError) -> Self {
        match err {
            EmbeddingError::Unavailable(_) => AppError::new(
                StatusCode::BAD_GATEWAY,
                "embedding_unavailable",
                err.to_string(),
            ),
            _ => internal(err.to_string()),
        }
    }
}

impl From<RetrievalError> for AppError {
    fn from(err: RetrievalError) -> Self {
        match err {
            RetrievalError::InvalidQuery(e) => bad_request(e.to_string()),
            RetrievalError::Index(e) => e.into(),
            RetrievalError::Embedding(e) => e.into(),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        internal(format!("{:#}", err))
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    index_ready: bool,
    chunks: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let current = state.index.current();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        index_ready: current.is_some(),
        chunks: current.as_ref().map_or(0, |i| i.len()),
        model: current.map(|i| i.model().to_string()),
    })
}

// ============ POST /retrieve ============

#[derive(Deserialize)]
struct RetrieveRequest {
    #[serde(flatten)]
    query: QueryData,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    use_augmentation: Option<bool>,
}

async fn handle_retrieve(
    State(state): State<AppState>,
    Json(req): Json<RetrieveRequest>,
) -> Result<Json<RetrievalResult>, AppError> {
    let top_k = req.top_k.unwrap_or(state.config.retrieval.top_k);
    let use_augmentation = req
        .use_augmentation
        .unwrap_or(state.config.retrieval.use_augmentation);

    let result = state
        .pipeline
        .retriever()
        .retrieve(&req.query, top_k, use_augmentation)
        .await?;
    Ok(Json(result))
}

// ============ POST /tickets ============

#[derive(Deserialize)]
struct TicketRequest {
    question: String,
    #[serde(default)]
    ticket_id: Option<String>,
}

async fn handle_ticket(
    State(state): State<AppState>,
    Json(req): Json<TicketRequest>,
) -> Result<Json<TicketOutcome>, AppError> {
    if req.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }
    let ticket_id = req
        .ticket_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(new_ticket_id);

    let outcome = state.pipeline.process(&ticket_id, &req.question).await?;
    if let Some(pool) = &state.pool {
        results::record_outcome(pool, &outcome).await?;
    }
    Ok(Json(outcome))
}

// ============ Escalations ============

#[derive(Deserialize)]
struct EscalationsQuery {
    #[serde(default)]
    all: bool,
}

fn require_pool(state: &AppState) -> Result<&SqlitePool, AppError> {
    state
        .pool
        .as_ref()
        .ok_or_else(|| internal("results database is not configured"))
}

async fn handle_list_escalations(
    State(state): State<AppState>,
    Query(params): Query<EscalationsQuery>,
) -> Result<Json<Vec<results::EscalationRecord>>, AppError> {
    let pool = require_pool(&state)?;
    Ok(Json(results::list_escalations(pool, !params.all).await?))
}

#[derive(Serialize)]
struct ResolveResponse {
    ticket_id: String,
    resolved: u64,
}

async fn handle_resolve(
    State(state): State<AppState>,
    Path(ticket_id): Path<String>,
) -> Result<Json<ResolveResponse>, AppError> {
    let pool = require_pool(&state)?;
    let resolved = results::resolve_escalation(pool, &ticket_id).await?;
    if resolved == 0 {
        return Err(AppError::new(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("no open escalation for ticket {}", ticket_id),
        ));
    }
    Ok(Json(ResolveResponse {
        ticket_id,
        resolved,
    }))
}

// ============ POST /index/reload ============

#[derive(Serialize)]
struct ReloadResponse {
    chunks: usize,
    dims: usize,
    model: String,
}

async fn handle_reload(State(state): State<AppState>) -> Result<Json<ReloadResponse>, AppError> {
    let dir = state.config.index.dir.clone();
    let loaded = tokio::task::spawn_blocking(move || load_index(&dir))
        .await
        .map_err(|e| internal(format!("index reload task failed: {}", e)))??;

    let embedder = state.pipeline.retriever().embedder();
    if loaded.dims() != embedder.dims() || loaded.model() != embedder.model_name() {
        return Err(AppError::new(
            StatusCode::CONFLICT,
            "index_incompatible",
            format!(
                "index was built with {} ({} dims) but the server embeds with {} ({} dims)",
                loaded.model(),
                loaded.dims(),
                embedder.model_name(),
                embedder.dims()
            ),
        ));
    }

    let response = ReloadResponse {
        chunks: loaded.len(),
        dims: loaded.dims(),
        model: loaded.model().to_string(),
    };
    state.index.install(loaded);
    info!(chunks = response.chunks, "index reloaded");
    Ok(Json(response))
}
