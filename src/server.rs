//! Read-only HTTP server over the graph.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (version and schema version) |
//! | `GET`  | `/search?q=&limit=` | Full-text search |
//! | `GET`  | `/node?id=` | One node with its edges |
//! | `GET`  | `/trace?seed=&max_hops=&limit=` | Trace from a node id |
//! | `GET`  | `/stats` | Store statistics |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "q must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `timeout` (408),
//! `internal` (500).
//!
//! Every query runs under `[query].timeout_secs`. All origins, methods and
//! headers are permitted.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::config::Config;
use crate::error::TrailError;
use crate::get::{get_node_view, NodeView};
use crate::migrate;
use crate::stats::{collect_stats, StatsReport};
use crate::store::{GraphStore, SearchHit};
use crate::trace::{trace, TraceHit, TraceOptions};

/// Shared state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    store: Arc<GraphStore>,
    config: Arc<Config>,
}

/// Open the store and serve on `[server].bind` until the process ends.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let store = Arc::new(GraphStore::open(&config.db.path).await?);
    let bind_addr = config.server.bind.clone();

    let app = router(store, Arc::new(config.clone()));
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(bind = %bind_addr, "server listening");
    println!("codetrail server listening on http://{}", bind_addr);

    axum::serve(listener, app).await?;
    Ok(())
}

/// The full route table, with CORS applied.
pub fn router(store: Arc<GraphStore>, config: Arc<Config>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/search", get(handle_search))
        .route("/node", get(handle_node))
        .route("/trace", get(handle_trace))
        .route("/stats", get(handle_stats))
        .layer(cors)
        .with_state(AppState { store, config })
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

impl From<TrailError> for AppError {
    fn from(err: TrailError) -> Self {
        AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal",
            message: err.to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn timeout_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::REQUEST_TIMEOUT,
        code: "timeout",
        message: message.into(),
    }
}

/// Run a store query under `[query].timeout_secs`.
async fn bounded<T>(
    state: &AppState,
    fut: impl Future<Output = crate::error::Result<T>>,
) -> Result<T, AppError> {
    let limit = Duration::from_secs(state.config.query.timeout_secs);
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(AppError::from),
        Err(_) => Err(timeout_error(format!("query timed out after {:?}", limit))),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    schema_version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        schema_version: migrate::schema_version_string(),
    })
}

// ============ GET /search ============

#[derive(Deserialize)]
struct SearchParams {
    q: Option<String>,
    limit: Option<i64>,
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<SearchHit>,
}

async fn handle_search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>, AppError> {
    let q = params.q.unwrap_or_default();
    if q.trim().is_empty() {
        return Err(bad_request("q must not be empty"));
    }
    let limit = params.limit.unwrap_or(state.config.query.default_limit);
    if limit < 1 {
        return Err(bad_request("limit must be at least 1"));
    }

    let results = bounded(&state, state.store.search_text(&q, limit)).await?;
    Ok(Json(SearchResponse { results }))
}

// ============ GET /node ============

#[derive(Deserialize)]
struct NodeParams {
    id: Option<String>,
}

async fn handle_node(
    State(state): State<AppState>,
    Query(params): Query<NodeParams>,
) -> Result<Json<NodeView>, AppError> {
    let id = params
        .id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| bad_request("id must not be empty"))?;

    match bounded(&state, get_node_view(&state.store, &id)).await? {
        Some(view) => Ok(Json(view)),
        None => Err(not_found(format!("node not found: {}", id))),
    }
}

// ============ GET /trace ============

#[derive(Deserialize)]
struct TraceParams {
    seed: Option<String>,
    max_hops: Option<usize>,
    limit: Option<usize>,
}

#[derive(Serialize)]
struct TraceResponse {
    seed: String,
    results: Vec<TraceHit>,
}

async fn handle_trace(
    State(state): State<AppState>,
    Query(params): Query<TraceParams>,
) -> Result<Json<TraceResponse>, AppError> {
    let seed = params
        .seed
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| bad_request("seed must not be empty"))?;

    let defaults = TraceOptions::from(&state.config.trace);
    let options = TraceOptions {
        max_hops: params.max_hops.unwrap_or(defaults.max_hops),
        max_results: params.limit.unwrap_or(defaults.max_results),
    };
    if options.max_hops == 0 || options.max_results == 0 {
        return Err(bad_request("max_hops and limit must be at least 1"));
    }

    let results = bounded(&state, trace(&state.store, &seed, options)).await?;
    Ok(Json(TraceResponse { seed, results }))
}

// ============ GET /stats ============

async fn handle_stats(State(state): State<AppState>) -> Result<Json<StatsReport>, AppError> {
    Ok(Json(bounded(&state, collect_stats(&state.store)).await?))
}
