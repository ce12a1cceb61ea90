//! HTTP RPC server for the retrieval interfaces.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/rpc/match_by_interests` | Interests-vector similarity search |
//! | `POST` | `/rpc/hybrid_search` | Semantic + keyword search fused with RRF |
//!
//! Both RPCs accept either a precomputed `query_embedding` or a
//! `query_text` that the server embeds with the configured provider.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "rrf_k must be > 0" } }
//! ```
//!
//! Error codes: `bad_request` (400), `embeddings_disabled` (400),
//! `upstream` (502), `internal` (500).

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::config::{Config, RetrievalConfig};
use crate::embedding::{create_provider, embed_query, EmbeddingProvider};
use crate::search::{
    hybrid_search, match_by_interests, HybridMatch, HybridQuery, InterestMatch, QueryError,
};
use crate::store::{SqliteStore, Store};

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    pub retrieval: RetrievalConfig,
    pub store: Arc<dyn Store>,
    /// `None` when embeddings are disabled; text queries then cannot be
    /// embedded.
    pub provider: Option<Arc<dyn EmbeddingProvider>>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/rpc/match_by_interests", post(handle_match_by_interests))
        .route("/rpc/hybrid_search", post(handle_hybrid_search))
        .layer(cors)
        .with_state(state)
}

/// Starts the server on `[server].bind` and runs until the process ends.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let store = SqliteStore::open(config).await?;
    let provider: Option<Arc<dyn EmbeddingProvider>> = if config.embedding.is_enabled() {
        Some(Arc::from(create_provider(&config.embedding)?))
    } else {
        warn!("embeddings disabled, RPCs need a query_embedding or fall back to keywords");
        None
    };

    let app = router(AppState {
        retrieval: config.retrieval.clone(),
        store: Arc::new(store),
        provider,
    });

    let bind_addr = &config.server.bind;
    println!("rapport server listening on http://{}", bind_addr);
    info!(bind = %bind_addr, "server started");

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

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &str {
        self.code
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
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn embeddings_disabled() -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "embeddings_disabled",
        message: "query_text needs an embedding provider; send query_embedding instead".into(),
    }
}

fn upstream(err: anyhow::Error) -> AppError {
    AppError {
        status: StatusCode::BAD_GATEWAY,
        code: "upstream",
        message: format!("embedding service: {:#}", err),
    }
}

fn internal(err: anyhow::Error) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: format!("{:#}", err),
    }
}

/// Query problems are the caller's fault; anything else is ours.
fn search_error(err: anyhow::Error) -> AppError {
    match err.downcast_ref::<QueryError>() {
        Some(e) => bad_request(e.to_string()),
        None => internal(err),
    }
}

fn parse<T: DeserializeOwned>(body: Value) -> Result<T, AppError> {
    serde_json::from_value(body).map_err(|e| bad_request(format!("invalid request: {}", e)))
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

// ============ POST /rpc/match_by_interests ============

#[derive(Debug, Deserialize)]
pub struct MatchByInterestsRequest {
    #[serde(default)]
    pub query_embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub query_text: Option<String>,
    #[serde(default)]
    pub similarity_threshold: Option<f32>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct MatchByInterestsResponse {
    pub results: Vec<InterestMatch>,
}

pub async fn handle_match_by_interests(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<MatchByInterestsResponse>, AppError> {
    let req: MatchByInterestsRequest = parse(body)?;

    let embedding = match (req.query_embedding, req.query_text) {
        (Some(vec), _) => vec,
        (None, Some(text)) if !text.trim().is_empty() => {
            let provider = state.provider.as_ref().ok_or_else(embeddings_disabled)?;
            embed_query(provider.as_ref(), &text).await.map_err(upstream)?
        }
        _ => return Err(bad_request("query_embedding or query_text is required")),
    };
    if embedding.is_empty() {
        return Err(bad_request("query_embedding must not be empty"));
    }

    let threshold = req
        .similarity_threshold
        .unwrap_or(state.retrieval.similarity_threshold);
    let limit = req.limit.unwrap_or(state.retrieval.final_limit);
    let results = match_by_interests(state.store.as_ref(), &embedding, threshold, limit)
        .await
        .map_err(search_error)?;
    Ok(Json(MatchByInterestsResponse { results }))
}

// ============ POST /rpc/hybrid_search ============

#[derive(Debug, Default, Deserialize)]
pub struct HybridSearchRequest {
    #[serde(default)]
    pub query_text: String,
    #[serde(default)]
    pub query_embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub proximity_min: Option<i64>,
    #[serde(default)]
    pub capacity_min: Option<i64>,
    #[serde(default)]
    pub semantic_weight: Option<f64>,
    #[serde(default)]
    pub keyword_weight: Option<f64>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub rrf_k: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct HybridSearchResponse {
    pub results: Vec<HybridMatch>,
}

pub async fn handle_hybrid_search(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<HybridSearchResponse>, AppError> {
    let req: HybridSearchRequest = parse(body)?;

    let mut query = HybridQuery::new(&state.retrieval, req.query_text);
    query.proximity_min = req.proximity_min;
    query.capacity_min = req.capacity_min;
    if let Some(w) = req.semantic_weight {
        query.semantic_weight = w;
    }
    if let Some(w) = req.keyword_weight {
        query.keyword_weight = w;
    }
    if let Some(limit) = req.limit {
        query.limit = limit;
    }
    if let Some(k) = req.rrf_k {
        query.rrf_k = k;
    }
    if query.rrf_k.is_nan() || query.rrf_k <= 0.0 {
        return Err(bad_request("rrf_k must be > 0"));
    }
    if query.semantic_weight < 0.0 || query.keyword_weight < 0.0 {
        return Err(bad_request("weights must be >= 0"));
    }

    query.query_embedding = match req.query_embedding {
        Some(vec) => Some(vec),
        None if query.semantic_weight > 0.0 && !query.query_text.trim().is_empty() => {
            match &state.provider {
                Some(provider) => Some(
                    embed_query(provider.as_ref(), &query.query_text)
                        .await
                        .map_err(upstream)?,
                ),
                None => None,
            }
        }
        None => None,
    };

    let results = hybrid_search(state.store.as_ref(), &query)
        .await
        .map_err(search_error)?;
    Ok(Json(HybridSearchResponse { results }))
}
