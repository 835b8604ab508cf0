//! HTTP surface over the knowledge core.
//!
//! Thin JSON endpoints over the library operations. The caller supplies an
//! [`AuthScope`] in the request body where visibility matters; the server
//! never invents one. File-path ingestion is deliberately absent here — it
//! is a CLI-only source, so the server never reads server-local paths.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::Config;
use crate::error::Error;
use crate::ingest::{self, FactSource, IngestParams, NewFactMeta};
use crate::models::{AuthScope, FileAction, RagQuery, SearchQuery, VerificationConfig};
use crate::provider::ModelProvider;
use crate::search::{self, SearchParams};
use crate::session;
use crate::store::FactStore;
use crate::verify;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn FactStore>,
    pub provider: Arc<dyn ModelProvider>,
    pub search_params: SearchParams,
    pub ingest_params: IngestParams,
    pub verification_defaults: VerificationConfig,
}

struct AppError(Error);

impl From<Error> for AppError {
    fn from(e: Error) -> Self {
        AppError(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            Error::InvalidArgument(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Error::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            Error::UpstreamUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "upstream_unavailable")
            }
            Error::PartialFailure { .. } => (StatusCode::MULTI_STATUS, "partial_failure"),
            Error::Database(_) | Error::Config(_) | Error::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        let body = json!({ "error": { "code": code, "message": self.0.to_string() } });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, AppError>;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/search", post(search_handler))
        .route("/rag-search", post(rag_handler))
        .route("/facts", post(ingest_handler))
        .route("/facts/{id}", get(get_fact).delete(delete_fact))
        .route("/facts/bulk-delete", post(bulk_delete_handler))
        .route("/pending", get(list_pending))
        .route("/pending/{id}/approve", post(approve_handler))
        .route("/pending/{id}/reject", post(reject_handler))
        .route("/pending/bulk-approve", post(bulk_approve_handler))
        .route("/pending/bulk-reject", post(bulk_reject_handler))
        .route(
            "/verification/config",
            get(get_verification_config).put(put_verification_config),
        )
        .route("/sessions/{id}/facts", get(session_facts))
        .route(
            "/sessions/{id}/facts/{fact_id}/preserve",
            put(preserve_one),
        )
        .route("/sessions/{id}/preserve", post(preserve_bulk))
        .route("/sessions/{id}/resolve", post(resolve_session_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the server until the process is stopped.
pub async fn serve(config: &Config, state: AppState) -> anyhow::Result<()> {
    let addr: SocketAddr = config.server.bind.parse()?;
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

// ============ Retrieval ============

#[derive(Deserialize)]
struct ScopedSearchRequest {
    #[serde(default)]
    scope: AuthScope,
    #[serde(flatten)]
    query: SearchQuery,
}

async fn search_handler(
    State(state): State<AppState>,
    Json(req): Json<ScopedSearchRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let resp = search::search(
        state.store.as_ref(),
        state.provider.as_ref(),
        &req.scope,
        &req.query,
        &state.search_params,
    )
    .await?;
    Ok(Json(serde_json::to_value(resp).map_err(Error::from)?))
}

#[derive(Deserialize)]
struct ScopedRagRequest {
    #[serde(default)]
    scope: AuthScope,
    #[serde(flatten)]
    query: RagQuery,
}

async fn rag_handler(
    State(state): State<AppState>,
    Json(req): Json<ScopedRagRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let answer = search::rag_search(
        state.store.as_ref(),
        state.provider.as_ref(),
        &req.scope,
        &req.query,
        &state.search_params,
    )
    .await?;
    Ok(Json(serde_json::to_value(answer).map_err(Error::from)?))
}

// ============ Ingestion ============

#[derive(Deserialize)]
struct IngestRequest {
    #[serde(default)]
    scope: AuthScope,
    /// Inline content. Exactly one of `content` / `url` must be set.
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(flatten)]
    meta: NewFactMeta,
}

async fn ingest_handler(
    State(state): State<AppState>,
    Json(req): Json<IngestRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let source = match (req.content, req.url) {
        (Some(text), None) => FactSource::Text(text),
        (None, Some(url)) => FactSource::Url(url),
        _ => {
            return Err(Error::invalid("provide exactly one of content or url").into());
        }
    };
    let vcfg = verify::get_config(state.store.as_ref(), &state.verification_defaults).await?;
    let outcome = ingest::ingest(
        state.store.as_ref(),
        state.provider.as_ref(),
        &req.scope,
        source,
        req.meta,
        &vcfg,
        &state.ingest_params,
    )
    .await?;
    Ok(Json(serde_json::to_value(outcome).map_err(Error::from)?))
}

#[derive(Deserialize)]
struct ScopeQuery {
    #[serde(default)]
    principal: Option<String>,
}

async fn get_fact(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<ScopeQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let fact = state
        .store
        .get_fact(&id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("fact {} not found", id)))?;
    let scope = AuthScope {
        principal: q.principal.unwrap_or_else(|| "anonymous".to_string()),
        ..AuthScope::default()
    };
    if !fact.visible_to(&scope) {
        // Indistinguishable from absence for unauthorized callers.
        return Err(Error::NotFound(format!("fact {} not found", id)).into());
    }
    Ok(Json(serde_json::to_value(fact).map_err(Error::from)?))
}

async fn delete_fact(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    if state.store.delete_fact(&id).await? {
        Ok(Json(json!({ "deleted": id })))
    } else {
        Err(Error::NotFound(format!("fact {} not found", id)).into())
    }
}

#[derive(Deserialize)]
struct IdsRequest {
    ids: Vec<String>,
}

async fn bulk_delete_handler(
    State(state): State<AppState>,
    Json(req): Json<IdsRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let outcome = session::bulk_delete(Arc::clone(&state.store), req.ids).await?;
    Ok(Json(serde_json::to_value(outcome).map_err(Error::from)?))
}

// ============ Verification ============

#[derive(Deserialize)]
struct PageQuery {
    #[serde(default = "default_page")]
    page: i64,
    #[serde(default)]
    page_size: Option<i64>,
}

fn default_page() -> i64 {
    1
}

async fn list_pending(
    State(state): State<AppState>,
    Query(q): Query<PageQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let cfg = verify::get_config(state.store.as_ref(), &state.verification_defaults).await?;
    let page = verify::list_pending(state.store.as_ref(), q.page, q.page_size, &cfg).await?;
    Ok(Json(serde_json::to_value(page).map_err(Error::from)?))
}

/// Reviewer identity for approve/reject. The caller's scope names who is
/// acting; it defaults to the anonymous principal when omitted.
#[derive(Deserialize, Default)]
struct ReviewRequest {
    #[serde(default)]
    scope: AuthScope,
}

async fn approve_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<ReviewRequest>>,
) -> ApiResult<Json<serde_json::Value>> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let outcome = verify::approve(state.store.as_ref(), &id, &req.scope.principal).await?;
    Ok(Json(serde_json::to_value(outcome).map_err(Error::from)?))
}

#[derive(Deserialize, Default)]
struct RejectRequest {
    #[serde(default)]
    scope: AuthScope,
    #[serde(default)]
    delete: Option<bool>,
}

async fn reject_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<RejectRequest>>,
) -> ApiResult<Json<serde_json::Value>> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let cfg = verify::get_config(state.store.as_ref(), &state.verification_defaults).await?;
    let outcome = verify::reject(
        state.store.as_ref(),
        &id,
        &req.scope.principal,
        req.delete,
        &cfg,
    )
    .await?;
    Ok(Json(serde_json::to_value(outcome).map_err(Error::from)?))
}

#[derive(Deserialize)]
struct BulkReviewRequest {
    #[serde(default)]
    scope: AuthScope,
    ids: Vec<String>,
    #[serde(default)]
    delete: Option<bool>,
}

async fn bulk_approve_handler(
    State(state): State<AppState>,
    Json(req): Json<BulkReviewRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let outcome =
        verify::bulk_approve(Arc::clone(&state.store), req.ids, &req.scope.principal).await?;
    Ok(Json(serde_json::to_value(outcome).map_err(Error::from)?))
}

async fn bulk_reject_handler(
    State(state): State<AppState>,
    Json(req): Json<BulkReviewRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let cfg = verify::get_config(state.store.as_ref(), &state.verification_defaults).await?;
    let outcome = verify::bulk_reject(
        Arc::clone(&state.store),
        req.ids,
        &req.scope.principal,
        req.delete,
        &cfg,
    )
    .await?;
    Ok(Json(serde_json::to_value(outcome).map_err(Error::from)?))
}

async fn get_verification_config(
    State(state): State<AppState>,
) -> ApiResult<Json<serde_json::Value>> {
    let cfg = verify::get_config(state.store.as_ref(), &state.verification_defaults).await?;
    Ok(Json(serde_json::to_value(cfg).map_err(Error::from)?))
}

async fn put_verification_config(
    State(state): State<AppState>,
    Json(cfg): Json<VerificationConfig>,
) -> ApiResult<Json<serde_json::Value>> {
    verify::update_config(state.store.as_ref(), &cfg).await?;
    Ok(Json(serde_json::to_value(cfg).map_err(Error::from)?))
}

// ============ Sessions ============

async fn session_facts(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let records = session::list_session_facts(state.store.as_ref(), &id).await?;
    Ok(Json(serde_json::to_value(records).map_err(Error::from)?))
}

#[derive(Deserialize)]
struct PreserveRequest {
    preserve: bool,
}

async fn preserve_one(
    State(state): State<AppState>,
    Path((id, fact_id)): Path<(String, String)>,
    Json(req): Json<PreserveRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    session::set_preserve(state.store.as_ref(), &id, &fact_id, req.preserve).await?;
    Ok(Json(json!({ "fact_id": fact_id, "preserve": req.preserve })))
}

#[derive(Deserialize)]
struct BulkPreserveRequest {
    fact_ids: Vec<String>,
    preserve: bool,
}

async fn preserve_bulk(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<BulkPreserveRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let outcome =
        session::bulk_preserve(Arc::clone(&state.store), &id, req.fact_ids, req.preserve).await?;
    Ok(Json(serde_json::to_value(outcome).map_err(Error::from)?))
}

#[derive(Deserialize)]
struct ResolveRequest {
    #[serde(default = "default_file_action")]
    file_action: FileAction,
}

fn default_file_action() -> FileAction {
    FileAction::Delete
}

async fn resolve_session_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<ResolveRequest>>,
) -> ApiResult<Json<serde_json::Value>> {
    let req = body.map(|Json(r)| r).unwrap_or(ResolveRequest {
        file_action: FileAction::Delete,
    });
    let resolution =
        session::resolve_session(Arc::clone(&state.store), &id, req.file_action).await?;
    Ok(Json(serde_json::to_value(resolution).map_err(Error::from)?))
}
