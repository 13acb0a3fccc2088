use anyhow::Result;
use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use url::Url;

use super::AppState;
use crate::clustering::{
    list_candidates, list_clusters, refresh_clusters, CandidatePage, ClusterPage, RefreshOutcome,
    ReviewQuery,
};
use crate::db::raw::NewRawArticle;
use crate::review::{
    apply_decisions, edit_review, reorder, BatchMode, DecisionItem, DecisionOutcome,
    DecisionResult, InvalidRequest, ReorderRequest, ReviewEdit,
};
use crate::TARGET_WEB_REQUEST;

/// Error returned by handlers: a status code plus a JSON message.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        if let Some(invalid) = e.downcast_ref::<InvalidRequest>() {
            return ApiError::bad_request(invalid.to_string());
        }
        error!(target: TARGET_WEB_REQUEST, "Request failed: {:?}", e);
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal error".to_string(),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        anyhow::Error::from(e).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// Builds the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/clusters", get(get_clusters))
        .route("/api/clusters/refresh", post(post_refresh))
        .route("/api/candidates", get(get_candidates))
        .route("/api/decisions", post(post_decisions))
        .route("/api/reviews/{id}/edit", post(post_edit))
        .route("/api/reorder", post(post_reorder))
        .route("/api/raw-articles", post(post_raw_article))
        .route("/status", get(status_check))
        .with_state(state)
}

/// Runs the API server until it fails.
pub async fn app_api_loop(state: AppState) -> Result<()> {
    let addr = format!("0.0.0.0:{}", state.settings.port);
    let app = router(state);

    let listener = TcpListener::bind(&addr).await?;
    info!(target: TARGET_WEB_REQUEST, "Server running on http://{}", addr);

    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

async fn status_check() -> StatusCode {
    StatusCode::OK
}

async fn get_clusters(
    State(state): State<AppState>,
    Query(query): Query<ReviewQuery>,
) -> Result<Json<ClusterPage>, ApiError> {
    let page = list_clusters(&state.db, &state.settings, state.grouper.as_ref(), &query).await?;
    Ok(Json(page))
}

async fn get_candidates(
    State(state): State<AppState>,
    Query(query): Query<ReviewQuery>,
) -> Result<Json<CandidatePage>, ApiError> {
    let page = list_candidates(&state.db, &state.settings, &query).await?;
    Ok(Json(page))
}

async fn post_refresh(State(state): State<AppState>) -> Result<Json<RefreshOutcome>, ApiError> {
    let outcome = refresh_clusters(&state.db, &state.settings, state.grouper.as_ref()).await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
struct DecisionsRequest {
    items: Vec<DecisionItem>,
    #[serde(default)]
    strict: bool,
    #[serde(default)]
    actor: Option<String>,
}

#[derive(Debug, Serialize)]
struct DecisionsResponse {
    results: Vec<DecisionResult>,
}

async fn post_decisions(
    State(state): State<AppState>,
    Json(request): Json<DecisionsRequest>,
) -> Result<Json<DecisionsResponse>, ApiError> {
    if request.items.is_empty() {
        return Err(ApiError::bad_request("no decisions given"));
    }
    let mode = if request.strict {
        BatchMode::Strict
    } else {
        BatchMode::BestEffort
    };
    info!(target: TARGET_WEB_REQUEST, "{} decisions from {:?} ({:?})", request.items.len(), request.actor, mode);

    let results =
        apply_decisions(&state.db, &request.items, mode, request.actor.as_deref()).await?;
    Ok(Json(DecisionsResponse { results }))
}

#[derive(Debug, Deserialize)]
struct EditRequest {
    #[serde(flatten)]
    edit: ReviewEdit,
    #[serde(default)]
    actor: Option<String>,
}

async fn post_edit(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<EditRequest>,
) -> Result<Json<DecisionResult>, ApiError> {
    let outcome: DecisionOutcome =
        edit_review(&state.db, id, &request.edit, request.actor.as_deref()).await?;
    Ok(Json(DecisionResult { id, outcome }))
}

async fn post_reorder(
    State(state): State<AppState>,
    Json(request): Json<ReorderRequest>,
) -> Result<Json<DecisionsResponse>, ApiError> {
    let results = reorder(&state.db, &request).await?;
    Ok(Json(DecisionsResponse { results }))
}

#[derive(Debug, Serialize)]
struct RawArticleResponse {
    id: i64,
    backfilled: bool,
}

/// Crawler hand-off. A known URL returns the existing id; a body sent for a known article
/// that had none fills it in.
async fn post_raw_article(
    State(state): State<AppState>,
    Json(article): Json<NewRawArticle>,
) -> Result<Json<RawArticleResponse>, ApiError> {
    if let Err(e) = Url::parse(&article.url) {
        warn!(target: TARGET_WEB_REQUEST, "Rejected raw article with URL {:?}: {}", article.url, e);
        return Err(ApiError::bad_request(format!("invalid url: {}", e)));
    }
    if article.title.trim().is_empty() {
        return Err(ApiError::bad_request("title is required"));
    }

    let id = state.db.add_raw_article(&article).await?;
    let backfilled = match article.body.as_deref() {
        Some(body) => state.db.backfill_raw_body(id, body).await?,
        None => false,
    };
    Ok(Json(RawArticleResponse { id, backfilled }))
}
