//! ActivityPub endpoints: actor profile, outbox submission/read, and the
//! followers/following/liked collection read views.
//!
//! Grounded on the route shape and per-request metrics timers of
//! `rustresort::api::activitypub::activitypub_router`; the inbox and
//! shared-inbox routes it also exposed are dropped, the inbox (receive)
//! pipeline being out of scope.

use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;

use crate::metrics::{HTTP_REQUESTS_TOTAL, HTTP_REQUEST_DURATION_SECONDS};
use crate::data::normalize;
use crate::error::AppError;
use crate::outbox::pipeline;
use crate::AppState;

pub fn outbox_router() -> Router<AppState> {
    Router::new()
        .route("/actors/:username", get(actor))
        .route("/outbox/:actor", post(submit).get(get_outbox))
        .route("/actors/:username/followers", get(followers))
        .route("/actors/:username/following", get(following))
        .route("/actors/:username/liked", get(liked))
}

fn actor_iri(state: &AppState, username: &str) -> String {
    format!("{}/actors/{}", state.config.server.base_url(), username)
}

async fn require_local_actor(state: &AppState, username: &str) -> Result<String, AppError> {
    let iri = actor_iri(state, username);
    state
        .actor_resolver
        .resolve_local(&iri)
        .await?
        .ok_or_else(|| AppError::UnknownActor(username.to_string()))?;
    Ok(iri)
}

async fn actor(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["GET", "/actors/:username"])
        .start_timer();

    let iri = actor_iri(&state, &username);
    let resolved = state
        .actor_resolver
        .resolve_local(&iri)
        .await?
        .ok_or_else(|| AppError::UnknownActor(username.clone()))?;

    HTTP_REQUESTS_TOTAL
        .with_label_values(&["GET", "/actors/:username", "200"])
        .inc();

    Ok(Json(resolved.document.clone()))
}

/// POST /outbox/:actor
///
/// Submits a new activity (or bare object) on behalf of a local actor.
/// `:actor` is the actor's username; ownership/auth of the posting user is
/// an external collaborator's concern and is assumed already established
/// by the time a request reaches this handler.
async fn submit(
    State(state): State<AppState>,
    Path(actor): Path<String>,
    headers: http::HeaderMap,
    body: axum::body::Bytes,
) -> Result<Json<serde_json::Value>, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["POST", "/outbox/:actor"])
        .start_timer();

    let content_type = headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    if !pipeline::accepts_media_type(content_type) {
        return Err(AppError::UnsupportedMediaType);
    }

    let actor_iri = require_local_actor(&state, &actor).await?;

    let raw: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|_| AppError::InvalidActivity("Invalid activity".to_string()))?;

    let iri = pipeline::run(&state.pipeline, &actor_iri, raw).await?;

    HTTP_REQUESTS_TOTAL
        .with_label_values(&["POST", "/outbox/:actor", "201"])
        .inc();

    Ok(Json(serde_json::json!({ "id": iri })))
}

#[derive(Debug, Deserialize)]
struct PageParams {
    /// Absent: plain `OrderedCollection` summary. `?page=true`: first page.
    /// `?page=<cursor>`: the page starting strictly after that cursor.
    page: Option<String>,
    #[serde(rename = "pageSize")]
    page_size: Option<i64>,
}

/// GET /outbox/:actor
///
/// Paginated outbox collection, newest activity first.
async fn get_outbox(
    State(state): State<AppState>,
    Path(actor): Path<String>,
    Query(params): Query<PageParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    let actor_iri = require_local_actor(&state, &actor).await?;
    let collection_iri = format!("{actor_iri}/outbox");
    collection_response(&state, &collection_iri, params).await
}

async fn liked(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(params): Query<PageParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    let actor_iri = require_local_actor(&state, &username).await?;
    let collection_iri = format!("{actor_iri}/liked");
    collection_response(&state, &collection_iri, params).await
}

async fn collection_response(
    state: &AppState,
    collection_iri: &str,
    params: PageParams,
) -> Result<Json<serde_json::Value>, AppError> {
    let total = state.collections.total_items(collection_iri).await?;

    let Some(page_param) = params.page.as_deref() else {
        return Ok(Json(serde_json::json!({
            "@context": normalize::default_context(),
            "type": "OrderedCollection",
            "id": collection_iri,
            "totalItems": total,
            "first": format!("{collection_iri}?page=true"),
        })));
    };

    let cursor = if page_param == "true" { None } else { Some(page_param) };

    let page = state
        .collections
        .page_stream(collection_iri, cursor, params.page_size)
        .await?;

    let next = page
        .next_cursor
        .as_deref()
        .map(|cursor| format!("{collection_iri}?page={cursor}"));

    Ok(Json(serde_json::json!({
        "@context": normalize::default_context(),
        "type": "OrderedCollectionPage",
        "id": format!("{collection_iri}?page={page_param}"),
        "partOf": collection_iri,
        "totalItems": total,
        "orderedItems": page.items,
        "next": next,
    })))
}

async fn followers(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let actor_iri = require_local_actor(&state, &username).await?;
    let collection_iri = format!("{actor_iri}/followers");
    members_response(&state, &collection_iri).await
}

async fn following(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let actor_iri = require_local_actor(&state, &username).await?;
    let collection_iri = format!("{actor_iri}/following");
    members_response(&state, &collection_iri).await
}

async fn members_response(
    state: &AppState,
    collection_iri: &str,
) -> Result<Json<serde_json::Value>, AppError> {
    let members = state.collections.list_members(collection_iri).await?;

    Ok(Json(serde_json::json!({
        "@context": normalize::default_context(),
        "type": "OrderedCollection",
        "id": collection_iri,
        "totalItems": members.len(),
        "orderedItems": members,
    })))
}
