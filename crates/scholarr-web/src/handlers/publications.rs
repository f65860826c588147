//! Publication listing and per-user read/favorite state.

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use scholarr_db::links::LinkRepository;
use scholarr_db::publications::{ListMode, ListQuery, PublicationRepository, SortBy};
use scholarr_db::runs::RunRepository;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::CurrentUser;
use crate::envelope::{ok, ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PublicationsQuery {
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub scholar: Option<i64>,
    #[serde(default)]
    pub favorite: Option<bool>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub sort_by: Option<String>,
    #[serde(default)]
    pub sort_dir: Option<String>,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default)]
    pub snapshot: Option<DateTime<Utc>>,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    50
}

pub async fn list_publications(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Query(query): Query<PublicationsQuery>,
) -> ApiResult<Json<Value>> {
    let mode = match query.mode.as_deref() {
        None | Some("all") => ListMode::All,
        Some("unread") => ListMode::Unread,
        // `new` is a legacy alias for `latest`; both stay accepted.
        Some("latest") | Some("new") => ListMode::Latest,
        Some(other) => {
            return Err(ApiError::bad_request(format!("unknown mode {other:?}")));
        }
    };
    let sort_by = match query.sort_by.as_deref() {
        None | Some("first_seen") => SortBy::FirstSeen,
        Some("title") => SortBy::Title,
        Some("year") => SortBy::Year,
        Some("citations") => SortBy::Citations,
        Some(other) => {
            return Err(ApiError::bad_request(format!("unknown sort_by {other:?}")));
        }
    };
    let sort_desc = match query.sort_dir.as_deref() {
        None | Some("desc") => true,
        Some("asc") => false,
        Some(other) => {
            return Err(ApiError::bad_request(format!("unknown sort_dir {other:?}")));
        }
    };

    let latest_run_id = if mode == ListMode::Latest {
        RunRepository::new(state.db.clone())
            .latest_completed_run_id(user.id)
            .await
            .map_err(ApiError::from)?
    } else {
        None
    };

    let page = PublicationRepository::new(state.db.clone())
        .list_for_user(
            user.id,
            &ListQuery {
                mode,
                scholar_profile_id: query.scholar,
                favorite_only: query.favorite.unwrap_or(false),
                search: query.search.clone(),
                sort_by,
                sort_desc,
                page: query.page.max(1),
                page_size: query.page_size,
                snapshot: query.snapshot,
                latest_run_id,
            },
        )
        .await
        .map_err(ApiError::from)?;

    Ok(ok(page))
}

pub async fn mark_all_read(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> ApiResult<Json<Value>> {
    let marked = LinkRepository::new(state.db.clone())
        .mark_all_read(user.id)
        .await
        .map_err(ApiError::from)?;
    Ok(ok(json!({ "marked": marked })))
}

#[derive(Debug, Deserialize)]
pub struct MarkSelectedBody {
    pub publication_ids: Vec<i64>,
}

pub async fn mark_selected_read(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(body): Json<MarkSelectedBody>,
) -> ApiResult<Json<Value>> {
    if body.publication_ids.is_empty() {
        return Err(ApiError::bad_request("publication_ids must not be empty"));
    }
    let marked = LinkRepository::new(state.db.clone())
        .mark_selected_read(user.id, &body.publication_ids)
        .await
        .map_err(ApiError::from)?;
    Ok(ok(json!({ "marked": marked })))
}

#[derive(Debug, Deserialize, Default)]
pub struct FavoriteBody {
    #[serde(default = "default_favorite")]
    pub favorite: bool,
}

fn default_favorite() -> bool {
    true
}

pub async fn set_favorite(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(publication_id): Path<i64>,
    body: Option<Json<FavoriteBody>>,
) -> ApiResult<Json<Value>> {
    let favorite = body.map(|Json(b)| b.favorite).unwrap_or(true);
    let applied = LinkRepository::new(state.db.clone())
        .set_favorite(user.id, publication_id, favorite)
        .await
        .map_err(ApiError::from)?;
    if !applied {
        return Err(ApiError::not_found(format!("publication {publication_id}")));
    }
    Ok(ok(json!({ "publication_id": publication_id, "favorite": favorite })))
}

pub async fn retry_pdf(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(publication_id): Path<i64>,
) -> ApiResult<Json<Value>> {
    // The publication must be visible to this user through one of their links.
    let visible = LinkRepository::new(state.db.clone())
        .find_for_user(user.id, publication_id)
        .await
        .map_err(ApiError::from)?;
    if visible.is_none() {
        return Err(ApiError::not_found(format!("publication {publication_id}")));
    }

    let requeued = state
        .pdf
        .retry_publication(publication_id)
        .await
        .map_err(ApiError::from)?;
    if !requeued {
        return Err(ApiError::not_found(format!("publication {publication_id}")));
    }
    Ok(ok(json!({ "publication_id": publication_id, "pdf_status": "queued" })))
}
