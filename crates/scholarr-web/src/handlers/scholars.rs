//! Scholar profile management and name search.

use axum::extract::State;
use axum::Json;
use scholarr_common::{Clock, ScholarrError};
use scholarr_db::scholars::ScholarRepository;
use serde::Deserialize;
use serde_json::Value;

use crate::auth::CurrentUser;
use crate::envelope::{ok, ApiError, ApiResult};
use crate::state::AppState;

pub async fn list_scholars(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> ApiResult<Json<Value>> {
    let scholars = ScholarRepository::new(state.db.clone())
        .list_for_user(user.id)
        .await
        .map_err(ApiError::from)?;
    Ok(ok(scholars))
}

#[derive(Debug, Deserialize)]
pub struct CreateScholarBody {
    pub scholar_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

pub async fn create_scholar(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(body): Json<CreateScholarBody>,
) -> ApiResult<Json<Value>> {
    let scholar_id = body.scholar_id.trim();
    if scholar_id.len() != 12 || !scholar_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(ApiError::bad_request(
            "scholar_id must be the 12-character id from the profile URL",
        ));
    }

    let repo = ScholarRepository::new(state.db.clone());
    let display_name = body.display_name.as_deref().unwrap_or(scholar_id);
    let id = repo
        .insert(user.id, scholar_id, display_name, state.clock.now())
        .await
        .map_err(|err| match err {
            ScholarrError::Database(db_err)
                if db_err
                    .as_database_error()
                    .map(|e| e.is_unique_violation())
                    .unwrap_or(false) =>
            {
                ApiError::bad_request("scholar is already tracked")
            }
            other => ApiError::from(other),
        })?;

    let scholar = repo
        .find_by_id(id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found("scholar just created"))?;
    Ok(ok(scholar))
}

#[derive(Debug, Deserialize)]
pub struct SearchBody {
    pub name: String,
}

pub async fn search_scholars(
    State(state): State<AppState>,
    CurrentUser(_user): CurrentUser,
    Json(body): Json<SearchBody>,
) -> ApiResult<Json<Value>> {
    let hits = state
        .name_search
        .search(&body.name)
        .await
        .map_err(ApiError::from)?;
    Ok(ok(hits))
}
