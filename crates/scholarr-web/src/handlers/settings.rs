//! User settings endpoint.
//!
//! The response carries a `policy` block with the server floors and allowed
//! flags so the UI enforces exactly what the server enforces. A PUT with a
//! value below a floor is rejected; sub-floor values are never persisted.

use axum::extract::State;
use axum::Json;
use scholarr_db::users::{UserRepository, UserSettings};
use serde_json::{json, Value};

use crate::auth::CurrentUser;
use crate::envelope::{ok, ApiError, ApiResult};
use crate::state::AppState;

fn policy(state: &AppState) -> Value {
    json!({
        "min_request_delay_seconds": state.settings.ingestion.min_request_delay_seconds,
        "min_run_interval_minutes": state.settings.ingestion.min_run_interval_minutes,
        "manual_runs_enabled": state.settings.policy.manual_runs_enabled,
        "automation_enabled": state.settings.policy.automation_enabled,
    })
}

pub async fn get_settings(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> ApiResult<Json<Value>> {
    let safety_state = state.safety.state(user.id).await.map_err(ApiError::from)?;
    Ok(ok(json!({
        "settings": user.settings.0,
        "policy": policy(&state),
        "safety_state": safety_state,
    })))
}

pub async fn put_settings(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(body): Json<UserSettings>,
) -> ApiResult<Json<Value>> {
    let floors = &state.settings.ingestion;
    if body.request_delay_seconds < floors.min_request_delay_seconds {
        return Err(ApiError::bad_request(format!(
            "request_delay_seconds must be at least {}",
            floors.min_request_delay_seconds
        )));
    }
    if body.run_interval_minutes < floors.min_run_interval_minutes {
        return Err(ApiError::bad_request(format!(
            "run_interval_minutes must be at least {}",
            floors.min_run_interval_minutes
        )));
    }

    UserRepository::new(state.db.clone())
        .update_settings(user.id, &body)
        .await
        .map_err(ApiError::from)?;

    let safety_state = state.safety.state(user.id).await.map_err(ApiError::from)?;
    Ok(ok(json!({
        "settings": body,
        "policy": policy(&state),
        "safety_state": safety_state,
    })))
}
