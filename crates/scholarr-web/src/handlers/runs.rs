//! Run endpoints: manual trigger, cancel, history.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use scholarr_db::runs::RunRepository;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::CurrentUser;
use crate::envelope::{ok, ApiError, ApiResult};
use crate::state::AppState;
use scholarr_runtime::safety::Refusal;
use scholarr_runtime::scheduler::ManualRunOutcome;

#[derive(Debug, Deserialize, Default)]
pub struct TriggerBody {
    #[serde(default)]
    pub force: bool,
}

pub async fn trigger_run(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    body: Option<Json<TriggerBody>>,
) -> ApiResult<Json<Value>> {
    let force = body.map(|Json(b)| b.force).unwrap_or(false);
    match state.scheduler.request_manual_run(&user, force).await? {
        ManualRunOutcome::Started(run) | ManualRunOutcome::InFlight(run) => Ok(ok(run)),
        ManualRunOutcome::Refused(refusal) => Err(refusal_error(refusal)),
    }
}

fn refusal_error(refusal: Refusal) -> ApiError {
    match refusal {
        Refusal::CooldownActive { state: safety } => ApiError::new(
            StatusCode::CONFLICT,
            "scrape_cooldown_active",
            "scrape safety cooldown is active",
        )
        .with_details(json!({ "safety_state": safety })),
        Refusal::ManualRunsDisabled => ApiError::new(
            StatusCode::FORBIDDEN,
            "manual_runs_disabled",
            "manual runs are disabled by server policy",
        ),
        Refusal::AutomationDisabled => ApiError::new(
            StatusCode::FORBIDDEN,
            "automation_disabled",
            "automated runs are disabled by server policy",
        ),
        Refusal::RunInProgress { run_id } => ApiError::new(
            StatusCode::CONFLICT,
            "run_in_progress",
            "a run is already in progress",
        )
        .with_details(json!({ "run_id": run_id })),
    }
}

pub async fn cancel_run(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(run_id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let runs = RunRepository::new(state.db.clone());
    let run = runs
        .find_by_id(run_id)
        .await
        .map_err(ApiError::from)?
        .filter(|run| run.user_id == user.id)
        .ok_or_else(|| ApiError::not_found(format!("run {run_id}")))?;

    let cancelled = runs.request_cancel(run.id).await.map_err(ApiError::from)?;
    Ok(ok(json!({ "run_id": run.id, "cancel_requested": cancelled })))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    20
}

pub async fn list_runs(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Value>> {
    let runs = RunRepository::new(state.db.clone())
        .list_recent(user.id, query.limit.clamp(1, 100))
        .await
        .map_err(ApiError::from)?;
    let safety_state = state.safety.state(user.id).await.map_err(ApiError::from)?;
    Ok(ok(json!({ "runs": runs, "safety_state": safety_state })))
}

pub async fn get_run(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(run_id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let repo = RunRepository::new(state.db.clone());
    let run = repo
        .find_by_id(run_id)
        .await
        .map_err(ApiError::from)?
        .filter(|run| run.user_id == user.id)
        .ok_or_else(|| ApiError::not_found(format!("run {run_id}")))?;
    let results = repo.list_scholar_results(run.id).await.map_err(ApiError::from)?;
    Ok(ok(json!({ "run": run, "scholar_results": results })))
}
