//! Server-Sent Events stream for a run's live events.

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_core::Stream;
use scholarr_db::runs::RunRepository;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::auth::CurrentUser;
use crate::envelope::ApiError;
use crate::state::AppState;

/// SSE endpoint for one run's topic. The stream ends after `run_completed`;
/// events missed before connecting are not replayed, so clients reconcile
/// over the REST listing.
pub async fn run_stream(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(run_id): Path<i64>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let run = RunRepository::new(state.db.clone())
        .find_by_id(run_id)
        .await
        .map_err(ApiError::from)?
        .filter(|run| run.user_id == user.id)
        .ok_or_else(|| ApiError::not_found(format!("run {run_id}")))?;

    let rx = state.events.subscribe(run.id);
    let stream = BroadcastStream::new(rx).filter_map(|result| {
        // Lagged receivers drop their oldest events; the stream continues.
        result.ok().and_then(|event| {
            serde_json::to_string(&event)
                .ok()
                .map(|data| Ok(Event::default().data(data)))
        })
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    ))
}
