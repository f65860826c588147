//! Liveness endpoint for container orchestration. Unauthenticated.

use axum::extract::State;
use axum::Json;
use scholarr_common::Clock;
use scholarr_db::queues::PdfQueueRepository;
use serde_json::{json, Value};

use crate::envelope::ok;
use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let pdf_pending = PdfQueueRepository::new(state.db.clone())
        .pending_count(state.clock.now())
        .await
        .unwrap_or(-1);
    ok(json!({
        "status": "ok",
        "scheduler_last_tick": state.scheduler.last_tick(),
        "pdf_queue_pending": pdf_pending,
    }))
}
