//! Safety state repository: exactly one row per user, mutated only by the
//! safety controller during run finalization.

use chrono::{DateTime, Utc};
use scholarr_common::Result;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::sync::Arc;

use crate::database::Database;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum CooldownReason {
    Blocked,
    Network,
    None,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SafetyState {
    pub user_id: i64,
    pub cooldown_active: bool,
    pub cooldown_reason: CooldownReason,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub consecutive_blocked_runs: i64,
    pub consecutive_network_runs: i64,
    pub cooldown_entry_count: i64,
    pub blocked_start_count: i64,
    pub last_evaluated_run_id: Option<i64>,
}

impl SafetyState {
    fn fresh(user_id: i64) -> Self {
        Self {
            user_id,
            cooldown_active: false,
            cooldown_reason: CooldownReason::None,
            cooldown_until: None,
            consecutive_blocked_runs: 0,
            consecutive_network_runs: 0,
            cooldown_entry_count: 0,
            blocked_start_count: 0,
            last_evaluated_run_id: None,
        }
    }
}

#[derive(Clone)]
pub struct SafetyRepository {
    db: Arc<Database>,
}

impl SafetyRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub async fn get_or_create(&self, user_id: i64) -> Result<SafetyState> {
        sqlx::query("INSERT OR IGNORE INTO safety_state (user_id) VALUES (?1)")
            .bind(user_id)
            .execute(self.db.pool())
            .await?;
        let state = sqlx::query_as::<_, SafetyState>(
            "SELECT * FROM safety_state WHERE user_id = ?1",
        )
        .bind(user_id)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(state.unwrap_or_else(|| SafetyState::fresh(user_id)))
    }

    pub async fn save(&self, state: &SafetyState) -> Result<()> {
        sqlx::query(
            "INSERT INTO safety_state
                 (user_id, cooldown_active, cooldown_reason, cooldown_until,
                  consecutive_blocked_runs, consecutive_network_runs,
                  cooldown_entry_count, blocked_start_count, last_evaluated_run_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT (user_id) DO UPDATE SET
                 cooldown_active = excluded.cooldown_active,
                 cooldown_reason = excluded.cooldown_reason,
                 cooldown_until = excluded.cooldown_until,
                 consecutive_blocked_runs = excluded.consecutive_blocked_runs,
                 consecutive_network_runs = excluded.consecutive_network_runs,
                 cooldown_entry_count = excluded.cooldown_entry_count,
                 blocked_start_count = excluded.blocked_start_count,
                 last_evaluated_run_id = excluded.last_evaluated_run_id",
        )
        .bind(state.user_id)
        .bind(state.cooldown_active)
        .bind(state.cooldown_reason)
        .bind(state.cooldown_until)
        .bind(state.consecutive_blocked_runs)
        .bind(state.consecutive_network_runs)
        .bind(state.cooldown_entry_count)
        .bind(state.blocked_start_count)
        .bind(state.last_evaluated_run_id)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }
}
