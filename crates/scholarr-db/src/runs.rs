//! Run and per-scholar result repository.
//!
//! At most one non-terminal run exists per user; creation is guarded inside
//! a transaction so concurrent triggers cannot both slip through.

use chrono::{DateTime, Utc};
use scholarr_common::Result;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use std::sync::Arc;

use crate::database::Database;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum RunTrigger {
    Manual,
    Scheduled,
    Continuation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Resolving,
    Success,
    PartialFailure,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running | Self::Resolving)
    }
}

/// Terminal state of one scholar inside one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ScholarOutcome {
    Success,
    SkippedNoChange,
    ParseFailure,
    Blocked,
    NetworkError,
    UpsertException,
}

impl ScholarOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success | Self::SkippedNoChange)
    }
}

/// Coarse display state derived from the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ScholarResultState {
    Ok,
    Warning,
    Error,
}

impl From<ScholarOutcome> for ScholarResultState {
    fn from(outcome: ScholarOutcome) -> Self {
        match outcome {
            ScholarOutcome::Success | ScholarOutcome::SkippedNoChange => Self::Ok,
            ScholarOutcome::NetworkError => Self::Warning,
            ScholarOutcome::ParseFailure
            | ScholarOutcome::Blocked
            | ScholarOutcome::UpsertException => Self::Error,
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Run {
    pub id: i64,
    pub user_id: i64,
    pub trigger_kind: RunTrigger,
    pub status: RunStatus,
    pub start_dt: DateTime<Utc>,
    pub end_dt: Option<DateTime<Utc>>,
    pub scholar_count: i64,
    pub new_publication_count: i64,
    pub failed_count: i64,
    pub partial_count: i64,
    pub cancel_requested: bool,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct RunScholarResult {
    pub run_id: i64,
    pub scholar_profile_id: i64,
    pub outcome: ScholarOutcome,
    pub state: ScholarResultState,
    pub state_reason: Option<String>,
    pub publication_count: i64,
    pub attempt_count: i64,
    pub warnings: Json<Vec<String>>,
}

#[derive(Clone)]
pub struct RunRepository {
    db: Arc<Database>,
}

impl RunRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Create a pending run unless the user already has a non-terminal one.
    /// Returns the new run id, or `None` when a run is in flight.
    pub async fn create(
        &self,
        user_id: i64,
        trigger: RunTrigger,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>> {
        let mut tx = self.db.pool().begin().await?;
        let active: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM runs
             WHERE user_id = ?1 AND status IN ('pending', 'running', 'resolving')
             LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;
        if active.is_some() {
            return Ok(None);
        }

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO runs (user_id, trigger_kind, status, start_dt)
             VALUES (?1, ?2, 'pending', ?3)
             RETURNING id",
        )
        .bind(user_id)
        .bind(trigger)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(Some(id))
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<Run>> {
        let run = sqlx::query_as::<_, Run>("SELECT * FROM runs WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(run)
    }

    pub async fn find_active(&self, user_id: i64) -> Result<Option<Run>> {
        let run = sqlx::query_as::<_, Run>(
            "SELECT * FROM runs
             WHERE user_id = ?1 AND status IN ('pending', 'running', 'resolving')
             ORDER BY id DESC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(run)
    }

    pub async fn list_non_terminal(&self) -> Result<Vec<Run>> {
        let runs = sqlx::query_as::<_, Run>(
            "SELECT * FROM runs WHERE status IN ('pending', 'running', 'resolving') ORDER BY id",
        )
        .fetch_all(self.db.pool())
        .await?;
        Ok(runs)
    }

    pub async fn list_recent(&self, user_id: i64, limit: u32) -> Result<Vec<Run>> {
        let runs = sqlx::query_as::<_, Run>(
            "SELECT * FROM runs WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;
        Ok(runs)
    }

    /// Start instant of the user's most recent run, for interval scheduling.
    pub async fn last_start(&self, user_id: i64) -> Result<Option<DateTime<Utc>>> {
        let start = sqlx::query_scalar(
            "SELECT start_dt FROM runs WHERE user_id = ?1 ORDER BY id DESC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(start)
    }

    /// Most recent run that completed with links attached (success or
    /// partial failure); this anchors the publications `latest` mode.
    pub async fn latest_completed_run_id(&self, user_id: i64) -> Result<Option<i64>> {
        let id = sqlx::query_scalar(
            "SELECT id FROM runs
             WHERE user_id = ?1 AND status IN ('success', 'partial_failure')
             ORDER BY id DESC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(id)
    }

    pub async fn set_status(&self, run_id: i64, status: RunStatus) -> Result<()> {
        sqlx::query("UPDATE runs SET status = ?2 WHERE id = ?1")
            .bind(run_id)
            .bind(status)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    pub async fn set_scholar_count(&self, run_id: i64, scholar_count: i64) -> Result<()> {
        sqlx::query("UPDATE runs SET scholar_count = ?2 WHERE id = ?1")
            .bind(run_id)
            .bind(scholar_count)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Cooperative cancellation: flips the flag; the run driver observes it
    /// at the next scholar boundary. Returns false for terminal runs.
    pub async fn request_cancel(&self, run_id: i64) -> Result<bool> {
        let affected = sqlx::query(
            "UPDATE runs SET cancel_requested = 1
             WHERE id = ?1 AND status IN ('pending', 'running', 'resolving')",
        )
        .bind(run_id)
        .execute(self.db.pool())
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    pub async fn is_cancel_requested(&self, run_id: i64) -> Result<bool> {
        let flagged: Option<bool> =
            sqlx::query_scalar("SELECT cancel_requested FROM runs WHERE id = ?1")
                .bind(run_id)
                .fetch_optional(self.db.pool())
                .await?;
        Ok(flagged.unwrap_or(false))
    }

    pub async fn finalize(
        &self,
        run_id: i64,
        status: RunStatus,
        new_publication_count: i64,
        failed_count: i64,
        partial_count: i64,
        end_dt: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE runs
             SET status = ?2, new_publication_count = ?3, failed_count = ?4,
                 partial_count = ?5, end_dt = ?6
             WHERE id = ?1",
        )
        .bind(run_id)
        .bind(status)
        .bind(new_publication_count)
        .bind(failed_count)
        .bind(partial_count)
        .bind(end_dt)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Written once per (run, scholar) on finalization.
    pub async fn insert_scholar_result(&self, result: &RunScholarResult) -> Result<()> {
        sqlx::query(
            "INSERT INTO run_scholar_results
                 (run_id, scholar_profile_id, outcome, state, state_reason,
                  publication_count, attempt_count, warnings)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(result.run_id)
        .bind(result.scholar_profile_id)
        .bind(result.outcome)
        .bind(result.state)
        .bind(&result.state_reason)
        .bind(result.publication_count)
        .bind(result.attempt_count)
        .bind(&result.warnings)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    pub async fn list_scholar_results(&self, run_id: i64) -> Result<Vec<RunScholarResult>> {
        let results = sqlx::query_as::<_, RunScholarResult>(
            "SELECT * FROM run_scholar_results WHERE run_id = ?1 ORDER BY scholar_profile_id",
        )
        .bind(run_id)
        .fetch_all(self.db.pool())
        .await?;
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::UserRepository;

    async fn seed() -> (Arc<Database>, i64) {
        let db = Arc::new(Database::connect_memory().await.unwrap());
        let user_id = UserRepository::new(db.clone())
            .insert("ada@example.com", false, Utc::now())
            .await
            .unwrap();
        (db, user_id)
    }

    #[tokio::test]
    async fn only_one_non_terminal_run_per_user() {
        let (db, user_id) = seed().await;
        let repo = RunRepository::new(db);
        let now = Utc::now();

        let first = repo.create(user_id, RunTrigger::Manual, now).await.unwrap();
        assert!(first.is_some());
        let second = repo.create(user_id, RunTrigger::Scheduled, now).await.unwrap();
        assert!(second.is_none());

        // Finalizing frees the slot.
        repo.finalize(first.unwrap(), RunStatus::Success, 0, 0, 0, now)
            .await
            .unwrap();
        let third = repo.create(user_id, RunTrigger::Scheduled, now).await.unwrap();
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn cancel_only_applies_to_live_runs() {
        let (db, user_id) = seed().await;
        let repo = RunRepository::new(db);
        let now = Utc::now();

        let run_id = repo
            .create(user_id, RunTrigger::Manual, now)
            .await
            .unwrap()
            .unwrap();
        assert!(repo.request_cancel(run_id).await.unwrap());
        assert!(repo.is_cancel_requested(run_id).await.unwrap());

        repo.finalize(run_id, RunStatus::Cancelled, 0, 0, 0, now)
            .await
            .unwrap();
        assert!(!repo.request_cancel(run_id).await.unwrap());
    }

    #[tokio::test]
    async fn latest_completed_skips_failed_and_cancelled() {
        let (db, user_id) = seed().await;
        let repo = RunRepository::new(db);
        let now = Utc::now();

        let a = repo.create(user_id, RunTrigger::Manual, now).await.unwrap().unwrap();
        repo.finalize(a, RunStatus::Success, 3, 0, 0, now).await.unwrap();
        let b = repo.create(user_id, RunTrigger::Manual, now).await.unwrap().unwrap();
        repo.finalize(b, RunStatus::Failed, 0, 2, 0, now).await.unwrap();

        assert_eq!(repo.latest_completed_run_id(user_id).await.unwrap(), Some(a));
    }
}
