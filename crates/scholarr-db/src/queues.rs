//! Continuation and PDF resolution queues.
//!
//! Both queues are persisted so interrupted work survives a crash. The PDF
//! queue hands items to workers through a claim update, which is what keeps
//! at most one worker on a publication at a time.

use chrono::{DateTime, Duration, Utc};
use scholarr_common::Result;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::sync::Arc;

use crate::database::Database;

// ── Continuation queue ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ContinuationStatus {
    Queued,
    Retrying,
    Dropped,
    Cleared,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ContinuationQueueItem {
    pub id: i64,
    pub user_id: i64,
    pub scholar_profile_id: i64,
    /// First page index that was not fetched.
    pub resume_cursor: i64,
    pub attempt_count: i64,
    pub status: ContinuationStatus,
    pub next_attempt_dt: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct ContinuationUpdate {
    pub attempt_count: i64,
    pub next_attempt_dt: DateTime<Utc>,
    /// Attempt budget exhausted; the slot moved to `dropped`.
    pub dropped: bool,
}

#[derive(Clone)]
pub struct ContinuationRepository {
    db: Arc<Database>,
}

impl ContinuationRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Record a partial walk. A fresh slot waits `base`; an existing slot
    /// doubles its delay (capped) and drops once past `max_attempts`.
    pub async fn record_partial(
        &self,
        user_id: i64,
        scholar_profile_id: i64,
        resume_cursor: i64,
        base_delay: Duration,
        max_delay: Duration,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<ContinuationUpdate> {
        let mut tx = self.db.pool().begin().await?;
        let existing = sqlx::query_as::<_, ContinuationQueueItem>(
            "SELECT * FROM continuation_queue
             WHERE user_id = ?1 AND scholar_profile_id = ?2
               AND status IN ('queued', 'retrying')",
        )
        .bind(user_id)
        .bind(scholar_profile_id)
        .fetch_optional(&mut *tx)
        .await?;

        let update = match existing {
            None => {
                let next = now + base_delay;
                sqlx::query(
                    "INSERT INTO continuation_queue
                         (user_id, scholar_profile_id, resume_cursor, attempt_count,
                          status, next_attempt_dt, created_at)
                     VALUES (?1, ?2, ?3, 1, 'queued', ?4, ?5)",
                )
                .bind(user_id)
                .bind(scholar_profile_id)
                .bind(resume_cursor)
                .bind(next)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                ContinuationUpdate {
                    attempt_count: 1,
                    next_attempt_dt: next,
                    dropped: false,
                }
            }
            Some(slot) => {
                let attempt = slot.attempt_count + 1;
                if attempt > max_attempts as i64 {
                    sqlx::query("UPDATE continuation_queue SET status = 'dropped' WHERE id = ?1")
                        .bind(slot.id)
                        .execute(&mut *tx)
                        .await?;
                    ContinuationUpdate {
                        attempt_count: slot.attempt_count,
                        next_attempt_dt: slot.next_attempt_dt,
                        dropped: true,
                    }
                } else {
                    let exponent = (attempt - 1).min(30) as u32;
                    let delay = base_delay
                        .checked_mul(2_i32.pow(exponent))
                        .unwrap_or(max_delay)
                        .min(max_delay);
                    let next = now + delay;
                    sqlx::query(
                        "UPDATE continuation_queue
                         SET attempt_count = ?2, resume_cursor = ?3,
                             status = 'retrying', next_attempt_dt = ?4
                         WHERE id = ?1",
                    )
                    .bind(slot.id)
                    .bind(attempt)
                    .bind(resume_cursor)
                    .bind(next)
                    .execute(&mut *tx)
                    .await?;
                    ContinuationUpdate {
                        attempt_count: attempt,
                        next_attempt_dt: next,
                        dropped: false,
                    }
                }
            }
        };
        tx.commit().await?;
        Ok(update)
    }

    pub async fn due_items(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<ContinuationQueueItem>> {
        let items = sqlx::query_as::<_, ContinuationQueueItem>(
            "SELECT * FROM continuation_queue
             WHERE status IN ('queued', 'retrying') AND next_attempt_dt <= ?1
             ORDER BY next_attempt_dt, id
             LIMIT ?2",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;
        Ok(items)
    }

    pub async fn find_active(
        &self,
        user_id: i64,
        scholar_profile_id: i64,
    ) -> Result<Option<ContinuationQueueItem>> {
        let item = sqlx::query_as::<_, ContinuationQueueItem>(
            "SELECT * FROM continuation_queue
             WHERE user_id = ?1 AND scholar_profile_id = ?2
               AND status IN ('queued', 'retrying')",
        )
        .bind(user_id)
        .bind(scholar_profile_id)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(item)
    }

    /// The scholar completed a full walk; its slot is finished.
    pub async fn mark_cleared(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE continuation_queue SET status = 'cleared' WHERE id = ?1")
            .bind(id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Dropped slots not yet surfaced to the user. Consuming them moves the
    /// slot to `cleared` so the warning appears exactly once.
    pub async fn take_dropped(&self, user_id: i64) -> Result<Vec<ContinuationQueueItem>> {
        let mut tx = self.db.pool().begin().await?;
        let items = sqlx::query_as::<_, ContinuationQueueItem>(
            "SELECT * FROM continuation_queue WHERE user_id = ?1 AND status = 'dropped'",
        )
        .bind(user_id)
        .fetch_all(&mut *tx)
        .await?;
        sqlx::query("UPDATE continuation_queue SET status = 'cleared' WHERE user_id = ?1 AND status = 'dropped'")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(items)
    }
}

// ── PDF resolution queue ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum PdfQueueStatus {
    Queued,
    Running,
    Resolved,
    Failed,
    Abandoned,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PdfQueueItem {
    pub id: i64,
    pub publication_id: i64,
    pub status: PdfQueueStatus,
    pub attempt_count: i64,
    pub next_attempt_dt: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct PdfQueueRepository {
    db: Arc<Database>,
}

impl PdfQueueRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Enqueue a publication for PDF resolution. A publication with an
    /// active item keeps that item (partial unique index + OR IGNORE).
    pub async fn enqueue(&self, publication_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO pdf_queue
                 (publication_id, status, next_attempt_dt, created_at)
             VALUES (?1, 'queued', ?2, ?2)",
        )
        .bind(publication_id)
        .bind(now)
        .execute(self.db.pool())
        .await?
        .rows_affected();
        Ok(inserted > 0)
    }

    /// Claim the next due item for a worker. The row-level claim update is
    /// what guarantees at most one running worker per publication.
    pub async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<PdfQueueItem>> {
        let item = sqlx::query_as::<_, PdfQueueItem>(
            "UPDATE pdf_queue
             SET status = 'running'
             WHERE id = (SELECT id FROM pdf_queue
                         WHERE status = 'queued' AND next_attempt_dt <= ?1
                         ORDER BY next_attempt_dt, id
                         LIMIT 1)
             RETURNING *",
        )
        .bind(now)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(item)
    }

    pub async fn mark_resolved(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE pdf_queue SET status = 'resolved', last_error = NULL WHERE id = ?1")
            .bind(id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Retryable failure: back to `queued` with the next attempt scheduled.
    pub async fn mark_retry(
        &self,
        id: i64,
        attempt_count: i64,
        next_attempt_dt: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE pdf_queue
             SET status = 'queued', attempt_count = ?2, next_attempt_dt = ?3, last_error = ?4
             WHERE id = ?1",
        )
        .bind(id)
        .bind(attempt_count)
        .bind(next_attempt_dt)
        .bind(error)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Terminal failure (no open-access copy known). Waits for an operator retry.
    pub async fn mark_failed(&self, id: i64, attempt_count: i64, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE pdf_queue
             SET status = 'failed', attempt_count = ?2, last_error = ?3
             WHERE id = ?1",
        )
        .bind(id)
        .bind(attempt_count)
        .bind(error)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Attempt budget exhausted.
    pub async fn mark_abandoned(&self, id: i64, attempt_count: i64, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE pdf_queue
             SET status = 'abandoned', attempt_count = ?2, last_error = ?3
             WHERE id = ?1",
        )
        .bind(id)
        .bind(attempt_count)
        .bind(error)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    pub async fn pending_count(&self, now: DateTime<Utc>) -> Result<i64> {
        let n = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pdf_queue WHERE status = 'queued' AND next_attempt_dt <= ?1",
        )
        .bind(now)
        .fetch_one(self.db.pool())
        .await?;
        Ok(n)
    }
}
