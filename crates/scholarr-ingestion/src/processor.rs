//! Per-scholar outcome resolution.
//!
//! Drives one scholar through fetch → parse → upsert and resolves the walk
//! into an explicit terminal outcome. Failures are reported, never retried
//! within the run; interrupted walks persist a continuation slot instead.

use chrono::Duration as ChronoDuration;
use scholarr_common::clock::{Clock, SharedClock};
use scholarr_common::Result;
use scholarr_config::{ContinuationSettings, IngestionSettings};
use scholarr_db::queues::ContinuationRepository;
use scholarr_db::runs::ScholarOutcome;
use scholarr_db::scholars::{ScholarProfile, ScholarRepository};
use scholarr_db::Database;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::fetcher::ProfileFetcher;
use crate::paginator::{InterruptCause, Paginator, WalkParams, WalkTermination};
use crate::upserter::{DiscoveredPublication, Upserter};

/// Resolution of one (run, scholar).
#[derive(Debug)]
pub struct ScholarReport {
    pub outcome: ScholarOutcome,
    pub state_reason: Option<String>,
    pub publication_count: i64,
    pub warnings: Vec<String>,
    pub discovered: Vec<DiscoveredPublication>,
    /// The run was cancelled before this scholar finished; no result row is
    /// written for it.
    pub cancelled: bool,
}

pub struct ScholarProcessor {
    db: Arc<Database>,
    clock: SharedClock,
    ingestion: IngestionSettings,
    continuation: ContinuationSettings,
}

impl ScholarProcessor {
    pub fn new(
        db: Arc<Database>,
        clock: SharedClock,
        ingestion: IngestionSettings,
        continuation: ContinuationSettings,
    ) -> Self {
        Self {
            db,
            clock,
            ingestion,
            continuation,
        }
    }

    #[instrument(skip_all, fields(scholar = scholar.id, run = run_id))]
    pub async fn process(
        &self,
        fetcher: &dyn ProfileFetcher,
        scholar: &ScholarProfile,
        run_id: i64,
        force: bool,
        start_cursor: u32,
        user_delay: Duration,
        cancel: watch::Receiver<bool>,
    ) -> Result<ScholarReport> {
        let upserter = Upserter::new(self.db.clone(), self.clock.clone());
        let paginator = Paginator::new(fetcher, &upserter);
        let params = WalkParams {
            run_id,
            user_delay,
            force,
            start_cursor,
            max_pages: self.ingestion.max_pages_per_scholar,
            cancel,
        };

        let scholars = ScholarRepository::new(self.db.clone());
        let continuations = ContinuationRepository::new(self.db.clone());

        // Soft deadline for the whole scholar: enough for every page at the
        // per-request budget. Exceeding it counts as a network failure and
        // leaves a resume slot like any other interruption.
        let soft_deadline = Duration::from_secs(
            self.ingestion.page_deadline_seconds
                * u64::from(self.ingestion.max_pages_per_scholar.max(1)),
        );
        let walk = match tokio::time::timeout(soft_deadline, paginator.walk(scholar, &params)).await
        {
            Ok(Ok(walk)) => walk,
            Ok(Err(err)) => {
                // A failed upsert transaction resolves the scholar, not the
                // run. Pages committed before the failure are already in.
                warn!(error = %err, "upsert failed mid-walk");
                scholars
                    .record_outcome(scholar.id, "upsert_exception", self.clock.now(), None)
                    .await?;
                return Ok(ScholarReport {
                    outcome: ScholarOutcome::UpsertException,
                    state_reason: Some(err.to_string()),
                    publication_count: 0,
                    warnings: Vec::new(),
                    discovered: Vec::new(),
                    cancelled: false,
                });
            }
            Err(_) => {
                warn!(deadline_secs = soft_deadline.as_secs(), "scholar soft deadline exceeded");
                crate::paginator::WalkOutcome {
                    termination: WalkTermination::Interrupted {
                        cause: InterruptCause::Network("scholar soft deadline exceeded".to_string()),
                        resume_cursor: start_cursor,
                    },
                    pages_fetched: 0,
                    publication_count: 0,
                    head_fingerprint: None,
                    profile: None,
                    warnings: Vec::new(),
                    discovered: Vec::new(),
                }
            }
        };
        let now = self.clock.now();

        let mut report = ScholarReport {
            outcome: ScholarOutcome::Success,
            state_reason: None,
            publication_count: walk.publication_count,
            warnings: walk.warnings,
            discovered: walk.discovered,
            cancelled: false,
        };

        match walk.termination {
            WalkTermination::Cancelled => {
                report.cancelled = true;
                return Ok(report);
            }
            WalkTermination::Completed => {
                report.outcome = ScholarOutcome::Success;
                if let Some(profile) = &walk.profile {
                    scholars
                        .update_profile_meta(
                            scholar.id,
                            &profile.display_name,
                            profile.affiliation.as_deref(),
                            profile.image_url.as_deref(),
                        )
                        .await?;
                }
                scholars
                    .record_outcome(scholar.id, "success", now, walk.head_fingerprint.as_deref())
                    .await?;
                // A finished walk supersedes any pending resume slot.
                if let Some(slot) = continuations.find_active(scholar.user_id, scholar.id).await? {
                    continuations.mark_cleared(slot.id).await?;
                }
                info!(publications = report.publication_count, "scholar processed");
            }
            WalkTermination::SkippedNoChange => {
                report.outcome = ScholarOutcome::SkippedNoChange;
                scholars
                    .record_outcome(
                        scholar.id,
                        "skipped_no_change",
                        now,
                        walk.head_fingerprint.as_deref(),
                    )
                    .await?;
            }
            WalkTermination::LayoutError { code } => {
                report.outcome = ScholarOutcome::ParseFailure;
                report.state_reason = Some(code.to_string());
                scholars
                    .record_outcome(scholar.id, "parse_failure", now, None)
                    .await?;
            }
            WalkTermination::Interrupted {
                cause,
                resume_cursor,
            } => {
                let (outcome, outcome_name, reason) = match cause {
                    InterruptCause::Blocked => (
                        ScholarOutcome::Blocked,
                        "blocked",
                        "anti-bot response from Scholar".to_string(),
                    ),
                    InterruptCause::Network(cause) => {
                        (ScholarOutcome::NetworkError, "network_error", cause)
                    }
                };
                report.outcome = outcome;
                report.state_reason = Some(reason);
                scholars
                    .record_outcome(scholar.id, outcome_name, now, None)
                    .await?;

                let update = continuations
                    .record_partial(
                        scholar.user_id,
                        scholar.id,
                        resume_cursor as i64,
                        ChronoDuration::seconds(self.continuation.base_delay_seconds as i64),
                        ChronoDuration::seconds(self.continuation.max_delay_seconds as i64),
                        self.continuation.max_attempts,
                        now,
                    )
                    .await?;
                if update.dropped {
                    warn!("continuation attempts exhausted, slot dropped");
                    report.warnings.push(format!(
                        "gave up resuming {} after {} attempts",
                        scholar.display_name, self.continuation.max_attempts
                    ));
                } else {
                    info!(
                        attempt = update.attempt_count,
                        resume_cursor, "continuation slot recorded"
                    );
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use scholarr_common::SystemClock;
    use scholarr_db::queues::ContinuationStatus;
    use scholarr_db::runs::{RunRepository, RunTrigger};
    use scholarr_db::users::UserRepository;
    use std::collections::HashMap;

    use crate::fetcher::PageFetch;
    use crate::models::{Pagination, ParsedPage, ProfileMeta, PublicationRow};

    struct ScriptedFetcher {
        pages: HashMap<u32, PageScript>,
    }

    enum PageScript {
        Rows(Vec<PublicationRow>, bool),
        Blocked,
    }

    #[async_trait]
    impl ProfileFetcher for ScriptedFetcher {
        async fn fetch_page(&self, _scholar: &str, page: u32, _delay: Duration) -> PageFetch {
            match self.pages.get(&page) {
                Some(PageScript::Rows(rows, has_next)) => PageFetch::Page(ParsedPage {
                    profile: (page == 0).then(|| ProfileMeta {
                        display_name: "Ada Lovelace".to_string(),
                        affiliation: Some("AEI".to_string()),
                        ..Default::default()
                    }),
                    rows: rows.clone(),
                    pagination: Pagination {
                        has_next: *has_next,
                        next_cursor: has_next.then(|| page + 1),
                    },
                }),
                Some(PageScript::Blocked) => PageFetch::Blocked,
                None => PageFetch::NetworkError {
                    cause: "unscripted page".to_string(),
                },
            }
        }
    }

    fn rows(n: usize) -> Vec<PublicationRow> {
        (0..n)
            .map(|i| PublicationRow {
                cluster_id: Some(format!("c{i}")),
                title: format!("Paper {i}"),
                year: Some(2024),
                ..Default::default()
            })
            .collect()
    }

    struct Fixture {
        db: Arc<Database>,
        processor: ScholarProcessor,
        scholar: ScholarProfile,
        run_id: i64,
    }

    async fn fixture() -> Fixture {
        let db = Arc::new(Database::connect_memory().await.unwrap());
        let now = Utc::now();
        let user_id = UserRepository::new(db.clone())
            .insert("ada@example.com", false, now)
            .await
            .unwrap();
        let scholars = ScholarRepository::new(db.clone());
        let id = scholars.insert(user_id, "AbCdEfGhIjKl", "Ada", now).await.unwrap();
        let scholar = scholars.find_by_id(id).await.unwrap().unwrap();
        let run_id = RunRepository::new(db.clone())
            .create(user_id, RunTrigger::Manual, now)
            .await
            .unwrap()
            .unwrap();
        let processor = ScholarProcessor::new(
            db.clone(),
            Arc::new(SystemClock),
            IngestionSettings::default(),
            ContinuationSettings::default(),
        );
        Fixture {
            db,
            processor,
            scholar,
            run_id,
        }
    }

    fn cancel_off() -> watch::Receiver<bool> {
        // The sender side may drop; borrow() keeps serving the last value.
        let (_tx, rx) = watch::channel(false);
        rx
    }

    #[tokio::test]
    async fn successful_walk_updates_profile_and_head() {
        let f = fixture().await;
        let fetcher = ScriptedFetcher {
            pages: HashMap::from([(0, PageScript::Rows(rows(5), false))]),
        };
        let report = f
            .processor
            .process(&fetcher, &f.scholar, f.run_id, false, 0, Duration::ZERO, cancel_off())
            .await
            .unwrap();

        assert_eq!(report.outcome, ScholarOutcome::Success);
        assert_eq!(report.publication_count, 5);
        assert_eq!(report.discovered.len(), 5);

        let scholar = ScholarRepository::new(f.db.clone())
            .find_by_id(f.scholar.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(scholar.last_outcome.as_deref(), Some("success"));
        assert!(scholar.last_fingerprint_head.is_some());
        assert_eq!(scholar.display_name, "Ada Lovelace");
        assert_eq!(scholar.affiliation.as_deref(), Some("AEI"));
    }

    #[tokio::test]
    async fn blocked_page_writes_continuation_slot() {
        let f = fixture().await;
        let fetcher = ScriptedFetcher {
            pages: HashMap::from([
                (0, PageScript::Rows(rows(100), true)),
                (1, PageScript::Blocked),
            ]),
        };
        let report = f
            .processor
            .process(&fetcher, &f.scholar, f.run_id, false, 0, Duration::ZERO, cancel_off())
            .await
            .unwrap();

        assert_eq!(report.outcome, ScholarOutcome::Blocked);
        // Partial rows from page 0 were upserted before the interruption.
        assert_eq!(report.publication_count, 100);

        let slot = ContinuationRepository::new(f.db.clone())
            .find_active(f.scholar.user_id, f.scholar.id)
            .await
            .unwrap()
            .expect("continuation slot");
        assert_eq!(slot.resume_cursor, 1);
        assert_eq!(slot.attempt_count, 1);
        assert_eq!(slot.status, ContinuationStatus::Queued);
    }

    #[tokio::test]
    async fn upsert_failure_resolves_the_scholar_not_the_run() {
        let f = fixture().await;
        // Break the link table so the first page's transaction fails.
        sqlx::query("DROP TABLE scholar_publication_links")
            .execute(f.db.pool())
            .await
            .unwrap();

        let fetcher = ScriptedFetcher {
            pages: HashMap::from([(0, PageScript::Rows(rows(3), false))]),
        };
        let report = f
            .processor
            .process(&fetcher, &f.scholar, f.run_id, false, 0, Duration::ZERO, cancel_off())
            .await
            .expect("resolved as an outcome, not an error");

        assert_eq!(report.outcome, ScholarOutcome::UpsertException);
        assert!(report.state_reason.is_some());
        assert_eq!(report.publication_count, 0);

        let scholar = ScholarRepository::new(f.db.clone())
            .find_by_id(f.scholar.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(scholar.last_outcome.as_deref(), Some("upsert_exception"));
    }

    #[tokio::test]
    async fn completed_continuation_clears_the_slot() {
        let f = fixture().await;

        // First: blocked walk creates the slot.
        let blocked = ScriptedFetcher {
            pages: HashMap::from([
                (0, PageScript::Rows(rows(10), true)),
                (1, PageScript::Blocked),
            ]),
        };
        f.processor
            .process(&blocked, &f.scholar, f.run_id, false, 0, Duration::ZERO, cancel_off())
            .await
            .unwrap();

        // Continuation run resumes from page 1 and completes.
        let resumed = ScriptedFetcher {
            pages: HashMap::from([(1, PageScript::Rows(rows(3), false))]),
        };
        let report = f
            .processor
            .process(&resumed, &f.scholar, f.run_id, true, 1, Duration::ZERO, cancel_off())
            .await
            .unwrap();
        assert_eq!(report.outcome, ScholarOutcome::Success);

        let slot = ContinuationRepository::new(f.db.clone())
            .find_active(f.scholar.user_id, f.scholar.id)
            .await
            .unwrap();
        assert!(slot.is_none());
    }
}
