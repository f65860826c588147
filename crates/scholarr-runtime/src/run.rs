//! Run driver: one ingestion cycle across a user's scholars.
//!
//! Scholars are processed strictly in sequence inside a run; cancellation is
//! observed at scholar boundaries and, via the watch channel, before every
//! page fetch. After the last scholar reaches a terminal state the run moves
//! to `resolving` for enrichment and PDF queueing, then finalizes and hands
//! its failure counters to the safety controller.

use scholarr_common::clock::{Clock, SharedClock};
use scholarr_common::Result;
use scholarr_config::Settings;
use scholarr_db::links::LinkRepository;
use scholarr_db::queues::{ContinuationQueueItem, ContinuationRepository};
use scholarr_db::runs::{
    RunRepository, RunScholarResult, RunStatus, ScholarOutcome, ScholarResultState,
};
use scholarr_db::scholars::{ScholarProfile, ScholarRepository};
use scholarr_db::users::User;
use scholarr_db::Database;
use scholarr_ingestion::enrichment::EnrichmentRunner;
use scholarr_ingestion::fetcher::ProfileFetcher;
use scholarr_ingestion::pdf::PdfResolver;
use scholarr_ingestion::processor::{ScholarProcessor, ScholarReport};
use sqlx::types::Json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::events::{EventBus, RunEvent, RunSummary};
use crate::safety::SafetyController;

/// What a run covers: every enabled scholar, or specific resume slots.
#[derive(Debug)]
pub enum RunScope {
    AllEnabled { force: bool },
    Continuations(Vec<ContinuationQueueItem>),
}

struct Target {
    scholar: ScholarProfile,
    start_cursor: u32,
    force: bool,
    attempt_count: i64,
}

pub struct RunDriver {
    db: Arc<Database>,
    clock: SharedClock,
    settings: Settings,
    events: Arc<EventBus>,
    fetcher: Arc<dyn ProfileFetcher>,
    enrichment: Arc<EnrichmentRunner>,
    pdf: Arc<PdfResolver>,
    safety: Arc<SafetyController>,
}

impl RunDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Database>,
        clock: SharedClock,
        settings: Settings,
        events: Arc<EventBus>,
        fetcher: Arc<dyn ProfileFetcher>,
        enrichment: Arc<EnrichmentRunner>,
        pdf: Arc<PdfResolver>,
        safety: Arc<SafetyController>,
    ) -> Self {
        Self {
            db,
            clock,
            settings,
            events,
            fetcher,
            enrichment,
            pdf,
            safety,
        }
    }

    /// Execute a run to a terminal status. Unexpected errors finalize the
    /// run as `failed` rather than leaving it stuck non-terminal.
    #[instrument(skip(self, user, scope), fields(run = run_id, user = user.id))]
    pub async fn execute(&self, run_id: i64, user: &User, scope: RunScope) {
        if let Err(err) = self.execute_inner(run_id, user, scope).await {
            error!(error = %err, "run aborted by internal error");
            let runs = RunRepository::new(self.db.clone());
            let _ = runs
                .finalize(run_id, RunStatus::Failed, 0, 0, 0, self.clock.now())
                .await;
            self.events.publish(
                run_id,
                RunEvent::RunCompleted {
                    outcome: RunStatus::Failed,
                    summary: RunSummary {
                        scholar_count: 0,
                        new_publication_count: 0,
                        failed_count: 0,
                        partial_count: 0,
                        warnings: vec![format!("run aborted: {err}")],
                    },
                },
            );
        }
    }

    async fn execute_inner(&self, run_id: i64, user: &User, scope: RunScope) -> Result<()> {
        let runs = RunRepository::new(self.db.clone());
        let links = LinkRepository::new(self.db.clone());
        let scholars = ScholarRepository::new(self.db.clone());

        runs.set_status(run_id, RunStatus::Running).await?;
        let targets = self.resolve_targets(&scholars, user, scope).await?;
        runs.set_scholar_count(run_id, targets.len() as i64).await?;

        let user_delay = Duration::from_secs(
            self.settings
                .effective_request_delay_seconds(user.settings.request_delay_seconds),
        );
        let processor = ScholarProcessor::new(
            self.db.clone(),
            self.clock.clone(),
            self.settings.ingestion.clone(),
            self.settings.continuation.clone(),
        );

        // Cancellation monitor: surfaces the persisted flag to in-flight
        // walks between page fetches.
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let monitor = tokio::spawn({
            let runs = runs.clone();
            async move {
                loop {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    match runs.is_cancel_requested(run_id).await {
                        Ok(true) => {
                            let _ = cancel_tx.send(true);
                            break;
                        }
                        Ok(false) => {}
                        Err(_) => break,
                    }
                }
            }
        });

        let total = targets.len() as i64;
        let mut reports: Vec<(i64, i64, ScholarReport)> = Vec::new();
        let mut cancelled = false;

        for (index, target) in targets.iter().enumerate() {
            if runs.is_cancel_requested(run_id).await? {
                cancelled = true;
                break;
            }

            let report = processor
                .process(
                    self.fetcher.as_ref(),
                    &target.scholar,
                    run_id,
                    target.force,
                    target.start_cursor,
                    user_delay,
                    cancel_rx.clone(),
                )
                .await?;
            if report.cancelled {
                cancelled = true;
                break;
            }

            let now = self.clock.now();
            for discovered in &report.discovered {
                self.events.publish(
                    run_id,
                    RunEvent::PublicationDiscovered {
                        publication_id: discovered.publication_id,
                        scholar_profile_id: discovered.scholar_profile_id,
                        title: discovered.title.clone(),
                        first_seen_at: now,
                        pub_url: discovered.pub_url.clone(),
                    },
                );
            }
            if report.outcome.is_success() {
                links.clear_stale_new_flags(target.scholar.id, run_id).await?;
            }
            self.events.publish(
                run_id,
                RunEvent::RunProgress {
                    processed: index as i64 + 1,
                    total,
                },
            );
            reports.push((target.scholar.id, target.attempt_count, report));
        }

        monitor.abort();

        if cancelled {
            info!("run cancelled at scholar boundary");
            self.finalize(run_id, user, RunStatus::Cancelled, total, reports, Vec::new())
                .await?;
            return Ok(());
        }

        // Post-run resolution: identifier enrichment, then PDF queue.
        runs.set_status(run_id, RunStatus::Resolving).await?;
        for update in self.enrichment.enrich_run(run_id).await? {
            self.events.publish(
                run_id,
                RunEvent::IdentifierUpdated {
                    publication_id: update.publication_id,
                    display_identifier: update.display_identifier,
                },
            );
        }

        self.pdf.enqueue_missing_for_run(run_id).await?;
        let mut workers = Vec::new();
        for _ in 0..self.settings.pdf.workers.max(1) {
            let resolver = self.pdf.clone();
            workers.push(tokio::spawn(async move { resolver.drain().await }));
        }
        for worker in workers {
            match worker.await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => warn!(error = %err, "pdf worker failed"),
                Err(err) => warn!(error = %err, "pdf worker panicked"),
            }
        }

        let dropped = ContinuationRepository::new(self.db.clone())
            .take_dropped(user.id)
            .await?;
        let dropped_warnings: Vec<String> = dropped
            .iter()
            .map(|slot| {
                format!(
                    "gave up resuming scholar {} after {} attempts",
                    slot.scholar_profile_id, slot.attempt_count
                )
            })
            .collect();

        let status = run_status(&reports);
        self.finalize(run_id, user, status, total, reports, dropped_warnings)
            .await?;
        Ok(())
    }

    async fn finalize(
        &self,
        run_id: i64,
        user: &User,
        status: RunStatus,
        scholar_count: i64,
        reports: Vec<(i64, i64, ScholarReport)>,
        mut extra_warnings: Vec<String>,
    ) -> Result<()> {
        let runs = RunRepository::new(self.db.clone());
        let links = LinkRepository::new(self.db.clone());
        let now = self.clock.now();

        let mut blocked = 0u32;
        let mut network = 0u32;
        let mut failed_count = 0i64;
        for (scholar_profile_id, attempt_count, report) in &reports {
            match report.outcome {
                ScholarOutcome::Blocked => blocked += 1,
                ScholarOutcome::NetworkError => network += 1,
                _ => {}
            }
            if !report.outcome.is_success() {
                failed_count += 1;
            }
            runs.insert_scholar_result(&RunScholarResult {
                run_id,
                scholar_profile_id: *scholar_profile_id,
                outcome: report.outcome,
                state: ScholarResultState::from(report.outcome),
                state_reason: report.state_reason.clone(),
                publication_count: report.publication_count,
                attempt_count: *attempt_count,
                warnings: Json(report.warnings.clone()),
            })
            .await?;
            extra_warnings.extend(report.warnings.iter().cloned());
        }
        let partial_count = (blocked + network) as i64;
        let new_publication_count = links.count_first_seen(run_id).await?;

        runs.finalize(run_id, status, new_publication_count, failed_count, partial_count, now)
            .await?;
        info!(
            ?status,
            new_publications = new_publication_count,
            failed = failed_count,
            "run finalized"
        );

        self.events.publish(
            run_id,
            RunEvent::RunCompleted {
                outcome: status,
                summary: RunSummary {
                    scholar_count,
                    new_publication_count,
                    failed_count,
                    partial_count,
                    warnings: extra_warnings,
                },
            },
        );

        // Terminal handoff: only completed runs feed the threshold counters.
        if status != RunStatus::Cancelled {
            self.safety
                .observe_run(user.id, run_id, blocked, network)
                .await?;
        }
        Ok(())
    }

    async fn resolve_targets(
        &self,
        scholars: &ScholarRepository,
        user: &User,
        scope: RunScope,
    ) -> Result<Vec<Target>> {
        match scope {
            RunScope::AllEnabled { force } => Ok(scholars
                .list_enabled_for_user(user.id)
                .await?
                .into_iter()
                .map(|scholar| Target {
                    scholar,
                    start_cursor: 0,
                    force,
                    attempt_count: 1,
                })
                .collect()),
            RunScope::Continuations(items) => {
                let mut targets = Vec::new();
                for item in items {
                    let Some(scholar) = scholars.find_by_id(item.scholar_profile_id).await? else {
                        warn!(scholar = item.scholar_profile_id, "continuation for missing scholar");
                        continue;
                    };
                    if !scholar.is_enabled {
                        continue;
                    }
                    targets.push(Target {
                        scholar,
                        start_cursor: item.resume_cursor as u32,
                        force: true,
                        attempt_count: item.attempt_count,
                    });
                }
                Ok(targets)
            }
        }
    }
}

/// Run-level status from per-scholar outcomes: all good → success, all bad →
/// failed, otherwise partial.
fn run_status(reports: &[(i64, i64, ScholarReport)]) -> RunStatus {
    if reports.is_empty() {
        return RunStatus::Success;
    }
    let successes = reports.iter().filter(|(_, _, r)| r.outcome.is_success()).count();
    if successes == reports.len() {
        RunStatus::Success
    } else if successes == 0 {
        RunStatus::Failed
    } else {
        RunStatus::PartialFailure
    }
}
