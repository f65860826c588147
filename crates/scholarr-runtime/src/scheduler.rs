//! Cooperative scheduler tick loop.
//!
//! Each tick selects due users, asks the safety controller to admit them,
//! drains due continuation slots, and gives the PDF queue a pass for items
//! whose backoff elapsed. Runs execute on a semaphore-bounded worker set;
//! the tick itself never blocks on a run.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use scholarr_common::clock::{Clock, SharedClock};
use scholarr_common::Result;
use scholarr_config::Settings;
use scholarr_db::queues::ContinuationQueueItem;
use scholarr_db::runs::{Run, RunRepository, RunTrigger};
use scholarr_db::users::{User, UserRepository};
use scholarr_db::Database;
use scholarr_ingestion::pdf::PdfResolver;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, instrument, warn};

use crate::run::{RunDriver, RunScope};
use crate::safety::{Admission, Refusal, SafetyController};

/// Result of a manual trigger request, mapped to API codes by the caller.
#[derive(Debug)]
pub enum ManualRunOutcome {
    Started(Run),
    /// Duplicate submission inside the idempotency window: here is the run
    /// already in flight.
    InFlight(Run),
    Refused(Refusal),
}

pub struct Scheduler {
    db: Arc<Database>,
    clock: SharedClock,
    settings: Settings,
    driver: Arc<RunDriver>,
    safety: Arc<SafetyController>,
    pdf: Arc<PdfResolver>,
    run_slots: Arc<Semaphore>,
    shutdown: watch::Receiver<bool>,
    last_tick: Mutex<Option<DateTime<Utc>>>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Database>,
        clock: SharedClock,
        settings: Settings,
        driver: Arc<RunDriver>,
        safety: Arc<SafetyController>,
        pdf: Arc<PdfResolver>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let run_slots = Arc::new(Semaphore::new(settings.scheduler.max_concurrent_runs.max(1)));
        Self {
            db,
            clock,
            settings,
            driver,
            safety,
            pdf,
            run_slots,
            shutdown,
            last_tick: Mutex::new(None),
        }
    }

    /// Wall-clock time of the last completed tick, for the health endpoint.
    pub fn last_tick(&self) -> Option<DateTime<Utc>> {
        *self.last_tick.lock().unwrap()
    }

    /// Tick until shutdown, then cancel in-flight runs and wait for them to
    /// reach a scholar boundary.
    pub async fn run_loop(&self) {
        let mut shutdown = self.shutdown.clone();
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.settings.scheduler.tick_seconds.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(
            tick_seconds = self.settings.scheduler.tick_seconds,
            "scheduler loop started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.tick().await {
                        error!(error = %err, "scheduler tick failed");
                    }
                    *self.last_tick.lock().unwrap() = Some(self.clock.now());
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.drain_for_shutdown().await;
        info!("scheduler loop stopped");
    }

    #[instrument(skip(self))]
    async fn tick(&self) -> Result<()> {
        self.start_due_scheduled_runs().await?;
        self.drain_continuations().await?;
        self.drain_pdf_queue().await;
        Ok(())
    }

    async fn start_due_scheduled_runs(&self) -> Result<()> {
        let users = UserRepository::new(self.db.clone());
        let runs = RunRepository::new(self.db.clone());
        let now = self.clock.now();

        for user in users.list_auto_run_candidates().await? {
            let interval_minutes = self
                .settings
                .effective_run_interval_minutes(user.settings.run_interval_minutes);
            let due = match runs.last_start(user.id).await? {
                None => true,
                Some(last) => now >= last + ChronoDuration::minutes(interval_minutes as i64),
            };
            if !due {
                continue;
            }

            match self.safety.admit(user.id, RunTrigger::Scheduled).await? {
                Admission::Admitted => {
                    if let Some(run_id) = runs.create(user.id, RunTrigger::Scheduled, now).await? {
                        info!(user = user.id, run = run_id, "scheduled run starting");
                        self.spawn_run(run_id, user, RunScope::AllEnabled { force: false });
                    }
                }
                Admission::Refused(refusal) => {
                    debug!(user = user.id, code = refusal.code(), "scheduled run refused");
                }
            }
        }
        Ok(())
    }

    async fn drain_continuations(&self) -> Result<()> {
        let continuations =
            scholarr_db::queues::ContinuationRepository::new(self.db.clone());
        let users = UserRepository::new(self.db.clone());
        let runs = RunRepository::new(self.db.clone());
        let now = self.clock.now();

        let due = continuations
            .due_items(now, self.settings.scheduler.queue_batch_size)
            .await?;
        if due.is_empty() {
            return Ok(());
        }

        let mut by_user: HashMap<i64, Vec<ContinuationQueueItem>> = HashMap::new();
        for item in due {
            by_user.entry(item.user_id).or_default().push(item);
        }

        for (user_id, items) in by_user {
            let Some(user) = users.find_by_id(user_id).await? else {
                continue;
            };
            match self.safety.admit(user_id, RunTrigger::Continuation).await? {
                Admission::Admitted => {
                    if let Some(run_id) = runs.create(user_id, RunTrigger::Continuation, now).await? {
                        info!(user = user_id, run = run_id, slots = items.len(), "continuation run starting");
                        self.spawn_run(run_id, user, RunScope::Continuations(items));
                    }
                }
                Admission::Refused(refusal) => {
                    debug!(user = user_id, code = refusal.code(), "continuation refused");
                }
            }
        }
        Ok(())
    }

    /// Give queued PDF items whose backoff elapsed another pass.
    async fn drain_pdf_queue(&self) {
        match self.pdf.drain().await {
            Ok(0) => {}
            Ok(n) => debug!(processed = n, "pdf queue drained on tick"),
            Err(err) => warn!(error = %err, "pdf drain failed"),
        }
    }

    /// Manual trigger from the API. Duplicate submissions within the
    /// idempotency window return the in-flight run instead of a refusal.
    pub async fn request_manual_run(&self, user: &User, force: bool) -> Result<ManualRunOutcome> {
        let runs = RunRepository::new(self.db.clone());
        let now = self.clock.now();

        match self.safety.admit(user.id, RunTrigger::Manual).await? {
            Admission::Refused(Refusal::RunInProgress { run_id }) => {
                if let Some(run) = runs.find_by_id(run_id).await? {
                    let window =
                        ChronoDuration::seconds(self.settings.scheduler.manual_idempotency_seconds as i64);
                    if now - run.start_dt <= window {
                        return Ok(ManualRunOutcome::InFlight(run));
                    }
                    return Ok(ManualRunOutcome::Refused(Refusal::RunInProgress { run_id }));
                }
                Ok(ManualRunOutcome::Refused(Refusal::RunInProgress { run_id }))
            }
            Admission::Refused(refusal) => Ok(ManualRunOutcome::Refused(refusal)),
            Admission::Admitted => {
                let Some(run_id) = runs.create(user.id, RunTrigger::Manual, now).await? else {
                    // Lost a race with another trigger.
                    let active = runs.find_active(user.id).await?;
                    return Ok(match active {
                        Some(run) => ManualRunOutcome::InFlight(run),
                        None => ManualRunOutcome::Refused(Refusal::RunInProgress { run_id: 0 }),
                    });
                };
                let run = runs
                    .find_by_id(run_id)
                    .await?
                    .expect("run just created");
                info!(user = user.id, run = run_id, "manual run starting");
                self.spawn_run(run_id, user.clone(), RunScope::AllEnabled { force });
                Ok(ManualRunOutcome::Started(run))
            }
        }
    }

    fn spawn_run(&self, run_id: i64, user: User, scope: RunScope) {
        let driver = self.driver.clone();
        let slots = self.run_slots.clone();
        tokio::spawn(async move {
            let Ok(_permit) = slots.acquire_owned().await else {
                return;
            };
            driver.execute(run_id, &user, scope).await;
        });
    }

    /// Cooperative shutdown: flag every live run as cancel-requested, then
    /// wait for the worker set to empty.
    async fn drain_for_shutdown(&self) {
        let runs = RunRepository::new(self.db.clone());
        match runs.list_non_terminal().await {
            Ok(live) => {
                for run in live {
                    let _ = runs.request_cancel(run.id).await;
                }
            }
            Err(err) => warn!(error = %err, "could not flag live runs for cancel"),
        }

        let all = self.settings.scheduler.max_concurrent_runs.max(1) as u32;
        let waited = tokio::time::timeout(
            Duration::from_secs(30),
            self.run_slots.acquire_many(all),
        )
        .await;
        match waited {
            Ok(Ok(permits)) => drop(permits),
            _ => warn!("shutdown timed out waiting for in-flight runs"),
        }
    }
}
