//! Scrape-safety controller.
//!
//! Per-user state machine over the persisted counters: blocked/network
//! failure thresholds trip a cooldown, the gate refuses runs while a
//! cooldown is active, and counters clear on a healthy run. Nothing else in
//! the system writes the safety row.

use scholarr_common::clock::{Clock, SharedClock};
use scholarr_common::Result;
use scholarr_config::{IngestionSettings, PolicySettings};
use scholarr_db::runs::{RunRepository, RunTrigger};
use scholarr_db::safety::{CooldownReason, SafetyRepository, SafetyState};
use scholarr_db::Database;
use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Gate decision for a run trigger.
#[derive(Debug)]
pub enum Admission {
    Admitted,
    Refused(Refusal),
}

#[derive(Debug)]
pub enum Refusal {
    CooldownActive { state: SafetyState },
    ManualRunsDisabled,
    AutomationDisabled,
    RunInProgress { run_id: i64 },
}

impl Refusal {
    pub fn code(&self) -> &'static str {
        match self {
            Self::CooldownActive { .. } => "scrape_cooldown_active",
            Self::ManualRunsDisabled => "manual_runs_disabled",
            Self::AutomationDisabled => "automation_disabled",
            Self::RunInProgress { .. } => "run_in_progress",
        }
    }
}

pub struct SafetyController {
    db: Arc<Database>,
    clock: SharedClock,
    ingestion: IngestionSettings,
    policy: PolicySettings,
}

impl SafetyController {
    pub fn new(
        db: Arc<Database>,
        clock: SharedClock,
        ingestion: IngestionSettings,
        policy: PolicySettings,
    ) -> Self {
        Self {
            db,
            clock,
            ingestion,
            policy,
        }
    }

    /// Current safety state with an expired cooldown already cleared.
    pub async fn state(&self, user_id: i64) -> Result<SafetyState> {
        let repo = SafetyRepository::new(self.db.clone());
        let mut state = repo.get_or_create(user_id).await?;
        if self.expire_cooldown(&mut state) {
            repo.save(&state).await?;
        }
        Ok(state)
    }

    /// Gate for every run trigger. Refusals carry what the caller needs to
    /// answer the API request (safety state or the in-flight run id).
    #[instrument(skip(self), fields(user = user_id, trigger = ?trigger))]
    pub async fn admit(&self, user_id: i64, trigger: RunTrigger) -> Result<Admission> {
        let state = self.state(user_id).await?;
        if state.cooldown_active {
            warn!(reason = ?state.cooldown_reason, "run refused: cooldown active");
            return Ok(Admission::Refused(Refusal::CooldownActive { state }));
        }

        match trigger {
            RunTrigger::Manual if !self.policy.manual_runs_enabled => {
                return Ok(Admission::Refused(Refusal::ManualRunsDisabled));
            }
            RunTrigger::Scheduled | RunTrigger::Continuation
                if !self.policy.automation_enabled =>
            {
                return Ok(Admission::Refused(Refusal::AutomationDisabled));
            }
            _ => {}
        }

        if let Some(run) = RunRepository::new(self.db.clone()).find_active(user_id).await? {
            return Ok(Admission::Refused(Refusal::RunInProgress { run_id: run.id }));
        }

        Ok(Admission::Admitted)
    }

    /// Terminal handoff from a finished run: evaluate thresholds, enter or
    /// clear cooldown, persist the row.
    #[instrument(skip(self), fields(user = user_id, run = run_id))]
    pub async fn observe_run(
        &self,
        user_id: i64,
        run_id: i64,
        blocked_failures: u32,
        network_failures: u32,
    ) -> Result<SafetyState> {
        let repo = SafetyRepository::new(self.db.clone());
        let mut state = repo.get_or_create(user_id).await?;
        let now = self.clock.now();

        if blocked_failures >= self.ingestion.alert_blocked_failure_threshold {
            state.cooldown_active = true;
            state.cooldown_reason = CooldownReason::Blocked;
            state.cooldown_until =
                Some(now + ChronoDuration::seconds(self.ingestion.cooldown_blocked_seconds as i64));
            state.consecutive_blocked_runs += 1;
            state.cooldown_entry_count += 1;
            state.blocked_start_count += blocked_failures as i64;
            warn!(
                blocked_failures,
                until = ?state.cooldown_until,
                "blocked threshold tripped, entering cooldown"
            );
        } else if network_failures >= self.ingestion.alert_network_failure_threshold {
            state.cooldown_active = true;
            state.cooldown_reason = CooldownReason::Network;
            state.cooldown_until =
                Some(now + ChronoDuration::seconds(self.ingestion.cooldown_network_seconds as i64));
            state.consecutive_network_runs += 1;
            state.cooldown_entry_count += 1;
            warn!(
                network_failures,
                until = ?state.cooldown_until,
                "network threshold tripped, entering cooldown"
            );
        } else {
            state.consecutive_blocked_runs = 0;
            state.consecutive_network_runs = 0;
            if self.expire_cooldown(&mut state) {
                info!("cooldown cleared");
            }
        }

        state.last_evaluated_run_id = Some(run_id);
        repo.save(&state).await?;
        Ok(state)
    }

    /// Returns true when an active-but-elapsed cooldown was cleared.
    fn expire_cooldown(&self, state: &mut SafetyState) -> bool {
        if !state.cooldown_active {
            return false;
        }
        let expired = state
            .cooldown_until
            .map(|until| until <= self.clock.now())
            .unwrap_or(true);
        if expired {
            state.cooldown_active = false;
            state.cooldown_reason = CooldownReason::None;
            state.cooldown_until = None;
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use scholarr_common::ManualClock;
    use scholarr_db::users::UserRepository;

    struct Fixture {
        db: Arc<Database>,
        clock: Arc<ManualClock>,
        user_id: i64,
    }

    async fn fixture() -> Fixture {
        let db = Arc::new(Database::connect_memory().await.unwrap());
        let user_id = UserRepository::new(db.clone())
            .insert("ada@example.com", false, Utc::now())
            .await
            .unwrap();
        Fixture {
            db,
            clock: Arc::new(ManualClock::new(Utc::now())),
            user_id,
        }
    }

    fn controller(f: &Fixture) -> SafetyController {
        let mut ingestion = IngestionSettings::default();
        ingestion.alert_blocked_failure_threshold = 1;
        ingestion.alert_network_failure_threshold = 3;
        ingestion.cooldown_blocked_seconds = 1800;
        ingestion.cooldown_network_seconds = 900;
        SafetyController::new(
            f.db.clone(),
            f.clock.clone(),
            ingestion,
            PolicySettings::default(),
        )
    }

    #[tokio::test]
    async fn blocked_threshold_enters_cooldown_and_refuses_runs() {
        let f = fixture().await;
        let controller = controller(&f);

        // Healthy before observation.
        assert!(matches!(
            controller.admit(f.user_id, RunTrigger::Manual).await.unwrap(),
            Admission::Admitted
        ));

        let state = controller.observe_run(f.user_id, 1, 1, 0).await.unwrap();
        assert!(state.cooldown_active);
        assert_eq!(state.cooldown_reason, CooldownReason::Blocked);
        assert_eq!(state.consecutive_blocked_runs, 1);
        assert_eq!(
            state.cooldown_until.unwrap(),
            f.clock.now() + ChronoDuration::seconds(1800)
        );

        // Manual trigger inside the window is refused with the state attached.
        match controller.admit(f.user_id, RunTrigger::Manual).await.unwrap() {
            Admission::Refused(Refusal::CooldownActive { state }) => {
                assert_eq!(state.cooldown_reason, CooldownReason::Blocked)
            }
            other => panic!("expected cooldown refusal, got {other:?}"),
        }

        // After the window the gate opens again.
        f.clock.advance(ChronoDuration::seconds(1801));
        assert!(matches!(
            controller.admit(f.user_id, RunTrigger::Scheduled).await.unwrap(),
            Admission::Admitted
        ));
        let state = controller.state(f.user_id).await.unwrap();
        assert!(!state.cooldown_active);
        assert_eq!(state.cooldown_reason, CooldownReason::None);
    }

    #[tokio::test]
    async fn network_threshold_uses_its_own_window() {
        let f = fixture().await;
        let controller = controller(&f);

        // Below threshold: nothing happens.
        let state = controller.observe_run(f.user_id, 1, 0, 2).await.unwrap();
        assert!(!state.cooldown_active);

        let state = controller.observe_run(f.user_id, 2, 0, 3).await.unwrap();
        assert!(state.cooldown_active);
        assert_eq!(state.cooldown_reason, CooldownReason::Network);
        assert_eq!(
            state.cooldown_until.unwrap(),
            f.clock.now() + ChronoDuration::seconds(900)
        );
        assert_eq!(state.last_evaluated_run_id, Some(2));
    }

    #[tokio::test]
    async fn healthy_run_clears_counters() {
        let f = fixture().await;
        let controller = controller(&f);

        controller.observe_run(f.user_id, 1, 1, 0).await.unwrap();
        f.clock.advance(ChronoDuration::seconds(1801));
        let state = controller.observe_run(f.user_id, 2, 0, 0).await.unwrap();
        assert!(!state.cooldown_active);
        assert_eq!(state.consecutive_blocked_runs, 0);
        assert_eq!(state.consecutive_network_runs, 0);
    }

    #[tokio::test]
    async fn policy_flags_gate_triggers() {
        let f = fixture().await;
        let mut policy = PolicySettings::default();
        policy.manual_runs_enabled = false;
        policy.automation_enabled = false;
        let controller = SafetyController::new(
            f.db.clone(),
            f.clock.clone(),
            IngestionSettings::default(),
            policy,
        );

        assert!(matches!(
            controller.admit(f.user_id, RunTrigger::Manual).await.unwrap(),
            Admission::Refused(Refusal::ManualRunsDisabled)
        ));
        assert!(matches!(
            controller.admit(f.user_id, RunTrigger::Scheduled).await.unwrap(),
            Admission::Refused(Refusal::AutomationDisabled)
        ));
        assert!(matches!(
            controller.admit(f.user_id, RunTrigger::Continuation).await.unwrap(),
            Admission::Refused(Refusal::AutomationDisabled)
        ));
    }

    #[tokio::test]
    async fn active_run_refuses_with_its_id() {
        let f = fixture().await;
        let controller = controller(&f);
        let run_id = RunRepository::new(f.db.clone())
            .create(f.user_id, RunTrigger::Manual, Utc::now())
            .await
            .unwrap()
            .unwrap();

        match controller.admit(f.user_id, RunTrigger::Scheduled).await.unwrap() {
            Admission::Refused(Refusal::RunInProgress { run_id: active }) => {
                assert_eq!(active, run_id)
            }
            other => panic!("expected run-in-progress refusal, got {other:?}"),
        }
    }
}
