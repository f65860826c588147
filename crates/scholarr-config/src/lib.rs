//! Configuration loading for Scholarr.
//! Reads scholarr.toml (path in SCHOLARR_CONFIG env var, optional), then
//! applies environment overrides, then clamps values to the server floors.
//!
//! The resulting [`Settings`] is a snapshot: it is captured once at startup
//! (and carried by value into each run), never re-read mid-run.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub ingestion: IngestionSettings,
    #[serde(default)]
    pub continuation: ContinuationSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub pdf: PdfSettings,
    #[serde(default)]
    pub name_search: NameSearchSettings,
    #[serde(default)]
    pub policy: PolicySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
}

fn default_bind_addr()    -> String { "127.0.0.1:8490".to_string() }
fn default_database_url() -> String { "sqlite://scholarr.db".to_string() }

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            database_url: default_database_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionSettings {
    /// Hard floor applied to any user-configured per-request delay.
    #[serde(default = "default_min_request_delay")]
    pub min_request_delay_seconds: u64,
    /// Hard floor for the auto-run interval.
    #[serde(default = "default_min_run_interval")]
    pub min_run_interval_minutes: u64,
    #[serde(default = "default_max_pages")]
    pub max_pages_per_scholar: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Per-request deadline; a scholar's soft deadline is this times the page cap.
    #[serde(default = "default_page_deadline")]
    pub page_deadline_seconds: u64,
    #[serde(default = "default_network_retries")]
    pub network_error_retries: u32,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_seconds: u64,
    /// Uniform jitter in `[0, jitter)` added on top of the pacing gap.
    #[serde(default = "default_request_jitter")]
    pub request_jitter_seconds: f64,
    #[serde(default = "default_blocked_threshold")]
    pub alert_blocked_failure_threshold: u32,
    #[serde(default = "default_network_threshold")]
    pub alert_network_failure_threshold: u32,
    #[serde(default = "default_cooldown_blocked")]
    pub cooldown_blocked_seconds: u64,
    #[serde(default = "default_cooldown_network")]
    pub cooldown_network_seconds: u64,
}

fn default_min_request_delay() -> u64 { 2 }
fn default_min_run_interval()  -> u64 { 15 }
fn default_max_pages()         -> u32 { 30 }
fn default_page_size()         -> u32 { 100 }
fn default_page_deadline()     -> u64 { 30 }
fn default_network_retries()   -> u32 { 1 }
fn default_retry_backoff()     -> u64 { 2 }
fn default_request_jitter()    -> f64 { 1.5 }
fn default_blocked_threshold() -> u32 { 2 }
fn default_network_threshold() -> u32 { 3 }
fn default_cooldown_blocked()  -> u64 { 1800 }
fn default_cooldown_network()  -> u64 { 900 }

impl Default for IngestionSettings {
    fn default() -> Self {
        toml::from_str("").expect("empty ingestion settings deserialize")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuationSettings {
    #[serde(default = "default_continuation_base")]
    pub base_delay_seconds: u64,
    #[serde(default = "default_continuation_max_delay")]
    pub max_delay_seconds: u64,
    #[serde(default = "default_continuation_attempts")]
    pub max_attempts: u32,
}

fn default_continuation_base()      -> u64 { 120 }
fn default_continuation_max_delay() -> u64 { 3600 }
fn default_continuation_attempts()  -> u32 { 5 }

impl Default for ContinuationSettings {
    fn default() -> Self {
        toml::from_str("").expect("empty continuation settings deserialize")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    #[serde(default = "default_tick")]
    pub tick_seconds: u64,
    /// Due continuation items drained per tick.
    #[serde(default = "default_queue_batch")]
    pub queue_batch_size: u32,
    /// Bound on concurrently-running user runs.
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    /// Duplicate manual submissions inside this window return the in-flight run.
    #[serde(default = "default_idempotency_window")]
    pub manual_idempotency_seconds: u64,
}

fn default_tick()                -> u64 { 60 }
fn default_queue_batch()         -> u32 { 10 }
fn default_max_concurrent_runs() -> usize { 2 }
fn default_idempotency_window()  -> u64 { 60 }

impl Default for SchedulerSettings {
    fn default() -> Self {
        toml::from_str("").expect("empty scheduler settings deserialize")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PdfSettings {
    #[serde(default = "default_pdf_workers")]
    pub workers: usize,
    #[serde(default = "default_pdf_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_pdf_base_backoff")]
    pub base_backoff_seconds: u64,
    #[serde(default = "default_pdf_max_backoff")]
    pub max_backoff_seconds: u64,
    /// Contact address sent to Unpaywall (required by its API).
    #[serde(default = "default_unpaywall_email")]
    pub unpaywall_email: String,
}

fn default_pdf_workers()      -> usize { 2 }
fn default_pdf_attempts()     -> u32 { 5 }
fn default_pdf_base_backoff() -> u64 { 60 }
fn default_pdf_max_backoff()  -> u64 { 3600 }
fn default_unpaywall_email()  -> String { "scholarr@example.com".to_string() }

impl Default for PdfSettings {
    fn default() -> Self {
        toml::from_str("").expect("empty pdf settings deserialize")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameSearchSettings {
    #[serde(default = "default_ns_min_interval")]
    pub min_interval_seconds: u64,
    #[serde(default = "default_ns_jitter")]
    pub interval_jitter_seconds: f64,
    /// Consecutive blocked responses before the breaker opens.
    #[serde(default = "default_ns_block_threshold")]
    pub cooldown_block_threshold: u32,
    #[serde(default = "default_ns_cooldown")]
    pub cooldown_seconds: u64,
    #[serde(default = "default_ns_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "default_ns_positive_ttl")]
    pub positive_ttl_seconds: u64,
    #[serde(default = "default_ns_negative_ttl")]
    pub negative_ttl_seconds: u64,
}

fn default_ns_min_interval()    -> u64 { 10 }
fn default_ns_jitter()          -> f64 { 4.0 }
fn default_ns_block_threshold() -> u32 { 3 }
fn default_ns_cooldown()        -> u64 { 1800 }
fn default_ns_cache_capacity()  -> usize { 256 }
fn default_ns_positive_ttl()    -> u64 { 86_400 }
fn default_ns_negative_ttl()    -> u64 { 600 }

impl Default for NameSearchSettings {
    fn default() -> Self {
        toml::from_str("").expect("empty name-search settings deserialize")
    }
}

/// Server-side policy flags, also returned with user settings so the UI can
/// enforce the same floors the server enforces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySettings {
    #[serde(default = "bool_true")]
    pub manual_runs_enabled: bool,
    #[serde(default = "bool_true")]
    pub automation_enabled: bool,
}

fn bool_true() -> bool { true }

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            manual_runs_enabled: true,
            automation_enabled: true,
        }
    }
}

impl Settings {
    /// Load from scholarr.toml (if present), apply env overrides, clamp floors.
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let path = std::env::var("SCHOLARR_CONFIG").unwrap_or_else(|_| "scholarr.toml".to_string());

        let mut settings: Settings = if Path::new(&path).exists() {
            let content = std::fs::read_to_string(&path)?;
            toml::from_str(&content)?
        } else {
            Settings::default()
        };

        settings.apply_env()?;
        settings.clamp_floors();
        Ok(settings)
    }

    /// Overlay recognized environment variables onto the snapshot.
    fn apply_env(&mut self) -> anyhow::Result<()> {
        override_u64(&mut self.ingestion.min_request_delay_seconds, "INGESTION_MIN_REQUEST_DELAY_SECONDS")?;
        override_u64(&mut self.ingestion.min_run_interval_minutes, "INGESTION_MIN_RUN_INTERVAL_MINUTES")?;
        override_u32(&mut self.ingestion.max_pages_per_scholar, "INGESTION_MAX_PAGES_PER_SCHOLAR")?;
        override_u32(&mut self.ingestion.page_size, "INGESTION_PAGE_SIZE")?;
        override_u32(&mut self.ingestion.alert_blocked_failure_threshold, "INGESTION_ALERT_BLOCKED_FAILURE_THRESHOLD")?;
        override_u32(&mut self.ingestion.alert_network_failure_threshold, "INGESTION_ALERT_NETWORK_FAILURE_THRESHOLD")?;
        override_u64(&mut self.ingestion.cooldown_blocked_seconds, "INGESTION_COOLDOWN_BLOCKED_SECONDS")?;
        override_u64(&mut self.ingestion.cooldown_network_seconds, "INGESTION_COOLDOWN_NETWORK_SECONDS")?;
        override_u64(&mut self.continuation.base_delay_seconds, "INGESTION_CONTINUATION_BASE_DELAY_SECONDS")?;
        override_u64(&mut self.continuation.max_delay_seconds, "INGESTION_CONTINUATION_MAX_DELAY_SECONDS")?;
        override_u32(&mut self.continuation.max_attempts, "INGESTION_CONTINUATION_MAX_ATTEMPTS")?;
        override_u64(&mut self.name_search.min_interval_seconds, "INGESTION_NAME_SEARCH_MIN_INTERVAL_SECONDS")?;
        override_f64(&mut self.name_search.interval_jitter_seconds, "INGESTION_NAME_SEARCH_INTERVAL_JITTER_SECONDS")?;
        override_u32(&mut self.name_search.cooldown_block_threshold, "INGESTION_NAME_SEARCH_COOLDOWN_BLOCK_THRESHOLD")?;
        override_u64(&mut self.name_search.cooldown_seconds, "INGESTION_NAME_SEARCH_COOLDOWN_SECONDS")?;
        override_bool(&mut self.policy.manual_runs_enabled, "SCHOLARR_MANUAL_RUNS_ENABLED")?;
        override_bool(&mut self.policy.automation_enabled, "SCHOLARR_AUTOMATION_ENABLED")?;

        if let Ok(v) = std::env::var("SCHOLARR_BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Ok(v) = std::env::var("SCHOLARR_DATABASE_URL") {
            self.server.database_url = v;
        }
        if let Ok(v) = std::env::var("SCHOLARR_UNPAYWALL_EMAIL") {
            self.pdf.unpaywall_email = v;
        }
        Ok(())
    }

    /// Enforce the server minima regardless of how the values arrived.
    fn clamp_floors(&mut self) {
        if self.ingestion.min_request_delay_seconds < 2 {
            tracing::warn!(
                configured = self.ingestion.min_request_delay_seconds,
                "min_request_delay_seconds below floor, clamping to 2"
            );
            self.ingestion.min_request_delay_seconds = 2;
        }
        if self.ingestion.min_run_interval_minutes < 15 {
            tracing::warn!(
                configured = self.ingestion.min_run_interval_minutes,
                "min_run_interval_minutes below floor, clamping to 15"
            );
            self.ingestion.min_run_interval_minutes = 15;
        }
    }

    /// Per-request delay for a user: their preference, never below the floor.
    pub fn effective_request_delay_seconds(&self, user_delay: u64) -> u64 {
        user_delay.max(self.ingestion.min_request_delay_seconds)
    }

    /// Auto-run interval for a user: their preference, never below the floor.
    pub fn effective_run_interval_minutes(&self, user_interval: u64) -> u64 {
        user_interval.max(self.ingestion.min_run_interval_minutes)
    }
}

/// Parse `1/0`, `true/false`, `yes/no`, `on/off` (case-insensitive).
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn override_u64(slot: &mut u64, var: &str) -> anyhow::Result<()> {
    if let Ok(raw) = std::env::var(var) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{var} is not a valid integer: {raw:?}"))?;
    }
    Ok(())
}

fn override_u32(slot: &mut u32, var: &str) -> anyhow::Result<()> {
    if let Ok(raw) = std::env::var(var) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{var} is not a valid integer: {raw:?}"))?;
    }
    Ok(())
}

fn override_f64(slot: &mut f64, var: &str) -> anyhow::Result<()> {
    if let Ok(raw) = std::env::var(var) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{var} is not a valid number: {raw:?}"))?;
    }
    Ok(())
}

fn override_bool(slot: &mut bool, var: &str) -> anyhow::Result<()> {
    if let Ok(raw) = std::env::var(var) {
        *slot = parse_bool(&raw).ok_or_else(|| anyhow::anyhow!("{var} is not a valid boolean: {raw:?}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_respect_floors() {
        let s = Settings::default();
        assert!(s.ingestion.min_request_delay_seconds >= 2);
        assert!(s.ingestion.min_run_interval_minutes >= 15);
        assert_eq!(s.ingestion.max_pages_per_scholar, 30);
        assert_eq!(s.ingestion.page_size, 100);
        assert_eq!(s.continuation.base_delay_seconds, 120);
        assert_eq!(s.pdf.workers, 2);
    }

    #[test]
    fn clamp_raises_sub_floor_values() {
        let mut s = Settings::default();
        s.ingestion.min_request_delay_seconds = 0;
        s.ingestion.min_run_interval_minutes = 5;
        s.clamp_floors();
        assert_eq!(s.ingestion.min_request_delay_seconds, 2);
        assert_eq!(s.ingestion.min_run_interval_minutes, 15);
    }

    #[test]
    fn effective_delay_applies_floor() {
        let s = Settings::default();
        assert_eq!(s.effective_request_delay_seconds(0), 2);
        assert_eq!(s.effective_request_delay_seconds(7), 7);
        assert_eq!(s.effective_run_interval_minutes(1), 15);
        assert_eq!(s.effective_run_interval_minutes(60), 60);
    }

    #[test]
    fn bool_parsing_accepts_all_forms() {
        for raw in ["1", "true", "Yes", "ON"] {
            assert_eq!(parse_bool(raw), Some(true), "{raw}");
        }
        for raw in ["0", "False", "no", "off"] {
            assert_eq!(parse_bool(raw), Some(false), "{raw}");
        }
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn toml_snapshot_round_trips() {
        let s = Settings::default();
        let text = toml::to_string(&s).expect("serialize");
        let back: Settings = toml::from_str(&text).expect("deserialize");
        assert_eq!(back.ingestion.page_size, s.ingestion.page_size);
        assert_eq!(back.scheduler.tick_seconds, s.scheduler.tick_seconds);
    }
}
