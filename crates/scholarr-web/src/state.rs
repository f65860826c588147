//! Shared application state for the web server.

use scholarr_common::clock::SharedClock;
use scholarr_config::Settings;
use scholarr_db::Database;
use scholarr_ingestion::name_search::NameSearchClient;
use scholarr_ingestion::pdf::PdfResolver;
use scholarr_runtime::events::EventBus;
use scholarr_runtime::safety::SafetyController;
use scholarr_runtime::scheduler::Scheduler;
use std::sync::Arc;

/// State injected into every handler. Everything is behind an `Arc`, so the
/// clone per request is cheap.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub clock: SharedClock,
    pub settings: Settings,
    pub events: Arc<EventBus>,
    pub scheduler: Arc<Scheduler>,
    pub safety: Arc<SafetyController>,
    pub pdf: Arc<PdfResolver>,
    pub name_search: Arc<NameSearchClient>,
}
