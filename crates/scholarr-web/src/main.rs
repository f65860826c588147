//! Scholarr server binary.
//!
//! Run with: cargo run -p scholarr-web

use scholarr_common::clock::{Clock, SharedClock};
use scholarr_common::SystemClock;
use scholarr_config::Settings;
use scholarr_db::users::UserRepository;
use scholarr_db::Database;
use scholarr_ingestion::enrichment::EnrichmentRunner;
use scholarr_ingestion::fetcher::{HttpProfileFetcher, ProfileFetcher};
use scholarr_ingestion::gateway::Gateway;
use scholarr_ingestion::name_search::NameSearchClient;
use scholarr_ingestion::pdf::PdfResolver;
use scholarr_runtime::events::EventBus;
use scholarr_runtime::run::RunDriver;
use scholarr_runtime::safety::SafetyController;
use scholarr_runtime::scheduler::Scheduler;
use scholarr_web::router::build_router;
use scholarr_web::state::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = Settings::load()?;
    let clock: SharedClock = Arc::new(SystemClock);

    let db = Arc::new(Database::connect(&settings.server.database_url).await?);
    db.initialize().await?;
    bootstrap_admin(&db, &clock).await?;

    let gateway = Arc::new(Gateway::new(clock.clone(), settings.ingestion.clone())?);
    let fetcher: Arc<dyn ProfileFetcher> =
        Arc::new(HttpProfileFetcher::new(gateway.clone(), &settings.ingestion));
    let enrichment = Arc::new(EnrichmentRunner::new(
        db.clone(),
        clock.clone(),
        gateway.clone(),
    ));
    let pdf = Arc::new(PdfResolver::new(
        db.clone(),
        clock.clone(),
        gateway.clone(),
        settings.pdf.clone(),
    ));
    let safety = Arc::new(SafetyController::new(
        db.clone(),
        clock.clone(),
        settings.ingestion.clone(),
        settings.policy.clone(),
    ));
    let events = Arc::new(EventBus::new());
    let name_search = Arc::new(NameSearchClient::new(
        gateway.clone(),
        clock.clone(),
        settings.name_search.clone(),
    ));

    let driver = Arc::new(RunDriver::new(
        db.clone(),
        clock.clone(),
        settings.clone(),
        events.clone(),
        fetcher,
        enrichment,
        pdf.clone(),
        safety.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = Arc::new(Scheduler::new(
        db.clone(),
        clock.clone(),
        settings.clone(),
        driver,
        safety.clone(),
        pdf.clone(),
        shutdown_rx,
    ));
    let scheduler_task = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.run_loop().await }
    });

    let state = AppState {
        db,
        clock,
        settings: settings.clone(),
        events,
        scheduler,
        safety,
        pdf,
        name_search,
    };
    let app = build_router(state);

    let addr: SocketAddr = settings.server.bind_addr.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "scholarr listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    // Let the scheduler cancel in-flight runs and drain.
    scheduler_task.await?;
    Ok(())
}

/// First start on an empty database: create the admin and print its token.
async fn bootstrap_admin(db: &Arc<Database>, clock: &SharedClock) -> anyhow::Result<()> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
        .fetch_one(db.pool())
        .await?;
    if count > 0 {
        return Ok(());
    }

    let users = UserRepository::new(db.clone());
    let user_id = users.insert("admin@localhost", true, clock.now()).await?;
    let token = uuid::Uuid::new_v4().simple().to_string();
    users.set_api_token(user_id, &token).await?;
    info!(user_id, token, "created initial admin user");
    Ok(())
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
}
