//! PDF resolution queue workers.
//!
//! Publications that finished a run without a PDF URL are enqueued; workers
//! claim one item at a time (row-level claim in the queue repository) and
//! try Unpaywall, then arXiv. Transient failures reschedule with bounded
//! exponential backoff; a missing open-access copy is terminal until an
//! operator retries it.

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use scholarr_common::clock::{Clock, SharedClock};
use scholarr_common::Result;
use scholarr_config::PdfSettings;
use scholarr_db::publications::{PdfStatus, Publication, PublicationRepository};
use scholarr_db::queues::{PdfQueueItem, PdfQueueRepository};
use scholarr_db::Database;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::gateway::{FetchOutcome, Gateway};

/// One provider's verdict for one publication.
#[derive(Debug, Clone)]
pub enum PdfAttempt {
    Resolved(String),
    /// This provider knows no copy; the next provider may.
    NoCopy(String),
    /// Transient failure; worth retrying later.
    Retryable(String),
}

#[async_trait]
pub trait PdfProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn locate(&self, publication: &Publication) -> PdfAttempt;
}

// ── Unpaywall ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct UnpaywallResponse {
    best_oa_location: Option<UnpaywallLocation>,
}

#[derive(Debug, Deserialize)]
struct UnpaywallLocation {
    url_for_pdf: Option<String>,
}

/// Open-access lookup by DOI.
///
/// API: https://api.unpaywall.org/v2 (requires an email, no key).
pub struct UnpaywallProvider {
    gateway: Arc<Gateway>,
    email: String,
}

impl UnpaywallProvider {
    pub fn new(gateway: Arc<Gateway>, email: impl Into<String>) -> Self {
        Self {
            gateway,
            email: email.into(),
        }
    }
}

#[async_trait]
impl PdfProvider for UnpaywallProvider {
    fn name(&self) -> &'static str {
        "unpaywall"
    }

    async fn locate(&self, publication: &Publication) -> PdfAttempt {
        let Some(doi) = &publication.doi else {
            return PdfAttempt::NoCopy("no doi".to_string());
        };
        let url = format!(
            "https://api.unpaywall.org/v2/{}?email={}",
            doi,
            urlencoded(&self.email)
        );
        let Ok(url) = Url::parse(&url) else {
            return PdfAttempt::NoCopy(format!("unparseable doi: {doi}"));
        };

        match self.gateway.fetch_api(&url).await {
            FetchOutcome::Ok { body, .. } => match serde_json::from_str::<UnpaywallResponse>(&body)
            {
                Ok(response) => match response.best_oa_location.and_then(|l| l.url_for_pdf) {
                    Some(pdf_url) => PdfAttempt::Resolved(pdf_url),
                    None => PdfAttempt::NoCopy("no open-access copy known".to_string()),
                },
                Err(err) => PdfAttempt::Retryable(format!("unpaywall response parse: {err}")),
            },
            FetchOutcome::NotFound => PdfAttempt::NoCopy("doi unknown to unpaywall".to_string()),
            FetchOutcome::Blocked => PdfAttempt::Retryable("unpaywall blocked".to_string()),
            FetchOutcome::RateLimited { .. } => {
                PdfAttempt::Retryable("unpaywall rate limited".to_string())
            }
            FetchOutcome::NetworkError { cause } => PdfAttempt::Retryable(cause),
        }
    }
}

fn urlencoded(s: &str) -> String {
    s.replace('@', "%40")
}

// ── arXiv ─────────────────────────────────────────────────────────────────

/// arXiv serves every paper's PDF at a stable URL derived from its id.
pub struct ArxivPdfProvider;

#[async_trait]
impl PdfProvider for ArxivPdfProvider {
    fn name(&self) -> &'static str {
        "arxiv"
    }

    async fn locate(&self, publication: &Publication) -> PdfAttempt {
        match &publication.arxiv_id {
            Some(arxiv_id) => PdfAttempt::Resolved(format!("https://arxiv.org/pdf/{arxiv_id}")),
            None => PdfAttempt::NoCopy("no arxiv id".to_string()),
        }
    }
}

// ── Resolver ──────────────────────────────────────────────────────────────

pub struct PdfResolver {
    db: Arc<Database>,
    clock: SharedClock,
    settings: PdfSettings,
    providers: Vec<Box<dyn PdfProvider>>,
}

impl PdfResolver {
    pub fn new(
        db: Arc<Database>,
        clock: SharedClock,
        gateway: Arc<Gateway>,
        settings: PdfSettings,
    ) -> Self {
        let providers: Vec<Box<dyn PdfProvider>> = vec![
            Box::new(UnpaywallProvider::new(gateway, settings.unpaywall_email.clone())),
            Box::new(ArxivPdfProvider),
        ];
        Self::with_providers(db, clock, settings, providers)
    }

    pub fn with_providers(
        db: Arc<Database>,
        clock: SharedClock,
        settings: PdfSettings,
        providers: Vec<Box<dyn PdfProvider>>,
    ) -> Self {
        Self {
            db,
            clock,
            settings,
            providers,
        }
    }

    /// Queue every publication of the run that still lacks a PDF URL.
    #[instrument(skip(self))]
    pub async fn enqueue_missing_for_run(&self, run_id: i64) -> Result<usize> {
        let publications = PublicationRepository::new(self.db.clone());
        let queue = PdfQueueRepository::new(self.db.clone());
        let now = self.clock.now();

        let mut queued = 0;
        for publication in publications.list_missing_pdf_for_run(run_id).await? {
            if queue.enqueue(publication.id, now).await? {
                publications
                    .set_pdf_state(
                        publication.id,
                        PdfStatus::Queued,
                        publication.pdf_attempt_count,
                        None,
                        now,
                    )
                    .await?;
                queued += 1;
            }
        }
        info!(queued, "pdf queue fed from run");
        Ok(queued)
    }

    /// Operator retry for a terminally-failed publication: fresh attempt
    /// budget, back into the queue. Returns false if the publication is gone.
    pub async fn retry_publication(&self, publication_id: i64) -> Result<bool> {
        let publications = PublicationRepository::new(self.db.clone());
        let queue = PdfQueueRepository::new(self.db.clone());
        let now = self.clock.now();

        let Some(publication) = publications.find_by_id(publication_id).await? else {
            return Ok(false);
        };
        publications
            .set_pdf_state(publication.id, PdfStatus::Queued, 0, None, now)
            .await?;
        queue.enqueue(publication.id, now).await?;
        Ok(true)
    }

    /// Claim and resolve due items until none remain. One call of this is one
    /// worker; run several concurrently for a pool.
    pub async fn drain(&self) -> Result<usize> {
        let queue = PdfQueueRepository::new(self.db.clone());
        let mut processed = 0;
        while let Some(item) = queue.claim_next(self.clock.now()).await? {
            self.resolve_item(&item).await?;
            processed += 1;
        }
        Ok(processed)
    }

    #[instrument(skip(self, item), fields(publication = item.publication_id, attempt = item.attempt_count))]
    async fn resolve_item(&self, item: &PdfQueueItem) -> Result<()> {
        let publications = PublicationRepository::new(self.db.clone());
        let queue = PdfQueueRepository::new(self.db.clone());
        let now = self.clock.now();

        let Some(publication) = publications.find_by_id(item.publication_id).await? else {
            // Publication merged away while queued.
            queue.mark_resolved(item.id).await?;
            return Ok(());
        };
        publications
            .set_pdf_state(
                publication.id,
                PdfStatus::Running,
                item.attempt_count,
                None,
                now,
            )
            .await?;

        let mut retryable: Option<String> = None;
        let mut no_copy = String::from("no provider applicable");
        for provider in &self.providers {
            match provider.locate(&publication).await {
                PdfAttempt::Resolved(pdf_url) => {
                    info!(provider = provider.name(), "pdf resolved");
                    publications
                        .set_pdf_resolved(publication.id, &pdf_url, now)
                        .await?;
                    queue.mark_resolved(item.id).await?;
                    return Ok(());
                }
                PdfAttempt::NoCopy(reason) => {
                    debug!(provider = provider.name(), reason = %reason, "no copy");
                    no_copy = reason;
                }
                PdfAttempt::Retryable(reason) => {
                    warn!(provider = provider.name(), reason = %reason, "retryable failure");
                    retryable.get_or_insert(reason);
                }
            }
        }

        match retryable {
            Some(reason) => {
                let backoff_secs = (self.settings.base_backoff_seconds
                    * 2u64.pow(item.attempt_count.min(30) as u32))
                .min(self.settings.max_backoff_seconds);
                let attempt_count = item.attempt_count + 1;
                if attempt_count >= self.settings.max_attempts as i64 {
                    warn!(attempts = attempt_count, "pdf attempts exhausted, abandoning");
                    queue.mark_abandoned(item.id, attempt_count, &reason).await?;
                    publications
                        .set_pdf_state(
                            publication.id,
                            PdfStatus::Failed,
                            attempt_count,
                            Some(&reason),
                            now,
                        )
                        .await?;
                } else {
                    let next = now + ChronoDuration::seconds(backoff_secs as i64);
                    queue.mark_retry(item.id, attempt_count, next, &reason).await?;
                    publications
                        .set_pdf_state(
                            publication.id,
                            PdfStatus::Queued,
                            attempt_count,
                            Some(&reason),
                            now,
                        )
                        .await?;
                }
            }
            None => {
                queue.mark_failed(item.id, item.attempt_count, &no_copy).await?;
                publications
                    .set_pdf_state(
                        publication.id,
                        PdfStatus::Failed,
                        item.attempt_count,
                        Some(&no_copy),
                        now,
                    )
                    .await?;
            }
        }
        Ok(())
    }
}
