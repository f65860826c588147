//! Post-run identifier discovery.
//!
//! After every scholar in a run reaches a terminal state, publications with
//! an incomplete identifier set are looked up against OpenAlex, Crossref,
//! and arXiv, in that order. Newly shared identifiers trigger a best-effort
//! merge: links move to the older publication and the younger row is
//! deleted.

pub mod arxiv;
pub mod crossref;
pub mod openalex;

use async_trait::async_trait;
use scholarr_common::clock::{Clock, SharedClock};
use scholarr_common::{fingerprint, Result};
use scholarr_db::publications::{Publication, PublicationRepository};
use scholarr_db::Database;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::gateway::Gateway;

/// Identifiers a provider managed to recover for one publication.
#[derive(Debug, Clone, Default)]
pub struct IdentifierFindings {
    pub doi: Option<String>,
    pub arxiv_id: Option<String>,
    pub pmid: Option<String>,
    pub openalex_id: Option<String>,
}

impl IdentifierFindings {
    fn merge_missing(&mut self, other: IdentifierFindings) {
        self.doi = self.doi.take().or(other.doi);
        self.arxiv_id = self.arxiv_id.take().or(other.arxiv_id);
        self.pmid = self.pmid.take().or(other.pmid);
        self.openalex_id = self.openalex_id.take().or(other.openalex_id);
    }

    fn is_empty(&self) -> bool {
        self.doi.is_none()
            && self.arxiv_id.is_none()
            && self.pmid.is_none()
            && self.openalex_id.is_none()
    }

    /// Drop malformed values; the dedup indexes only ever see canonical forms.
    fn normalized(mut self) -> Self {
        self.doi = self.doi.as_deref().and_then(fingerprint::normalize_doi);
        self.arxiv_id = self
            .arxiv_id
            .as_deref()
            .and_then(fingerprint::normalize_arxiv_id);
        self
    }
}

/// Common interface for the identifier metadata services.
#[async_trait]
pub trait IdentifierProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn lookup(&self, publication: &Publication) -> Result<IdentifierFindings>;
}

/// One applied identifier change, published as `identifier_updated`.
#[derive(Debug, Clone)]
pub struct IdentifierUpdate {
    pub publication_id: i64,
    pub display_identifier: String,
}

pub struct EnrichmentRunner {
    db: Arc<Database>,
    clock: SharedClock,
    providers: Vec<Box<dyn IdentifierProvider>>,
}

impl EnrichmentRunner {
    pub fn new(db: Arc<Database>, clock: SharedClock, gateway: Arc<Gateway>) -> Self {
        let providers: Vec<Box<dyn IdentifierProvider>> = vec![
            Box::new(openalex::OpenAlexClient::new(gateway.clone())),
            Box::new(crossref::CrossRefClient::new(gateway.clone())),
            Box::new(arxiv::ArxivClient::new(gateway)),
        ];
        Self::with_providers(db, clock, providers)
    }

    pub fn with_providers(
        db: Arc<Database>,
        clock: SharedClock,
        providers: Vec<Box<dyn IdentifierProvider>>,
    ) -> Self {
        Self {
            db,
            clock,
            providers,
        }
    }

    /// Enrich every incomplete publication discovered in `run_id`. Provider
    /// failures are logged and skipped; enrichment never fails a run.
    #[instrument(skip(self))]
    pub async fn enrich_run(&self, run_id: i64) -> Result<Vec<IdentifierUpdate>> {
        let repo = PublicationRepository::new(self.db.clone());
        let pending = repo.list_incomplete_for_run(run_id).await?;
        info!(candidates = pending.len(), "starting enrichment pass");

        let mut updates = Vec::new();
        for publication in pending {
            match self.enrich_one(&repo, &publication).await {
                Ok(Some(update)) => updates.push(update),
                Ok(None) => {}
                Err(err) => {
                    warn!(publication = publication.id, error = %err, "enrichment failed");
                }
            }
        }
        info!(updated = updates.len(), "enrichment pass complete");
        Ok(updates)
    }

    async fn enrich_one(
        &self,
        repo: &PublicationRepository,
        publication: &Publication,
    ) -> Result<Option<IdentifierUpdate>> {
        let mut findings = IdentifierFindings::default();
        for provider in &self.providers {
            if !wants_lookup(provider.name(), publication, &findings) {
                continue;
            }
            match provider.lookup(publication).await {
                Ok(found) => findings.merge_missing(found),
                Err(err) => {
                    warn!(provider = provider.name(), publication = publication.id,
                          error = %err, "provider lookup failed");
                }
            }
        }
        let findings = findings.normalized();
        if findings.is_empty() {
            return Ok(None);
        }

        // Another publication may already own one of these identifiers; in
        // that case the two rows describe the same work and must merge
        // before the identifier lands anywhere.
        if let Some(twin) = repo
            .find_by_any_identifier(
                findings.doi.as_deref(),
                findings.arxiv_id.as_deref(),
                findings.pmid.as_deref(),
            )
            .await?
        {
            if twin.id != publication.id {
                let (winner, loser) = pick_winner(publication, &twin);
                info!(winner, loser, "merging identifier twins");
                repo.merge(winner, loser, self.clock.now()).await?;
                let winner_row = repo.find_by_id(winner).await?;
                let updated = repo
                    .apply_identifiers(
                        winner,
                        findings.doi.as_deref(),
                        findings.arxiv_id.as_deref(),
                        findings.pmid.as_deref(),
                        findings.openalex_id.as_deref(),
                        self.clock.now(),
                    )
                    .await?
                    .or(winner_row);
                return Ok(updated.and_then(|p| {
                    p.display_identifier().map(|display_identifier| IdentifierUpdate {
                        publication_id: p.id,
                        display_identifier,
                    })
                }));
            }
        }

        let updated = repo
            .apply_identifiers(
                publication.id,
                findings.doi.as_deref(),
                findings.arxiv_id.as_deref(),
                findings.pmid.as_deref(),
                findings.openalex_id.as_deref(),
                self.clock.now(),
            )
            .await?;

        Ok(updated.and_then(|p| {
            p.display_identifier().map(|display_identifier| IdentifierUpdate {
                publication_id: p.id,
                display_identifier,
            })
        }))
    }
}

/// Whether a provider can still contribute given what is already known.
fn wants_lookup(provider: &str, publication: &Publication, findings: &IdentifierFindings) -> bool {
    let doi_known = publication.doi.is_some() || findings.doi.is_some();
    let arxiv_known = publication.arxiv_id.is_some() || findings.arxiv_id.is_some();
    let openalex_known = publication.openalex_id.is_some() || findings.openalex_id.is_some();
    match provider {
        "openalex" => !doi_known || !openalex_known,
        "crossref" => !doi_known,
        "arxiv" => !arxiv_known,
        _ => true,
    }
}

/// Older `created_at` wins; ties break toward the lower id.
fn pick_winner(a: &Publication, b: &Publication) -> (i64, i64) {
    if (b.created_at, b.id) < (a.created_at, a.id) {
        (b.id, a.id)
    } else {
        (a.id, b.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use scholarr_common::SystemClock;
    use scholarr_db::links::{upsert_link, LinkRepository};
    use scholarr_db::publications::{resolve_or_create, PublicationCandidate};
    use scholarr_db::runs::{RunRepository, RunTrigger};
    use scholarr_db::scholars::ScholarRepository;
    use scholarr_db::users::UserRepository;

    struct StaticProvider {
        name: &'static str,
        findings: IdentifierFindings,
    }

    #[async_trait]
    impl IdentifierProvider for StaticProvider {
        fn name(&self) -> &'static str {
            self.name
        }
        async fn lookup(&self, _publication: &Publication) -> Result<IdentifierFindings> {
            Ok(self.findings.clone())
        }
    }

    struct Fixture {
        db: Arc<Database>,
        run_id: i64,
        scholar_id: i64,
    }

    async fn fixture() -> Fixture {
        let db = Arc::new(Database::connect_memory().await.unwrap());
        let now = Utc::now();
        let user_id = UserRepository::new(db.clone())
            .insert("ada@example.com", false, now)
            .await
            .unwrap();
        let scholar_id = ScholarRepository::new(db.clone())
            .insert(user_id, "AbCdEfGhIjKl", "Ada", now)
            .await
            .unwrap();
        let run_id = RunRepository::new(db.clone())
            .create(user_id, RunTrigger::Manual, now)
            .await
            .unwrap()
            .unwrap();
        Fixture {
            db,
            run_id,
            scholar_id,
        }
    }

    async fn seed_publication(f: &Fixture, title: &str, fingerprint: &str) -> i64 {
        let now = Utc::now();
        let mut tx = f.db.pool().begin().await.unwrap();
        let id = resolve_or_create(
            &mut *tx,
            &PublicationCandidate {
                fingerprint: fingerprint.to_string(),
                canonical_title: title.to_string(),
                ..Default::default()
            },
            now,
        )
        .await
        .unwrap()
        .id;
        upsert_link(&mut *tx, f.scholar_id, id, f.run_id, 0, None, now)
            .await
            .unwrap();
        tx.commit().await.unwrap();
        id
    }

    #[tokio::test]
    async fn discovered_doi_is_applied_and_reported() {
        let f = fixture().await;
        let publication_id = seed_publication(&f, "A publication without ids", "fp-1").await;

        let runner = EnrichmentRunner::with_providers(
            f.db.clone(),
            Arc::new(SystemClock),
            vec![Box::new(StaticProvider {
                name: "openalex",
                findings: IdentifierFindings {
                    doi: Some("https://doi.org/10.1000/XYZ".to_string()),
                    openalex_id: Some("W12345".to_string()),
                    ..Default::default()
                },
            })],
        );
        let updates = runner.enrich_run(f.run_id).await.unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].publication_id, publication_id);
        // The event carries the normalized DOI.
        assert_eq!(updates[0].display_identifier, "10.1000/xyz");

        let publication = PublicationRepository::new(f.db.clone())
            .find_by_id(publication_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(publication.doi.as_deref(), Some("10.1000/xyz"));
        assert_eq!(publication.openalex_id.as_deref(), Some("W12345"));
    }

    #[tokio::test]
    async fn shared_identifier_merges_into_older_row() {
        let f = fixture().await;
        let older = seed_publication(&f, "Preprint version", "fp-old").await;
        let newer = seed_publication(&f, "Published version", "fp-new").await;

        // The older row already owns the DOI the provider now reports for
        // the newer row.
        let repo = PublicationRepository::new(f.db.clone());
        repo.apply_identifiers(older, Some("10.1000/same"), None, None, None, Utc::now())
            .await
            .unwrap();

        let runner = EnrichmentRunner::with_providers(
            f.db.clone(),
            Arc::new(SystemClock),
            vec![Box::new(StaticProvider {
                name: "crossref",
                findings: IdentifierFindings {
                    doi: Some("10.1000/same".to_string()),
                    ..Default::default()
                },
            })],
        );
        runner.enrich_run(f.run_id).await.unwrap();

        assert!(repo.find_by_id(newer).await.unwrap().is_none(), "loser deleted");
        let winner = repo.find_by_id(older).await.unwrap().unwrap();
        assert_eq!(winner.doi.as_deref(), Some("10.1000/same"));
        // The scholar keeps exactly one link, now to the winner.
        let link = LinkRepository::new(f.db.clone())
            .find(f.scholar_id, older)
            .await
            .unwrap();
        assert!(link.is_some());
    }

    #[tokio::test]
    async fn provider_skipped_when_it_cannot_contribute() {
        let f = fixture().await;
        let publication_id = seed_publication(&f, "Already has a doi", "fp-done").await;
        let repo = PublicationRepository::new(f.db.clone());
        repo.apply_identifiers(
            publication_id,
            Some("10.1/a"),
            Some("2301.00001"),
            None,
            Some("W1"),
            Utc::now(),
        )
        .await
        .unwrap();

        let publication = repo.find_by_id(publication_id).await.unwrap().unwrap();
        let findings = IdentifierFindings::default();
        assert!(!wants_lookup("openalex", &publication, &findings));
        assert!(!wants_lookup("crossref", &publication, &findings));
        assert!(!wants_lookup("arxiv", &publication, &findings));
    }
}
