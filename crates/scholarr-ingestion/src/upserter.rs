//! Batch publication upsert for one (scholar, page).
//!
//! Each page commits in a single transaction: publication resolution and the
//! per-user link writes land together or not at all. Partial pages collected
//! before an interruption therefore survive the interruption.

use scholarr_common::clock::{Clock, SharedClock};
use scholarr_common::{fingerprint, Result};
use scholarr_db::links::{self, LinkUpsert};
use scholarr_db::publications::{self, PublicationCandidate};
use scholarr_db::scholars::ScholarProfile;
use scholarr_db::Database;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::models::PublicationRow;

/// A link created in this run; becomes a `publication_discovered` event.
#[derive(Debug, Clone)]
pub struct DiscoveredPublication {
    pub publication_id: i64,
    pub scholar_profile_id: i64,
    pub title: String,
    pub pub_url: Option<String>,
}

#[derive(Debug, Default)]
pub struct PageUpsertStats {
    pub total: usize,
    pub created_links: usize,
    pub existing_links: usize,
    pub citation_changes: usize,
    pub warnings: Vec<String>,
    pub discovered: Vec<DiscoveredPublication>,
}

impl PageUpsertStats {
    /// True when every row on the page was already linked for this scholar
    /// with unchanged citation counts; the paginator stops walking here.
    pub fn is_stable_tail(&self) -> bool {
        self.total > 0 && self.created_links == 0 && self.citation_changes == 0
    }
}

pub struct Upserter {
    db: Arc<Database>,
    clock: SharedClock,
}

impl Upserter {
    pub fn new(db: Arc<Database>, clock: SharedClock) -> Self {
        Self { db, clock }
    }

    #[instrument(skip(self, rows), fields(scholar = scholar.id, run = run_id, rows = rows.len()))]
    pub async fn upsert_page(
        &self,
        scholar: &ScholarProfile,
        run_id: i64,
        rows: &[PublicationRow],
    ) -> Result<PageUpsertStats> {
        let now = self.clock.now();
        let mut stats = PageUpsertStats {
            total: rows.len(),
            ..Default::default()
        };

        let mut tx = self.db.pool().begin().await?;
        for row in rows {
            let candidate = candidate_from_row(row);
            let resolved = publications::resolve_or_create(&mut *tx, &candidate, now).await?;

            let LinkUpsert {
                created,
                citation_changed,
                citation_regressed,
            } = links::upsert_link(
                &mut *tx,
                scholar.id,
                resolved.id,
                run_id,
                row.citation_count,
                row.pub_url.as_deref(),
                now,
            )
            .await?;

            if created {
                stats.created_links += 1;
                stats.discovered.push(DiscoveredPublication {
                    publication_id: resolved.id,
                    scholar_profile_id: scholar.id,
                    title: row.title.clone(),
                    pub_url: row.pub_url.clone(),
                });
            } else {
                stats.existing_links += 1;
            }
            if citation_changed {
                stats.citation_changes += 1;
            }
            if citation_regressed {
                stats.warnings.push(format!(
                    "citation count for {:?} reported lower than stored; keeping previous value",
                    row.title
                ));
            }
        }
        tx.commit().await?;

        debug!(
            created = stats.created_links,
            existing = stats.existing_links,
            "page upserted"
        );
        Ok(stats)
    }
}

fn candidate_from_row(row: &PublicationRow) -> PublicationCandidate {
    let arxiv_id = row
        .pdf_url
        .as_deref()
        .and_then(arxiv_id_from_url)
        .or_else(|| row.pub_url.as_deref().and_then(arxiv_id_from_url));

    PublicationCandidate {
        fingerprint: row.fingerprint(),
        canonical_title: row.title.clone(),
        year: row.year.map(|y| y as i64),
        venue_text: row.venue_text.clone(),
        cluster_id: row.cluster_id.clone(),
        doi: None,
        arxiv_id,
        pmid: None,
        pub_url: row.pub_url.clone(),
        pdf_url: row.pdf_url.clone(),
    }
}

/// Extract an arXiv id from `arxiv.org/abs/...` or `arxiv.org/pdf/...` links.
fn arxiv_id_from_url(url: &str) -> Option<String> {
    let rest = url.split("arxiv.org/").nth(1)?;
    let id = rest
        .strip_prefix("abs/")
        .or_else(|| rest.strip_prefix("pdf/"))?;
    let id = id.trim_end_matches(".pdf").split(['?', '#']).next()?;
    fingerprint::normalize_arxiv_id(id)
}
