//! Publication repository: global dedup, identifier updates, merges, and the
//! per-user listing queries behind the publications endpoint.
//!
//! The resolve-or-create chain runs inside a caller-owned transaction so a
//! publication lookup and its link upsert commit atomically. SQLite gives us
//! serializable transactions (single writer); concurrent creators are
//! reconciled by retrying the lookup chain once after a unique violation.

use chrono::{DateTime, Utc};
use scholarr_common::Result;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, SqliteConnection};
use std::sync::Arc;

use crate::database::Database;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum PdfStatus {
    Untracked,
    Queued,
    Running,
    Resolved,
    Failed,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Publication {
    pub id: i64,
    pub fingerprint: String,
    pub canonical_title: String,
    pub year: Option<i64>,
    pub venue_text: Option<String>,
    pub cluster_id: Option<String>,
    pub doi: Option<String>,
    pub arxiv_id: Option<String>,
    pub pmid: Option<String>,
    pub openalex_id: Option<String>,
    pub pub_url: Option<String>,
    pub pdf_url: Option<String>,
    pub pdf_status: PdfStatus,
    pub pdf_attempt_count: i64,
    pub pdf_failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Publication {
    /// Identifier shown in the UI, most specific first.
    pub fn display_identifier(&self) -> Option<String> {
        self.doi
            .clone()
            .or_else(|| self.arxiv_id.as_ref().map(|a| format!("arXiv:{a}")))
            .or_else(|| self.pmid.as_ref().map(|p| format!("PMID:{p}")))
            .or_else(|| self.openalex_id.clone())
    }

}

/// Candidate built from one parsed profile row; identifiers already normalized.
#[derive(Debug, Clone, Default)]
pub struct PublicationCandidate {
    pub fingerprint: String,
    pub canonical_title: String,
    pub year: Option<i64>,
    pub venue_text: Option<String>,
    pub cluster_id: Option<String>,
    pub doi: Option<String>,
    pub arxiv_id: Option<String>,
    pub pmid: Option<String>,
    pub pub_url: Option<String>,
    /// Direct PDF link scraped alongside the row, when Scholar offers one.
    pub pdf_url: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct ResolvedPublication {
    pub id: i64,
    pub created: bool,
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.kind() == sqlx::error::ErrorKind::UniqueViolation
    )
}

/// Look up an existing publication for the candidate: cluster id first, then
/// fingerprint, then any normalized identifier.
async fn lookup(
    conn: &mut SqliteConnection,
    candidate: &PublicationCandidate,
) -> Result<Option<i64>> {
    if let Some(cluster_id) = &candidate.cluster_id {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT id FROM publications WHERE cluster_id = ?1")
                .bind(cluster_id)
                .fetch_optional(&mut *conn)
                .await?;
        if found.is_some() {
            return Ok(found);
        }
    }

    let found: Option<i64> =
        sqlx::query_scalar("SELECT id FROM publications WHERE fingerprint = ?1")
            .bind(&candidate.fingerprint)
            .fetch_optional(&mut *conn)
            .await?;
    if found.is_some() {
        return Ok(found);
    }

    for (column, value) in [
        ("doi", &candidate.doi),
        ("arxiv_id", &candidate.arxiv_id),
        ("pmid", &candidate.pmid),
    ] {
        if let Some(value) = value {
            let found: Option<i64> =
                sqlx::query_scalar(&format!("SELECT id FROM publications WHERE {column} = ?1"))
                    .bind(value)
                    .fetch_optional(&mut *conn)
                    .await?;
            if found.is_some() {
                return Ok(found);
            }
        }
    }

    Ok(None)
}

/// Fill previously-absent fields on a matched publication. Identifiers only
/// grow here; corrections go through the merge/repair path.
async fn backfill(
    conn: &mut SqliteConnection,
    id: i64,
    candidate: &PublicationCandidate,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE publications
         SET cluster_id = COALESCE(cluster_id, ?2),
             doi        = COALESCE(doi, ?3),
             arxiv_id   = COALESCE(arxiv_id, ?4),
             pmid       = COALESCE(pmid, ?5),
             venue_text = COALESCE(venue_text, ?6),
             pub_url    = COALESCE(pub_url, ?7),
             year       = COALESCE(year, ?8),
             pdf_url    = COALESCE(pdf_url, ?9),
             pdf_status = CASE
                 WHEN pdf_url IS NULL AND ?9 IS NOT NULL THEN 'resolved'
                 ELSE pdf_status
             END,
             updated_at = ?10
         WHERE id = ?1",
    )
    .bind(id)
    .bind(&candidate.cluster_id)
    .bind(&candidate.doi)
    .bind(&candidate.arxiv_id)
    .bind(&candidate.pmid)
    .bind(&candidate.venue_text)
    .bind(&candidate.pub_url)
    .bind(candidate.year)
    .bind(&candidate.pdf_url)
    .bind(now)
    .execute(conn)
    .await?;
    Ok(())
}

async fn insert(
    conn: &mut SqliteConnection,
    candidate: &PublicationCandidate,
    now: DateTime<Utc>,
) -> std::result::Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        "INSERT INTO publications
             (fingerprint, canonical_title, year, venue_text, cluster_id,
              doi, arxiv_id, pmid, pub_url, pdf_url, pdf_status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                 CASE WHEN ?10 IS NOT NULL THEN 'resolved' ELSE 'untracked' END,
                 ?11, ?11)
         RETURNING id",
    )
    .bind(&candidate.fingerprint)
    .bind(&candidate.canonical_title)
    .bind(candidate.year)
    .bind(&candidate.venue_text)
    .bind(&candidate.cluster_id)
    .bind(&candidate.doi)
    .bind(&candidate.arxiv_id)
    .bind(&candidate.pmid)
    .bind(&candidate.pub_url)
    .bind(&candidate.pdf_url)
    .bind(now)
    .fetch_one(conn)
    .await
}

/// Resolve a candidate to a publication id inside the caller's transaction,
/// creating the row when nothing matches. A unique-violation on create means
/// a concurrent run won the race, so the lookup chain is retried once.
pub async fn resolve_or_create(
    conn: &mut SqliteConnection,
    candidate: &PublicationCandidate,
    now: DateTime<Utc>,
) -> Result<ResolvedPublication> {
    if let Some(id) = lookup(conn, candidate).await? {
        backfill(conn, id, candidate, now).await?;
        return Ok(ResolvedPublication { id, created: false });
    }

    match insert(conn, candidate, now).await {
        Ok(id) => Ok(ResolvedPublication { id, created: true }),
        Err(err) if is_unique_violation(&err) => {
            let id = lookup(conn, candidate).await?.ok_or(err)?;
            backfill(conn, id, candidate, now).await?;
            Ok(ResolvedPublication { id, created: false })
        }
        Err(err) => Err(err.into()),
    }
}

// ── Listing ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListMode {
    #[default]
    All,
    Unread,
    /// Publications first seen in the user's latest completed run.
    Latest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortBy {
    #[default]
    FirstSeen,
    Title,
    Year,
    Citations,
}

#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub mode: ListMode,
    pub scholar_profile_id: Option<i64>,
    pub favorite_only: bool,
    pub search: Option<String>,
    pub sort_by: SortBy,
    pub sort_desc: bool,
    pub page: u32,
    pub page_size: u32,
    /// Pin results to links created at or before this instant.
    pub snapshot: Option<DateTime<Utc>>,
    /// Required for `Latest`; `None` yields an empty page.
    pub latest_run_id: Option<i64>,
}

/// One row of the deduplicated per-user view: publication plus the user's
/// link state aggregated across their scholars.
#[derive(Debug, Clone, Serialize)]
pub struct PublicationListItem {
    #[serde(flatten)]
    pub publication: Publication,
    pub is_read: bool,
    pub is_favorite: bool,
    pub is_new_in_latest_run: bool,
    pub citation_count: i64,
    pub first_seen_run_id: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublicationPage {
    pub items: Vec<PublicationListItem>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
}

#[derive(Clone)]
pub struct PublicationRepository {
    db: Arc<Database>,
}

impl PublicationRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<Publication>> {
        let publication =
            sqlx::query_as::<_, Publication>("SELECT * FROM publications WHERE id = ?1")
                .bind(id)
                .fetch_optional(self.db.pool())
                .await?;
        Ok(publication)
    }

    pub async fn list_for_user(&self, user_id: i64, query: &ListQuery) -> Result<PublicationPage> {
        let mut conditions = vec!["sp.user_id = ?1".to_string()];
        if let Some(scholar) = query.scholar_profile_id {
            conditions.push(format!("l.scholar_profile_id = {scholar}"));
        }
        // Bound as ?2 so the comparison uses the driver's datetime encoding.
        if query.snapshot.is_some() {
            conditions.push("l.created_at <= ?2".to_string());
        }
        let where_clause = conditions.join(" AND ");

        let mut having = Vec::new();
        match query.mode {
            ListMode::All => {}
            ListMode::Unread => having.push("MAX(l.is_read) = 0".to_string()),
            ListMode::Latest => match query.latest_run_id {
                Some(run_id) => having.push(format!("MIN(l.first_seen_run_id) = {run_id}")),
                None => having.push("0".to_string()),
            },
        }
        if query.favorite_only {
            having.push("MAX(l.is_favorite) = 1".to_string());
        }
        if let Some(search) = &query.search {
            let escaped = search.replace('\'', "''").to_lowercase();
            having.push(format!("instr(lower(p.canonical_title), '{escaped}') > 0"));
        }
        let having_clause = if having.is_empty() {
            String::new()
        } else {
            format!("HAVING {}", having.join(" AND "))
        };

        let order = match query.sort_by {
            SortBy::FirstSeen => "MIN(l.first_seen_run_id)",
            SortBy::Title => "lower(p.canonical_title)",
            SortBy::Year => "p.year",
            SortBy::Citations => "MAX(l.citation_count)",
        };
        let direction = if query.sort_desc { "DESC" } else { "ASC" };

        let base = format!(
            "FROM scholar_publication_links l
             JOIN scholar_profiles sp ON sp.id = l.scholar_profile_id
             JOIN publications p ON p.id = l.publication_id
             WHERE {where_clause}
             GROUP BY p.id
             {having_clause}"
        );

        let count_sql = format!("SELECT COUNT(*) FROM (SELECT p.id {base})");
        let mut count_query = sqlx::query_scalar(&count_sql).bind(user_id);
        if let Some(snapshot) = query.snapshot {
            count_query = count_query.bind(snapshot);
        }
        let total: i64 = count_query.fetch_one(self.db.pool()).await?;

        let page_size = query.page_size.clamp(1, 200);
        let offset = u64::from(query.page.saturating_sub(1)) * u64::from(page_size);
        let rows_sql = format!(
            "SELECT p.*,
                    MAX(l.is_read) AS is_read,
                    MAX(l.is_favorite) AS is_favorite,
                    MAX(l.is_new_in_latest_run) AS is_new_in_latest_run,
                    MAX(l.citation_count) AS citation_count,
                    MIN(l.first_seen_run_id) AS first_seen_run_id
             {base}
             ORDER BY {order} {direction}, p.id {direction}
             LIMIT {page_size} OFFSET {offset}"
        );
        let mut rows_query = sqlx::query(&rows_sql).bind(user_id);
        if let Some(snapshot) = query.snapshot {
            rows_query = rows_query.bind(snapshot);
        }
        let rows = rows_query.fetch_all(self.db.pool()).await?;

        let items = rows
            .into_iter()
            .map(|row| row_to_list_item(&row))
            .collect::<Result<Vec<_>>>()?;

        Ok(PublicationPage {
            items,
            total,
            page: query.page.max(1),
            page_size,
        })
    }

    /// Publications first seen in `run_id` whose identifier set is incomplete.
    pub async fn list_incomplete_for_run(&self, run_id: i64) -> Result<Vec<Publication>> {
        let publications = sqlx::query_as::<_, Publication>(
            "SELECT DISTINCT p.* FROM publications p
             JOIN scholar_publication_links l ON l.publication_id = p.id
             WHERE l.first_seen_run_id = ?1
               AND (p.doi IS NULL OR p.openalex_id IS NULL
                    OR (p.arxiv_id IS NULL AND p.pmid IS NULL))
             ORDER BY p.id",
        )
        .bind(run_id)
        .fetch_all(self.db.pool())
        .await?;
        Ok(publications)
    }

    /// Publications first seen in `run_id` that still have no PDF URL.
    pub async fn list_missing_pdf_for_run(&self, run_id: i64) -> Result<Vec<Publication>> {
        let publications = sqlx::query_as::<_, Publication>(
            "SELECT DISTINCT p.* FROM publications p
             JOIN scholar_publication_links l ON l.publication_id = p.id
             WHERE l.first_seen_run_id = ?1
               AND p.pdf_url IS NULL
               AND p.pdf_status != 'failed'
             ORDER BY p.id",
        )
        .bind(run_id)
        .fetch_all(self.db.pool())
        .await?;
        Ok(publications)
    }

    /// Apply newly discovered identifiers; only absent fields are written.
    /// Returns the refreshed row when anything actually changed.
    pub async fn apply_identifiers(
        &self,
        id: i64,
        doi: Option<&str>,
        arxiv_id: Option<&str>,
        pmid: Option<&str>,
        openalex_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<Publication>> {
        let changed = sqlx::query(
            "UPDATE publications
             SET doi         = COALESCE(doi, ?2),
                 arxiv_id    = COALESCE(arxiv_id, ?3),
                 pmid        = COALESCE(pmid, ?4),
                 openalex_id = COALESCE(openalex_id, ?5),
                 updated_at  = ?6
             WHERE id = ?1
               AND ((?2 IS NOT NULL AND doi IS NULL)
                 OR (?3 IS NOT NULL AND arxiv_id IS NULL)
                 OR (?4 IS NOT NULL AND pmid IS NULL)
                 OR (?5 IS NOT NULL AND openalex_id IS NULL))",
        )
        .bind(id)
        .bind(doi)
        .bind(arxiv_id)
        .bind(pmid)
        .bind(openalex_id)
        .bind(now)
        .execute(self.db.pool())
        .await?
        .rows_affected();

        if changed == 0 {
            return Ok(None);
        }
        self.find_by_id(id).await
    }

    /// Existing publication holding any of the given normalized identifiers.
    pub async fn find_by_any_identifier(
        &self,
        doi: Option<&str>,
        arxiv_id: Option<&str>,
        pmid: Option<&str>,
    ) -> Result<Option<Publication>> {
        let publication = sqlx::query_as::<_, Publication>(
            "SELECT * FROM publications
             WHERE (?1 IS NOT NULL AND doi = ?1)
                OR (?2 IS NOT NULL AND arxiv_id = ?2)
                OR (?3 IS NOT NULL AND pmid = ?3)
             ORDER BY created_at, id
             LIMIT 1",
        )
        .bind(doi)
        .bind(arxiv_id)
        .bind(pmid)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(publication)
    }

    /// Publications (other than `id`) sharing any of the given identifiers,
    /// i.e. merge candidates after enrichment.
    pub async fn find_identifier_twins(&self, publication: &Publication) -> Result<Vec<Publication>> {
        let twins = sqlx::query_as::<_, Publication>(
            "SELECT * FROM publications
             WHERE id != ?1
               AND ((?2 IS NOT NULL AND doi = ?2)
                 OR (?3 IS NOT NULL AND arxiv_id = ?3)
                 OR (?4 IS NOT NULL AND pmid = ?4))
             ORDER BY created_at, id",
        )
        .bind(publication.id)
        .bind(&publication.doi)
        .bind(&publication.arxiv_id)
        .bind(&publication.pmid)
        .fetch_all(self.db.pool())
        .await?;
        Ok(twins)
    }

    /// Merge `loser` into `winner`: rewrite links, graft missing fields,
    /// delete the loser. One transaction.
    pub async fn merge(&self, winner_id: i64, loser_id: i64, now: DateTime<Utc>) -> Result<()> {
        let mut tx = self.db.pool().begin().await?;

        // A user already linked to the winner keeps that single link.
        sqlx::query(
            "INSERT OR IGNORE INTO scholar_publication_links
                 (scholar_profile_id, publication_id, first_seen_run_id, last_seen_run_id,
                  is_read, is_favorite, is_new_in_latest_run, citation_count,
                  link_scholar_pub_url, created_at)
             SELECT scholar_profile_id, ?1, first_seen_run_id, last_seen_run_id,
                    is_read, is_favorite, is_new_in_latest_run, citation_count,
                    link_scholar_pub_url, created_at
             FROM scholar_publication_links WHERE publication_id = ?2",
        )
        .bind(winner_id)
        .bind(loser_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM scholar_publication_links WHERE publication_id = ?1")
            .bind(loser_id)
            .execute(&mut *tx)
            .await?;

        // Free the loser's unique identifier slots before grafting them over.
        let loser = sqlx::query_as::<_, Publication>("SELECT * FROM publications WHERE id = ?1")
            .bind(loser_id)
            .fetch_one(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM pdf_queue WHERE publication_id = ?1")
            .bind(loser_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM publications WHERE id = ?1")
            .bind(loser_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE publications
             SET cluster_id  = COALESCE(cluster_id, ?2),
                 doi         = COALESCE(doi, ?3),
                 arxiv_id    = COALESCE(arxiv_id, ?4),
                 pmid        = COALESCE(pmid, ?5),
                 openalex_id = COALESCE(openalex_id, ?6),
                 pdf_url     = COALESCE(pdf_url, ?7),
                 updated_at  = ?8
             WHERE id = ?1",
        )
        .bind(winner_id)
        .bind(&loser.cluster_id)
        .bind(&loser.doi)
        .bind(&loser.arxiv_id)
        .bind(&loser.pmid)
        .bind(&loser.openalex_id)
        .bind(&loser.pdf_url)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn set_pdf_resolved(&self, id: i64, pdf_url: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE publications
             SET pdf_url = ?2, pdf_status = 'resolved', pdf_failure_reason = NULL, updated_at = ?3
             WHERE id = ?1",
        )
        .bind(id)
        .bind(pdf_url)
        .bind(now)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    pub async fn set_pdf_state(
        &self,
        id: i64,
        status: PdfStatus,
        attempt_count: i64,
        failure_reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE publications
             SET pdf_status = ?2, pdf_attempt_count = ?3, pdf_failure_reason = ?4, updated_at = ?5
             WHERE id = ?1",
        )
        .bind(id)
        .bind(status)
        .bind(attempt_count)
        .bind(failure_reason)
        .bind(now)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }
}

fn row_to_list_item(row: &SqliteRow) -> Result<PublicationListItem> {
    let publication = Publication::from_row(row)?;
    Ok(PublicationListItem {
        publication,
        is_read: row.try_get::<i64, _>("is_read")? != 0,
        is_favorite: row.try_get::<i64, _>("is_favorite")? != 0,
        is_new_in_latest_run: row.try_get::<i64, _>("is_new_in_latest_run")? != 0,
        citation_count: row.try_get("citation_count")?,
        first_seen_run_id: row.try_get("first_seen_run_id")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(title: &str, year: Option<i64>, cluster: Option<&str>) -> PublicationCandidate {
        PublicationCandidate {
            fingerprint: scholarr_common::fingerprint::compute(title, year.map(|y| y as i32)),
            canonical_title: title.to_string(),
            year,
            cluster_id: cluster.map(String::from),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn resolve_matches_by_cluster_then_fingerprint() {
        let db = Database::connect_memory().await.unwrap();
        let now = Utc::now();
        let mut tx = db.pool().begin().await.unwrap();

        let first = resolve_or_create(&mut *tx, &candidate("Deep Learning", Some(2015), Some("c1")), now)
            .await
            .unwrap();
        assert!(first.created);

        // Same cluster id, different title variant: one publication.
        let by_cluster =
            resolve_or_create(&mut *tx, &candidate("Deep learning.", Some(2015), Some("c1")), now)
                .await
                .unwrap();
        assert_eq!(by_cluster.id, first.id);
        assert!(!by_cluster.created);

        // Same fingerprint, no cluster id.
        let by_fingerprint =
            resolve_or_create(&mut *tx, &candidate("Deep  LEARNING", Some(2015), None), now)
                .await
                .unwrap();
        assert_eq!(by_fingerprint.id, first.id);
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn resolve_matches_by_identifier() {
        let db = Database::connect_memory().await.unwrap();
        let now = Utc::now();
        let mut tx = db.pool().begin().await.unwrap();

        let mut a = candidate("Attention is all you need", Some(2017), None);
        a.doi = Some("10.1000/attn".to_string());
        let first = resolve_or_create(&mut *tx, &a, now).await.unwrap();

        // Retitled preprint, same DOI.
        let mut b = candidate("Attention is all you need (preprint)", None, None);
        b.doi = Some("10.1000/attn".to_string());
        let second = resolve_or_create(&mut *tx, &b, now).await.unwrap();
        assert_eq!(second.id, first.id);
        assert!(!second.created);
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn backfill_grows_but_never_overwrites() {
        let db = Database::connect_memory().await.unwrap();
        let now = Utc::now();
        let mut tx = db.pool().begin().await.unwrap();

        let mut a = candidate("Residual learning", Some(2016), None);
        a.venue_text = Some("CVPR".to_string());
        let id = resolve_or_create(&mut *tx, &a, now).await.unwrap().id;

        let mut b = candidate("Residual learning", Some(2016), Some("c-res"));
        b.venue_text = Some("arXiv".to_string());
        b.doi = Some("10.1109/cvpr.2016.90".to_string());
        resolve_or_create(&mut *tx, &b, now).await.unwrap();
        tx.commit().await.unwrap();

        let repo = PublicationRepository::new(Arc::new(db));
        let publication = repo.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(publication.cluster_id.as_deref(), Some("c-res"));
        assert_eq!(publication.doi.as_deref(), Some("10.1109/cvpr.2016.90"));
        // First writer wins for descriptive text.
        assert_eq!(publication.venue_text.as_deref(), Some("CVPR"));
    }

    #[tokio::test]
    async fn listing_dedups_across_a_users_scholars() {
        use crate::links::{upsert_link, LinkRepository};
        use crate::runs::{RunRepository, RunTrigger};
        use crate::scholars::ScholarRepository;
        use crate::users::UserRepository;

        let db = Arc::new(Database::connect_memory().await.unwrap());
        let now = Utc::now();
        let user_id = UserRepository::new(db.clone())
            .insert("ada@example.com", false, now)
            .await
            .unwrap();
        let scholars = ScholarRepository::new(db.clone());
        let scholar_a = scholars.insert(user_id, "AbCdEfGhIjKl", "Ada", now).await.unwrap();
        let scholar_b = scholars.insert(user_id, "MnOpQrStUvWx", "Ada alias", now).await.unwrap();
        let run_id = RunRepository::new(db.clone())
            .create(user_id, RunTrigger::Manual, now)
            .await
            .unwrap()
            .unwrap();

        // The same paper observed on both of the user's scholar profiles,
        // plus one paper unique to profile A.
        let mut tx = db.pool().begin().await.unwrap();
        let shared = resolve_or_create(&mut *tx, &candidate("Shared work", Some(2020), Some("cs")), now)
            .await
            .unwrap()
            .id;
        let solo = resolve_or_create(&mut *tx, &candidate("Solo work", Some(2021), Some("cx")), now)
            .await
            .unwrap()
            .id;
        upsert_link(&mut *tx, scholar_a, shared, run_id, 4, None, now).await.unwrap();
        upsert_link(&mut *tx, scholar_b, shared, run_id, 9, None, now).await.unwrap();
        upsert_link(&mut *tx, scholar_a, solo, run_id, 1, None, now).await.unwrap();
        tx.commit().await.unwrap();

        let repo = PublicationRepository::new(db.clone());
        let page = repo
            .list_for_user(user_id, &ListQuery {
                page: 1,
                page_size: 10,
                sort_by: SortBy::Title,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 2, "shared work appears once");
        assert_eq!(page.items.len(), 2);
        let shared_item = page
            .items
            .iter()
            .find(|i| i.publication.id == shared)
            .unwrap();
        // Aggregated across both links.
        assert_eq!(shared_item.citation_count, 9);
        assert!(shared_item.is_new_in_latest_run);

        // Unread mode drops the paper once every link is read.
        LinkRepository::new(db.clone())
            .mark_selected_read(user_id, &[shared])
            .await
            .unwrap();
        let unread = repo
            .list_for_user(user_id, &ListQuery {
                mode: ListMode::Unread,
                page: 1,
                page_size: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(unread.total, 1);
        assert_eq!(unread.items[0].publication.id, solo);

        // Latest mode keys on the first-seen run.
        let latest = repo
            .list_for_user(user_id, &ListQuery {
                mode: ListMode::Latest,
                latest_run_id: Some(run_id),
                page: 1,
                page_size: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(latest.total, 2);
        let empty = repo
            .list_for_user(user_id, &ListQuery {
                mode: ListMode::Latest,
                latest_run_id: None,
                page: 1,
                page_size: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(empty.total, 0);

        // Favorite filter.
        LinkRepository::new(db.clone())
            .set_favorite(user_id, solo, true)
            .await
            .unwrap();
        let favorites = repo
            .list_for_user(user_id, &ListQuery {
                favorite_only: true,
                page: 1,
                page_size: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(favorites.total, 1);
        assert_eq!(favorites.items[0].publication.id, solo);

        // Title search.
        let searched = repo
            .list_for_user(user_id, &ListQuery {
                search: Some("solo".to_string()),
                page: 1,
                page_size: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(searched.total, 1);
    }

    #[tokio::test]
    async fn apply_identifiers_reports_change_once() {
        let db = Database::connect_memory().await.unwrap();
        let now = Utc::now();
        let mut tx = db.pool().begin().await.unwrap();
        let id = resolve_or_create(&mut *tx, &candidate("Untitled", None, None), now)
            .await
            .unwrap()
            .id;
        tx.commit().await.unwrap();

        let repo = PublicationRepository::new(Arc::new(db));
        let updated = repo
            .apply_identifiers(id, Some("10.1000/xyz"), None, None, None, now)
            .await
            .unwrap();
        assert!(updated.is_some());
        assert_eq!(updated.unwrap().doi.as_deref(), Some("10.1000/xyz"));

        // Same identifiers again: nothing to do.
        let again = repo
            .apply_identifiers(id, Some("10.1000/other"), None, None, None, now)
            .await
            .unwrap();
        assert!(again.is_none());
    }
}
