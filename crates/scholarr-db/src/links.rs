//! Scholar-publication link repository.
//!
//! Read/favorite/new state lives only here, never on the publication row, so
//! two users tracking the same scholar never see each other's flags.

use chrono::{DateTime, Utc};
use scholarr_common::Result;
use serde::Serialize;
use sqlx::{FromRow, SqliteConnection};
use std::sync::Arc;

use crate::database::Database;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ScholarPublicationLink {
    pub scholar_profile_id: i64,
    pub publication_id: i64,
    pub first_seen_run_id: i64,
    pub last_seen_run_id: Option<i64>,
    pub is_read: bool,
    pub is_favorite: bool,
    pub is_new_in_latest_run: bool,
    pub citation_count: i64,
    pub link_scholar_pub_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct LinkUpsert {
    pub created: bool,
    /// Scholar reported more citations than we had stored.
    pub citation_changed: bool,
    /// Scholar reported fewer citations than we have stored; the stored count
    /// was kept and the caller should record a warning.
    pub citation_regressed: bool,
}

/// Create or refresh the link for one observed row, inside the caller's
/// transaction. Citation counts are monotone: a lower scraped value keeps
/// the stored count and flags a regression.
pub async fn upsert_link(
    conn: &mut SqliteConnection,
    scholar_profile_id: i64,
    publication_id: i64,
    run_id: i64,
    citation_count: i64,
    link_scholar_pub_url: Option<&str>,
    now: DateTime<Utc>,
) -> Result<LinkUpsert> {
    let existing = sqlx::query_as::<_, ScholarPublicationLink>(
        "SELECT * FROM scholar_publication_links
         WHERE scholar_profile_id = ?1 AND publication_id = ?2",
    )
    .bind(scholar_profile_id)
    .bind(publication_id)
    .fetch_optional(&mut *conn)
    .await?;

    match existing {
        None => {
            sqlx::query(
                "INSERT INTO scholar_publication_links
                     (scholar_profile_id, publication_id, first_seen_run_id, last_seen_run_id,
                      is_new_in_latest_run, citation_count, link_scholar_pub_url, created_at)
                 VALUES (?1, ?2, ?3, ?3, 1, ?4, ?5, ?6)",
            )
            .bind(scholar_profile_id)
            .bind(publication_id)
            .bind(run_id)
            .bind(citation_count)
            .bind(link_scholar_pub_url)
            .bind(now)
            .execute(conn)
            .await?;
            Ok(LinkUpsert {
                created: true,
                citation_changed: true,
                citation_regressed: false,
            })
        }
        Some(link) => {
            let citation_changed = citation_count > link.citation_count;
            let citation_regressed = citation_count < link.citation_count;
            // Keep the new-flag when the link was first created earlier in
            // this same run (duplicate row on a later page).
            let keep_new = link.first_seen_run_id == run_id;
            sqlx::query(
                "UPDATE scholar_publication_links
                 SET last_seen_run_id = ?3,
                     citation_count = MAX(citation_count, ?4),
                     is_new_in_latest_run = ?5,
                     link_scholar_pub_url = COALESCE(?6, link_scholar_pub_url)
                 WHERE scholar_profile_id = ?1 AND publication_id = ?2",
            )
            .bind(scholar_profile_id)
            .bind(publication_id)
            .bind(run_id)
            .bind(citation_count)
            .bind(keep_new)
            .bind(link_scholar_pub_url)
            .execute(conn)
            .await?;
            Ok(LinkUpsert {
                created: false,
                citation_changed,
                citation_regressed,
            })
        }
    }
}

#[derive(Clone)]
pub struct LinkRepository {
    db: Arc<Database>,
}

impl LinkRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub async fn find(
        &self,
        scholar_profile_id: i64,
        publication_id: i64,
    ) -> Result<Option<ScholarPublicationLink>> {
        let link = sqlx::query_as::<_, ScholarPublicationLink>(
            "SELECT * FROM scholar_publication_links
             WHERE scholar_profile_id = ?1 AND publication_id = ?2",
        )
        .bind(scholar_profile_id)
        .bind(publication_id)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(link)
    }

    /// Any of the user's links to this publication, across their scholars.
    pub async fn find_for_user(
        &self,
        user_id: i64,
        publication_id: i64,
    ) -> Result<Option<ScholarPublicationLink>> {
        let link = sqlx::query_as::<_, ScholarPublicationLink>(
            "SELECT l.* FROM scholar_publication_links l
             JOIN scholar_profiles sp ON sp.id = l.scholar_profile_id
             WHERE sp.user_id = ?1 AND l.publication_id = ?2
             LIMIT 1",
        )
        .bind(user_id)
        .bind(publication_id)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(link)
    }

    /// Drop the new-flag on every link of this scholar that was not observed
    /// in the given run, so the flag means "new in the latest run" only.
    pub async fn clear_stale_new_flags(&self, scholar_profile_id: i64, run_id: i64) -> Result<u64> {
        let affected = sqlx::query(
            "UPDATE scholar_publication_links
             SET is_new_in_latest_run = 0
             WHERE scholar_profile_id = ?1
               AND is_new_in_latest_run = 1
               AND (last_seen_run_id IS NULL OR last_seen_run_id != ?2)",
        )
        .bind(scholar_profile_id)
        .bind(run_id)
        .execute(self.db.pool())
        .await?
        .rows_affected();
        Ok(affected)
    }

    /// Number of links first seen in this run (the run's new-publication count).
    pub async fn count_first_seen(&self, run_id: i64) -> Result<i64> {
        let n = sqlx::query_scalar(
            "SELECT COUNT(*) FROM scholar_publication_links WHERE first_seen_run_id = ?1",
        )
        .bind(run_id)
        .fetch_one(self.db.pool())
        .await?;
        Ok(n)
    }

    pub async fn mark_all_read(&self, user_id: i64) -> Result<u64> {
        let affected = sqlx::query(
            "UPDATE scholar_publication_links
             SET is_read = 1
             WHERE is_read = 0
               AND scholar_profile_id IN (SELECT id FROM scholar_profiles WHERE user_id = ?1)",
        )
        .bind(user_id)
        .execute(self.db.pool())
        .await?
        .rows_affected();
        Ok(affected)
    }

    pub async fn mark_selected_read(&self, user_id: i64, publication_ids: &[i64]) -> Result<u64> {
        if publication_ids.is_empty() {
            return Ok(0);
        }
        let placeholders = publication_ids
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE scholar_publication_links
             SET is_read = 1
             WHERE publication_id IN ({placeholders})
               AND scholar_profile_id IN (SELECT id FROM scholar_profiles WHERE user_id = ?1)"
        );
        let mut query = sqlx::query(&sql).bind(user_id);
        for id in publication_ids {
            query = query.bind(id);
        }
        let affected = query.execute(self.db.pool()).await?.rows_affected();
        Ok(affected)
    }

    /// Toggle-or-set the favorite flag across all of the user's links to the
    /// publication. Returns false when the user has no link to it.
    pub async fn set_favorite(
        &self,
        user_id: i64,
        publication_id: i64,
        favorite: bool,
    ) -> Result<bool> {
        let affected = sqlx::query(
            "UPDATE scholar_publication_links
             SET is_favorite = ?3
             WHERE publication_id = ?2
               AND scholar_profile_id IN (SELECT id FROM scholar_profiles WHERE user_id = ?1)",
        )
        .bind(user_id)
        .bind(publication_id)
        .bind(favorite)
        .execute(self.db.pool())
        .await?
        .rows_affected();
        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publications::{resolve_or_create, PublicationCandidate};
    use crate::runs::{RunRepository, RunTrigger};
    use crate::scholars::ScholarRepository;
    use crate::users::UserRepository;

    struct Fixture {
        db: Arc<Database>,
        user_a: i64,
        user_b: i64,
        scholar_a: i64,
        scholar_b: i64,
        publication: i64,
        run_a: i64,
        run_b: i64,
    }

    /// Two users tracking the same scholar id, one shared publication.
    async fn fixture() -> Fixture {
        let db = Arc::new(Database::connect_memory().await.unwrap());
        let now = Utc::now();
        let users = UserRepository::new(db.clone());
        let scholars = ScholarRepository::new(db.clone());
        let runs = RunRepository::new(db.clone());

        let user_a = users.insert("a@example.com", false, now).await.unwrap();
        let user_b = users.insert("b@example.com", false, now).await.unwrap();
        let scholar_a = scholars.insert(user_a, "AbCdEfGhIjKl", "Ada", now).await.unwrap();
        let scholar_b = scholars.insert(user_b, "AbCdEfGhIjKl", "Ada", now).await.unwrap();
        let run_a = runs
            .create(user_a, RunTrigger::Manual, now)
            .await
            .unwrap()
            .expect("run a");
        let run_b = runs
            .create(user_b, RunTrigger::Manual, now)
            .await
            .unwrap()
            .expect("run b");

        let mut tx = db.pool().begin().await.unwrap();
        let publication = resolve_or_create(
            &mut *tx,
            &PublicationCandidate {
                fingerprint: "fp-shared".to_string(),
                canonical_title: "Shared paper".to_string(),
                ..Default::default()
            },
            now,
        )
        .await
        .unwrap()
        .id;
        upsert_link(&mut *tx, scholar_a, publication, run_a, 10, None, now)
            .await
            .unwrap();
        upsert_link(&mut *tx, scholar_b, publication, run_b, 10, None, now)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        Fixture {
            db,
            user_a,
            user_b,
            scholar_a,
            scholar_b,
            publication,
            run_a,
            run_b,
        }
    }

    #[tokio::test]
    async fn read_state_is_isolated_between_users() {
        let f = fixture().await;
        let repo = LinkRepository::new(f.db.clone());

        let marked = repo
            .mark_selected_read(f.user_a, &[f.publication])
            .await
            .unwrap();
        assert_eq!(marked, 1);

        let link_a = repo.find(f.scholar_a, f.publication).await.unwrap().unwrap();
        let link_b = repo.find(f.scholar_b, f.publication).await.unwrap().unwrap();
        assert!(link_a.is_read);
        assert!(!link_b.is_read);
        // Each user's first_seen points at their own run.
        assert_eq!(link_a.first_seen_run_id, f.run_a);
        assert_eq!(link_b.first_seen_run_id, f.run_b);
    }

    #[tokio::test]
    async fn citation_count_is_monotone() {
        let f = fixture().await;
        let now = Utc::now();

        let mut tx = f.db.pool().begin().await.unwrap();
        let outcome = upsert_link(&mut *tx, f.scholar_a, f.publication, f.run_a, 7, None, now)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert!(outcome.citation_regressed);
        let link = LinkRepository::new(f.db.clone())
            .find(f.scholar_a, f.publication)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(link.citation_count, 10);
    }

    #[tokio::test]
    async fn stale_new_flags_cleared_after_run() {
        let f = fixture().await;
        let repo = LinkRepository::new(f.db.clone());

        // Link was seen in run_a; a later run that does not observe it clears the flag.
        let next_run = f.run_a + 100;
        let cleared = repo.clear_stale_new_flags(f.scholar_a, next_run).await.unwrap();
        assert_eq!(cleared, 1);
        let link = repo.find(f.scholar_a, f.publication).await.unwrap().unwrap();
        assert!(!link.is_new_in_latest_run);
    }

    #[tokio::test]
    async fn favorite_requires_a_link() {
        let f = fixture().await;
        let repo = LinkRepository::new(f.db.clone());

        assert!(repo.set_favorite(f.user_a, f.publication, true).await.unwrap());
        assert!(!repo.set_favorite(f.user_a, f.publication + 999, true).await.unwrap());

        let link_b = repo.find(f.scholar_b, f.publication).await.unwrap().unwrap();
        assert!(!link_b.is_favorite);
    }
}
