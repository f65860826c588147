//! Scholar profile repository.

use chrono::{DateTime, Utc};
use scholarr_common::Result;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::sync::Arc;

use crate::database::Database;

/// Where the profile image came from. `override`/`upload` are user-managed
/// and never clobbered by a scrape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ProfileImageSource {
    Scraped,
    Override,
    Upload,
    Fallback,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ScholarProfile {
    pub id: i64,
    pub user_id: i64,
    /// Google Scholar's 12-character opaque author id.
    pub scholar_id: String,
    pub display_name: String,
    pub affiliation: Option<String>,
    pub profile_image_source: ProfileImageSource,
    pub profile_image_url: Option<String>,
    pub is_enabled: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<String>,
    pub last_fingerprint_head: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ScholarRepository {
    db: Arc<Database>,
}

impl ScholarRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub async fn insert(
        &self,
        user_id: i64,
        scholar_id: &str,
        display_name: &str,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let id = sqlx::query_scalar(
            "INSERT INTO scholar_profiles (user_id, scholar_id, display_name, created_at)
             VALUES (?1, ?2, ?3, ?4)
             RETURNING id",
        )
        .bind(user_id)
        .bind(scholar_id)
        .bind(display_name)
        .bind(now)
        .fetch_one(self.db.pool())
        .await?;
        Ok(id)
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<ScholarProfile>> {
        let profile =
            sqlx::query_as::<_, ScholarProfile>("SELECT * FROM scholar_profiles WHERE id = ?1")
                .bind(id)
                .fetch_optional(self.db.pool())
                .await?;
        Ok(profile)
    }

    pub async fn list_for_user(&self, user_id: i64) -> Result<Vec<ScholarProfile>> {
        let profiles = sqlx::query_as::<_, ScholarProfile>(
            "SELECT * FROM scholar_profiles WHERE user_id = ?1 ORDER BY display_name, id",
        )
        .bind(user_id)
        .fetch_all(self.db.pool())
        .await?;
        Ok(profiles)
    }

    pub async fn list_enabled_for_user(&self, user_id: i64) -> Result<Vec<ScholarProfile>> {
        let profiles = sqlx::query_as::<_, ScholarProfile>(
            "SELECT * FROM scholar_profiles
             WHERE user_id = ?1 AND is_enabled = 1
             ORDER BY id",
        )
        .bind(user_id)
        .fetch_all(self.db.pool())
        .await?;
        Ok(profiles)
    }

    pub async fn set_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        sqlx::query("UPDATE scholar_profiles SET is_enabled = ?2 WHERE id = ?1")
            .bind(id)
            .bind(enabled)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Refresh scraped profile metadata from the first page of a walk.
    /// The image URL is only taken when the current source is not user-managed.
    pub async fn update_profile_meta(
        &self,
        id: i64,
        display_name: &str,
        affiliation: Option<&str>,
        image_url: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE scholar_profiles
             SET display_name = ?2,
                 affiliation = ?3,
                 profile_image_url = CASE
                     WHEN profile_image_source IN ('override', 'upload') THEN profile_image_url
                     ELSE COALESCE(?4, profile_image_url)
                 END,
                 profile_image_source = CASE
                     WHEN profile_image_source IN ('override', 'upload') THEN profile_image_source
                     WHEN ?4 IS NOT NULL THEN 'scraped'
                     ELSE profile_image_source
                 END
             WHERE id = ?1",
        )
        .bind(id)
        .bind(display_name)
        .bind(affiliation)
        .bind(image_url)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Record a walk outcome. The fingerprint head is only rewritten when the
    /// walk produced one (successful or skipped-no-change walks).
    pub async fn record_outcome(
        &self,
        id: i64,
        outcome: &str,
        checked_at: DateTime<Utc>,
        fingerprint_head: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE scholar_profiles
             SET last_outcome = ?2,
                 last_checked_at = ?3,
                 last_fingerprint_head = COALESCE(?4, last_fingerprint_head)
             WHERE id = ?1",
        )
        .bind(id)
        .bind(outcome)
        .bind(checked_at)
        .bind(fingerprint_head)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::UserRepository;

    async fn seed() -> (Arc<Database>, i64) {
        let db = Arc::new(Database::connect_memory().await.unwrap());
        let user_id = UserRepository::new(db.clone())
            .insert("ada@example.com", false, Utc::now())
            .await
            .unwrap();
        (db, user_id)
    }

    #[tokio::test]
    async fn duplicate_scholar_per_user_rejected() {
        let (db, user_id) = seed().await;
        let repo = ScholarRepository::new(db);
        repo.insert(user_id, "AbCdEfGhIjKl", "Ada Lovelace", Utc::now())
            .await
            .unwrap();
        let dup = repo
            .insert(user_id, "AbCdEfGhIjKl", "Ada Lovelace", Utc::now())
            .await;
        assert!(dup.is_err());
    }

    #[tokio::test]
    async fn user_managed_image_survives_scrape() {
        let (db, user_id) = seed().await;
        let repo = ScholarRepository::new(db.clone());
        let id = repo
            .insert(user_id, "AbCdEfGhIjKl", "Ada", Utc::now())
            .await
            .unwrap();

        sqlx::query(
            "UPDATE scholar_profiles
             SET profile_image_source = 'override', profile_image_url = 'https://me/custom.png'
             WHERE id = ?1",
        )
        .bind(id)
        .execute(db.pool())
        .await
        .unwrap();

        repo.update_profile_meta(id, "Ada Lovelace", Some("Analytical Engines"), Some("https://scholar/scraped.png"))
            .await
            .unwrap();

        let profile = repo.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(profile.profile_image_url.as_deref(), Some("https://me/custom.png"));
        assert_eq!(profile.profile_image_source, ProfileImageSource::Override);
        assert_eq!(profile.display_name, "Ada Lovelace");
    }

    #[tokio::test]
    async fn fingerprint_head_not_cleared_on_failure() {
        let (db, user_id) = seed().await;
        let repo = ScholarRepository::new(db);
        let id = repo
            .insert(user_id, "AbCdEfGhIjKl", "Ada", Utc::now())
            .await
            .unwrap();

        repo.record_outcome(id, "success", Utc::now(), Some("deadbeef00000001"))
            .await
            .unwrap();
        repo.record_outcome(id, "network_error", Utc::now(), None)
            .await
            .unwrap();

        let profile = repo.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(profile.last_outcome.as_deref(), Some("network_error"));
        assert_eq!(profile.last_fingerprint_head.as_deref(), Some("deadbeef00000001"));
    }
}
