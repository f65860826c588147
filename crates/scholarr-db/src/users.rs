//! User repository.

use chrono::{DateTime, Utc};
use scholarr_common::Result;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use std::sync::Arc;

use crate::database::Database;

/// Per-user settings blob. Stored as JSON on the users row; the server
/// floors are applied on top of these values, never persisted into them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserSettings {
    #[serde(default = "default_auto_run")]
    pub auto_run_enabled: bool,
    #[serde(default = "default_run_interval")]
    pub run_interval_minutes: u64,
    #[serde(default = "default_request_delay")]
    pub request_delay_seconds: u64,
    #[serde(default = "default_nav_pages")]
    pub nav_visible_pages: Vec<String>,
    /// Contact address forwarded to polite-pool metadata APIs.
    #[serde(default)]
    pub crossref_mailto: Option<String>,
    #[serde(default)]
    pub unpaywall_email: Option<String>,
}

fn default_auto_run()      -> bool { true }
fn default_run_interval()  -> u64 { 360 }
fn default_request_delay() -> u64 { 5 }
fn default_nav_pages()     -> Vec<String> {
    vec!["publications".to_string(), "scholars".to_string(), "runs".to_string()]
}

impl Default for UserSettings {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty user settings deserialize")
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub is_admin: bool,
    pub is_active: bool,
    pub api_token: Option<String>,
    pub settings: Json<UserSettings>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct UserRepository {
    db: Arc<Database>,
}

impl UserRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub async fn insert(&self, email: &str, is_admin: bool, now: DateTime<Utc>) -> Result<i64> {
        let id = sqlx::query_scalar(
            "INSERT INTO users (email, is_admin, settings, created_at)
             VALUES (?1, ?2, '{}', ?3)
             RETURNING id",
        )
        .bind(email)
        .bind(is_admin)
        .bind(now)
        .fetch_one(self.db.pool())
        .await?;
        Ok(id)
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(user)
    }

    pub async fn find_by_api_token(&self, token: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE api_token = ?1 AND is_active = 1",
        )
        .bind(token)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(user)
    }

    pub async fn set_api_token(&self, user_id: i64, token: &str) -> Result<()> {
        sqlx::query("UPDATE users SET api_token = ?2 WHERE id = ?1")
            .bind(user_id)
            .bind(token)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Active users with automation enabled, candidates for scheduled runs.
    pub async fn list_auto_run_candidates(&self) -> Result<Vec<User>> {
        let users = sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE is_active = 1 ORDER BY id",
        )
        .fetch_all(self.db.pool())
        .await?;
        // auto_run_enabled lives in the JSON blob and defaults to true there.
        Ok(users
            .into_iter()
            .filter(|u| u.settings.auto_run_enabled)
            .collect())
    }

    pub async fn update_settings(&self, user_id: i64, settings: &UserSettings) -> Result<()> {
        sqlx::query("UPDATE users SET settings = ?2 WHERE id = ?1")
            .bind(user_id)
            .bind(Json(settings))
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    pub async fn set_active(&self, user_id: i64, active: bool) -> Result<()> {
        sqlx::query("UPDATE users SET is_active = ?2 WHERE id = ?1")
            .bind(user_id)
            .bind(active)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn settings_round_trip() {
        let db = Arc::new(Database::connect_memory().await.unwrap());
        let repo = UserRepository::new(db);
        let id = repo.insert("ada@example.com", true, Utc::now()).await.unwrap();

        let user = repo.find_by_id(id).await.unwrap().unwrap();
        assert!(user.settings.auto_run_enabled);
        assert_eq!(user.settings.request_delay_seconds, 5);

        let mut settings = user.settings.0.clone();
        settings.request_delay_seconds = 9;
        settings.auto_run_enabled = false;
        repo.update_settings(id, &settings).await.unwrap();

        let user = repo.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(user.settings.request_delay_seconds, 9);
        assert!(!user.settings.auto_run_enabled);
        assert!(repo.list_auto_run_candidates().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn token_lookup_respects_active_flag() {
        let db = Arc::new(Database::connect_memory().await.unwrap());
        let repo = UserRepository::new(db);
        let id = repo.insert("ada@example.com", false, Utc::now()).await.unwrap();
        repo.set_api_token(id, "tok-123").await.unwrap();

        assert!(repo.find_by_api_token("tok-123").await.unwrap().is_some());
        repo.set_active(id, false).await.unwrap();
        assert!(repo.find_by_api_token("tok-123").await.unwrap().is_none());
    }
}
