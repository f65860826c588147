use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScholarrError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Scholar page layout unexpected: {code}")]
    Layout { code: String },

    #[error("Remote host signalled anti-bot measures")]
    BlockedOrCaptcha,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Scrape cooldown active ({reason})")]
    CooldownActive {
        reason: String,
        until: Option<DateTime<Utc>>,
    },

    #[error("A run is already in progress (run {run_id})")]
    RunInProgress { run_id: i64 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ScholarrError {
    /// Stable machine-readable code for the API error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Layout { .. } => "layout_error",
            Self::BlockedOrCaptcha => "blocked_or_captcha",
            Self::Network(_) => "network_error",
            Self::CooldownActive { .. } => "scrape_cooldown_active",
            Self::RunInProgress { .. } => "run_in_progress",
            Self::NotFound(_) => "not_found",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::Database(_) | Self::Http(_) | Self::Serialization(_) | Self::Other(_) => {
                "internal_error"
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, ScholarrError>;
