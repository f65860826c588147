//! Single-page fetch: gateway request plus parse.
//!
//! The trait seam lets the paginator run against scripted pages in tests.
//! Transient-error retries live in the gateway; blocked and layout outcomes
//! short-circuit here.

use async_trait::async_trait;
use scholarr_config::IngestionSettings;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;
use url::Url;

use crate::gateway::{FetchOutcome, Gateway};
use crate::models::{ParseResult, ParsedPage};
use crate::scholar_html::{parse_profile_page, SCHOLAR_BASE_URL};

/// Outcome of fetching-and-parsing one profile page.
#[derive(Debug)]
pub enum PageFetch {
    Page(ParsedPage),
    Blocked,
    Layout { code: &'static str },
    NetworkError { cause: String },
}

#[async_trait]
pub trait ProfileFetcher: Send + Sync {
    /// Fetch page `page_index` of a scholar's profile, pacing by `user_delay`.
    async fn fetch_page(
        &self,
        scholar_id: &str,
        page_index: u32,
        user_delay: Duration,
    ) -> PageFetch;
}

pub struct HttpProfileFetcher {
    gateway: Arc<Gateway>,
    page_size: u32,
    base_url: String,
}

impl HttpProfileFetcher {
    pub fn new(gateway: Arc<Gateway>, settings: &IngestionSettings) -> Self {
        Self {
            gateway,
            page_size: settings.page_size,
            base_url: SCHOLAR_BASE_URL.to_string(),
        }
    }

    /// Point at a mirror or a test server instead of scholar.google.com.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn page_url(&self, scholar_id: &str, page_index: u32) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(&format!("{}/citations", self.base_url))?;
        let cstart = page_index * self.page_size;
        url.query_pairs_mut()
            .append_pair("user", scholar_id)
            .append_pair("hl", "en")
            .append_pair("sortby", "pubdate")
            .append_pair("cstart", &cstart.to_string())
            .append_pair("pagesize", &self.page_size.to_string());
        Ok(url)
    }
}

#[async_trait]
impl ProfileFetcher for HttpProfileFetcher {
    #[instrument(skip(self), fields(scholar = scholar_id, page = page_index))]
    async fn fetch_page(
        &self,
        scholar_id: &str,
        page_index: u32,
        user_delay: Duration,
    ) -> PageFetch {
        let url = match self.page_url(scholar_id, page_index) {
            Ok(url) => url,
            Err(err) => {
                return PageFetch::NetworkError {
                    cause: format!("bad page url: {err}"),
                }
            }
        };

        match self.gateway.fetch(&url, user_delay).await {
            FetchOutcome::Ok { body, .. } => match parse_profile_page(&body, page_index) {
                ParseResult::Page(page) => PageFetch::Page(page),
                ParseResult::Layout { code } => PageFetch::Layout { code },
                ParseResult::Blocked { .. } => PageFetch::Blocked,
            },
            FetchOutcome::Blocked => PageFetch::Blocked,
            // A rate limit that survived the gateway's single retry counts
            // against the blocked threshold, like any other anti-bot signal.
            FetchOutcome::RateLimited { .. } => PageFetch::Blocked,
            // Deleted or mistyped profile: the layout we expected is gone.
            FetchOutcome::NotFound => PageFetch::Layout {
                code: "profile_not_found",
            },
            FetchOutcome::NetworkError { cause } => PageFetch::NetworkError { cause },
        }
    }
}
