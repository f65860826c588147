//! arXiv id recovery via the Atom query API.
//!
//! API: http://export.arxiv.org/api/query

use async_trait::async_trait;
use scholarr_common::{fingerprint, Result, ScholarrError};
use scholarr_db::publications::Publication;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, instrument};
use url::Url;

use super::{IdentifierFindings, IdentifierProvider};
use crate::gateway::{FetchOutcome, Gateway};

const ARXIV_API_BASE: &str = "https://export.arxiv.org/api/query";

#[derive(Debug, Deserialize)]
struct Feed {
    #[serde(rename = "entry", default)]
    entries: Vec<Entry>,
}

#[derive(Debug, Deserialize)]
struct Entry {
    /// e.g. `http://arxiv.org/abs/2301.04567v2`
    id: String,
    title: String,
}

pub struct ArxivClient {
    gateway: Arc<Gateway>,
}

impl ArxivClient {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    #[instrument(skip(self, publication), fields(publication = publication.id))]
    async fn search(&self, publication: &Publication) -> Result<Vec<Entry>> {
        let mut url =
            Url::parse(ARXIV_API_BASE).map_err(|e| ScholarrError::Validation(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair(
                "search_query",
                &format!("ti:\"{}\"", publication.canonical_title),
            )
            .append_pair("max_results", "5");

        let body = match self.gateway.fetch_api(&url).await {
            FetchOutcome::Ok { body, .. } => body,
            FetchOutcome::NotFound => return Ok(Vec::new()),
            FetchOutcome::Blocked | FetchOutcome::RateLimited { .. } => {
                return Err(ScholarrError::Network("arxiv rate limited".to_string()))
            }
            FetchOutcome::NetworkError { cause } => return Err(ScholarrError::Network(cause)),
        };
        let feed: Feed = quick_xml::de::from_str(&body)
            .map_err(|e| ScholarrError::Network(format!("arxiv feed parse: {e}")))?;
        Ok(feed.entries)
    }
}

#[async_trait]
impl IdentifierProvider for ArxivClient {
    fn name(&self) -> &'static str {
        "arxiv"
    }

    async fn lookup(&self, publication: &Publication) -> Result<IdentifierFindings> {
        let entries = self.search(publication).await?;
        debug!(n = entries.len(), "arxiv search results");
        Ok(IdentifierFindings {
            arxiv_id: match_entry(&entries, &publication.canonical_title),
            ..Default::default()
        })
    }
}

fn match_entry(entries: &[Entry], title: &str) -> Option<String> {
    let ours = fingerprint::normalize_title(title);
    entries
        .iter()
        .find(|entry| fingerprint::normalize_title(&entry.title) == ours)
        .and_then(|entry| entry.id.rsplit("/abs/").next())
        .and_then(fingerprint::normalize_arxiv_id)
}
