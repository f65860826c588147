//! Crossref DOI recovery.
//!
//! Bibliographic search over Crossref to find a DOI for a publication that
//! has none. Only an exact normalized-title match is accepted; a close-but-
//! different work must never donate its DOI.
//!
//! API: https://api.crossref.org/works

use async_trait::async_trait;
use scholarr_common::{fingerprint, Result, ScholarrError};
use scholarr_db::publications::Publication;
use std::sync::Arc;
use tracing::{debug, instrument};
use url::Url;

use super::{IdentifierFindings, IdentifierProvider};
use crate::gateway::{FetchOutcome, Gateway};

const CR_API_BASE: &str = "https://api.crossref.org/works";

pub struct CrossRefClient {
    gateway: Arc<Gateway>,
}

impl CrossRefClient {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    #[instrument(skip(self, publication), fields(publication = publication.id))]
    async fn search_works(&self, publication: &Publication) -> Result<Vec<serde_json::Value>> {
        let mut url =
            Url::parse(CR_API_BASE).map_err(|e| ScholarrError::Validation(e.to_string()))?;
        {
            let mut params = url.query_pairs_mut();
            params.append_pair("query.bibliographic", &publication.canonical_title);
            params.append_pair("rows", "5");
            params.append_pair("select", "DOI,title,issued");
        }

        let body = match self.gateway.fetch_api(&url).await {
            FetchOutcome::Ok { body, .. } => body,
            FetchOutcome::NotFound => return Ok(Vec::new()),
            FetchOutcome::Blocked | FetchOutcome::RateLimited { .. } => {
                return Err(ScholarrError::Network("crossref rate limited".to_string()))
            }
            FetchOutcome::NetworkError { cause } => return Err(ScholarrError::Network(cause)),
        };
        let body: serde_json::Value = serde_json::from_str(&body)?;
        Ok(body["message"]["items"].as_array().cloned().unwrap_or_default())
    }
}

#[async_trait]
impl IdentifierProvider for CrossRefClient {
    fn name(&self) -> &'static str {
        "crossref"
    }

    async fn lookup(&self, publication: &Publication) -> Result<IdentifierFindings> {
        let items = self.search_works(publication).await?;
        debug!(n = items.len(), "crossref search results");
        Ok(IdentifierFindings {
            doi: match_doi(&items, &publication.canonical_title, publication.year),
            ..Default::default()
        })
    }
}

fn match_doi(items: &[serde_json::Value], title: &str, year: Option<i64>) -> Option<String> {
    let ours = fingerprint::normalize_title(title);
    items
        .iter()
        .find(|item| {
            let title_matches = item["title"]
                .as_array()
                .and_then(|t| t.first())
                .and_then(|t| t.as_str())
                .map(|t| fingerprint::normalize_title(t) == ours)
                .unwrap_or(false);
            if !title_matches {
                return false;
            }
            // When both sides know the year they must agree.
            let their_year = item["issued"]["date-parts"]
                .as_array()
                .and_then(|dp| dp.first())
                .and_then(|dp| dp.as_array())
                .and_then(|parts| parts.first())
                .and_then(|y| y.as_i64());
            match (year, their_year) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
        })
        .and_then(|item| item["DOI"].as_str())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(title: &str, doi: &str, year: i64) -> serde_json::Value {
        serde_json::json!({
            "DOI": doi,
            "title": [title],
            "issued": { "date-parts": [[year]] }
        })
    }

    #[test]
    fn exact_title_match_recovers_doi() {
        let items = vec![
            item("A Different Work Entirely", "10.1/wrong", 2020),
            item("Attention Is All You Need", "10.1/right", 2017),
        ];
        assert_eq!(
            match_doi(&items, "Attention is all you need", Some(2017)),
            Some("10.1/right".to_string())
        );
    }

    #[test]
    fn year_mismatch_rejects_candidate() {
        let items = vec![item("Attention Is All You Need", "10.1/right", 2019)];
        assert_eq!(match_doi(&items, "Attention is all you need", Some(2017)), None);
    }

    #[test]
    fn near_miss_title_is_not_accepted() {
        let items = vec![item("Attention Is Not All You Need", "10.1/near", 2017)];
        assert_eq!(match_doi(&items, "Attention is all you need", Some(2017)), None);
    }
}
