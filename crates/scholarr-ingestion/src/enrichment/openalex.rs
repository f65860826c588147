//! OpenAlex works lookup.
//!
//! Resolves a publication to its OpenAlex work to recover DOI, PMID, and the
//! OpenAlex id, either directly by DOI or by title search.
//!
//! API: https://api.openalex.org/works

use async_trait::async_trait;
use scholarr_common::{fingerprint, Result, ScholarrError};
use scholarr_db::publications::Publication;
use std::sync::Arc;
use tracing::{debug, instrument};
use url::Url;

use super::{IdentifierFindings, IdentifierProvider};
use crate::gateway::{FetchOutcome, Gateway};

const OA_API_BASE: &str = "https://api.openalex.org/works";

pub struct OpenAlexClient {
    gateway: Arc<Gateway>,
}

impl OpenAlexClient {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    async fn get_json(&self, url: &Url) -> Result<Option<serde_json::Value>> {
        match self.gateway.fetch_api(url).await {
            FetchOutcome::Ok { body, .. } => Ok(Some(serde_json::from_str(&body)?)),
            FetchOutcome::NotFound => Ok(None),
            FetchOutcome::Blocked | FetchOutcome::RateLimited { .. } => {
                Err(ScholarrError::Network("openalex rate limited".to_string()))
            }
            FetchOutcome::NetworkError { cause } => Err(ScholarrError::Network(cause)),
        }
    }

    #[instrument(skip(self, publication), fields(publication = publication.id))]
    async fn find_work(&self, publication: &Publication) -> Result<Option<serde_json::Value>> {
        if let Some(doi) = &publication.doi {
            let url = Url::parse(&format!("{OA_API_BASE}/doi:{doi}"))
                .map_err(|e| ScholarrError::Validation(e.to_string()))?;
            return self.get_json(&url).await;
        }

        let mut url =
            Url::parse(OA_API_BASE).map_err(|e| ScholarrError::Validation(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("filter", &format!("title.search:{}", publication.canonical_title))
            .append_pair("per-page", "5");
        let Some(body) = self.get_json(&url).await? else {
            return Ok(None);
        };

        let ours = fingerprint::normalize_title(&publication.canonical_title);
        let matched = body["results"]
            .as_array()
            .into_iter()
            .flatten()
            .find(|work| {
                work["title"]
                    .as_str()
                    .map(|t| fingerprint::normalize_title(t) == ours)
                    .unwrap_or(false)
            })
            .cloned();
        debug!(matched = matched.is_some(), "openalex title search");
        Ok(matched)
    }
}

#[async_trait]
impl IdentifierProvider for OpenAlexClient {
    fn name(&self) -> &'static str {
        "openalex"
    }

    async fn lookup(&self, publication: &Publication) -> Result<IdentifierFindings> {
        let Some(work) = self.find_work(publication).await? else {
            return Ok(IdentifierFindings::default());
        };
        Ok(work_to_findings(&work))
    }
}

fn work_to_findings(work: &serde_json::Value) -> IdentifierFindings {
    let ids = &work["ids"];
    IdentifierFindings {
        doi: ids["doi"].as_str().map(String::from),
        pmid: ids["pmid"]
            .as_str()
            .and_then(|url| url.rsplit('/').next())
            .filter(|p| p.chars().all(|c| c.is_ascii_digit()))
            .map(String::from),
        openalex_id: ids["openalex"]
            .as_str()
            .and_then(|url| url.rsplit('/').next())
            .map(String::from),
        arxiv_id: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_ids_extracted() {
        let work = serde_json::json!({
            "title": "A Stochastic Approximation Method",
            "ids": {
                "openalex": "https://openalex.org/W2018289835",
                "doi": "https://doi.org/10.1214/aoms/1177729586",
                "pmid": "https://pubmed.ncbi.nlm.nih.gov/12345678"
            }
        });
        let findings = work_to_findings(&work);
        assert_eq!(findings.doi.as_deref(), Some("https://doi.org/10.1214/aoms/1177729586"));
        assert_eq!(findings.pmid.as_deref(), Some("12345678"));
        assert_eq!(findings.openalex_id.as_deref(), Some("W2018289835"));
    }

    #[test]
    fn missing_ids_yield_empty_findings() {
        let work = serde_json::json!({ "title": "Untitled", "ids": {} });
        let findings = work_to_findings(&work);
        assert!(findings.doi.is_none());
        assert!(findings.pmid.is_none());
        assert!(findings.openalex_id.is_none());
    }
}
