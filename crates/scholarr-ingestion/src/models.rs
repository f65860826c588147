//! Typed results of parsing a Scholar profile page.

use scholarr_common::fingerprint;
use serde::{Deserialize, Serialize};

/// Profile metadata captured from the first page of a walk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileMeta {
    pub display_name: String,
    pub affiliation: Option<String>,
    pub email_domain: Option<String>,
    pub interests: Vec<String>,
    pub image_url: Option<String>,
}

/// One publication row scraped from the profile table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublicationRow {
    /// Scholar's opaque work id, stable across metadata variants.
    pub cluster_id: Option<String>,
    pub title: String,
    pub authors: String,
    pub venue_text: Option<String>,
    pub year: Option<i32>,
    pub citation_count: i64,
    pub pub_url: Option<String>,
    /// Direct PDF link when Scholar offers one next to the row.
    pub pdf_url: Option<String>,
}

impl PublicationRow {
    pub fn fingerprint(&self) -> String {
        fingerprint::compute(&self.title, self.year)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Pagination {
    pub has_next: bool,
    /// Index of the next unfetched page, present iff `has_next`.
    pub next_cursor: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsedPage {
    /// Present on page 0 only.
    pub profile: Option<ProfileMeta>,
    pub rows: Vec<PublicationRow>,
    pub pagination: Pagination,
}

/// Outcome of parsing one page. A structural surprise fails the whole page:
/// half-parsed rows never escape this boundary.
#[derive(Debug, Clone)]
pub enum ParseResult {
    Page(ParsedPage),
    Layout { code: &'static str },
    Blocked { sentinel: String },
}
