//! Title normalization and stable publication fingerprints.
//!
//! The fingerprint is the primary dedup key for publications and must be
//! byte-stable across process restarts, so the hash is a fixed FNV-1a 64
//! rather than anything seeded per process.

use lazy_static::lazy_static;
use regex::Regex;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

lazy_static! {
    // New-style arXiv id: YYMM.NNNNN with an optional version suffix.
    static ref ARXIV_NEW: Regex = Regex::new(r"^(\d{4}\.\d{4,5})(?:v\d+)?$").unwrap();
    // Old-style arXiv id: archive(.subject)?/YYMMNNN with an optional version suffix.
    static ref ARXIV_OLD: Regex =
        Regex::new(r"^([a-z][a-z-]*(?:\.[A-Za-z]{2})?/\d{7})(?:v\d+)?$").unwrap();
}

/// Lowercase, NFKD-fold, strip non-alphanumerics, collapse whitespace.
///
/// Idempotent: normalizing an already-normalized title is a no-op.
pub fn normalize_title(title: &str) -> String {
    let folded: String = title
        .to_lowercase()
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();

    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Stable fingerprint over `normalized_title | year`, hex-encoded.
pub fn compute(title: &str, year: Option<i32>) -> String {
    let normalized = normalize_title(title);
    let year_part = year.map(|y| y.to_string()).unwrap_or_default();
    let key = format!("{normalized}|{year_part}");
    format!("{:016x}", fnv64(key.as_bytes()))
}

/// FNV-1a 64-bit hash.
fn fnv64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 14695981039346656037;
    for &byte in bytes {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(1099511628211);
    }
    hash
}

/// Lowercase a DOI and strip resolver/scheme prefixes.
///
/// Returns `None` when what remains does not look like a DOI.
pub fn normalize_doi(raw: &str) -> Option<String> {
    let mut doi = raw.trim().to_lowercase();
    for prefix in [
        "https://doi.org/",
        "http://doi.org/",
        "https://dx.doi.org/",
        "http://dx.doi.org/",
        "doi:",
    ] {
        if let Some(rest) = doi.strip_prefix(prefix) {
            doi = rest.trim().to_string();
            break;
        }
    }
    if doi.starts_with("10.") && doi.contains('/') {
        Some(doi)
    } else {
        None
    }
}

/// Canonicalize an arXiv identifier to its version-less form.
///
/// Accepts both old (`math.GT/0309136v2`) and new (`2301.04567v3`) forms,
/// with or without an `arXiv:` prefix.
pub fn normalize_arxiv_id(raw: &str) -> Option<String> {
    let id = raw.trim();
    let id = id
        .strip_prefix("arXiv:")
        .or_else(|| id.strip_prefix("arxiv:"))
        .unwrap_or(id)
        .trim();

    if let Some(caps) = ARXIV_NEW.captures(id) {
        return Some(caps[1].to_string());
    }
    if let Some(caps) = ARXIV_OLD.captures(id) {
        return Some(caps[1].to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_title_basic() {
        assert_eq!(
            normalize_title("Attention Is All You Need"),
            "attention is all you need"
        );
    }

    #[test]
    fn normalize_title_strips_punctuation_and_folds_diacritics() {
        assert_eq!(
            normalize_title("  Glauber dynamics:   José's  survey!  "),
            "glauber dynamics jose s survey"
        );
    }

    #[test]
    fn normalize_title_idempotent() {
        let titles = [
            "Attention Is All You Need",
            "Ĉu ŝi — parolas, Esperanton?",
            "Deep learning (review), 2015 edition",
            "",
        ];
        for t in titles {
            let once = normalize_title(t);
            assert_eq!(once, normalize_title(&once));
        }
    }

    #[test]
    fn fingerprint_stable_under_renormalization() {
        let title = "A Stochastic Approximation Method";
        let once = normalize_title(title);
        assert_eq!(compute(title, Some(1951)), compute(&once, Some(1951)));
        assert_eq!(compute(title, None), compute(&once, None));
    }

    #[test]
    fn fingerprint_distinguishes_year() {
        let title = "Annual review of widgets";
        assert_ne!(compute(title, Some(2023)), compute(title, Some(2024)));
        assert_ne!(compute(title, Some(2023)), compute(title, None));
    }

    #[test]
    fn doi_normalization() {
        assert_eq!(
            normalize_doi("https://doi.org/10.1000/XYZ123"),
            Some("10.1000/xyz123".to_string())
        );
        assert_eq!(
            normalize_doi("doi:10.48550/arXiv.2301.04567"),
            Some("10.48550/arxiv.2301.04567".to_string())
        );
        assert_eq!(normalize_doi("not-a-doi"), None);
        assert_eq!(normalize_doi("10.1000"), None);
    }

    #[test]
    fn arxiv_id_normalization() {
        assert_eq!(
            normalize_arxiv_id("arXiv:2301.04567v3"),
            Some("2301.04567".to_string())
        );
        assert_eq!(
            normalize_arxiv_id("2301.04567"),
            Some("2301.04567".to_string())
        );
        assert_eq!(
            normalize_arxiv_id("math.GT/0309136v2"),
            Some("math.GT/0309136".to_string())
        );
        assert_eq!(
            normalize_arxiv_id("hep-th/9901001"),
            Some("hep-th/9901001".to_string())
        );
        assert_eq!(normalize_arxiv_id("10.1000/xyz"), None);
    }
}
