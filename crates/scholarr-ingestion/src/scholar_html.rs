//! Scholar profile page parser.
//!
//! Turns one `citations?user=…` HTML page into a [`ParsedPage`]. Structural
//! surprises fail the whole page with a short layout code; a page is either
//! fully parsed or not parsed at all.

use lazy_static::lazy_static;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use crate::gateway::body_looks_blocked;
use crate::models::{Pagination, ParsedPage, ProfileMeta, PublicationRow};

pub const SCHOLAR_BASE_URL: &str = "https://scholar.google.com";

lazy_static! {
    static ref ROW: Selector = Selector::parse("tr.gsc_a_tr").expect("static selector");
    static ref ROW_BODY: Selector = Selector::parse("#gsc_a_b").expect("static selector");
    static ref EMPTY_MARKER: Selector = Selector::parse("td.gsc_a_e").expect("static selector");
    static ref TITLE_LINK: Selector = Selector::parse("a.gsc_a_at").expect("static selector");
    static ref GRAY_LINE: Selector = Selector::parse("div.gs_gray").expect("static selector");
    static ref YEAR_CELL: Selector = Selector::parse("td.gsc_a_y span").expect("static selector");
    static ref CITE_LINK: Selector = Selector::parse("td.gsc_a_c a.gsc_a_ac").expect("static selector");
    static ref PDF_LINK: Selector = Selector::parse("td.gsc_a_t a.gsc_a_atp").expect("static selector");
    static ref PROFILE_NAME: Selector = Selector::parse("#gsc_prf_in").expect("static selector");
    static ref PROFILE_AFFILIATION: Selector =
        Selector::parse("div.gsc_prf_il").expect("static selector");
    static ref PROFILE_EMAIL: Selector = Selector::parse("#gsc_prf_ivh").expect("static selector");
    static ref PROFILE_INTEREST: Selector =
        Selector::parse("a.gsc_prf_inta").expect("static selector");
    static ref PROFILE_IMAGE: Selector =
        Selector::parse("img#gsc_prf_pup-img").expect("static selector");
    static ref MORE_BUTTON: Selector = Selector::parse("button#gsc_bpf_more").expect("static selector");
    static ref YEAR_RE: Regex = Regex::new(r"\b(19|20)\d{2}\b").expect("static regex");
    static ref EMAIL_DOMAIN_RE: Regex =
        Regex::new(r"[Vv]erified email at ([A-Za-z0-9.-]+)").expect("static regex");
}

/// Re-exported result type; see [`crate::models::ParseResult`].
pub use crate::models::ParseResult;

pub fn parse_profile_page(html: &str, page_index: u32) -> ParseResult {
    if let Some(sentinel) = body_looks_blocked(html) {
        return ParseResult::Blocked {
            sentinel: sentinel.to_string(),
        };
    }

    let document = Html::parse_document(html);

    let Some(body) = document.select(&ROW_BODY).next() else {
        return ParseResult::Layout {
            code: "missing_rows",
        };
    };

    let mut rows = Vec::new();
    for row in body.select(&ROW) {
        // The "no articles" marker renders as a row of its own.
        if row.select(&EMPTY_MARKER).next().is_some() {
            continue;
        }
        match parse_row(&row) {
            Ok(parsed) => rows.push(parsed),
            Err(code) => return ParseResult::Layout { code },
        }
    }
    if rows.is_empty() && body.select(&EMPTY_MARKER).next().is_none() && page_index == 0 {
        // Page 0 with neither rows nor the explicit empty marker is a layout
        // we do not recognize.
        return ParseResult::Layout {
            code: "missing_rows",
        };
    }

    let profile = if page_index == 0 {
        match parse_profile(&document) {
            Ok(profile) => Some(profile),
            Err(code) => return ParseResult::Layout { code },
        }
    } else {
        None
    };

    let has_next = document
        .select(&MORE_BUTTON)
        .next()
        .map(|button| button.value().attr("disabled").is_none())
        .unwrap_or(false);

    debug!(page_index, rows = rows.len(), has_next, "parsed profile page");

    ParseResult::Page(ParsedPage {
        profile,
        rows,
        pagination: Pagination {
            has_next,
            next_cursor: has_next.then(|| page_index + 1),
        },
    })
}

fn parse_row(row: &ElementRef<'_>) -> Result<PublicationRow, &'static str> {
    let title_link = row.select(&TITLE_LINK).next().ok_or("missing_title")?;
    let title = text_of(&title_link);
    if title.is_empty() {
        return Err("missing_title");
    }

    let href = title_link.value().attr("href").unwrap_or("");
    let cluster_id = cluster_id_from_href(href);
    let pub_url = if href.is_empty() {
        None
    } else {
        Some(format!("{SCHOLAR_BASE_URL}{href}"))
    };

    let gray: Vec<String> = row.select(&GRAY_LINE).map(|el| text_of(&el)).collect();
    let authors = gray.first().cloned().unwrap_or_default();
    let venue_text = gray.get(1).filter(|v| !v.is_empty()).cloned();

    let year = row
        .select(&YEAR_CELL)
        .next()
        .map(|el| text_of(&el))
        .filter(|t| !t.is_empty())
        .or_else(|| {
            venue_text
                .as_deref()
                .and_then(|v| YEAR_RE.find(v).map(|m| m.as_str().to_string()))
        })
        .and_then(|t| t.parse::<i32>().ok());

    let citation_count = row
        .select(&CITE_LINK)
        .next()
        .map(|el| text_of(&el))
        .and_then(|t| t.parse::<i64>().ok())
        .unwrap_or(0);

    let pdf_url = row
        .select(&PDF_LINK)
        .next()
        .and_then(|el| el.value().attr("href"))
        .map(String::from);

    Ok(PublicationRow {
        cluster_id,
        title,
        authors,
        venue_text,
        year,
        citation_count,
        pub_url,
        pdf_url,
    })
}

fn parse_profile(document: &Html) -> Result<ProfileMeta, &'static str> {
    let name = document
        .select(&PROFILE_NAME)
        .next()
        .map(|el| text_of(&el))
        .filter(|n| !n.is_empty())
        .ok_or("missing_profile")?;

    let affiliation = document
        .select(&PROFILE_AFFILIATION)
        .next()
        .map(|el| text_of(&el))
        .filter(|a| !a.is_empty());

    let email_domain = document
        .select(&PROFILE_EMAIL)
        .next()
        .map(|el| text_of(&el))
        .and_then(|t| EMAIL_DOMAIN_RE.captures(&t).map(|c| c[1].to_string()));

    let interests = document
        .select(&PROFILE_INTEREST)
        .map(|el| text_of(&el))
        .filter(|i| !i.is_empty())
        .collect();

    let image_url = document
        .select(&PROFILE_IMAGE)
        .next()
        .and_then(|el| el.value().attr("src"))
        .map(String::from);

    Ok(ProfileMeta {
        display_name: name,
        affiliation,
        email_domain,
        interests,
        image_url,
    })
}

/// `citation_for_view=USERID:CLUSTERID` → `CLUSTERID`.
fn cluster_id_from_href(href: &str) -> Option<String> {
    let (_, query) = href.split_once('?')?;
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("citation_for_view="))
        .and_then(|value| value.split(':').nth(1))
        .filter(|id| !id.is_empty())
        .map(String::from)
}

fn text_of(el: &ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile_header() -> &'static str {
        r#"<div id="gsc_prf_in">Ada Lovelace</div>
           <div class="gsc_prf_il">Analytical Engines Institute</div>
           <div id="gsc_prf_ivh">Verified email at aei.example.edu - <a>Homepage</a></div>
           <div id="gsc_prf_int">
             <a class="gsc_prf_inta">computing</a>
             <a class="gsc_prf_inta">mathematics</a>
           </div>
           <img id="gsc_prf_pup-img" src="/citations/images/avatar.png">"#
    }

    fn row(title: &str, cluster: &str, year: &str, citations: &str) -> String {
        format!(
            r#"<tr class="gsc_a_tr">
                 <td class="gsc_a_t">
                   <a class="gsc_a_at" href="/citations?view_op=view_citation&user=AbCdEfGhIjKl&citation_for_view=AbCdEfGhIjKl:{cluster}">{title}</a>
                   <div class="gs_gray">A Lovelace, C Babbage</div>
                   <div class="gs_gray">Journal of Computation, {year}</div>
                 </td>
                 <td class="gsc_a_c"><a class="gsc_a_ac" href="/scholar?cites=1">{citations}</a></td>
                 <td class="gsc_a_y"><span class="gsc_a_h">{year}</span></td>
               </tr>"#
        )
    }

    fn page(header: &str, rows: &str, more_enabled: bool) -> String {
        let button = if more_enabled {
            r#"<button id="gsc_bpf_more" type="button">Show more</button>"#
        } else {
            r#"<button id="gsc_bpf_more" type="button" disabled>Show more</button>"#
        };
        format!(
            r#"<html><body>{header}
               <table id="gsc_a_t"><tbody id="gsc_a_b">{rows}</tbody></table>
               {button}</body></html>"#
        )
    }

    #[test]
    fn parses_rows_and_profile() {
        let html = page(
            profile_header(),
            &format!(
                "{}{}",
                row("Notes on the Analytical Engine", "cl_1", "1843", "412"),
                row("Sketch of the Engine", "cl_2", "1842", "")
            ),
            true,
        );
        let result = parse_profile_page(&html, 0);
        let ParseResult::Page(parsed) = result else {
            panic!("expected page, got {result:?}");
        };

        assert_eq!(parsed.rows.len(), 2);
        let first = &parsed.rows[0];
        assert_eq!(first.title, "Notes on the Analytical Engine");
        assert_eq!(first.cluster_id.as_deref(), Some("cl_1"));
        assert_eq!(first.year, Some(1843));
        assert_eq!(first.citation_count, 412);
        assert!(first.pub_url.as_deref().unwrap().starts_with(SCHOLAR_BASE_URL));
        // Empty citation link means zero citations, not a parse failure.
        assert_eq!(parsed.rows[1].citation_count, 0);

        let profile = parsed.profile.expect("profile on page 0");
        assert_eq!(profile.display_name, "Ada Lovelace");
        assert_eq!(profile.affiliation.as_deref(), Some("Analytical Engines Institute"));
        assert_eq!(profile.email_domain.as_deref(), Some("aei.example.edu"));
        assert_eq!(profile.interests, vec!["computing", "mathematics"]);
        assert!(profile.image_url.is_some());

        assert!(parsed.pagination.has_next);
        assert_eq!(parsed.pagination.next_cursor, Some(1));
    }

    #[test]
    fn later_pages_skip_profile_and_stop_on_disabled_button() {
        let html = page("", &row("Paper", "cl_9", "2001", "3"), false);
        let ParseResult::Page(parsed) = parse_profile_page(&html, 3) else {
            panic!("expected page");
        };
        assert!(parsed.profile.is_none());
        assert!(!parsed.pagination.has_next);
        assert_eq!(parsed.pagination.next_cursor, None);
    }

    #[test]
    fn empty_profile_is_not_a_layout_error() {
        let html = page(
            profile_header(),
            r#"<tr><td class="gsc_a_e" colspan="3">There are no articles in this profile.</td></tr>"#,
            false,
        );
        let ParseResult::Page(parsed) = parse_profile_page(&html, 0) else {
            panic!("expected page");
        };
        assert!(parsed.rows.is_empty());
    }

    #[test]
    fn missing_table_is_a_whole_page_failure() {
        let result = parse_profile_page("<html><body><p>something else</p></body></html>", 0);
        assert!(matches!(result, ParseResult::Layout { code: "missing_rows" }));
    }

    #[test]
    fn row_without_title_fails_the_page() {
        let broken = r#"<tr class="gsc_a_tr"><td class="gsc_a_t"><div class="gs_gray">authors</div></td></tr>"#;
        let html = page(profile_header(), broken, false);
        let result = parse_profile_page(&html, 0);
        assert!(matches!(result, ParseResult::Layout { code: "missing_title" }));
    }

    #[test]
    fn captcha_page_is_blocked() {
        let result = parse_profile_page(
            "<html>Our systems have detected unusual traffic from your computer network</html>",
            0,
        );
        assert!(matches!(result, ParseResult::Blocked { .. }));
    }

    #[test]
    fn cluster_id_extraction() {
        assert_eq!(
            cluster_id_from_href("/citations?view_op=view_citation&citation_for_view=U123:W456"),
            Some("W456".to_string())
        );
        assert_eq!(cluster_id_from_href("/citations?view_op=view_citation"), None);
        assert_eq!(cluster_id_from_href(""), None);
    }
}
