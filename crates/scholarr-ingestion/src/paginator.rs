//! Multi-page profile walk.
//!
//! Pages are fetched, parsed, and upserted strictly in order: page N is
//! committed before page N+1 is requested, so an interruption leaves a clean
//! resume cursor and everything already collected stays persisted.

use scholarr_common::Result;
use scholarr_db::scholars::ScholarProfile;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::fetcher::{PageFetch, ProfileFetcher};
use crate::models::ProfileMeta;
use crate::upserter::{DiscoveredPublication, Upserter};

#[derive(Debug, Clone)]
pub enum InterruptCause {
    Blocked,
    Network(String),
}

#[derive(Debug, Clone)]
pub enum WalkTermination {
    /// Walked to the end of the profile, the page cap, or a stable tail.
    Completed,
    /// Head fingerprint matched the previous successful walk.
    SkippedNoChange,
    LayoutError { code: &'static str },
    /// Partial walk; everything before `resume_cursor` is already upserted.
    Interrupted {
        cause: InterruptCause,
        resume_cursor: u32,
    },
    Cancelled,
}

#[derive(Debug)]
pub struct WalkOutcome {
    pub termination: WalkTermination,
    pub pages_fetched: u32,
    /// Rows observed and upserted across all fetched pages.
    pub publication_count: i64,
    /// Fingerprint of the first row of page 0, when page 0 was fetched.
    pub head_fingerprint: Option<String>,
    pub profile: Option<ProfileMeta>,
    pub warnings: Vec<String>,
    pub discovered: Vec<DiscoveredPublication>,
}

pub struct WalkParams {
    pub run_id: i64,
    pub user_delay: Duration,
    /// Skip the head short-circuit (manual forced runs).
    pub force: bool,
    /// First page to fetch; non-zero for continuation runs.
    pub start_cursor: u32,
    pub max_pages: u32,
    pub cancel: watch::Receiver<bool>,
}

pub struct Paginator<'a> {
    fetcher: &'a dyn ProfileFetcher,
    upserter: &'a Upserter,
}

impl<'a> Paginator<'a> {
    pub fn new(fetcher: &'a dyn ProfileFetcher, upserter: &'a Upserter) -> Self {
        Self { fetcher, upserter }
    }

    #[instrument(skip(self, scholar, params), fields(scholar = scholar.id, run = params.run_id))]
    pub async fn walk(&self, scholar: &ScholarProfile, params: &WalkParams) -> Result<WalkOutcome> {
        let mut outcome = WalkOutcome {
            termination: WalkTermination::Completed,
            pages_fetched: 0,
            publication_count: 0,
            head_fingerprint: None,
            profile: None,
            warnings: Vec::new(),
            discovered: Vec::new(),
        };

        let mut page = params.start_cursor;
        loop {
            if *params.cancel.borrow() {
                outcome.termination = WalkTermination::Cancelled;
                return Ok(outcome);
            }
            if outcome.pages_fetched >= params.max_pages {
                info!(page, "page cap reached, stopping walk");
                outcome.termination = WalkTermination::Completed;
                return Ok(outcome);
            }

            let fetched = self
                .fetcher
                .fetch_page(&scholar.scholar_id, page, params.user_delay)
                .await;
            let parsed = match fetched {
                PageFetch::Page(parsed) => parsed,
                PageFetch::Blocked => {
                    warn!(page, "walk interrupted: blocked");
                    outcome.termination = WalkTermination::Interrupted {
                        cause: InterruptCause::Blocked,
                        resume_cursor: page,
                    };
                    return Ok(outcome);
                }
                PageFetch::NetworkError { cause } => {
                    warn!(page, cause = %cause, "walk interrupted: network");
                    outcome.termination = WalkTermination::Interrupted {
                        cause: InterruptCause::Network(cause),
                        resume_cursor: page,
                    };
                    return Ok(outcome);
                }
                PageFetch::Layout { code } => {
                    outcome.termination = WalkTermination::LayoutError { code };
                    return Ok(outcome);
                }
            };
            outcome.pages_fetched += 1;

            if page == 0 {
                outcome.profile = parsed.profile.clone();
                outcome.head_fingerprint = parsed.rows.first().map(|row| row.fingerprint());

                if !params.force {
                    if let (Some(head), Some(previous)) = (
                        outcome.head_fingerprint.as_deref(),
                        scholar.last_fingerprint_head.as_deref(),
                    ) {
                        if head == previous {
                            info!("head fingerprint unchanged, skipping walk");
                            outcome.termination = WalkTermination::SkippedNoChange;
                            return Ok(outcome);
                        }
                    }
                }
            }

            if !parsed.rows.is_empty() {
                let stats = self
                    .upserter
                    .upsert_page(scholar, params.run_id, &parsed.rows)
                    .await?;
                outcome.publication_count += stats.total as i64;
                let is_stable_tail = stats.is_stable_tail();
                outcome.warnings.extend(stats.warnings);
                outcome.discovered.extend(stats.discovered);

                if is_stable_tail && page > params.start_cursor {
                    info!(page, "stable tail reached, stopping walk");
                    outcome.termination = WalkTermination::Completed;
                    return Ok(outcome);
                }
            }

            if !parsed.pagination.has_next {
                outcome.termination = WalkTermination::Completed;
                return Ok(outcome);
            }
            page = parsed.pagination.next_cursor.unwrap_or(page + 1);
        }
    }
}
