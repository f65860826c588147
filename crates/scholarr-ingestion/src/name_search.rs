//! Scholar author name search.
//!
//! This side channel is the most block-prone surface we touch, so it gets
//! its own guard rails on top of the gateway pacing: a circuit breaker that
//! opens after consecutive blocked responses, and a bounded LRU cache with
//! separate TTLs for hits and for blocked (negative) results. The breaker is
//! orthogonal to the per-user run cooldown.

use lazy_static::lazy_static;
use lru::LruCache;
use rand::Rng;
use scholarr_common::clock::{Clock, SharedClock};
use scholarr_common::{Result, ScholarrError};
use scholarr_config::NameSearchSettings;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::gateway::{FetchOutcome, Gateway};
use crate::scholar_html::SCHOLAR_BASE_URL;

lazy_static! {
    static ref HIT: Selector = Selector::parse("div.gsc_1usr").expect("static selector");
    static ref HIT_NAME: Selector = Selector::parse("h3.gs_ai_name a").expect("static selector");
    static ref HIT_AFFILIATION: Selector =
        Selector::parse("div.gs_ai_aff").expect("static selector");
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScholarHit {
    pub scholar_id: String,
    pub display_name: String,
    pub affiliation: Option<String>,
}

#[derive(Clone)]
struct CacheEntry {
    hits: Vec<ScholarHit>,
    cached_at: Instant,
    /// Blocked lookups cache empty results for the (shorter) negative TTL.
    negative: bool,
}

#[derive(Default)]
struct Breaker {
    consecutive_blocked: u32,
    open_until: Option<Instant>,
}

pub struct NameSearchClient {
    gateway: Arc<Gateway>,
    clock: SharedClock,
    settings: NameSearchSettings,
    cache: Mutex<LruCache<String, CacheEntry>>,
    breaker: Mutex<Breaker>,
    base_url: String,
}

impl NameSearchClient {
    pub fn new(gateway: Arc<Gateway>, clock: SharedClock, settings: NameSearchSettings) -> Self {
        let capacity = NonZeroUsize::new(settings.cache_capacity.max(1)).expect("non-zero");
        Self {
            gateway,
            clock,
            settings,
            cache: Mutex::new(LruCache::new(capacity)),
            breaker: Mutex::new(Breaker::default()),
            base_url: SCHOLAR_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    #[instrument(skip(self))]
    pub async fn search(&self, name: &str) -> Result<Vec<ScholarHit>> {
        let key = name.trim().to_lowercase();
        if key.is_empty() {
            return Err(ScholarrError::Validation("empty search name".to_string()));
        }

        if let Some(hits) = self.cached(&key) {
            debug!("name search served from cache");
            return Ok(hits);
        }
        self.check_breaker()?;

        let mut url = Url::parse(&format!("{}/citations", self.base_url))
            .map_err(|e| ScholarrError::Validation(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("view_op", "search_authors")
            .append_pair("mauthors", name)
            .append_pair("hl", "en");

        let jitter = if self.settings.interval_jitter_seconds > 0.0 {
            rand::thread_rng().gen_range(0.0..self.settings.interval_jitter_seconds)
        } else {
            0.0
        };
        let gap = Duration::from_secs(self.settings.min_interval_seconds)
            + Duration::from_secs_f64(jitter);

        match self.gateway.fetch(&url, gap).await {
            FetchOutcome::Ok { body, .. } => {
                let hits = parse_author_search(&body);
                self.record_ok();
                self.store(&key, hits.clone(), false);
                info!(hits = hits.len(), "name search complete");
                Ok(hits)
            }
            FetchOutcome::Blocked | FetchOutcome::RateLimited { .. } => {
                warn!("name search blocked");
                self.record_blocked();
                self.store(&key, Vec::new(), true);
                Err(ScholarrError::BlockedOrCaptcha)
            }
            FetchOutcome::NotFound => {
                self.record_ok();
                self.store(&key, Vec::new(), false);
                Ok(Vec::new())
            }
            FetchOutcome::NetworkError { cause } => Err(ScholarrError::Network(cause)),
        }
    }

    fn cached(&self, key: &str) -> Option<Vec<ScholarHit>> {
        let now = self.clock.monotonic();
        let mut cache = self.cache.lock().unwrap();
        let entry = cache.get(key)?;
        let ttl = if entry.negative {
            Duration::from_secs(self.settings.negative_ttl_seconds)
        } else {
            Duration::from_secs(self.settings.positive_ttl_seconds)
        };
        if now.duration_since(entry.cached_at) > ttl {
            cache.pop(key);
            return None;
        }
        Some(entry.hits.clone())
    }

    fn store(&self, key: &str, hits: Vec<ScholarHit>, negative: bool) {
        let entry = CacheEntry {
            hits,
            cached_at: self.clock.monotonic(),
            negative,
        };
        self.cache.lock().unwrap().put(key.to_string(), entry);
    }

    fn check_breaker(&self) -> Result<()> {
        let now = self.clock.monotonic();
        let mut breaker = self.breaker.lock().unwrap();
        if let Some(open_until) = breaker.open_until {
            if now < open_until {
                return Err(ScholarrError::CooldownActive {
                    reason: "name_search_breaker_open".to_string(),
                    until: None,
                });
            }
            // Window elapsed: allow a probe request through.
            breaker.open_until = None;
        }
        Ok(())
    }

    fn record_ok(&self) {
        let mut breaker = self.breaker.lock().unwrap();
        breaker.consecutive_blocked = 0;
        breaker.open_until = None;
    }

    fn record_blocked(&self) {
        let mut breaker = self.breaker.lock().unwrap();
        breaker.consecutive_blocked += 1;
        if breaker.consecutive_blocked >= self.settings.cooldown_block_threshold {
            let until =
                self.clock.monotonic() + Duration::from_secs(self.settings.cooldown_seconds);
            warn!(
                blocked = breaker.consecutive_blocked,
                cooldown_secs = self.settings.cooldown_seconds,
                "name search breaker opened"
            );
            breaker.open_until = Some(until);
        }
    }
}

fn parse_author_search(html: &str) -> Vec<ScholarHit> {
    let document = Html::parse_document(html);
    document
        .select(&HIT)
        .filter_map(|hit| {
            let link = hit.select(&HIT_NAME).next()?;
            let display_name = link.text().collect::<String>().trim().to_string();
            let scholar_id = link
                .value()
                .attr("href")
                .and_then(scholar_id_from_href)?;
            let affiliation = hit
                .select(&HIT_AFFILIATION)
                .next()
                .map(|el| el.text().collect::<String>().trim().to_string())
                .filter(|a| !a.is_empty());
            Some(ScholarHit {
                scholar_id,
                display_name,
                affiliation,
            })
        })
        .collect()
}

fn scholar_id_from_href(href: &str) -> Option<String> {
    let (_, query) = href.split_once('?')?;
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("user="))
        .filter(|id| !id.is_empty())
        .map(String::from)
}
