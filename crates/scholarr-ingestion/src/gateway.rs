//! Outbound HTTP primitive with per-host pacing.
//!
//! Every outbound request in the ingestion subsystem goes through here: the
//! Scholar page fetches, the enrichment providers, and the PDF resolvers.
//! The gateway enforces a minimum monotonic gap per host, classifies
//! responses, and owns the only in-process retries (transient network
//! errors, and one rate-limit retry). Blocked responses are never retried;
//! they surface so the safety controller can cool the user down.

use rand::Rng;
use scholarr_common::clock::{Clock, SharedClock};
use scholarr_config::IngestionSettings;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Body substrings that mean Scholar served a challenge page instead of content.
const BLOCK_SENTINELS: &[&str] = &[
    "Solving the above CAPTCHA",
    "unusual traffic from your computer network",
    "gs_captcha_f",
    "/sorry/index",
];

pub fn body_looks_blocked(body: &str) -> Option<&'static str> {
    BLOCK_SENTINELS
        .iter()
        .find(|sentinel| body.contains(**sentinel))
        .copied()
}

/// Classified result of one gateway fetch.
#[derive(Debug)]
pub enum FetchOutcome {
    Ok {
        body: String,
        /// Pacing wait actually spent before the request, for the
        /// scheduler's wall-clock accounting.
        realized_delay: Duration,
    },
    /// Anti-bot response (403/503, 429 without Retry-After, or a challenge
    /// body). Never retried in-process.
    Blocked,
    /// 429 that survived the single in-process retry.
    RateLimited { retry_after: Option<Duration> },
    /// The resource does not exist upstream (404).
    NotFound,
    /// Transport failure after the configured retries.
    NetworkError { cause: String },
}

pub struct Gateway {
    client: reqwest::Client,
    clock: SharedClock,
    settings: IngestionSettings,
    last_request: Mutex<HashMap<String, Instant>>,
}

impl Gateway {
    pub fn new(clock: SharedClock, settings: IngestionSettings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(settings.page_deadline_seconds))
            .build()?;
        Ok(Self {
            client,
            clock,
            settings,
            last_request: Mutex::new(HashMap::new()),
        })
    }

    /// Fetch a scraping target with the user's configured delay (floored).
    pub async fn fetch(&self, url: &Url, user_delay: Duration) -> FetchOutcome {
        let floor = Duration::from_secs(self.settings.min_request_delay_seconds);
        self.fetch_with_gap(url, user_delay.max(floor)).await
    }

    /// Fetch a metadata API with the server floor only.
    pub async fn fetch_api(&self, url: &Url) -> FetchOutcome {
        let floor = Duration::from_secs(self.settings.min_request_delay_seconds);
        self.fetch_with_gap(url, floor).await
    }

    async fn fetch_with_gap(&self, url: &Url, min_gap: Duration) -> FetchOutcome {
        let host = url.host_str().unwrap_or("").to_string();
        let realized_delay = self.pace(&host, min_gap).await;

        let mut network_attempt: u32 = 0;
        let mut rate_limit_retried = false;
        loop {
            let response = self.client.get(url.as_str()).send().await;
            self.touch(&host);

            match response {
                Err(err) => {
                    let cause = err.to_string();
                    if network_attempt < self.settings.network_error_retries {
                        let backoff = Duration::from_secs(
                            self.settings.retry_backoff_seconds * 2u64.pow(network_attempt),
                        );
                        warn!(host = %host, attempt = network_attempt + 1, error = %cause,
                              "network error, retrying");
                        network_attempt += 1;
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                    return FetchOutcome::NetworkError { cause };
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    match status {
                        429 => {
                            let retry_after = response
                                .headers()
                                .get("retry-after")
                                .and_then(|v| v.to_str().ok())
                                .and_then(|v| v.trim().parse::<u64>().ok())
                                .map(Duration::from_secs);
                            let Some(wait) = retry_after else {
                                // 429 with no Retry-After reads as anti-bot.
                                return FetchOutcome::Blocked;
                            };
                            if rate_limit_retried {
                                return FetchOutcome::RateLimited {
                                    retry_after: Some(wait),
                                };
                            }
                            rate_limit_retried = true;
                            let wait = wait.min(Duration::from_secs(60));
                            debug!(host = %host, wait_secs = wait.as_secs(), "rate limited, backing off once");
                            tokio::time::sleep(wait).await;
                            continue;
                        }
                        403 | 503 => return FetchOutcome::Blocked,
                        404 => return FetchOutcome::NotFound,
                        200..=299 => {
                            let body = match response.text().await {
                                Ok(body) => body,
                                Err(err) => {
                                    return FetchOutcome::NetworkError {
                                        cause: err.to_string(),
                                    }
                                }
                            };
                            if body_looks_blocked(&body).is_some() {
                                return FetchOutcome::Blocked;
                            }
                            return FetchOutcome::Ok {
                                body,
                                realized_delay,
                            };
                        }
                        other => {
                            // Remaining 5xx are transient from our point of view.
                            if (500..600).contains(&other)
                                && network_attempt < self.settings.network_error_retries
                            {
                                let backoff = Duration::from_secs(
                                    self.settings.retry_backoff_seconds * 2u64.pow(network_attempt),
                                );
                                network_attempt += 1;
                                tokio::time::sleep(backoff).await;
                                continue;
                            }
                            return FetchOutcome::NetworkError {
                                cause: format!("http status {other}"),
                            };
                        }
                    }
                }
            }
        }
    }

    /// Wait out the minimum gap since the last request to this host, plus
    /// uniform jitter. Returns the wait actually spent.
    async fn pace(&self, host: &str, min_gap: Duration) -> Duration {
        let jitter_range = self.settings.request_jitter_seconds;
        let jitter = if jitter_range > 0.0 {
            Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..jitter_range))
        } else {
            Duration::ZERO
        };

        let now = self.clock.monotonic();
        let wait = {
            let last = self.last_request.lock().unwrap();
            match last.get(host) {
                Some(previous) => {
                    let ready_at = *previous + min_gap + jitter;
                    ready_at.saturating_duration_since(now)
                }
                None => Duration::ZERO,
            }
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        wait
    }

    fn touch(&self, host: &str) {
        let mut last = self.last_request.lock().unwrap();
        last.insert(host.to_string(), self.clock.monotonic());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scholarr_common::SystemClock;
    use std::sync::Arc;

    fn settings_for_test() -> IngestionSettings {
        let mut settings = IngestionSettings::default();
        settings.min_request_delay_seconds = 2;
        settings.request_jitter_seconds = 0.0;
        settings.network_error_retries = 1;
        settings.retry_backoff_seconds = 1;
        settings
    }

    fn gateway(settings: IngestionSettings) -> Gateway {
        Gateway::new(Arc::new(SystemClock), settings).unwrap()
    }

    #[test]
    fn sentinel_detection() {
        assert!(body_looks_blocked("<html>Solving the above CAPTCHA proves you are human</html>").is_some());
        assert!(body_looks_blocked("We detected unusual traffic from your computer network").is_some());
        assert!(body_looks_blocked("<html><body>regular page</body></html>").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn pace_enforces_min_gap_per_host() {
        let gw = gateway(settings_for_test());
        let host = "scholar.google.com";
        let gap = Duration::from_secs(5);

        let first = gw.pace(host, gap).await;
        assert_eq!(first, Duration::ZERO);
        gw.touch(host);

        let start = Instant::now();
        let second = gw.pace(host, gap).await;
        assert!(second >= gap - Duration::from_millis(5), "waited {second:?}");
        assert!(start.elapsed() >= gap - Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn pacing_is_per_host() {
        let gw = gateway(settings_for_test());
        gw.touch("scholar.google.com");

        let start = Instant::now();
        let wait = gw.pace("api.openalex.org", Duration::from_secs(5)).await;
        assert_eq!(wait, Duration::ZERO);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn classifies_blocked_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/citations")
            .with_status(403)
            .create_async()
            .await;

        let mut settings = settings_for_test();
        settings.min_request_delay_seconds = 0;
        let gw = gateway(settings);
        let url = Url::parse(&format!("{}/citations", server.url())).unwrap();
        let outcome = gw.fetch(&url, Duration::ZERO).await;
        assert!(matches!(outcome, FetchOutcome::Blocked));
    }

    #[tokio::test]
    async fn classifies_challenge_body_as_blocked() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/citations")
            .with_status(200)
            .with_body("Please prove you are human. Solving the above CAPTCHA ...")
            .create_async()
            .await;

        let mut settings = settings_for_test();
        settings.min_request_delay_seconds = 0;
        let gw = gateway(settings);
        let url = Url::parse(&format!("{}/citations", server.url())).unwrap();
        let outcome = gw.fetch(&url, Duration::ZERO).await;
        assert!(matches!(outcome, FetchOutcome::Blocked));
    }

    #[tokio::test]
    async fn server_errors_are_retried_then_reported_as_network() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/flaky")
            .with_status(500)
            .expect(2)
            .create_async()
            .await;

        let mut settings = settings_for_test();
        settings.min_request_delay_seconds = 0;
        settings.retry_backoff_seconds = 0;
        let gw = gateway(settings);
        let url = Url::parse(&format!("{}/flaky", server.url())).unwrap();
        let outcome = gw.fetch(&url, Duration::ZERO).await;
        assert!(
            matches!(outcome, FetchOutcome::NetworkError { .. }),
            "{outcome:?}"
        );
        // One original attempt plus one retry.
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn success_carries_body() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/page")
            .with_status(200)
            .with_body("<html>profile</html>")
            .create_async()
            .await;

        let mut settings = settings_for_test();
        settings.min_request_delay_seconds = 0;
        let gw = gateway(settings);
        let url = Url::parse(&format!("{}/page", server.url())).unwrap();
        match gw.fetch(&url, Duration::ZERO).await {
            FetchOutcome::Ok { body, .. } => assert!(body.contains("profile")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
