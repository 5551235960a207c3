//! Thin wrapper over an authenticated HTTP client. Credential acquisition
//! happens upstream; this layer receives a ready session token, issues
//! GETs, counts requests, and classifies responses into the crawl error
//! taxonomy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, COOKIE, RETRY_AFTER};
use reqwest::{Client, StatusCode};

use crate::config::Consts;
use crate::error::{CrawlError, Result};

const SESSION_COOKIE: &str = "fssessionid";

pub struct ApiSession {
    client: Client,
    base_url: String,
    counter: AtomicU64,
}

impl ApiSession {
    /// Build a session against `base_url` using an already-established
    /// session token.
    pub fn new(
        base_url: &str,
        session_token: &str,
        user_agent: &str,
        timeout_secs: u64,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let cookie = format!("{SESSION_COOKIE}={session_token}");
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&cookie)
                .map_err(|e| CrawlError::Config(format!("invalid session token: {e}")))?,
        );

        let client = Client::builder()
            .user_agent(user_agent)
            .default_headers(headers)
            .timeout(Duration::from_secs(timeout_secs))
            .pool_max_idle_per_host(Consts::POOL_IDLE_PER_HOST)
            .pool_idle_timeout(Duration::from_secs(Consts::POOL_IDLE_TIMEOUT_SECS))
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| CrawlError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            counter: AtomicU64::new(0),
        })
    }

    /// Monotonic count of requests issued through this session.
    pub fn request_count(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }

    /// GET `path` and return the parsed JSON body, or `None` for an empty
    /// (204) response. Non-success statuses come back as the matching
    /// taxonomy error.
    pub async fn get_json(&self, path: &str) -> Result<Option<serde_json::Value>> {
        let url = format!("{}{}", self.base_url, path);
        self.counter.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%url, "GET");

        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                CrawlError::Transient("request timeout".to_string())
            } else {
                CrawlError::Transient(e.to_string())
            }
        })?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        if let Some(err) = classify_status(status.as_u16(), retry_after) {
            tracing::debug!(%url, status = status.as_u16(), "non-success response");
            return Err(err);
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        let body = response
            .text()
            .await
            .map_err(|e| CrawlError::Transient(format!("failed to read body: {e}")))?;
        let json = serde_json::from_str(&body)
            .map_err(|e| CrawlError::CorruptPayload(format!("{url}: {e}")))?;
        Ok(Some(json))
    }
}

/// Map a status code onto the taxonomy; `None` means success.
pub fn classify_status(status: u16, retry_after: Option<u64>) -> Option<CrawlError> {
    match status {
        200..=299 => None,
        401 => Some(CrawlError::AuthExpired),
        429 => Some(CrawlError::Throttled {
            status,
            retry_after,
        }),
        500..=599 => Some(CrawlError::Throttled {
            status,
            retry_after,
        }),
        400..=499 => Some(CrawlError::PermanentFailure(status)),
        other => Some(CrawlError::PermanentFailure(other)),
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}
