use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use tracing::debug;

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_RETRIES: usize = 2;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 500;
pub const DEFAULT_RATE_LIMIT_MS: u64 = 300;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSettings {
    pub user_agent: String,
    pub timeout_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    pub rate_limit_ms: u64,
}

impl HttpSettings {
    pub fn new(user_agent: &str) -> Self {
        Self {
            user_agent: user_agent.to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_retries: DEFAULT_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            rate_limit_ms: DEFAULT_RATE_LIMIT_MS,
        }
    }

    pub fn build_client(&self) -> Result<Client> {
        Client::builder()
            .timeout(Duration::from_millis(self.timeout_ms))
            .user_agent(self.user_agent.clone())
            .cookie_store(true)
            .build()
            .context("failed to build HTTP client")
    }
}

/// Spaces requests at least `rate_limit_ms` apart across threads and counts
/// them. Also owns the retry backoff schedule.
pub struct RequestPacer {
    rate_limit: Duration,
    retry_delay_ms: u64,
    last_request_at: Mutex<Option<Instant>>,
    request_count: AtomicUsize,
}

impl RequestPacer {
    pub fn new(settings: &HttpSettings) -> Self {
        Self {
            rate_limit: Duration::from_millis(settings.rate_limit_ms),
            retry_delay_ms: settings.retry_delay_ms,
            last_request_at: Mutex::new(None),
            request_count: AtomicUsize::new(0),
        }
    }

    pub fn pace(&self) {
        let mut last = self
            .last_request_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.rate_limit {
                sleep(self.rate_limit - elapsed);
            }
        }
        *last = Some(Instant::now());
        self.request_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn request_count(&self) -> usize {
        self.request_count.load(Ordering::SeqCst)
    }

    pub fn retry_delay(&self, attempt: usize) -> Duration {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        Duration::from_millis(base.saturating_add(jitter))
    }

    pub fn wait_before_retry(&self, attempt: usize, what: &str) {
        let delay = self.retry_delay(attempt);
        debug!(attempt, delay_ms = delay.as_millis() as u64, what, "retrying request");
        sleep(delay);
    }
}

pub fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

pub fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}
