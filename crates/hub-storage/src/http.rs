use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use rand::Rng;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Exponential backoff: `base_delay * 2^attempt`, capped at `max_delay`,
/// spread by +/- `jitter` (a fraction of the delay).
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// No waiting between attempts; used by tests and in-process sinks.
    pub fn immediate(max_retries: usize) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn jittered_delay(&self, attempt_index: usize) -> Duration {
        let delay = self.delay_for_attempt(attempt_index);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        delay.mul_f64(factor).min(self.max_delay)
    }

    pub fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }
}

/// Final error of an operation that kept failing for every allowed attempt.
#[derive(Debug)]
pub struct Exhausted<E> {
    pub attempts: usize,
    pub last: E,
}

impl<E: fmt::Display> fmt::Display for Exhausted<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gave up after {} attempts: {}", self.attempts, self.last)
    }
}

/// Run `op` until it succeeds or the policy's attempts are used up.
pub async fn retry_async<T, E, F, Fut>(
    policy: &BackoffPolicy,
    label: &str,
    mut op: F,
) -> Result<T, Exhausted<E>>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_retries => {
                warn!(label, attempt, error = %err, "attempt failed; retrying");
                tokio::time::sleep(policy.jittered_delay(attempt)).await;
                attempt += 1;
            }
            Err(err) => {
                return Err(Exhausted {
                    attempts: attempt + 1,
                    last: err,
                })
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed after {attempts} attempts: {source}")]
    Exhausted {
        url: String,
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url} after {attempts} attempts")]
    HttpStatus {
        status: u16,
        url: String,
        attempts: usize,
    },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

impl FetchError {
    /// True when the upstream kept failing transiently until retries ran out.
    pub fn retries_exhausted(&self) -> bool {
        match self {
            FetchError::Exhausted { .. } => true,
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(|s| classify_status(s) == RetryDisposition::Retryable)
                .unwrap_or(false),
            FetchError::Request(_) => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            token_bucket,
            backoff: config.backoff,
        })
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    /// GET `url` with bounded concurrency, rate limiting and retry on transient failures.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        self.fetch_bytes_with(run_id, source_id, url, &self.backoff)
            .await
    }

    /// Same as [`HttpFetcher::fetch_bytes`] with a per-source retry policy.
    pub async fn fetch_bytes_with(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        backoff: &BackoffPolicy,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        let span = info_span!("http_fetch", %run_id, source_id, url);
        self.fetch_with_retries(url, backoff).instrument(span).await
    }

    async fn fetch_with_retries(
        &self,
        url: &str,
        backoff: &BackoffPolicy,
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            if let Some(bucket) = &self.token_bucket {
                bucket.take().await;
            }

            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let content_type = resp
                            .headers()
                            .get(reqwest::header::CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("application/octet-stream")
                            .to_string();
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            content_type,
                            body,
                        });
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < backoff.max_retries
                    {
                        warn!(status = status.as_u16(), attempt, "retryable http status");
                    } else {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                            attempts: attempt + 1,
                        });
                    }
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable {
                        return Err(FetchError::Request(err));
                    }
                    if attempt >= backoff.max_retries {
                        return Err(FetchError::Exhausted {
                            url: url.to_string(),
                            attempts: attempt + 1,
                            source: err,
                        });
                    }
                    warn!(error = %err, attempt, "transient request error");
                }
            }

            tokio::time::sleep(backoff.jittered_delay(attempt)).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
        assert_eq!(policy.jittered_delay(1), Duration::from_millis(200));
    }

    #[test]
    fn jitter_stays_within_band_and_cap() {
        let policy = BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            jitter: 0.5,
        };
        for _ in 0..50 {
            let d = policy.jittered_delay(1);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(300));
        }
    }

    #[test]
    fn retryable_statuses_count_as_exhaustion() {
        let err = FetchError::HttpStatus {
            status: 503,
            url: "https://api.carbonintensity.org.uk/regional/regionid/13".into(),
            attempts: 4,
        };
        assert!(err.retries_exhausted());
        let err = FetchError::HttpStatus {
            status: 404,
            url: "https://example.test/listing/1".into(),
            attempts: 1,
        };
        assert!(!err.retries_exhausted());
        assert_eq!(err.status(), Some(404));
    }

    #[tokio::test]
    async fn retry_async_stops_after_policy_attempts() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), Exhausted<String>> =
            retry_async(&BackoffPolicy::immediate(3), "always-fails", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("down".to_string()) }
            })
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn retry_async_returns_first_success() {
        let result: Result<usize, Exhausted<String>> =
            retry_async(&BackoffPolicy::immediate(3), "flaky", |attempt| async move {
                if attempt < 2 {
                    Err(format!("attempt {attempt}"))
                } else {
                    Ok(attempt)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
    }
}
