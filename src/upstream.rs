//! Resilient HTTP client for the backend: bounded connection pool, retry
//! with exponential backoff and jitter, and a circuit breaker.
//!
//! Retries apply to timeouts, connect errors, and the configured retryable
//! status set (429/502/503/504 by default) regardless of idempotency; this
//! assumes the backend's completions are side-effect free. Shrink
//! `retry.retry_on` in the config if that does not hold for your backend.
//!
//! The breaker wraps the whole retry loop: one exhausted `issue` call counts
//! as one consecutive failure. Crossing the threshold opens the circuit and
//! every call fails fast with no network attempt until the cooldown elapses;
//! then exactly one probe is let through.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::{BreakerConfig, ProxyConfig, RetryConfig};
use crate::error::{ProxyError, Result};
use crate::metrics::{MetricSample, MetricsCollector};

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: bool,
    pub retry_on: Vec<u16>,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
            retry_on: config.retry_on.clone(),
        }
    }

    #[must_use]
    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retry_on.contains(&status)
    }

    /// `min(base * multiplier^attempt, max_delay)` plus up to one full delay
    /// of jitter. `attempt` is zero-based.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = exp.min(self.max_delay.as_secs_f64());
        let jitter = if self.jitter {
            rand::thread_rng().gen_range(0.0..capped.max(f64::EPSILON))
        } else {
            0.0
        };
        Duration::from_secs_f64(capped + jitter)
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// Per-target failure gate. State is mutated only through
/// [`CircuitBreaker::admit_at`] / `record_*`, all of which hold the mutex
/// for a few instructions.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            cooldown: Duration::from_secs(config.cooldown_secs),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                open_until: None,
            }),
        }
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().map_or(CircuitState::Closed, |g| g.state)
    }

    pub fn admit(&self) -> Result<()> {
        self.admit_at(Instant::now())
    }

    /// Gate a call. `Ok` while closed; while open, fails fast until the
    /// cooldown deadline, then flips to half-open and admits exactly one
    /// probe (further calls fail fast until the probe resolves).
    pub fn admit_at(&self, now: Instant) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| ProxyError::other("circuit breaker lock poisoned"))?;
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let deadline = inner.open_until.unwrap_or(now);
                if now >= deadline {
                    inner.state = CircuitState::HalfOpen;
                    Ok(())
                } else {
                    Err(ProxyError::CircuitOpen)
                }
            }
            // Probe already in flight
            CircuitState::HalfOpen => Err(ProxyError::CircuitOpen),
        }
    }

    pub fn record_success(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.state = CircuitState::Closed;
            inner.consecutive_failures = 0;
            inner.open_until = None;
        }
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    pub fn record_failure_at(&self, now: Instant) {
        if let Ok(mut inner) = self.inner.lock() {
            match inner.state {
                CircuitState::Closed => {
                    inner.consecutive_failures += 1;
                    if inner.consecutive_failures >= self.failure_threshold {
                        inner.state = CircuitState::Open;
                        inner.open_until = Some(now + self.cooldown);
                        warn!(
                            failures = inner.consecutive_failures,
                            cooldown_secs = self.cooldown.as_secs(),
                            "Circuit opened"
                        );
                    }
                }
                // Failed probe reopens and restarts the cooldown
                CircuitState::HalfOpen | CircuitState::Open => {
                    inner.state = CircuitState::Open;
                    inner.open_until = Some(now + self.cooldown);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Retry loop
// ---------------------------------------------------------------------------

/// Outcome of a single attempt, classified by the caller.
pub enum Attempt<R> {
    Success(R),
    /// Worth retrying: timeout, connect error, retryable status.
    Retry(ProxyError),
    /// Not worth retrying; surfaced immediately.
    Fatal(ProxyError),
}

/// Drive `attempt_fn` under the policy and breaker. One exhausted loop is one
/// breaker failure; any success closes the circuit. A half-open probe gets
/// exactly one attempt: retrying a probe would defeat the cooldown.
pub async fn run_with_retry<R, F, Fut>(
    policy: &RetryPolicy,
    breaker: &CircuitBreaker,
    mut attempt_fn: F,
) -> Result<R>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Attempt<R>>,
{
    breaker.admit()?;

    let max_attempts = if breaker.state() == CircuitState::HalfOpen {
        1
    } else {
        policy.max_attempts
    };

    let mut last_err = None;
    for attempt in 0..max_attempts {
        match attempt_fn(attempt).await {
            Attempt::Success(resp) => {
                breaker.record_success();
                return Ok(resp);
            }
            Attempt::Fatal(err) => {
                breaker.record_failure();
                return Err(err);
            }
            Attempt::Retry(err) => {
                debug!(attempt, error = %err, "Upstream attempt failed");
                last_err = Some(err);
                if attempt + 1 < max_attempts {
                    sleep(policy.delay_for_attempt(attempt)).await;
                }
            }
        }
    }

    breaker.record_failure();
    Err(last_err.unwrap_or_else(|| ProxyError::other("retry loop without attempts")))
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    policy: RetryPolicy,
    breaker: CircuitBreaker,
    metrics: Arc<MetricsCollector>,
}

impl UpstreamClient {
    /// Build the pooled client from config. Pool bounds and timeouts live on
    /// the reqwest builder; the policy and breaker wrap every call.
    pub fn from_config(config: &ProxyConfig, metrics: Arc<MetricsCollector>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(config.backend.pool_max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(config.backend.pool_idle_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url: config.effective_base_url(),
            api_key: config.resolve_api_key()?,
            policy: RetryPolicy::from_config(&config.retry),
            breaker: CircuitBreaker::new(&config.breaker),
            metrics,
        })
    }

    #[must_use]
    pub fn breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// POST a JSON body to `path` under the retry policy and breaker.
    /// Non-retryable upstream statuses are returned as responses for the
    /// caller to translate; retryable ones are surfaced as `Upstream` after
    /// the attempts are exhausted.
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        run_with_retry(&self.policy, &self.breaker, |_attempt| {
            let url = url.clone();
            async move {
                let started = Instant::now();
                let result = self
                    .http
                    .post(&url)
                    .header("Authorization", format!("Bearer {}", self.api_key))
                    .header("Content-Type", "application/json")
                    .json(body)
                    .send()
                    .await;
                self.classify(path, "POST", started, result)
            }
        })
        .await
    }

    /// GET `path` under the same policy.
    pub async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        run_with_retry(&self.policy, &self.breaker, |_attempt| {
            let url = url.clone();
            async move {
                let started = Instant::now();
                let result = self
                    .http
                    .get(&url)
                    .header("Authorization", format!("Bearer {}", self.api_key))
                    .send()
                    .await;
                self.classify(path, "GET", started, result)
            }
        })
        .await
    }

    /// Classify one attempt and record its metric sample, so attempt counts
    /// are visible even when the caller only sees the final outcome.
    fn classify(
        &self,
        path: &str,
        method: &str,
        started: Instant,
        result: std::result::Result<reqwest::Response, reqwest::Error>,
    ) -> Attempt<reqwest::Response> {
        let mut sample = MetricSample::new(format!("upstream:{path}"), method);
        sample.duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        let attempt = match result {
            Ok(resp) => {
                let status = resp.status().as_u16();
                sample.status = status;
                if self.policy.is_retryable_status(status) {
                    Attempt::Retry(ProxyError::upstream(status, "retryable upstream status"))
                } else {
                    Attempt::Success(resp)
                }
            }
            Err(e) if e.is_timeout() => {
                Attempt::Retry(ProxyError::upstream(504, format!("upstream timeout: {e}")))
            }
            Err(e) if e.is_connect() => Attempt::Retry(ProxyError::upstream(
                502,
                format!("upstream connect error: {e}"),
            )),
            Err(e) => Attempt::Fatal(ProxyError::Http(e)),
        };

        self.metrics.record(sample);
        attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::SnapshotFilter;

    fn policy(max_attempts: u32, base_ms: u64, jitter: bool) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(base_ms),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter,
            retry_on: vec![429, 502, 503, 504],
        }
    }

    fn breaker(threshold: u32, cooldown: Duration) -> CircuitBreaker {
        CircuitBreaker::new(&BreakerConfig {
            failure_threshold: threshold,
            cooldown_secs: cooldown.as_secs(),
        })
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let p = policy(5, 1000, false);
        assert_eq!(p.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(p.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(p.delay_for_attempt(2), Duration::from_secs(4));
        // Capped at max_delay
        assert_eq!(p.delay_for_attempt(10), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_within_one_delay() {
        let p = policy(3, 1000, true);
        for _ in 0..50 {
            let d = p.delay_for_attempt(0);
            assert!(d >= Duration::from_secs(1));
            assert!(d <= Duration::from_secs(2));
        }
    }

    #[test]
    fn test_retryable_status_predicate() {
        let p = policy(3, 1, false);
        assert!(p.is_retryable_status(503));
        assert!(p.is_retryable_status(429));
        assert!(!p.is_retryable_status(400));
        assert!(!p.is_retryable_status(500));
    }

    #[test]
    fn test_breaker_opens_after_threshold() {
        let b = breaker(5, Duration::from_secs(30));
        let now = Instant::now();

        for _ in 0..4 {
            b.record_failure_at(now);
            assert_eq!(b.state(), CircuitState::Closed);
        }
        b.record_failure_at(now);
        assert_eq!(b.state(), CircuitState::Open);

        // Sixth call fails fast inside the cooldown window
        assert!(matches!(
            b.admit_at(now + Duration::from_secs(1)),
            Err(ProxyError::CircuitOpen)
        ));
    }

    #[test]
    fn test_breaker_single_probe_after_cooldown() {
        let b = breaker(1, Duration::from_secs(30));
        let now = Instant::now();
        b.record_failure_at(now);
        assert_eq!(b.state(), CircuitState::Open);

        let after = now + Duration::from_secs(31);
        // Exactly one probe admitted
        assert!(b.admit_at(after).is_ok());
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(matches!(b.admit_at(after), Err(ProxyError::CircuitOpen)));

        // Successful probe closes the circuit
        b.record_success();
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(b.admit_at(after).is_ok());
    }

    #[test]
    fn test_failed_probe_reopens_with_fresh_cooldown() {
        let b = breaker(1, Duration::from_secs(30));
        let now = Instant::now();
        b.record_failure_at(now);

        let probe_time = now + Duration::from_secs(31);
        assert!(b.admit_at(probe_time).is_ok());
        b.record_failure_at(probe_time);
        assert_eq!(b.state(), CircuitState::Open);

        // Old deadline has passed but the new one has not
        assert!(b.admit_at(probe_time + Duration::from_secs(29)).is_err());
        assert!(b.admit_at(probe_time + Duration::from_secs(31)).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_makes_exactly_max_attempts() {
        let p = policy(3, 1000, false);
        let b = breaker(10, Duration::from_secs(30));
        let attempts = std::sync::atomic::AtomicU32::new(0);

        let started = tokio::time::Instant::now();
        let result: Result<()> = run_with_retry(&p, &b, |_| {
            attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async { Attempt::Retry(ProxyError::upstream(503, "down")) }
        })
        .await;

        assert!(matches!(result, Err(ProxyError::Upstream { status: 503, .. })));
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
        // Two backoff sleeps: base + base*2 (no jitter, paused clock)
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(b.state(), CircuitState::Closed); // one failure, threshold 10
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_transient_failures() {
        let p = policy(3, 100, false);
        let b = breaker(10, Duration::from_secs(30));
        let attempts = std::sync::atomic::AtomicU32::new(0);

        let result = run_with_retry(&p, &b, |_| {
            let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move {
                if n < 2 {
                    Attempt::Retry(ProxyError::upstream(502, "flaky"))
                } else {
                    Attempt::Success(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_half_open_probe_makes_single_attempt() {
        let p = policy(3, 1, false);
        // Zero cooldown: the first admit after the failure is the probe
        let b = breaker(1, Duration::from_secs(0));
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);

        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result: Result<()> = run_with_retry(&p, &b, |_| {
            attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async { Attempt::Retry(ProxyError::upstream(503, "still down")) }
        })
        .await;

        assert!(matches!(result, Err(ProxyError::Upstream { status: 503, .. })));
        // The probe is not retried, and its failure reopens the circuit
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_open_breaker_skips_attempts_entirely() {
        let p = policy(3, 1, false);
        let b = breaker(1, Duration::from_secs(300));
        b.record_failure();

        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result: Result<()> = run_with_retry(&p, &b, |_| {
            attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async { Attempt::Retry(ProxyError::upstream(503, "down")) }
        })
        .await;

        assert!(matches!(result, Err(ProxyError::CircuitOpen)));
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_stops_immediately() {
        let p = policy(3, 1000, false);
        let b = breaker(10, Duration::from_secs(30));
        let attempts = std::sync::atomic::AtomicU32::new(0);

        let result: Result<()> = run_with_retry(&p, &b, |_| {
            attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async { Attempt::Fatal(ProxyError::other("broken request")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    // Attempt-level metrics are recorded by classify(); exercised here via
    // the same sample shape the client emits.
    #[test]
    fn test_attempt_samples_are_countable() {
        let metrics = Arc::new(MetricsCollector::new(16));
        for _ in 0..3 {
            let mut sample = MetricSample::new("upstream:/chat/completions", "POST");
            sample.status = 503;
            metrics.record(sample);
        }

        let snap = metrics.snapshot(&SnapshotFilter {
            endpoint_contains: Some("upstream:".to_string()),
            since: None,
        });
        assert_eq!(snap.total_requests, 3);
        assert_eq!(snap.failed_requests, 3);
    }
}
