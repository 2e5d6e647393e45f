//! Per-domain request pacing.
//!
//! Each domain gets a token bucket holding up to `burst` tokens and refilling
//! at `requests_per_second`. A caller reserves its slot under the bucket's
//! lock, letting the bucket go into debt, and then sleeps outside the lock
//! until the slot arrives. Reservation order is therefore service order:
//! same-domain callers are served FIFO, and a slow domain never blocks
//! another one.
//!
//! The rate is adaptive: a 429 from a domain halves its effective rate (down
//! to [`MIN_RATE_FACTOR`] of the configured one) and each success restores
//! 10% of it, never above the configured rate.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use leafcutter_core::ratelimit::{RateLimit, RateLimiter};
//!
//! # async fn run() {
//! let limiter = Arc::new(RateLimiter::new(RateLimit::new(2.0, 1)));
//! limiter.acquire("example.com").await; // immediate
//! limiter.acquire("example.com").await; // ~500ms later
//! limiter.acquire("other.org").await; // immediate
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::ScrapeError;
use crate::models::{FetchRequest, FetchResponse, FetchStrategy};
use crate::traits::Fetcher;

/// Lowest fraction of the configured rate that 429 feedback can reach.
pub const MIN_RATE_FACTOR: f64 = 1.0 / 16.0;

const BACKOFF_FACTOR: f64 = 0.5;
const RECOVERY_FACTOR: f64 = 1.1;

/// Sustained rate and burst size for one domain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimit {
    pub requests_per_second: f64,
    pub burst: u32,
}

impl RateLimit {
    pub fn new(requests_per_second: f64, burst: u32) -> Self {
        Self {
            requests_per_second,
            burst,
        }
    }

    /// Minimum spacing between requests once the burst is spent.
    pub fn interval(&self) -> Duration {
        seconds(1.0 / self.requests_per_second)
    }

    pub(crate) fn validate(&self, scope: &str) -> Result<(), ScrapeError> {
        if !(self.requests_per_second.is_finite() && self.requests_per_second > 0.0) {
            return Err(ScrapeError::Config(format!(
                "{scope}: requests_per_second must be positive, got {}",
                self.requests_per_second
            )));
        }
        // The slowest adapted interval must still be a representable duration.
        let slowest = self.requests_per_second * MIN_RATE_FACTOR;
        if Duration::try_from_secs_f64(1.0 / slowest).is_err() {
            return Err(ScrapeError::Config(format!(
                "{scope}: requests_per_second {} is too small",
                self.requests_per_second
            )));
        }
        if self.burst == 0 {
            return Err(ScrapeError::Config(format!("{scope}: burst must be at least 1")));
        }
        Ok(())
    }
}

/// Proof that a request slot was granted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateGrant {
    pub domain: String,
    /// Time spent waiting for the slot.
    pub waited: Duration,
}

/// Saturating seconds-to-duration conversion.
fn seconds(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

#[derive(Debug)]
struct Bucket {
    limit: RateLimit,
    /// Share of the configured rate currently allowed, in `MIN_RATE_FACTOR..=1`.
    factor: f64,
    tokens: f64,
    refilled_at: Instant,
}

impl Bucket {
    fn new(limit: RateLimit, now: Instant) -> Self {
        Self {
            limit,
            factor: 1.0,
            tokens: f64::from(limit.burst),
            refilled_at: now,
        }
    }

    fn rate(&self) -> f64 {
        self.limit.requests_per_second * self.factor
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.refilled_at).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate()).min(f64::from(self.limit.burst));
        self.refilled_at = now;
    }

    /// Take one token, possibly going into debt. Returns how long the
    /// caller must wait before its slot is due.
    fn reserve(&mut self, now: Instant) -> Duration {
        self.refill(now);
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            seconds(-self.tokens / self.rate())
        }
    }

    /// Change the rate from `now` on; tokens earned so far keep the old rate.
    fn rescale(&mut self, factor: f64, now: Instant) {
        self.refill(now);
        self.factor = factor.clamp(MIN_RATE_FACTOR, 1.0);
    }
}

/// Shared per-domain token buckets. Wrap in `Arc` and share across runs.
#[derive(Debug)]
pub struct RateLimiter {
    default_limit: RateLimit,
    overrides: HashMap<String, RateLimit>,
    /// Arc lets us drop the shard guard before touching the bucket.
    buckets: DashMap<String, Arc<Mutex<Bucket>>>,
}

impl RateLimiter {
    pub fn new(default_limit: RateLimit) -> Self {
        Self {
            default_limit,
            overrides: HashMap::new(),
            buckets: DashMap::new(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        let mut limiter = Self::new(config.rate_limit);
        for (domain, limit) in &config.domain_rate_limits {
            limiter = limiter.with_domain_limit(domain.as_str(), *limit);
        }
        limiter
    }

    pub fn with_domain_limit(mut self, domain: impl Into<String>, limit: RateLimit) -> Self {
        self.overrides
            .insert(domain.into().to_ascii_lowercase(), limit);
        self
    }

    /// The limit applied to `domain`.
    pub fn limit_for(&self, domain: &str) -> RateLimit {
        self.overrides
            .get(domain)
            .copied()
            .unwrap_or(self.default_limit)
    }

    fn bucket(&self, domain: &str) -> Arc<Mutex<Bucket>> {
        if let Some(bucket) = self.buckets.get(domain) {
            return Arc::clone(bucket.value());
        }
        let limit = self.limit_for(domain);
        let entry = self
            .buckets
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Bucket::new(limit, Instant::now()))));
        Arc::clone(entry.value())
    }

    fn lock_bucket<'a>(domain: &str, bucket: &'a Mutex<Bucket>) -> MutexGuard<'a, Bucket> {
        bucket.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(domain = %domain, "Recovered from poisoned rate-limit bucket");
            poisoned.into_inner()
        })
    }

    fn reserve(&self, domain: &str) -> Duration {
        let bucket = self.bucket(domain);
        let mut guard = Self::lock_bucket(domain, &bucket);
        guard.reserve(Instant::now())
    }

    /// The rate currently applied to `domain`, after 429 feedback.
    pub fn current_rate(&self, domain: &str) -> f64 {
        match self.buckets.get(domain).map(|b| Arc::clone(b.value())) {
            Some(bucket) => Self::lock_bucket(domain, &bucket).rate(),
            None => self.limit_for(domain).requests_per_second,
        }
    }

    /// The domain answered 429: halve its effective rate.
    pub fn record_rate_limited(&self, domain: &str) {
        let bucket = self.bucket(domain);
        let mut guard = Self::lock_bucket(domain, &bucket);
        let factor = guard.factor * BACKOFF_FACTOR;
        guard.rescale(factor, Instant::now());
        tracing::warn!(
            domain = %domain,
            requests_per_second = guard.rate(),
            "Rate limited by site, slowing down"
        );
    }

    /// A request to the domain succeeded: recover part of the configured rate.
    pub fn record_success(&self, domain: &str) {
        let Some(bucket) = self.buckets.get(domain).map(|b| Arc::clone(b.value())) else {
            return;
        };
        let mut guard = Self::lock_bucket(domain, &bucket);
        if guard.factor < 1.0 {
            let factor = guard.factor * RECOVERY_FACTOR;
            guard.rescale(factor, Instant::now());
            tracing::debug!(domain = %domain, requests_per_second = guard.rate(), "Recovering request rate");
        }
    }

    /// Wait until a request slot for `domain` is available. Never fails.
    pub async fn acquire(&self, domain: &str) -> RateGrant {
        let wait = self.reserve(domain);
        if !wait.is_zero() {
            tracing::debug!(domain = %domain, wait_ms = wait.as_millis() as u64, "Rate limiting request");
            tokio::time::sleep(wait).await;
        }
        RateGrant {
            domain: domain.to_string(),
            waited: wait,
        }
    }

    /// Like [`acquire`](Self::acquire), but gives up when `cancel` fires.
    pub async fn acquire_cancellable(
        &self,
        domain: &str,
        cancel: &CancellationToken,
    ) -> Result<RateGrant, ScrapeError> {
        if cancel.is_cancelled() {
            return Err(ScrapeError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ScrapeError::Cancelled),
            grant = self.acquire(domain) => Ok(grant),
        }
    }
}

/// A [`Fetcher`] that takes one rate-limit grant per call, keyed on the
/// request target's domain.
#[derive(Clone)]
pub struct RateLimitedFetcher<F> {
    inner: F,
    limiter: Arc<RateLimiter>,
}

impl<F: Fetcher> RateLimitedFetcher<F> {
    pub fn new(inner: F, limiter: Arc<RateLimiter>) -> Self {
        Self { inner, limiter }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn inner(&self) -> &F {
        &self.inner
    }
}

impl<F: Fetcher> Fetcher for RateLimitedFetcher<F> {
    fn supports(&self, strategy: FetchStrategy) -> bool {
        self.inner.supports(strategy)
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, ScrapeError> {
        let domain = &request.target.domain;
        self.limiter.acquire(domain).await;
        let result = self.inner.fetch(request).await;
        match &result {
            Ok(_) => self.limiter.record_success(domain),
            Err(err) if err.is_rate_limited() => self.limiter.record_rate_limited(domain),
            Err(_) => {}
        }
        result
    }
}
