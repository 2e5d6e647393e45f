//! Retry with exponential backoff for transient fetch failures.
//!
//! The nominal delay before retry `n` (0-based) is
//! `min(base_delay * 2^n, max_delay)`. Each delay is randomised by ±20%,
//! capped at `max_delay`, and never shorter than the delay before it.
//! Only [`ScrapeError::Transient`] and [`ScrapeError::RateLimited`] are
//! retried; everything else returns immediately.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::error::ScrapeError;
use crate::models::{FetchRequest, FetchResponse};
use crate::traits::Fetcher;

/// Fraction of the nominal delay used as the jitter range.
const JITTER_FRACTION: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

/// Result of a fetch run through [`RetryPolicy::execute`].
#[derive(Debug)]
pub struct RetryOutcome {
    pub result: Result<FetchResponse, ScrapeError>,
    /// Retries consumed (attempts minus one).
    pub retries: u32,
    /// Backoff delays actually slept, in order.
    pub delays: Vec<Duration>,
    /// Fetches started, including one abandoned on cancellation.
    pub attempts: u32,
    /// Wall time spent inside the fetcher over all attempts.
    pub fetch_time: Duration,
}

impl RetryOutcome {
    fn new(result: Result<FetchResponse, ScrapeError>) -> Self {
        Self {
            result,
            retries: 0,
            delays: Vec::new(),
            attempts: 0,
            fetch_time: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    /// Un-jittered delay before retry `retry` (0-based).
    pub fn nominal_delay(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Jittered delay before retry `retry`, never shorter than `previous`.
    pub fn backoff_delay(&self, retry: u32, previous: Duration) -> Duration {
        let nominal = self.nominal_delay(retry).as_secs_f64();
        let factor = rand::thread_rng().gen_range(1.0 - JITTER_FRACTION..=1.0 + JITTER_FRACTION);
        Duration::from_secs_f64(nominal * factor)
            .min(self.max_delay)
            .max(previous)
    }

    /// Fetch `request`, retrying transient failures.
    ///
    /// Backoff sleeps and in-flight fetches are abandoned as soon as `cancel`
    /// fires, yielding [`ScrapeError::Cancelled`].
    pub async fn execute<F: Fetcher>(
        &self,
        fetcher: &F,
        request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> RetryOutcome {
        let mut outcome = RetryOutcome::new(Err(ScrapeError::Cancelled));
        let mut previous = Duration::ZERO;

        loop {
            if cancel.is_cancelled() {
                outcome.result = Err(ScrapeError::Cancelled);
                return outcome;
            }

            let started = Instant::now();
            outcome.attempts += 1;
            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ScrapeError::Cancelled),
                result = fetcher.fetch(request) => result,
            };
            outcome.fetch_time += started.elapsed();

            let err = match attempt {
                Err(err) if err.is_retryable() => err,
                result => {
                    outcome.result = result;
                    return outcome;
                }
            };

            if outcome.retries >= self.max_retries {
                tracing::warn!(
                    domain = %request.target.domain,
                    page = request.page,
                    attempts = outcome.attempts,
                    error = %err,
                    "Retries exhausted"
                );
                outcome.result = Err(ScrapeError::RetriesExhausted {
                    attempts: outcome.attempts,
                    last: Box::new(err),
                });
                return outcome;
            }

            let delay = self.backoff_delay(outcome.retries, previous);
            tracing::info!(
                domain = %request.target.domain,
                page = request.page,
                retry = outcome.retries + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient fetch failure, backing off"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    outcome.result = Err(ScrapeError::Cancelled);
                    return outcome;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            previous = delay;
            outcome.delays.push(delay);
            outcome.retries += 1;
        }
    }
}
