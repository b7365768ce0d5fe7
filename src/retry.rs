//! Retry policy for extraction calls.
//!
//! This module provides the `RetryPolicy`, which re-issues an extraction call
//! that failed with a retryable error (query-level errors, API throttling or
//! server errors, connection failures and attempt timeouts). Request-level
//! errors are returned after the first attempt.
//!
//! Attempts are spaced with an exponential backoff, capped by a maximum delay
//! and optionally jittered. When the API reports that a domain is occupied,
//! the delay is raised to the wait it asked for. The retry loop is independent
//! of the crawler's own retry machinery and keeps its state per logical call.

use std::future::Future;
use std::time::Duration;

use rand::distributions::{Distribution, Uniform};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

use crate::error::{AutoExtractError, Result};

/// Bounded retry policy with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, the first one included.
    pub max_attempts: u32,
    /// Factor for exponential backoff (delay = backoff_factor * (2^retries)).
    pub backoff_factor: f64,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Spread delays by up to a quarter in either direction.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            backoff_factor: 1.0,
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Creates a new `RetryPolicy` with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that makes a single attempt.
    pub fn none() -> Self {
        Self::default().max_attempts(1)
    }

    /// Sets the maximum number of attempts. Values below 1 mean a single attempt.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the factor for exponential backoff.
    pub fn backoff_factor(mut self, backoff_factor: f64) -> Self {
        self.backoff_factor = backoff_factor;
        self
    }

    /// Sets the maximum delay between attempts.
    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Runs `call` until it succeeds, fails with a non-retryable error, runs
    /// out of attempts or `cancel` fires. `call` receives the 1-based attempt
    /// number.
    pub async fn call_with_retry<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut state = RetryState::new(self.max_attempts.max(1));

        loop {
            if cancel.is_cancelled() {
                trace!("Call cancelled before attempt {}", state.attempt_count + 1);
                return Err(AutoExtractError::Cancelled);
            }
            state.attempt_count += 1;

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AutoExtractError::Cancelled),
                outcome = call(state.attempt_count) => outcome,
            };

            let error = match outcome {
                Ok(value) => return Ok(value),
                Err(error) if !error.is_retryable() => {
                    trace!("Error is not retryable, returning it: {}", error);
                    return Err(error);
                }
                Err(error) => error,
            };

            if state.attempt_count >= state.max_attempts {
                warn!(
                    "Max attempts ({}) reached (error: {})",
                    state.max_attempts, error
                );
                return Err(AutoExtractError::RetryExhausted {
                    attempts: state.attempt_count,
                    last_error: Box::new(error),
                });
            }

            let delay = self.calculate_delay(state.attempt_count - 1, &error);
            info!(
                "Retrying (error: {}, attempt {}/{}) after {:?}",
                error,
                state.attempt_count + 1,
                state.max_attempts,
                delay
            );
            state.last_error = Some(error);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AutoExtractError::Cancelled),
                _ = sleep(delay) => {}
            }
        }
    }

    fn calculate_delay(&self, retries: u32, error: &AutoExtractError) -> Duration {
        let exponent = retries.min(f64::MAX_EXP as u32) as i32;
        let delay_secs =
            (self.backoff_factor * 2.0f64.powi(exponent)).min(self.max_delay.as_secs_f64());
        let delay = self.apply_jitter(self.to_delay(delay_secs));
        match error.retry_hint_secs() {
            Some(hint) => delay.max(self.to_delay(hint)),
            None => delay,
        }
    }

    // Values a `Duration` cannot hold (negative, NaN, overflowing) become `max_delay`.
    fn to_delay(&self, secs: f64) -> Duration {
        Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay)
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }

        let jitter_window = delay.mul_f64(0.25);
        let low = delay.saturating_sub(jitter_window);
        let high = delay + jitter_window;

        let mut rng = rand::thread_rng();
        Uniform::new_inclusive(low, high).sample(&mut rng)
    }
}

/// Progress of one logical call.
#[derive(Debug)]
pub struct RetryState {
    pub attempt_count: u32,
    pub last_error: Option<AutoExtractError>,
    pub max_attempts: u32,
}

impl RetryState {
    fn new(max_attempts: u32) -> Self {
        Self {
            attempt_count: 0,
            last_error: None,
            max_attempts,
        }
    }
}
