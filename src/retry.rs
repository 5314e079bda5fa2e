//! RetryPolicy (C1) — classify errors and compute backoff delays.

use crate::error::ClassifiedError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Substrings that mark an error as a transient transport failure worth
/// retrying. Matched case-insensitively against the error's message.
const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "econnreset",
    "econnrefused",
    "eai_again",
    "503",
    "429",
    "rate limit",
    "too many requests",
];

/// `{ maxRetries, baseDelayMs, maxDelayMs, jitterFactor }` from `spec.md` §3.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 500,
            max_delay_ms: 60_000,
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay_ms: u64, max_delay_ms: u64, jitter_factor: f64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            max_delay_ms: max_delay_ms.max(base_delay_ms),
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
        }
    }

    /// `shouldRetry(attempt, error, isRateLimited, policy)` from `spec.md` §4.1.
    pub fn should_retry(&self, attempt: u32, error: &ClassifiedError, is_rate_limited: bool) -> bool {
        if attempt >= self.max_retries {
            return false;
        }
        if is_rate_limited || error.is_rate_limited() {
            return true;
        }
        if let Some(status) = error.status_code() {
            if (500..600).contains(&status) || status == 429 {
                return true;
            }
        }
        match error.message() {
            Some(msg) => {
                let lower = msg.to_lowercase();
                TRANSIENT_MARKERS.iter().any(|marker| lower.contains(marker))
            }
            None => false,
        }
    }

    /// `getRetryDelay(attempt, policy, serverRetryAfterMs)` from `spec.md` §4.1.
    ///
    /// `server_retry_after_ms` of `Some(0)` means "retry immediately" and is
    /// distinct from `None` ("no server hint, compute our own backoff") —
    /// the same `Option`-not-truthiness discipline `spec.md` §9 calls for
    /// with `threshold`.
    pub fn retry_delay(&self, attempt: u32, server_retry_after_ms: Option<u64>) -> Duration {
        if let Some(server_ms) = server_retry_after_ms {
            return Duration::from_millis(server_ms.min(self.max_delay_ms));
        }

        let base = (self.base_delay_ms as f64) * 2f64.powi(attempt as i32);
        let capped = base.min(self.max_delay_ms as f64);

        let delay = if self.jitter_factor == 0.0 {
            capped
        } else {
            let spread = capped * self.jitter_factor;
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            (capped + offset).clamp(0.0, self.max_delay_ms as f64)
        };

        Duration::from_millis(delay.round() as u64)
    }
}
