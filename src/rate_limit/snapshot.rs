//! RateLimitSnapshot value object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `spec.md` §3: a value object describing a provider's current quota.
///
/// Invariant: if `limit_x` is present, `remaining_x <= limit_x`. Ratio
/// (`remaining / limit`) is undefined when `limit` is missing or zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub remaining_requests: Option<u64>,
    pub limit_requests: Option<u64>,
    pub remaining_tokens: Option<u64>,
    pub limit_tokens: Option<u64>,
    pub reset_at: Option<DateTime<Utc>>,
}

impl RateLimitSnapshot {
    pub fn requests_ratio(&self) -> Option<f64> {
        ratio(self.remaining_requests, self.limit_requests)
    }

    pub fn tokens_ratio(&self) -> Option<f64> {
        ratio(self.remaining_tokens, self.limit_tokens)
    }

    /// `isQuotaExhausted()`'s pure half: true iff either counter is known
    /// zero. Does not look at `reset_at` — the queue decides whether an
    /// exhausted snapshot should first be treated as refreshed.
    pub fn is_exhausted(&self) -> bool {
        self.remaining_requests == Some(0) || self.remaining_tokens == Some(0)
    }

    /// Merges a newer snapshot's present fields over this one, leaving
    /// fields the newer snapshot doesn't report untouched — used by
    /// `updateRateLimitState`, which only ever narrows what it knows.
    pub fn merge(&mut self, other: RateLimitSnapshot) {
        if other.remaining_requests.is_some() {
            self.remaining_requests = other.remaining_requests;
        }
        if other.limit_requests.is_some() {
            self.limit_requests = other.limit_requests;
        }
        if other.remaining_tokens.is_some() {
            self.remaining_tokens = other.remaining_tokens;
        }
        if other.limit_tokens.is_some() {
            self.limit_tokens = other.limit_tokens;
        }
        if other.reset_at.is_some() {
            self.reset_at = other.reset_at;
        }
    }
}

fn ratio(remaining: Option<u64>, limit: Option<u64>) -> Option<f64> {
    match (remaining, limit) {
        (Some(r), Some(l)) if l > 0 => Some(r as f64 / l as f64),
        _ => None,
    }
}
