//! HeaderParser (C2) — normalize rate-limit response metadata.

use crate::rate_limit::RateLimitSnapshot;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Parses a provider's response headers (already collected by the caller
/// into a plain map — transport is out of scope here) into a
/// [`RateLimitSnapshot`].
///
/// Header name matching is case-insensitive; missing values are left
/// absent rather than defaulted to zero.
pub fn parse_rate_limit_headers(headers: &HashMap<String, String>) -> RateLimitSnapshot {
    let lower: HashMap<String, &str> = headers
        .iter()
        .map(|(k, v)| (k.to_lowercase(), v.as_str()))
        .collect();

    let get_u64 = |key: &str| lower.get(key).and_then(|v| v.trim().parse::<u64>().ok());

    let remaining_requests = get_u64("x-ratelimit-remaining-requests");
    let limit_requests = get_u64("x-ratelimit-limit-requests");
    let remaining_tokens = get_u64("x-ratelimit-remaining-tokens");
    let limit_tokens = get_u64("x-ratelimit-limit-tokens");

    let reset_requests = lower
        .get("x-ratelimit-reset-requests")
        .and_then(|v| parse_duration_hint(v));
    let reset_tokens = lower
        .get("x-ratelimit-reset-tokens")
        .and_then(|v| parse_duration_hint(v));

    // The sooner of the two resets, when both are present, is the one that
    // actually gates further acquires.
    let reset_at = match (reset_requests, reset_tokens) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
    .map(|secs| Utc::now() + chrono::Duration::milliseconds((secs * 1000.0) as i64));

    RateLimitSnapshot {
        remaining_requests,
        limit_requests,
        remaining_tokens,
        limit_tokens,
        reset_at,
    }
}

/// Parses a duration hint like `"30"`, `"30s"`, `"500ms"`, `"2m"` into
/// seconds. Defaults to seconds when no suffix is present, per `spec.md` §4.2.
fn parse_duration_hint(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if let Some(stripped) = raw.strip_suffix("ms") {
        return stripped.trim().parse::<f64>().ok().map(|v| v / 1000.0);
    }
    if let Some(stripped) = raw.strip_suffix('s') {
        return stripped.trim().parse::<f64>().ok();
    }
    if let Some(stripped) = raw.strip_suffix('m') {
        return stripped.trim().parse::<f64>().ok().map(|v| v * 60.0);
    }
    raw.parse::<f64>().ok()
}

/// Parses a `retry-after` header: either a number of seconds or an HTTP
/// date. Returned as milliseconds, for passing straight to
/// `SlotQueue::mark_rate_limited`.
pub fn parse_retry_after(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<f64>() {
        if secs >= 0.0 {
            return Some((secs * 1000.0) as u64);
        }
    }
    let parsed = DateTime::parse_from_rfc2822(raw).ok()?;
    let now = Utc::now();
    let target = parsed.with_timezone(&Utc);
    let delta = target.signed_duration_since(now).num_milliseconds();
    Some(delta.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_requests_and_tokens() {
        let h = headers(&[
            ("X-RateLimit-Remaining-Requests", "42"),
            ("x-ratelimit-limit-requests", "100"),
            ("X-RateLimit-Remaining-Tokens", "900"),
            ("x-ratelimit-limit-tokens", "1000"),
        ]);
        let snap = parse_rate_limit_headers(&h);
        assert_eq!(snap.remaining_requests, Some(42));
        assert_eq!(snap.limit_requests, Some(100));
        assert_eq!(snap.remaining_tokens, Some(900));
        assert_eq!(snap.limit_tokens, Some(1000));
        assert!(snap.reset_at.is_none());
    }

    #[test]
    fn missing_values_are_absent_not_zero() {
        let h = headers(&[]);
        let snap = parse_rate_limit_headers(&h);
        assert!(snap.remaining_requests.is_none());
        assert!(snap.limit_requests.is_none());
    }

    #[test]
    fn reset_hint_defaults_to_seconds() {
        let h = headers(&[("x-ratelimit-reset-requests", "30")]);
        let snap = parse_rate_limit_headers(&h);
        let reset = snap.reset_at.expect("reset_at set");
        let delta = (reset - Utc::now()).num_seconds();
        assert!((28..=31).contains(&delta));
    }

    #[test]
    fn reset_hint_honors_ms_suffix() {
        let h = headers(&[("x-ratelimit-reset-requests", "500ms")]);
        let snap = parse_rate_limit_headers(&h);
        let reset = snap.reset_at.expect("reset_at set");
        let delta = (reset - Utc::now()).num_milliseconds();
        assert!((0..=600).contains(&delta));
    }

    #[test]
    fn retry_after_parses_seconds() {
        assert_eq!(parse_retry_after("120"), Some(120_000));
        assert_eq!(parse_retry_after("0"), Some(0));
    }

    #[test]
    fn retry_after_rejects_garbage() {
        assert_eq!(parse_retry_after("not-a-date"), None);
    }
}
