//! Ambient config surfaces (SPEC_FULL.md A3).
//!
//! Plain `serde`-derived structs a caller's own config loader (YAML/JSON/
//! TOML — out of scope here) deserializes into and hands to this crate.
//! Named presets follow the teacher's `VerifierConfig::quick()`/`full()`
//! style rather than scattering magic numbers across call sites.

use crate::rate_limit::SlotQueueConfig;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Assembles everything the assertion side of the pipeline needs, beyond
/// the assertion tree itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// `spec.md` §4.6/§9: abort a test on its first failing assertion
    /// instead of continuing to accumulate. An explicit field rather than
    /// process-wide state, per the redesign note in `spec.md` §9.
    pub short_circuit_on_failure: bool,
    /// `STRATEGY_EXEMPT_PLUGINS` from `spec.md` §4.7 — assertion `type`s
    /// that may never appear inside a combinator, supplied by the caller
    /// since the concrete plugin catalog lives outside this crate.
    pub exempt_plugins: Vec<String>,
}

impl DispatcherConfig {
    /// Continues accumulating past a failing assertion (the common case —
    /// a report wants every assertion's result, not just the first miss).
    pub fn continue_on_failure() -> Self {
        Self::default()
    }

    /// Aborts a test at its first failing assertion. Useful for smoke
    /// runs where the caller only cares about pass/fail, not full detail.
    pub fn fail_fast() -> Self {
        Self {
            short_circuit_on_failure: true,
            ..Default::default()
        }
    }
}

/// Top-level config a harness assembles once per run: the retry policy
/// shared across providers, and per-provider `SlotQueue` overrides keyed
/// by provider id (falling back to `default_slot_queue` when a provider
/// has no override) — `spec.md` §4.4's "provider-appropriate defaults".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalCoreConfig {
    pub retry_policy: RetryPolicy,
    pub default_slot_queue: SlotQueueConfig,
    pub provider_overrides: HashMap<String, SlotQueueConfig>,
    pub dispatcher: DispatcherConfig,
}

impl Default for EvalCoreConfig {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            default_slot_queue: SlotQueueConfig::default(),
            provider_overrides: HashMap::new(),
            dispatcher: DispatcherConfig::default(),
        }
    }
}

impl EvalCoreConfig {
    /// The `SlotQueueConfig` to construct a provider's queue with: its
    /// override if one is registered, otherwise the shared default.
    pub fn slot_queue_for(&self, provider_id: &str) -> SlotQueueConfig {
        self.provider_overrides
            .get(provider_id)
            .copied()
            .unwrap_or(self.default_slot_queue)
    }

    /// A permissive profile for local/dev runs against providers with
    /// generous rate limits: high concurrency, no queue timeout.
    pub fn permissive() -> Self {
        Self {
            default_slot_queue: SlotQueueConfig {
                max_concurrency: 20,
                min_concurrency: 1,
                queue_timeout_ms: 0,
            },
            ..Default::default()
        }
    }

    /// A conservative profile for providers with tight quotas: low
    /// concurrency and a short queue timeout so a stuck provider doesn't
    /// stall an entire eval run indefinitely.
    pub fn conservative() -> Self {
        Self {
            default_slot_queue: SlotQueueConfig {
                max_concurrency: 2,
                min_concurrency: 1,
                queue_timeout_ms: 30_000,
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_override_wins_over_default() {
        let mut config = EvalCoreConfig::default();
        config.provider_overrides.insert(
            "anthropic".to_string(),
            SlotQueueConfig {
                max_concurrency: 10,
                min_concurrency: 1,
                queue_timeout_ms: 0,
            },
        );
        assert_eq!(config.slot_queue_for("anthropic").max_concurrency, 10);
        assert_eq!(
            config.slot_queue_for("openai").max_concurrency,
            config.default_slot_queue.max_concurrency
        );
    }

    #[test]
    fn fail_fast_sets_short_circuit() {
        assert!(DispatcherConfig::fail_fast().short_circuit_on_failure);
        assert!(!DispatcherConfig::continue_on_failure().short_circuit_on_failure);
    }
}
