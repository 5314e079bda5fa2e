//! evalcore — evaluation dispatch pipeline for an LLM eval harness.
//!
//! This crate is the hard center of an LLM evaluation harness: the
//! per-provider rate-limited slot queue, the retry policy, the provider
//! wrapper that feeds rate-limit signal back into the queue, and the
//! assertion aggregation/validation/dispatch engine that turns a tree of
//! assertion primitives into a single test verdict.
//!
//! What this crate deliberately does *not* do: parse CLI flags, load or
//! parse config files, render prompts, implement individual assertion
//! types (equals, contains, model-graded rubrics, ...), talk HTTP to any
//! specific provider, or render reports. Those are callers' jobs; this
//! crate exposes the traits and types they plug into.
//!
//! # Modules
//!
//! - [`retry`]: `RetryPolicy` — classify errors, compute backoff with jitter.
//! - [`headers`]: normalize provider response headers into a
//!   [`rate_limit::RateLimitSnapshot`].
//! - [`rate_limit`]: the `SlotQueue` admission controller and the
//!   `RateLimitRegistry` that owns one queue per provider.
//! - [`provider`]: the `Provider` trait and its rate-limit-aware wrapper.
//! - [`assertion`]: the assertion data model, accumulator, validator, and
//!   dispatcher.
//! - [`config`]: ambient `serde`-derived config structs a caller's config
//!   loader fills in.
//! - [`error`]: the per-subsystem error taxonomy.

#![allow(dead_code)]
#![allow(clippy::uninlined_format_args)]

pub mod assertion;
pub mod config;
pub mod error;
pub mod headers;
pub mod provider;
pub mod rate_limit;
pub mod retry;

pub use assertion::{
    parse_assertions, validate_config, validate_config_json, AssertionAccumulator,
    AssertionDispatcher, AssertionHandlerRegistry, DispatchContext, GradingResult,
    TestCaseOutcome, TokenUsage, DEFAULT_TOKENS_USED, GUARDRAIL_BLOCKED_REASON,
};
pub use config::{DispatcherConfig, EvalCoreConfig};
pub use error::{AssertValidationError, ClassifiedError, DispatchError, SlotQueueError};
pub use headers::{parse_rate_limit_headers, parse_retry_after};
pub use provider::{Provider, WrappedProvider};
pub use rate_limit::{ProviderId, RateLimitRegistry, RateLimitSnapshot, SlotQueue, SlotQueueConfig};
pub use retry::RetryPolicy;
