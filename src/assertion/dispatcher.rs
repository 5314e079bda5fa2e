//! AssertionDispatcher (C8) — `spec.md` §4.8: walk a test's assertion
//! list, routing primitives to external handlers and folding everything
//! into a single [`GradingResult`] via the accumulator.

use super::accumulator::{AddResultArgs, AssertionAccumulator, ScoringFn};
use super::{Assertion, AssertionRef, CombinatorKind, GradingResult, TokenUsage, DEFAULT_TOKENS_USED};
use crate::error::DispatchError;
use crate::rate_limit::ProviderId;
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use uuid::Uuid;

/// Whatever a test needs to run its assertions against — the rendered
/// prompt output and the variables it was rendered with. Prompt rendering
/// itself is out of scope; this crate only consumes the result.
#[derive(Debug, Clone, Default)]
pub struct DispatchContext {
    pub output: serde_json::Value,
    pub vars: serde_json::Map<String, serde_json::Value>,
}

/// Supplemental reporting type (`SPEC_FULL.md` §3): bundles a test's final
/// [`GradingResult`] with the provider it ran against and how long the
/// whole test took, so a caller's report/UI layer (out of scope here) has
/// something to collect `run_test` outputs into. `run_test` itself still
/// returns a bare `GradingResult` — wrapping every call site in an
/// outcome would only be useful once a caller actually has a provider id
/// and a clock to attach, so construction is left to the caller via
/// [`TestCaseOutcome::record`].
#[derive(Debug, Clone)]
pub struct TestCaseOutcome {
    pub id: Uuid,
    pub provider: ProviderId,
    pub result: GradingResult,
    pub duration: Duration,
}

impl TestCaseOutcome {
    pub fn record(provider: ProviderId, duration: Duration, result: GradingResult) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider,
            result,
            duration,
        }
    }
}

/// The external assertion-type catalog (equals, contains, model-graded
/// rubric, guardrails, ...). Individual handlers are out of scope; this
/// crate only defines the seam they plug into.
#[async_trait]
pub trait AssertionHandlerRegistry: Send + Sync {
    async fn handle(
        &self,
        assertion: &super::PrimitiveAssertion,
        context: &DispatchContext,
    ) -> Result<GradingResult, DispatchError>;
}

fn is_guardrail_redteam(p: &super::PrimitiveAssertion) -> bool {
    p.assertion_type == "guardrails"
        && p.config
            .as_ref()
            .and_then(|c| c.get("purpose"))
            .and_then(|v| v.as_str())
            == Some("redteam")
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub struct AssertionDispatcher<'a> {
    handlers: &'a dyn AssertionHandlerRegistry,
    short_circuit: bool,
}

impl<'a> AssertionDispatcher<'a> {
    pub fn new(handlers: &'a dyn AssertionHandlerRegistry, short_circuit: bool) -> Self {
        Self {
            handlers,
            short_circuit,
        }
    }

    /// Runs a whole test's assertion list and returns its final verdict.
    pub async fn run_test(
        &self,
        assertions: &[Assertion],
        threshold: Option<f64>,
        context: &DispatchContext,
        scoring_fn: Option<&ScoringFn>,
    ) -> GradingResult {
        let span = tracing::debug_span!("dispatcher.run_test", assertions = assertions.len());
        let _enter = span.enter();

        if assertions.is_empty() {
            return AssertionAccumulator::no_asserts_result();
        }

        let mut acc = AssertionAccumulator::new(self.short_circuit, None);
        match self.dispatch_into(assertions, &mut acc, context).await {
            Ok(()) => {
                let verdict = acc.test_result(threshold, scoring_fn);
                tracing::debug!(pass = verdict.pass, score = verdict.score, "test dispatched");
                verdict
            }
            Err(DispatchError::Aborted(reason)) => {
                tracing::info!(reason = %reason, "test short-circuited on first failure");
                GradingResult {
                    pass: false,
                    score: 0.0,
                    reason,
                    assertion: None,
                    tokens_used: acc.tokens_used(),
                    component_results: Some(acc.flatten_hierarchy()),
                    metadata: None,
                }
            }
            Err(other) => GradingResult {
                pass: false,
                score: 0.0,
                reason: other.to_string(),
                assertion: None,
                tokens_used: acc.tokens_used(),
                component_results: Some(acc.flatten_hierarchy()),
                metadata: None,
            },
        }
    }

    fn dispatch_into<'b>(
        &'b self,
        assertions: &'b [Assertion],
        acc: &'b mut AssertionAccumulator,
        context: &'b DispatchContext,
    ) -> BoxFuture<'b, Result<(), DispatchError>> {
        Box::pin(async move {
            for (index, assertion) in assertions.iter().enumerate() {
                self.dispatch_one(index, assertion, acc, context).await?;
            }
            Ok(())
        })
    }

    fn dispatch_one<'b>(
        &'b self,
        index: usize,
        assertion: &'b Assertion,
        acc: &'b mut AssertionAccumulator,
        context: &'b DispatchContext,
    ) -> BoxFuture<'b, Result<(), DispatchError>> {
        Box::pin(async move {
            match assertion {
                Assertion::Primitive(p) => {
                    let result = match self.handlers.handle(p, context).await {
                        Ok(r) => r,
                        Err(e) => GradingResult {
                            pass: false,
                            score: 0.0,
                            reason: e.to_string(),
                            assertion: Some(AssertionRef {
                                index,
                                assertion_type: p.assertion_type.clone(),
                            }),
                            tokens_used: DEFAULT_TOKENS_USED,
                            component_results: None,
                            metadata: None,
                        },
                    };
                    let guardrail = is_guardrail_redteam(p) && !result.pass;
                    acc.add_result(AddResultArgs {
                        index,
                        result,
                        metric: p.metric.clone(),
                        weight: p.weight,
                        threshold: p.threshold,
                        is_guardrail_redteam_failure: guardrail,
                    })
                }

                Assertion::AssertSet(set) => {
                    let mut child = AssertionAccumulator::new(self.short_circuit, set.metric.clone());
                    self.dispatch_into(&set.assert, &mut child, context).await?;
                    let child_result = child.test_result(set.threshold, None);
                    acc.add_result(AddResultArgs {
                        index,
                        result: child_result,
                        metric: set.metric.clone(),
                        weight: set.weight,
                        threshold: set.threshold,
                        is_guardrail_redteam_failure: false,
                    })
                }

                Assertion::Combinator(combinator) => {
                    let result = self
                        .dispatch_combinator(combinator.kind, &combinator.assert, context)
                        .await?;
                    acc.add_result(AddResultArgs {
                        index,
                        result,
                        metric: None,
                        weight: Some(1.0),
                        threshold: None,
                        is_guardrail_redteam_failure: false,
                    })
                }

                // select-best / max-score run at the test-case level via a
                // separate comparison path; the validator guarantees this
                // dispatcher never sees one reachable from a test's own
                // assert list, so reaching here is a validation escape.
                Assertion::Special(s) => Err(DispatchError::HandlerFailed(format!(
                    "'{}' is not dispatchable — it must be run through the test-case comparison path",
                    s.assertion_type
                ))),
            }
        })
    }

    /// `and` passes iff every child passes (score = min); `or` passes iff
    /// any child passes (score = max). Combinators don't weight-aggregate
    /// into the parent; they contribute one primitive-equivalent result.
    async fn dispatch_combinator(
        &self,
        kind: CombinatorKind,
        children: &[Assertion],
        context: &DispatchContext,
    ) -> Result<GradingResult, DispatchError> {
        let mut child_results = Vec::with_capacity(children.len());
        for (i, child) in children.iter().enumerate() {
            let mut scratch = AssertionAccumulator::new(false, None);
            self.dispatch_one(i, child, &mut scratch, context).await?;
            child_results.push(scratch.test_result(None, None));
        }

        let (pass, score) = match kind {
            CombinatorKind::And => (
                child_results.iter().all(|r| r.pass),
                child_results
                    .iter()
                    .map(|r| r.score)
                    .fold(f64::INFINITY, f64::min),
            ),
            CombinatorKind::Or => (
                child_results.iter().any(|r| r.pass),
                child_results
                    .iter()
                    .map(|r| r.score)
                    .fold(f64::NEG_INFINITY, f64::max),
            ),
        };

        let reason = format!(
            "'{}' combinator {}",
            kind.as_str(),
            if pass { "passed" } else { "failed" }
        );
        let tokens_used = child_results
            .iter()
            .fold(TokenUsage::default(), |sum, r| sum + r.tokens_used);

        Ok(GradingResult {
            pass,
            score,
            reason,
            assertion: None,
            tokens_used,
            component_results: Some(child_results),
            metadata: None,
        })
    }
}
