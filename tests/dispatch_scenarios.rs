//! Black-box coverage of the eval-dispatch pipeline's testable properties,
//! exercised through `evalcore`'s public surface rather than its internal
//! `#[cfg(test)]` modules.

use async_trait::async_trait;
use evalcore::assertion::{
    Assertion, AssertSetAssertion, CombinatorAssertion, CombinatorKind, PrimitiveAssertion,
    ScenarioAsserts, TestCaseAsserts,
};
use evalcore::{
    parse_assertions, validate_config, AssertionDispatcher, AssertionHandlerRegistry,
    DispatchContext, GradingResult, RateLimitSnapshot, RetryPolicy, SlotQueue, SlotQueueConfig,
    TokenUsage,
};
use std::sync::Arc;
use std::time::Duration;

/// Installs a `tracing` subscriber so the slot-queue admission/promotion
/// spans surface when these tests run with `RUST_LOG` set, mirroring the
/// teacher's `main.rs` subscriber wiring. Idempotent — safe to call from
/// every test since the crate never installs one itself (`SPEC_FULL.md`
/// A2: library crates don't install a global subscriber).
fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

struct EqualsHandler;

#[async_trait]
impl AssertionHandlerRegistry for EqualsHandler {
    async fn handle(
        &self,
        assertion: &PrimitiveAssertion,
        context: &DispatchContext,
    ) -> Result<GradingResult, evalcore::error::DispatchError> {
        let expected = assertion
            .value
            .as_ref()
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let actual = context.output.as_str().unwrap_or_default();
        let pass = expected == actual || actual.contains(expected);
        Ok(GradingResult {
            pass,
            score: if pass { 1.0 } else { 0.0 },
            reason: if pass {
                "matched".to_string()
            } else {
                "did not match".to_string()
            },
            assertion: None,
            tokens_used: TokenUsage::default(),
            component_results: None,
            metadata: None,
        })
    }
}

fn primitive(assertion_type: &str, value: &str, weight: Option<f64>) -> Assertion {
    Assertion::Primitive(PrimitiveAssertion {
        assertion_type: assertion_type.to_string(),
        value: Some(serde_json::json!(value)),
        threshold: None,
        weight,
        metric: None,
        transform: None,
        config: None,
    })
}

fn ctx(output: &str) -> DispatchContext {
    DispatchContext {
        output: serde_json::json!(output),
        vars: Default::default(),
    }
}

/// S1 — concurrency bound: `maxConcurrency=5, minConcurrency=1`, 100
/// `acquire` calls land 5 active / 95 queued, and a single `release`
/// admits exactly one more waiter.
#[tokio::test]
async fn scenario_s1_concurrency_bound() {
    init_tracing();
    let queue = SlotQueue::new(SlotQueueConfig {
        max_concurrency: 5,
        min_concurrency: 1,
        queue_timeout_ms: 0,
    });

    let mut handles = Vec::new();
    for i in 0..100 {
        let q = Arc::clone(&queue);
        handles.push(tokio::spawn(async move {
            q.acquire(&format!("t{i}")).await
        }));
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(queue.active_count().await, 5);
    assert_eq!(queue.queue_depth().await, 95);

    queue.release().await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(queue.active_count().await, 5);
    assert_eq!(queue.queue_depth().await, 94);

    queue.dispose().await;
    for h in handles {
        let _ = h.await;
    }
}

/// S2 — backoff with a server hint: the server's `retry-after` wins
/// outright, capped at `maxDelayMs`.
#[test]
fn scenario_s2_backoff_with_server_hint() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.retry_delay(1, Some(5_000)).as_millis(), 5_000);
    assert_eq!(policy.retry_delay(1, Some(120_000)).as_millis(), 60_000);
}

/// S3/S4 — aggregate weighted threshold, below and above.
#[tokio::test]
async fn scenario_s3_s4_aggregate_threshold() {
    let handlers = EqualsHandler;
    let dispatcher = AssertionDispatcher::new(&handlers, false);
    let assertions = vec![
        primitive("equals", "Hello world", Some(2.0)),
        primitive("contains", "world", Some(1.0)),
    ];

    let below = dispatcher
        .run_test(&assertions, Some(0.5), &ctx("Hi there world"), None)
        .await;
    assert!(!below.pass);

    let above = dispatcher
        .run_test(&assertions, Some(0.25), &ctx("Hi there world"), None)
        .await;
    assert!(above.pass);
}

/// S5 — an assert-set's own aggregate fails its threshold, but the score
/// it contributes to a named metric clamps at the threshold rather than
/// the raw aggregate.
#[tokio::test]
async fn scenario_s5_assert_set_named_metric_clamps_to_threshold() {
    let handlers = EqualsHandler;
    let dispatcher = AssertionDispatcher::new(&handlers, false);
    let set = Assertion::AssertSet(AssertSetAssertion {
        assert: vec![
            primitive("equals", "Hello world", Some(2.0)),
            primitive("contains", "Expected", Some(1.0)),
        ],
        threshold: Some(0.5),
        weight: Some(1.0),
        metric: Some("The best metric".to_string()),
    });

    let verdict = dispatcher
        .run_test(&[set], None, &ctx("Expected output"), None)
        .await;
    assert!(verdict.pass);
}

/// S6 — a guardrails assertion that blocks the output is itself a
/// successful red-team result, not a test failure.
#[tokio::test]
async fn scenario_s6_guardrail_block_counts_as_pass() {
    struct GuardrailHandler;
    #[async_trait]
    impl AssertionHandlerRegistry for GuardrailHandler {
        async fn handle(
            &self,
            _assertion: &PrimitiveAssertion,
            _context: &DispatchContext,
        ) -> Result<GradingResult, evalcore::error::DispatchError> {
            Ok(GradingResult {
                pass: false,
                score: 0.0,
                reason: "Failed safety check".to_string(),
                assertion: None,
                tokens_used: TokenUsage::default(),
                component_results: None,
                metadata: None,
            })
        }
    }

    let assertion = Assertion::Primitive(PrimitiveAssertion {
        assertion_type: "guardrails".to_string(),
        value: None,
        threshold: None,
        weight: None,
        metric: None,
        transform: None,
        config: Some(serde_json::json!({"purpose": "redteam"}).as_object().unwrap().clone()),
    });

    let handlers = GuardrailHandler;
    let dispatcher = AssertionDispatcher::new(&handlers, false);
    let verdict = dispatcher
        .run_test(&[assertion], None, &ctx("anything"), None)
        .await;
    assert!(verdict.pass);
    assert_eq!(verdict.reason, evalcore::GUARDRAIL_BLOCKED_REASON);
}

/// S7 — a quota-exhausted queue admits a waiter once its `resetAt`
/// deadline passes, and clears `resetAt` on admission.
#[tokio::test]
async fn scenario_s7_rate_limit_reset_admits_after_deadline() {
    let queue = SlotQueue::new(SlotQueueConfig {
        max_concurrency: 1,
        min_concurrency: 1,
        queue_timeout_ms: 0,
    });
    queue
        .update_rate_limit_state(RateLimitSnapshot {
            remaining_requests: Some(0),
            limit_requests: Some(10),
            reset_at: Some(chrono::Utc::now() + chrono::Duration::milliseconds(60)),
            ..Default::default()
        })
        .await;

    let q2 = Arc::clone(&queue);
    let waiting = tokio::spawn(async move { q2.acquire("t1").await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(queue.queue_depth().await, 1);
    assert_eq!(queue.active_count().await, 0);

    waiting.await.unwrap().unwrap();
    assert_eq!(queue.active_count().await, 1);
    assert_eq!(queue.queue_depth().await, 0);
    assert!(queue.snapshot().await.reset_at.is_none());
}

/// S8 — `[{type:"equals"}, {value:"x"}]`: the second assertion is missing
/// `type`, so the raw-JSON shape guard rejects it before typed
/// deserialization, reporting the JSON-path location and the received
/// value `"x"`.
#[test]
fn scenario_s8_validator_reports_json_path() {
    let good = serde_json::json!([{ "type": "equals", "value": "x" }]);
    assert!(parse_assertions(&good, "tests[0].assert", &[]).is_ok());

    let bad = serde_json::json!([{ "type": "equals" }, { "value": "x" }]);
    let err = parse_assertions(&bad, "tests[0].assert", &[]).unwrap_err();
    assert_eq!(err.path, "tests[0].assert[1]");
    assert_eq!(err.received.get("value").and_then(|v| v.as_str()), Some("x"));
}

/// A `defaultTest`/`scenarios` validation failure reports the matching
/// path prefix rather than always blaming `tests[...]`.
#[test]
fn validate_config_paths_cover_default_test_and_scenarios() {
    let empty_combinator = Assertion::Combinator(CombinatorAssertion {
        kind: CombinatorKind::Or,
        assert: vec![],
    });

    let default_test = TestCaseAsserts {
        assert: vec![empty_combinator.clone()],
    };
    let err = validate_config(&[], Some(&default_test), &[], &[]).unwrap_err();
    assert_eq!(err.path, "defaultTest.assert[0]");

    let scenario = ScenarioAsserts {
        config: vec![TestCaseAsserts {
            assert: vec![empty_combinator],
        }],
        tests: vec![],
    };
    let err = validate_config(&[], None, &[scenario], &[]).unwrap_err();
    assert_eq!(err.path, "scenarios[0].config[0].assert[0]");
}
