//! Assertion data model: the tagged tree (`spec.md` §3), its per-result
//! shape, and the well-known constants the accumulator/dispatcher share.

mod accumulator;
mod dispatcher;
mod validator;

pub use accumulator::{AddResultArgs, AssertionAccumulator, ScoringContext, ScoringFn};
pub use dispatcher::{AssertionDispatcher, AssertionHandlerRegistry, DispatchContext, TestCaseOutcome};
pub use validator::{
    guard_assertion_shape, guard_json_is_array, parse_assertions, validate_assertions,
    validate_config, validate_config_json, ScenarioAsserts, ScenarioAssertsJson, TestCaseAsserts,
    TestCaseAssertsJson,
};

use serde::de::Error as DeError;
use serde::ser::Error as SerError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::ops::Add;

pub const GUARDRAIL_BLOCKED_REASON: &str =
    "The output was blocked by a guardrail, which is a successful result for this red-team test";
pub const POLICY_METRIC_PREFIX: &str = "PolicyViolation";
pub const MAX_NESTING_DEPTH: u32 = 10;

/// `spec.md` §3 `TokenUsage` — all non-negative, aggregated by summation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub total: u64,
    pub prompt: u64,
    pub completion: u64,
    pub cached: u64,
    pub num_requests: u64,
}

pub const DEFAULT_TOKENS_USED: TokenUsage = TokenUsage {
    total: 0,
    prompt: 0,
    completion: 0,
    cached: 0,
    num_requests: 0,
};

impl Add for TokenUsage {
    type Output = TokenUsage;
    fn add(self, rhs: TokenUsage) -> TokenUsage {
        TokenUsage {
            total: self.total + rhs.total,
            prompt: self.prompt + rhs.prompt,
            completion: self.completion + rhs.completion,
            cached: self.cached + rhs.cached,
            num_requests: self.num_requests + rhs.num_requests,
        }
    }
}

/// A pointer from a [`GradingResult`] back to the assertion that produced
/// it — `spec.md` §3's `assertion: AssertionRef|null`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionRef {
    pub index: usize,
    pub assertion_type: String,
}

/// Per-assertion outcome, per `spec.md` §3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradingResult {
    pub pass: bool,
    /// Always in `[0, 1]`.
    pub score: f64,
    pub reason: String,
    pub assertion: Option<AssertionRef>,
    pub tokens_used: TokenUsage,
    pub component_results: Option<Vec<GradingResult>>,
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

impl GradingResult {
    pub fn no_asserts() -> Self {
        Self {
            pass: true,
            score: 1.0,
            reason: "No assertions".to_string(),
            assertion: None,
            tokens_used: DEFAULT_TOKENS_USED,
            component_results: None,
            metadata: None,
        }
    }
}

/// `and` / `or` from `spec.md` §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CombinatorKind {
    And,
    Or,
}

impl CombinatorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CombinatorKind::And => "and",
            CombinatorKind::Or => "or",
        }
    }
}

/// A leaf node with an externally-registered handler (equals, contains,
/// model-graded rubric, etc. — implementations out of scope here).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimitiveAssertion {
    #[serde(rename = "type")]
    pub assertion_type: String,
    pub value: Option<serde_json::Value>,
    pub threshold: Option<f64>,
    pub weight: Option<f64>,
    pub metric: Option<String>,
    pub transform: Option<String>,
    pub config: Option<serde_json::Map<String, serde_json::Value>>,
}

/// A grouping node that aggregates its children as a sub-test before
/// contributing a single rolled-up result to its parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertSetAssertion {
    pub assert: Vec<Assertion>,
    pub threshold: Option<f64>,
    pub weight: Option<f64>,
    pub metric: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinatorAssertion {
    pub kind: CombinatorKind,
    pub assert: Vec<Assertion>,
}

/// `select-best` / `max-score` — resolved at the test-case level across
/// multiple outputs via a separate comparison path (out of scope here);
/// the validator guarantees these never reach the recursive dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecialAssertion {
    #[serde(rename = "type")]
    pub assertion_type: String,
}

pub const SELECT_BEST: &str = "select-best";
pub const MAX_SCORE: &str = "max-score";

/// `spec.md` §3's four assertion shapes, wire-distinguished not by an
/// internal tag field but by the *value* of `type`: `"assert-set"` picks
/// `AssertSet`, `"and"`/`"or"` pick `Combinator`, `"select-best"`/
/// `"max-score"`/`"human"` pick `Special`, anything else is a `Primitive`
/// whose `type` names an externally-registered handler. `serde`'s
/// built-in internally-tagged-enum representation (`#[serde(tag = "…")]`)
/// can't express this — it needs a field whose value literally is the
/// variant name — so `Deserialize`/`Serialize` are hand-written below.
#[derive(Debug, Clone, PartialEq)]
pub enum Assertion {
    Primitive(PrimitiveAssertion),
    AssertSet(AssertSetAssertion),
    Combinator(CombinatorAssertion),
    Special(SpecialAssertion),
}

impl Assertion {
    pub fn assertion_type(&self) -> &str {
        match self {
            Assertion::Primitive(p) => &p.assertion_type,
            Assertion::AssertSet(_) => "assert-set",
            Assertion::Combinator(c) => c.kind.as_str(),
            Assertion::Special(s) => &s.assertion_type,
        }
    }

    fn from_json_value(value: serde_json::Value) -> Result<Self, String> {
        let type_str = value
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "assertion must have a string 'type' field".to_string())?
            .to_string();

        match type_str.as_str() {
            "assert-set" => serde_json::from_value(value)
                .map(Assertion::AssertSet)
                .map_err(|e| e.to_string()),
            "and" => Ok(Assertion::Combinator(CombinatorAssertion {
                kind: CombinatorKind::And,
                assert: deserialize_children(&value)?,
            })),
            "or" => Ok(Assertion::Combinator(CombinatorAssertion {
                kind: CombinatorKind::Or,
                assert: deserialize_children(&value)?,
            })),
            SELECT_BEST | MAX_SCORE | "human" => {
                Ok(Assertion::Special(SpecialAssertion { assertion_type: type_str }))
            }
            _ => serde_json::from_value(value)
                .map(Assertion::Primitive)
                .map_err(|e| e.to_string()),
        }
    }
}

fn deserialize_children(value: &serde_json::Value) -> Result<Vec<Assertion>, String> {
    let children = value
        .get("assert")
        .cloned()
        .unwrap_or_else(|| serde_json::Value::Array(Vec::new()));
    serde_json::from_value(children).map_err(|e| e.to_string())
}

impl<'de> Deserialize<'de> for Assertion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        Assertion::from_json_value(value).map_err(D::Error::custom)
    }
}

impl Serialize for Assertion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Assertion::Primitive(p) => p.serialize(serializer),
            Assertion::Special(s) => s.serialize(serializer),
            Assertion::AssertSet(set) => {
                let mut value = serde_json::to_value(set).map_err(S::Error::custom)?;
                if let serde_json::Value::Object(map) = &mut value {
                    map.insert(
                        "type".to_string(),
                        serde_json::Value::String("assert-set".to_string()),
                    );
                }
                value.serialize(serializer)
            }
            Assertion::Combinator(c) => {
                let assert = serde_json::to_value(&c.assert).map_err(S::Error::custom)?;
                let mut map = serde_json::Map::new();
                map.insert(
                    "type".to_string(),
                    serde_json::Value::String(c.kind.as_str().to_string()),
                );
                map.insert("assert".to_string(), assert);
                serde_json::Value::Object(map).serialize(serializer)
            }
        }
    }
}
