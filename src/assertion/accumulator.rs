//! AssertionResult accumulator (C6) — `spec.md` §4.6.

use super::{GradingResult, TokenUsage, DEFAULT_TOKENS_USED, GUARDRAIL_BLOCKED_REASON};
use crate::error::DispatchError;
use std::collections::HashMap;

/// Arguments to [`AssertionAccumulator::add_result`]. Bundled into a struct
/// rather than positional params since most fields are optional and this
/// mirrors the spec's `{ index, result, metric?, weight? }` call shape.
pub struct AddResultArgs {
    pub index: usize,
    pub result: GradingResult,
    pub metric: Option<String>,
    pub weight: Option<f64>,
    /// The assertion's own threshold, if any. Used both to floor a
    /// named-metric score at the threshold (`spec.md` §8 scenario S5) and,
    /// if this result turns out to be an assert-set parent, recorded as
    /// `metadata.assertSetThreshold` when the hierarchy is flattened.
    pub threshold: Option<f64>,
    /// True when this result came from a `guardrails` assertion whose
    /// `config.purpose == "redteam"` and which failed — the caller (the
    /// dispatcher, which has the assertion's config) determines this since
    /// `GradingResult` itself carries no assertion config.
    pub is_guardrail_redteam_failure: bool,
}

struct Entry {
    result: GradingResult,
    weight: f64,
    threshold: Option<f64>,
}

pub struct ScoringContext<'a> {
    pub threshold: Option<f64>,
    pub parent_assertion_set: Option<&'a str>,
    pub component_results: &'a [GradingResult],
    pub tokens_used: TokenUsage,
}

pub type ScoringFn = dyn Fn(&HashMap<String, f64>, &ScoringContext) -> Result<GradingResult, String>
    + Send
    + Sync;

/// Per-test (or per-assert-set-child) running aggregate. One accumulator
/// per test; assert-set nodes get their own child accumulator whose
/// `test_result()` becomes a single entry in the parent's.
pub struct AssertionAccumulator {
    total_score: f64,
    total_weight: f64,
    named_scores: HashMap<String, f64>,
    entries: Vec<Entry>,
    tokens_used: TokenUsage,
    failed_reason: Option<String>,
    guardrail_override: bool,
    short_circuit: bool,
    parent_assertion_set: Option<String>,
}

impl AssertionAccumulator {
    pub fn new(short_circuit: bool, parent_assertion_set: Option<String>) -> Self {
        Self {
            total_score: 0.0,
            total_weight: 0.0,
            named_scores: HashMap::new(),
            entries: Vec::new(),
            tokens_used: DEFAULT_TOKENS_USED,
            failed_reason: None,
            guardrail_override: false,
            short_circuit,
            parent_assertion_set,
        }
    }

    pub fn no_asserts_result() -> GradingResult {
        GradingResult::no_asserts()
    }

    pub fn tokens_used(&self) -> TokenUsage {
        self.tokens_used
    }

    /// Returns `Err(DispatchError::Aborted)` only when the accumulator was
    /// constructed with `short_circuit = true` and this result failed —
    /// the caller treats that as an aborted test rather than a handler bug.
    pub fn add_result(&mut self, args: AddResultArgs) -> Result<(), DispatchError> {
        let weight = args.weight.unwrap_or(1.0);
        self.total_score += args.result.score * weight;
        self.total_weight += weight;
        self.tokens_used = self.tokens_used + args.result.tokens_used;

        if let Some(metric) = &args.metric {
            let recorded = match args.threshold {
                Some(threshold) => args.result.score.max(threshold),
                None => args.result.score,
            };
            self.named_scores
                .entry(metric.clone())
                .and_modify(|existing| {
                    if recorded > *existing {
                        *existing = recorded;
                    }
                })
                .or_insert(recorded);
        }

        if args.is_guardrail_redteam_failure && !args.result.pass {
            self.guardrail_override = true;
        }

        if !args.result.pass && self.failed_reason.is_none() {
            self.failed_reason = Some(args.result.reason.clone());
        }

        let short_circuit_abort = self.short_circuit && !args.result.pass;
        let abort_reason = args.result.reason.clone();

        self.entries.push(Entry {
            result: args.result,
            weight,
            threshold: args.threshold,
        });

        if short_circuit_abort {
            return Err(DispatchError::Aborted(abort_reason));
        }
        Ok(())
    }

    /// `testResult(scoringFn?)` from `spec.md` §4.6.
    pub fn test_result(&self, threshold: Option<f64>, scoring_fn: Option<&ScoringFn>) -> GradingResult {
        if self.entries.is_empty() {
            return GradingResult::no_asserts();
        }

        if let Some(scoring_fn) = scoring_fn {
            let flattened = self.flatten_hierarchy();
            let ctx = ScoringContext {
                threshold,
                parent_assertion_set: self.parent_assertion_set.as_deref(),
                component_results: &flattened,
                tokens_used: self.tokens_used,
            };
            return match scoring_fn(&self.named_scores, &ctx) {
                Ok(result) => result,
                Err(msg) => GradingResult {
                    pass: false,
                    score: 0.0,
                    reason: format!("Scoring function error: {msg}"),
                    assertion: None,
                    tokens_used: self.tokens_used,
                    component_results: None,
                    metadata: None,
                },
            };
        }

        let aggregate = if self.total_weight > 0.0 {
            self.total_score / self.total_weight
        } else {
            1.0
        };

        let (mut pass, mut reason) = match threshold {
            Some(t) => {
                if aggregate >= t {
                    (true, format!("Aggregate score {aggregate:.2} \u{2265} {t} threshold"))
                } else {
                    (false, format!("Aggregate score {aggregate:.2} < {t} threshold"))
                }
            }
            None => match &self.failed_reason {
                None => (true, "All assertions passed".to_string()),
                Some(reason) => (false, reason.clone()),
            },
        };

        if self.guardrail_override {
            pass = true;
            reason = GUARDRAIL_BLOCKED_REASON.to_string();
        }

        GradingResult {
            pass,
            score: aggregate,
            reason,
            assertion: None,
            tokens_used: self.tokens_used,
            component_results: Some(self.flatten_hierarchy()),
            metadata: None,
        }
    }

    /// Flattens nested assert-set results into one ordered list, annotating
    /// parent/child metadata per `spec.md` §4.6's "Hierarchy metadata".
    pub fn flatten_hierarchy(&self) -> Vec<GradingResult> {
        let mut flat = Vec::new();
        for entry in &self.entries {
            let mut result = entry.result.clone();
            let mut metadata = result.metadata.clone().unwrap_or_default();

            if let Some(children) = result.component_results.take() {
                metadata.insert("isAssertSet".to_string(), serde_json::Value::Bool(true));
                metadata.insert(
                    "childCount".to_string(),
                    serde_json::json!(children.len()),
                );
                if let Some(t) = entry.threshold {
                    metadata.insert("assertSetThreshold".to_string(), serde_json::json!(t));
                }
                metadata.insert("assertSetWeight".to_string(), serde_json::json!(entry.weight));
                result.metadata = Some(metadata);
                flat.push(result);

                let parent_index = flat.len() - 1;
                for child in children {
                    let mut child = child;
                    let mut child_meta = child.metadata.clone().unwrap_or_default();
                    child_meta.insert(
                        "parentAssertSetIndex".to_string(),
                        serde_json::json!(parent_index),
                    );
                    child.metadata = Some(child_meta);
                    flat.push(child);
                }
            } else {
                metadata.insert("assertSetWeight".to_string(), serde_json::json!(entry.weight));
                result.metadata = Some(metadata);
                flat.push(result);
            }
        }
        flat
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assertion::AssertionRef;

    fn result(pass: bool, score: f64, reason: &str) -> GradingResult {
        GradingResult {
            pass,
            score,
            reason: reason.to_string(),
            assertion: Some(AssertionRef {
                index: 0,
                assertion_type: "equals".to_string(),
            }),
            tokens_used: DEFAULT_TOKENS_USED,
            component_results: None,
            metadata: None,
        }
    }

    fn add(acc: &mut AssertionAccumulator, index: usize, r: GradingResult, weight: Option<f64>) {
        acc.add_result(AddResultArgs {
            index,
            result: r,
            metric: None,
            weight,
            threshold: None,
            is_guardrail_redteam_failure: false,
        })
        .unwrap();
    }

    /// S3 / S4 — aggregate threshold pass/fail.
    #[test]
    fn aggregate_threshold_scenario_s3_s4() {
        let mut acc = AssertionAccumulator::new(false, None);
        add(&mut acc, 0, result(false, 0.0, "not equal"), Some(2.0));
        add(&mut acc, 1, result(true, 1.0, "contains"), Some(1.0));

        let below = acc.test_result(Some(0.5), None);
        assert!(!below.pass);
        assert!(below.reason.contains("< 0.5"));

        let above = acc.test_result(Some(0.25), None);
        assert!(above.pass);
        assert!(above.reason.contains("\u{2265} 0.25"));
    }

    #[test]
    fn no_threshold_uses_first_failure_reason() {
        let mut acc = AssertionAccumulator::new(false, None);
        add(&mut acc, 0, result(true, 1.0, "ok"), None);
        add(&mut acc, 1, result(false, 0.0, "broke"), None);
        add(&mut acc, 2, result(false, 0.0, "also broke"), None);

        let verdict = acc.test_result(None, None);
        assert!(!verdict.pass);
        assert_eq!(verdict.reason, "broke");
    }

    #[test]
    fn all_pass_without_threshold() {
        let mut acc = AssertionAccumulator::new(false, None);
        add(&mut acc, 0, result(true, 1.0, "ok"), None);
        let verdict = acc.test_result(None, None);
        assert!(verdict.pass);
        assert_eq!(verdict.reason, "All assertions passed");
    }

    /// S5 — assert-set named metric clamps to its own threshold.
    #[test]
    fn named_metric_clamps_to_threshold_scenario_s5() {
        let mut acc = AssertionAccumulator::new(false, None);
        acc.add_result(AddResultArgs {
            index: 0,
            result: result(false, 1.0 / 3.0, "child failed"),
            metric: Some("The best metric".to_string()),
            weight: Some(1.0),
            threshold: Some(0.5),
            is_guardrail_redteam_failure: false,
        })
        .unwrap();

        assert_eq!(acc.named_scores.get("The best metric"), Some(&0.5));
    }

    #[test]
    fn named_metric_rolls_up_by_max_without_threshold() {
        let mut acc = AssertionAccumulator::new(false, None);
        acc.add_result(AddResultArgs {
            index: 0,
            result: result(true, 0.4, "a"),
            metric: Some("m".to_string()),
            weight: Some(1.0),
            threshold: None,
            is_guardrail_redteam_failure: false,
        })
        .unwrap();
        acc.add_result(AddResultArgs {
            index: 1,
            result: result(true, 0.9, "b"),
            metric: Some("m".to_string()),
            weight: Some(1.0),
            threshold: None,
            is_guardrail_redteam_failure: false,
        })
        .unwrap();
        acc.add_result(AddResultArgs {
            index: 2,
            result: result(true, 0.1, "c"),
            metric: Some("m".to_string()),
            weight: Some(1.0),
            threshold: None,
            is_guardrail_redteam_failure: false,
        })
        .unwrap();
        assert_eq!(acc.named_scores.get("m"), Some(&0.9));
    }

    /// S6 — guardrail override forces pass regardless of aggregate.
    #[test]
    fn guardrail_override_forces_pass_scenario_s6() {
        let mut acc = AssertionAccumulator::new(false, None);
        acc.add_result(AddResultArgs {
            index: 0,
            result: result(false, 0.0, "Failed safety check"),
            metric: None,
            weight: Some(1.0),
            threshold: None,
            is_guardrail_redteam_failure: true,
        })
        .unwrap();

        let verdict = acc.test_result(None, None);
        assert!(verdict.pass);
        assert_eq!(verdict.reason, GUARDRAIL_BLOCKED_REASON);
    }

    #[test]
    fn short_circuit_aborts_on_first_failure() {
        let mut acc = AssertionAccumulator::new(true, None);
        add(&mut acc, 0, result(true, 1.0, "ok"), None);
        let err = acc.add_result(AddResultArgs {
            index: 1,
            result: result(false, 0.0, "boom"),
            metric: None,
            weight: None,
            threshold: None,
            is_guardrail_redteam_failure: false,
        });
        assert_eq!(err, Err(DispatchError::Aborted("boom".to_string())));
    }

    #[test]
    fn hierarchy_flattening_annotates_parent_and_children() {
        let mut child_acc = AssertionAccumulator::new(false, Some("set".to_string()));
        add(&mut child_acc, 0, result(true, 1.0, "child one"), Some(2.0));
        add(&mut child_acc, 1, result(true, 1.0, "child two"), Some(1.0));
        let set_result = child_acc.test_result(Some(0.5), None);

        let mut parent = AssertionAccumulator::new(false, None);
        parent
            .add_result(AddResultArgs {
                index: 0,
                result: set_result,
                metric: Some("grouped".to_string()),
                weight: Some(1.0),
                threshold: Some(0.5),
                is_guardrail_redteam_failure: false,
            })
            .unwrap();
        add(&mut parent, 1, result(true, 1.0, "standalone"), Some(1.0));

        let flat = parent.flatten_hierarchy();
        assert_eq!(flat.len(), 4);
        let parent_meta = flat[0].metadata.as_ref().unwrap();
        assert_eq!(parent_meta.get("isAssertSet"), Some(&serde_json::json!(true)));
        assert_eq!(parent_meta.get("childCount"), Some(&serde_json::json!(2)));

        let child_meta = flat[1].metadata.as_ref().unwrap();
        assert_eq!(child_meta.get("parentAssertSetIndex"), Some(&serde_json::json!(0)));

        let standalone_meta = flat[3].metadata.as_ref().unwrap();
        assert!(standalone_meta.get("isAssertSet").is_none());
        assert!(standalone_meta.get("parentAssertSetIndex").is_none());
    }
}
