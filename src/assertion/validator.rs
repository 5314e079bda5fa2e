//! AssertionValidator (C7) — `spec.md` §4.7: static validation of
//! assertion trees before they're ever dispatched.

use super::{Assertion, CombinatorKind, MAX_NESTING_DEPTH, MAX_SCORE, SELECT_BEST};
use crate::error::AssertValidationError;

/// The part of a test case (or a scenario's `config` entry) that the
/// validator cares about — the rest of a test case's schema (description,
/// vars, provider overrides, ...) lives with the caller's config loader,
/// out of scope here (`spec.md` §1).
#[derive(Debug, Clone, Default)]
pub struct TestCaseAsserts {
    pub assert: Vec<Assertion>,
}

/// A scenario entry: its own `config` and `tests` arrays, each holding
/// test-case-shaped entries, per `spec.md` §4.7.
#[derive(Debug, Clone, Default)]
pub struct ScenarioAsserts {
    pub config: Vec<TestCaseAsserts>,
    pub tests: Vec<TestCaseAsserts>,
}

/// Validates a whole assertion list (a test case's `assert` array).
///
/// `exempt_plugins` names assertion `type`s that, alongside `select-best`
/// and `max-score`, may never appear inside a combinator — concretely
/// `STRATEGY_EXEMPT_PLUGINS` from `spec.md` §4.7, supplied by the caller
/// since the concrete plugin catalog is out of scope here.
pub fn validate_assertions(
    assertions: &[Assertion],
    exempt_plugins: &[String],
) -> Result<(), AssertValidationError> {
    validate_list(assertions, "tests[0].assert", exempt_plugins, 0, false, false)
}

/// Validates a whole config-load-time surface: the test list, an optional
/// `defaultTest`, and an optional scenarios list, per `spec.md` §4.7's
/// top-level entry point. Error paths follow `spec.md` §8 scenario S8's
/// shape: `tests[i].assert[j]`, `defaultTest.assert[k]`,
/// `scenarios[i].config[j].assert[k]`, `scenarios[i].tests[j].assert[k]`.
pub fn validate_config(
    tests: &[TestCaseAsserts],
    default_test: Option<&TestCaseAsserts>,
    scenarios: &[ScenarioAsserts],
    exempt_plugins: &[String],
) -> Result<(), AssertValidationError> {
    for (i, test) in tests.iter().enumerate() {
        validate_list(
            &test.assert,
            &format!("tests[{i}].assert"),
            exempt_plugins,
            0,
            false,
            false,
        )?;
    }

    if let Some(default_test) = default_test {
        validate_list(
            &default_test.assert,
            "defaultTest.assert",
            exempt_plugins,
            0,
            false,
            false,
        )?;
    }

    for (i, scenario) in scenarios.iter().enumerate() {
        for (j, entry) in scenario.config.iter().enumerate() {
            validate_list(
                &entry.assert,
                &format!("scenarios[{i}].config[{j}].assert"),
                exempt_plugins,
                0,
                false,
                false,
            )?;
        }
        for (j, entry) in scenario.tests.iter().enumerate() {
            validate_list(
                &entry.assert,
                &format!("scenarios[{i}].tests[{j}].assert"),
                exempt_plugins,
                0,
                false,
                false,
            )?;
        }
    }

    Ok(())
}

/// Guards against the top-level value not actually being a JSON array —
/// including an array-like object (e.g. one that merely carries a
/// `length` property) — before the caller even attempts to deserialize
/// it into `Assertion`s. `spec.md` §4.7's first rule.
pub fn guard_json_is_array(
    value: &serde_json::Value,
    path: &str,
) -> Result<(), AssertValidationError> {
    match value {
        serde_json::Value::Array(_) => Ok(()),
        other => Err(AssertValidationError::new(
            path,
            "expected a JSON array of assertions",
            other.clone(),
        )),
    }
}

/// `spec.md` §4.7's second rule: "each assertion must be an object with a
/// string `type`." Runs on the raw JSON *before* typed deserialization is
/// attempted, so a malformed entry (missing `type`, or not an object at
/// all) surfaces as a structured `AssertValidationError` at the right
/// path instead of an opaque `serde_json` error. Recurses into nested
/// `assert` arrays (assert-set and combinator shapes both carry one) so a
/// violation anywhere in the tree is caught here, not just at the top
/// level.
pub fn guard_assertion_shape(
    value: &serde_json::Value,
    path: &str,
) -> Result<(), AssertValidationError> {
    let obj = match value.as_object() {
        Some(obj) => obj,
        None => {
            return Err(AssertValidationError::new(
                path,
                "assertion must be a JSON object",
                value.clone(),
            ))
        }
    };

    match obj.get("type") {
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => {}
        _ => {
            return Err(AssertValidationError::new(
                path,
                "assertion must have a non-empty string 'type' field",
                value.clone(),
            ))
        }
    }

    if let Some(serde_json::Value::Array(children)) = obj.get("assert") {
        for (i, child) in children.iter().enumerate() {
            guard_assertion_shape(child, &format!("{path}.assert[{i}]"))?;
        }
    }

    Ok(())
}

/// The raw-JSON counterpart of [`validate_assertions`]: runs both of
/// `spec.md` §4.7's structural rules (array, then object-with-`type` per
/// item, recursively) before deserializing into typed `Assertion`s, then
/// runs the same depth/combinator/weight/threshold checks over the parsed
/// tree. This is the reachable path for rule 2 — callers that already
/// hold typed `Assertion`s (built in-process, not from JSON) use
/// [`validate_assertions`] directly instead.
pub fn parse_assertions(
    value: &serde_json::Value,
    path: &str,
    exempt_plugins: &[String],
) -> Result<Vec<Assertion>, AssertValidationError> {
    guard_json_is_array(value, path)?;
    let items = value.as_array().expect("guarded above");
    for (i, item) in items.iter().enumerate() {
        guard_assertion_shape(item, &format!("{path}[{i}]"))?;
    }

    let assertions: Vec<Assertion> = serde_json::from_value(value.clone()).map_err(|e| {
        AssertValidationError::new(
            path,
            format!("failed to parse assertion tree: {e}"),
            value.clone(),
        )
    })?;

    validate_list(&assertions, path, exempt_plugins, 0, false, false)?;
    Ok(assertions)
}

/// Raw-JSON counterpart of [`TestCaseAsserts`], for config surfaces that
/// haven't been typed-deserialized yet — see [`validate_config_json`].
#[derive(Debug, Clone, Default)]
pub struct TestCaseAssertsJson {
    pub assert: serde_json::Value,
}

/// Raw-JSON counterpart of [`ScenarioAsserts`].
#[derive(Debug, Clone, Default)]
pub struct ScenarioAssertsJson {
    pub config: Vec<TestCaseAssertsJson>,
    pub tests: Vec<TestCaseAssertsJson>,
}

/// [`validate_config`]'s raw-JSON counterpart: the entry point a caller's
/// config loader should use before it has deserialized any `assert` array
/// into typed `Assertion`s, so `spec.md` §4.7 rule 2 is actually enforced
/// on the data as it arrives off the wire.
pub fn validate_config_json(
    tests: &[TestCaseAssertsJson],
    default_test: Option<&TestCaseAssertsJson>,
    scenarios: &[ScenarioAssertsJson],
    exempt_plugins: &[String],
) -> Result<(), AssertValidationError> {
    for (i, test) in tests.iter().enumerate() {
        parse_assertions(&test.assert, &format!("tests[{i}].assert"), exempt_plugins)?;
    }

    if let Some(default_test) = default_test {
        parse_assertions(&default_test.assert, "defaultTest.assert", exempt_plugins)?;
    }

    for (i, scenario) in scenarios.iter().enumerate() {
        for (j, entry) in scenario.config.iter().enumerate() {
            parse_assertions(
                &entry.assert,
                &format!("scenarios[{i}].config[{j}].assert"),
                exempt_plugins,
            )?;
        }
        for (j, entry) in scenario.tests.iter().enumerate() {
            parse_assertions(
                &entry.assert,
                &format!("scenarios[{i}].tests[{j}].assert"),
                exempt_plugins,
            )?;
        }
    }

    Ok(())
}

fn validate_list(
    assertions: &[Assertion],
    path: &str,
    exempt_plugins: &[String],
    depth: u32,
    inside_combinator: bool,
    inside_assert_set: bool,
) -> Result<(), AssertValidationError> {
    for (i, assertion) in assertions.iter().enumerate() {
        let item_path = format!("{path}[{i}]");
        validate_one(
            assertion,
            &item_path,
            exempt_plugins,
            depth,
            inside_combinator,
            inside_assert_set,
        )?;
    }
    Ok(())
}

fn validate_one(
    assertion: &Assertion,
    path: &str,
    exempt_plugins: &[String],
    depth: u32,
    inside_combinator: bool,
    inside_assert_set: bool,
) -> Result<(), AssertValidationError> {
    match assertion {
        Assertion::Primitive(p) => {
            if p.assertion_type.trim().is_empty() {
                return Err(AssertValidationError::new(
                    path,
                    "assertion type must be a non-empty string",
                    serde_json::json!(p),
                ));
            }
            check_weight(p.weight, path, &serde_json::json!(p))?;
            check_threshold(p.threshold, path, &serde_json::json!(p))?;
            if inside_combinator
                && (exempt_plugins.iter().any(|e| e == &p.assertion_type))
            {
                return Err(AssertValidationError::new(
                    path,
                    format!("assertion type '{}' may not appear inside a combinator", p.assertion_type),
                    serde_json::json!(p),
                ));
            }
            Ok(())
        }

        Assertion::Special(s) => {
            if s.assertion_type == SELECT_BEST || s.assertion_type == MAX_SCORE {
                if inside_combinator || inside_assert_set {
                    return Err(AssertValidationError::new(
                        path,
                        format!(
                            "'{}' may not appear inside a combinator or assert-set",
                            s.assertion_type
                        ),
                        serde_json::json!(s),
                    ));
                }
                Ok(())
            } else {
                Err(AssertValidationError::new(
                    path,
                    format!("unknown special assertion type '{}'", s.assertion_type),
                    serde_json::json!(s),
                ))
            }
        }

        Assertion::Combinator(c) => {
            if inside_assert_set {
                return Err(AssertValidationError::new(
                    path,
                    "combinators may not appear inside an assert-set",
                    serde_json::json!({ "type": c.kind.as_str() }),
                ));
            }
            if c.assert.is_empty() {
                return Err(AssertValidationError::new(
                    path,
                    format!("'{}' combinator requires a non-empty assert array", c.kind.as_str()),
                    serde_json::json!({ "type": c.kind.as_str() }),
                ));
            }
            let next_depth = depth + 1;
            if next_depth > MAX_NESTING_DEPTH {
                return Err(too_deep(path, next_depth));
            }
            validate_list(
                &c.assert,
                &format!("{path}.assert"),
                exempt_plugins,
                next_depth,
                true,
                false,
            )
        }

        Assertion::AssertSet(s) => {
            if s.assert.is_empty() {
                return Err(AssertValidationError::new(
                    path,
                    "assert-set requires a non-empty 'assert' array",
                    serde_json::json!({ "type": "assert-set" }),
                ));
            }
            check_weight(s.weight, path, &serde_json::json!({ "type": "assert-set" }))?;
            check_threshold(s.threshold, path, &serde_json::json!({ "type": "assert-set" }))?;
            let next_depth = depth + 1;
            if next_depth > MAX_NESTING_DEPTH {
                return Err(too_deep(path, next_depth));
            }
            validate_list(
                &s.assert,
                &format!("{path}.assert"),
                exempt_plugins,
                next_depth,
                false,
                true,
            )
        }
    }
}

fn check_weight(
    weight: Option<f64>,
    path: &str,
    received: serde_json::Value,
) -> Result<(), AssertValidationError> {
    if let Some(w) = weight {
        if w < 0.0 {
            return Err(AssertValidationError::new(path, "weight must be \u{2265} 0", received));
        }
    }
    Ok(())
}

fn check_threshold(
    threshold: Option<f64>,
    path: &str,
    received: serde_json::Value,
) -> Result<(), AssertValidationError> {
    if let Some(t) = threshold {
        if !(0.0..=1.0).contains(&t) {
            return Err(AssertValidationError::new(
                path,
                "threshold must be in [0, 1]",
                received,
            ));
        }
    }
    Ok(())
}

fn too_deep(path: &str, depth: u32) -> AssertValidationError {
    AssertValidationError::new(
        path,
        format!("nesting depth {depth} exceeds the maximum of {MAX_NESTING_DEPTH}"),
        serde_json::json!(null),
    )
}
