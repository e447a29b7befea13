use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{
    error::{EffectError, GraderError},
    grader::{RubricContext, SemanticGrader},
    outcome::Outcome,
    scenario::{Assertion, AssertionKind, Expectation},
    verdict::{AssertionVerdict, Verdict},
};

/// Oracle deciding whether a named effect actually happened.
#[async_trait]
pub trait EffectChecker: Send + Sync {
    /// `payload` is the selected target of the assertion, if present.
    async fn check(
        &self,
        effect: &str,
        payload: Option<&Value>,
        outcome: &Outcome,
    ) -> Result<bool, EffectError>;
}

/// Accepts an effect when the payload reports `success: true` and carries
/// evidence of that effect: a matching `action` field, or, without one, the
/// effect's subject (`calendar` for `calendar_add`) somewhere in the payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultFlagEffect;

#[async_trait]
impl EffectChecker for ResultFlagEffect {
    async fn check(
        &self,
        effect: &str,
        payload: Option<&Value>,
        _outcome: &Outcome,
    ) -> Result<bool, EffectError> {
        let Some(payload) = payload else {
            return Ok(false);
        };
        if !payload.get("success").and_then(Value::as_bool).unwrap_or(false) {
            return Ok(false);
        }
        match payload.get("action") {
            Some(Value::String(action)) => Ok(action == effect),
            Some(_) => Ok(false),
            None => Ok(mentions_effect(payload, effect)),
        }
    }
}

fn mentions_effect(payload: &Value, effect: &str) -> bool {
    let subject = effect
        .split(['_', '-', '.'])
        .find(|part| !part.is_empty())
        .unwrap_or(effect)
        .to_lowercase();
    if subject.is_empty() {
        return false;
    }
    let mut rendered = payload.clone();
    if let Some(fields) = rendered.as_object_mut() {
        fields.remove("success");
    }
    rendered.to_string().to_lowercase().contains(&subject)
}

/// Effect checkers bound by name before the run. Names without a checker go
/// to the fallback, or resolve to `error` when there is none.
#[derive(Clone, Default)]
pub struct EffectRegistry {
    checkers: HashMap<String, Arc<dyn EffectChecker>>,
    fallback: Option<Arc<dyn EffectChecker>>,
}

impl EffectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that judges every effect by its result flag unless a
    /// dedicated checker is registered.
    pub fn with_result_flags() -> Self {
        Self::new().with_fallback(Arc::new(ResultFlagEffect))
    }

    pub fn register(&mut self, effect: impl Into<String>, checker: Arc<dyn EffectChecker>) {
        self.checkers.insert(effect.into(), checker);
    }

    pub fn with_checker(mut self, effect: impl Into<String>, checker: Arc<dyn EffectChecker>) -> Self {
        self.register(effect, checker);
        self
    }

    pub fn with_fallback(mut self, checker: Arc<dyn EffectChecker>) -> Self {
        self.fallback = Some(checker);
        self
    }

    pub fn resolve(&self, effect: &str) -> Option<&Arc<dyn EffectChecker>> {
        self.checkers.get(effect).or(self.fallback.as_ref())
    }
}

/// Evaluates assertions against captured outcomes. Holds no per-step state,
/// so one engine is shared by every scenario worker.
#[derive(Clone)]
pub struct AssertionEngine {
    effects: EffectRegistry,
    grader: Option<Arc<SemanticGrader>>,
    threshold: f64,
}

impl Default for AssertionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl AssertionEngine {
    pub fn new() -> Self {
        Self {
            effects: EffectRegistry::with_result_flags(),
            grader: None,
            threshold: 8.0,
        }
    }

    pub fn with_effects(mut self, effects: EffectRegistry) -> Self {
        self.effects = effects;
        self
    }

    /// Also adopts the grader's configured pass threshold.
    pub fn with_grader(mut self, grader: Arc<SemanticGrader>) -> Self {
        self.threshold = grader.threshold();
        self.grader = Some(grader);
        self
    }

    pub fn grader(&self) -> Option<&Arc<SemanticGrader>> {
        self.grader.as_ref()
    }

    /// Evaluates every assertion of `expectation` in insertion order.
    pub async fn evaluate_all(&self, expectation: &Expectation, outcome: &Outcome) -> Vec<AssertionVerdict> {
        let mut verdicts = Vec::with_capacity(expectation.assertions.len());
        for assertion in &expectation.assertions {
            verdicts.push(self.evaluate_in(assertion, outcome, Some(&expectation.action)).await);
        }
        verdicts
    }

    pub async fn evaluate(&self, assertion: &Assertion, outcome: &Outcome) -> AssertionVerdict {
        self.evaluate_in(assertion, outcome, None).await
    }

    async fn evaluate_in(
        &self,
        assertion: &Assertion,
        outcome: &Outcome,
        expected_action: Option<&str>,
    ) -> AssertionVerdict {
        let (verdict, detail, score) = match assertion.kind {
            AssertionKind::Contains => check_contains(assertion, outcome),
            AssertionKind::JsonpathEq => check_jsonpath_eq(assertion, outcome),
            AssertionKind::EffectOk => self.check_effect(assertion, outcome).await,
            AssertionKind::SemanticOk => self.check_semantic(assertion, outcome, expected_action).await,
        };
        let result = AssertionVerdict::new(assertion.kind, assertion.target, verdict, detail);
        match score {
            Some(score) => result.with_score(score),
            None => result,
        }
    }

    async fn check_effect(&self, assertion: &Assertion, outcome: &Outcome) -> Evaluation {
        let Some(effect) = assertion.value_str() else {
            return (Verdict::Error, "effect_ok requires an effect name as value".into(), None);
        };
        let Some(checker) = self.effects.resolve(effect) else {
            return (Verdict::Error, format!("no effect checker for `{effect}`"), None);
        };

        let payload = outcome.select(assertion.target).map(|selected| selected.as_json());
        match checker.check(effect, payload.as_ref(), outcome).await {
            Ok(true) => (Verdict::Pass, format!("effect `{effect}` observed"), None),
            Ok(false) if payload.is_none() => (
                Verdict::Fail,
                format!("target {} is absent from the outcome", assertion.target),
                None,
            ),
            Ok(false) => (Verdict::Fail, format!("effect `{effect}` not observed"), None),
            Err(err) => (Verdict::Error, err.to_string(), None),
        }
    }

    async fn check_semantic(
        &self,
        assertion: &Assertion,
        outcome: &Outcome,
        expected_action: Option<&str>,
    ) -> Evaluation {
        let Some(grader) = &self.grader else {
            return (Verdict::Skipped, "no semantic grader configured".into(), None);
        };
        let Some(selected) = outcome.select(assertion.target) else {
            return (
                Verdict::Fail,
                format!("target {} is absent from the outcome", assertion.target),
                None,
            );
        };
        let threshold = match &assertion.value {
            Some(value) => match numeric(value) {
                Some(threshold) => threshold,
                None => return (Verdict::Error, format!("threshold `{value}` is not a number"), None),
            },
            None => self.threshold,
        };

        let context = RubricContext {
            user_input: outcome.input.text.clone(),
            expected_action: expected_action.map(str::to_string),
            rubric: assertion.rubric.clone(),
            metadata: json!({
                "input_type": outcome.input.kind,
                "target": assertion.target,
                "plugin_result": outcome.plugin_result,
            }),
        };

        match grader.grade(&selected.as_text(), &context).await {
            Ok(grade) => {
                let verdict = if grade.score >= threshold {
                    Verdict::Pass
                } else {
                    Verdict::Fail
                };
                let mut detail = format!("score {:.1} against threshold {threshold:.1}", grade.score);
                if let Some(comments) = grade.comments {
                    detail.push_str(": ");
                    detail.push_str(&comments);
                }
                (verdict, detail, Some(grade.score))
            }
            Err(GraderError::Unavailable(reason)) => (Verdict::Skipped, reason, None),
            Err(err) => (Verdict::Error, err.to_string(), None),
        }
    }
}

type Evaluation = (Verdict, String, Option<f64>);

/// Numbers, or strings holding one (`"8.5"`).
fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

fn check_contains(assertion: &Assertion, outcome: &Outcome) -> Evaluation {
    let Some(needle) = assertion.value_str() else {
        return (Verdict::Error, "contains requires a string value".into(), None);
    };
    let Some(selected) = outcome.select(assertion.target) else {
        return (
            Verdict::Fail,
            format!("target {} is absent from the outcome", assertion.target),
            None,
        );
    };

    let haystack = selected.as_text();
    if haystack.to_lowercase().contains(&needle.to_lowercase()) {
        (Verdict::Pass, format!("found `{needle}`"), None)
    } else {
        (Verdict::Fail, format!("`{needle}` not found in `{}`", excerpt(&haystack)), None)
    }
}

fn check_jsonpath_eq(assertion: &Assertion, outcome: &Outcome) -> Evaluation {
    let Some(path) = assertion.path.as_deref() else {
        return (Verdict::Error, "jsonpath_eq requires a path".into(), None);
    };
    let segments = match parse_path(path) {
        Ok(segments) => segments,
        Err(message) => return (Verdict::Error, message, None),
    };
    let Some(selected) = outcome.select(assertion.target) else {
        return (
            Verdict::Fail,
            format!("target {} is absent from the outcome", assertion.target),
            None,
        );
    };
    let expected = assertion.value.clone().unwrap_or(Value::Null);

    let document = selected.as_json();
    match resolve(&document, &segments) {
        None => (Verdict::Fail, format!("path `{path}` did not resolve"), None),
        Some(actual) if values_equal(actual, &expected) => {
            (Verdict::Pass, format!("`{path}` equals {expected}"), None)
        }
        Some(actual) => (
            Verdict::Fail,
            format!("`{path}` is {actual}, expected {expected}"),
            None,
        ),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// Parses the dotted/bracketed subset of JSONPath: `$.a.b[0]`, `$['a b'].c`,
/// or the same without the leading `$`.
fn parse_path(path: &str) -> Result<Vec<Segment>, String> {
    let invalid = |reason: &str| format!("invalid path `{path}`: {reason}");
    let mut rest = path.trim();
    rest = rest.strip_prefix('$').unwrap_or(rest);

    let mut segments = Vec::new();
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('.') {
            let end = after.find(['.', '[']).unwrap_or(after.len());
            if end == 0 {
                return Err(invalid("empty key"));
            }
            segments.push(Segment::Key(after[..end].to_string()));
            rest = &after[end..];
        } else if let Some(after) = rest.strip_prefix('[') {
            let close = after.find(']').ok_or_else(|| invalid("unclosed bracket"))?;
            let inner = after[..close].trim();
            let quoted = inner
                .strip_prefix('\'')
                .and_then(|s| s.strip_suffix('\''))
                .or_else(|| inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')));
            let segment = match quoted {
                Some(key) => Segment::Key(key.to_string()),
                None => Segment::Index(inner.parse().map_err(|_| invalid("bad index"))?),
            };
            segments.push(segment);
            rest = &after[close + 1..];
        } else if segments.is_empty() {
            let end = rest.find(['.', '[']).unwrap_or(rest.len());
            segments.push(Segment::Key(rest[..end].to_string()));
            rest = &rest[end..];
        } else {
            return Err(invalid("unexpected character"));
        }
    }
    Ok(segments)
}

fn resolve<'a>(document: &'a Value, segments: &[Segment]) -> Option<&'a Value> {
    segments.iter().try_fold(document, |current, segment| match segment {
        Segment::Key(key) => current.get(key.as_str()),
        Segment::Index(index) => current.get(*index),
    })
}

/// Deep equality where `1` and `1.0` are the same number.
fn values_equal(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => a == b,
        },
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(key, x)| b.get(key).map_or(false, |y| values_equal(x, y)))
        }
        _ => actual == expected,
    }
}

fn excerpt(text: &str) -> String {
    const LIMIT: usize = 120;
    match text.char_indices().nth(LIMIT) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
