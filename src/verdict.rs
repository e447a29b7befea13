use std::fmt;

use serde::{Deserialize, Serialize};

use crate::scenario::{AssertionKind, Target};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
    Error,
    Timeout,
    Skipped,
}

impl Verdict {
    /// Higher wins when reducing: timeout > error > fail > skipped > pass.
    fn severity(self) -> u8 {
        match self {
            Verdict::Pass => 0,
            Verdict::Skipped => 1,
            Verdict::Fail => 2,
            Verdict::Error => 3,
            Verdict::Timeout => 4,
        }
    }

    pub fn is_pass(self) -> bool {
        self == Verdict::Pass
    }

    /// AND-reduction. An empty set of verdicts passes.
    pub fn reduce<I>(verdicts: I) -> Verdict
    where
        I: IntoIterator<Item = Verdict>,
    {
        verdicts
            .into_iter()
            .max_by_key(|verdict| verdict.severity())
            .unwrap_or(Verdict::Pass)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Verdict::Pass => "pass",
            Verdict::Fail => "fail",
            Verdict::Error => "error",
            Verdict::Timeout => "timeout",
            Verdict::Skipped => "skipped",
        };
        f.write_str(name)
    }
}

/// Result of evaluating one assertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertionVerdict {
    pub kind: AssertionKind,
    pub target: Target,
    pub verdict: Verdict,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

impl AssertionVerdict {
    pub fn new(kind: AssertionKind, target: Target, verdict: Verdict, detail: impl Into<String>) -> Self {
        Self {
            kind,
            target,
            verdict,
            detail: detail.into(),
            score: None,
        }
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }
}

/// Reduces assertion verdicts into a step verdict and names the first non-pass
/// assertion in evaluation order for quick diagnosis.
pub fn reduce_step(assertions: &[AssertionVerdict]) -> (Verdict, Option<&AssertionVerdict>) {
    let verdict = Verdict::reduce(assertions.iter().map(|a| a.verdict));
    let first_failure = assertions.iter().find(|a| !a.verdict.is_pass());
    (verdict, first_failure)
}
