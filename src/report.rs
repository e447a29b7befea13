use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::{
    hooks::HookFailure,
    outcome::{duration_ms, Outcome},
    scenario::LoadFailure,
    timeout::TimeoutSignal,
    verdict::{reduce_step, AssertionVerdict, Verdict},
};

/// Per-category tallies. Used at step and at scenario granularity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VerdictCounts {
    pub pass: usize,
    pub fail: usize,
    pub error: usize,
    pub timeout: usize,
    pub skipped: usize,
}

impl VerdictCounts {
    pub fn record(&mut self, verdict: Verdict) {
        match verdict {
            Verdict::Pass => self.pass += 1,
            Verdict::Fail => self.fail += 1,
            Verdict::Error => self.error += 1,
            Verdict::Timeout => self.timeout += 1,
            Verdict::Skipped => self.skipped += 1,
        }
    }

    pub fn merge(&mut self, other: &VerdictCounts) {
        self.pass += other.pass;
        self.fail += other.fail;
        self.error += other.error;
        self.timeout += other.timeout;
        self.skipped += other.skipped;
    }

    pub fn total(&self) -> usize {
        self.pass + self.fail + self.error + self.timeout + self.skipped
    }

    /// Everything that produced a real answer, i.e. all but skipped.
    pub fn decided(&self) -> usize {
        self.total() - self.skipped
    }

    /// `pass / (total - skipped)`; `None` when nothing was decided.
    pub fn pass_rate(&self) -> Option<f64> {
        match self.decided() {
            0 => None,
            decided => Some(self.pass as f64 / decided as f64),
        }
    }

    pub fn skip_ratio(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.skipped as f64 / total as f64,
        }
    }
}

impl FromIterator<Verdict> for VerdictCounts {
    fn from_iter<I: IntoIterator<Item = Verdict>>(iter: I) -> Self {
        let mut counts = VerdictCounts::default();
        for verdict in iter {
            counts.record(verdict);
        }
        counts
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub index: usize,
    pub kind: &'static str,
    pub input: String,
    pub verdict: Verdict,
    pub assertions: Vec<AssertionVerdict>,
    /// Detail of the first non-pass assertion in evaluation order.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_failure: Option<String>,
    /// Transport, audio or hook error that prevented evaluation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutSignal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hook_failures: Vec<HookFailure>,
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
}

impl StepReport {
    /// Step whose outcome was captured and whose assertions were all evaluated.
    pub fn evaluated(
        index: usize,
        kind: &'static str,
        input: impl Into<String>,
        outcome: Outcome,
        assertions: Vec<AssertionVerdict>,
        duration: Duration,
    ) -> Self {
        let (verdict, first) = reduce_step(&assertions);
        let first_failure = first.map(|a| format!("{} on {}: {}", a.kind, a.target, a.detail));
        Self {
            index,
            kind,
            input: input.into(),
            verdict,
            assertions,
            first_failure,
            error: None,
            timeout: None,
            outcome: Some(outcome),
            hook_failures: Vec::new(),
            duration,
        }
    }

    /// Step that never produced an outcome.
    pub fn errored(
        index: usize,
        kind: &'static str,
        input: impl Into<String>,
        error: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            index,
            kind,
            input: input.into(),
            verdict: Verdict::Error,
            assertions: Vec::new(),
            first_failure: None,
            error: Some(error.into()),
            timeout: None,
            outcome: None,
            hook_failures: Vec::new(),
            duration,
        }
    }

    pub fn timed_out(
        index: usize,
        kind: &'static str,
        input: impl Into<String>,
        signal: TimeoutSignal,
    ) -> Self {
        Self {
            index,
            kind,
            input: input.into(),
            verdict: Verdict::Timeout,
            assertions: Vec::new(),
            first_failure: None,
            error: Some(signal.to_string()),
            timeout: Some(signal),
            outcome: None,
            hook_failures: Vec::new(),
            duration: signal.elapsed,
        }
    }

    pub fn with_hook_failures(mut self, failures: Vec<HookFailure>) -> Self {
        self.hook_failures.extend(failures);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub verdict: Verdict,
    pub counts: VerdictCounts,
    pub steps: Vec<StepReport>,
    /// Why the scenario stopped early or never started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hook_failures: Vec<HookFailure>,
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
}

impl ScenarioReport {
    /// Scenario verdict is the reduction of its step verdicts; an abort
    /// reason forces at least `error`.
    pub fn from_steps(
        name: impl Into<String>,
        tags: Vec<String>,
        steps: Vec<StepReport>,
        error: Option<String>,
        hook_failures: Vec<HookFailure>,
        duration: Duration,
    ) -> Self {
        let step_verdicts = steps.iter().map(|step| step.verdict);
        let counts: VerdictCounts = step_verdicts.clone().collect();
        let abort = error.as_ref().map(|_| Verdict::Error);
        let verdict = Verdict::reduce(step_verdicts.chain(abort));
        Self {
            name: name.into(),
            tags,
            verdict,
            counts,
            steps,
            error,
            hook_failures,
            duration,
        }
    }

    /// A scenario file that could not be loaded. Reported as an `error`
    /// scenario named after its path.
    pub fn load_failure(failure: &LoadFailure) -> Self {
        Self::from_steps(
            failure.path.display().to_string(),
            Vec::new(),
            Vec::new(),
            Some(failure.error.to_string()),
            Vec::new(),
            Duration::ZERO,
        )
    }
}

/// Final, immutable result of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub config: Value,
    /// Step-level tallies across every scenario.
    pub totals: VerdictCounts,
    pub scenario_totals: VerdictCounts,
    pub pass_rate: Option<f64>,
    pub skip_ratio: f64,
    pub scenarios: Vec<ScenarioReport>,
}

impl RunReport {
    pub fn pass_rate(&self) -> Option<f64> {
        self.totals.pass_rate()
    }

    pub fn skip_ratio(&self) -> f64 {
        self.totals.skip_ratio()
    }

    /// Every scenario passed.
    pub fn is_success(&self) -> bool {
        self.scenario_totals.pass == self.scenario_totals.total()
    }

    pub fn scenario(&self, name: &str) -> Option<&ScenarioReport> {
        self.scenarios.iter().find(|s| s.name == name)
    }

    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }
}

/// Single accumulation point for scenario results. Workers hand over whole
/// scenario reports; nothing else writes to the aggregate.
#[derive(Debug)]
pub struct ResultAggregator {
    started_at: DateTime<Utc>,
    config: Value,
    scenarios: Vec<ScenarioReport>,
}

impl ResultAggregator {
    pub fn new(config: Value) -> Self {
        Self {
            started_at: Utc::now(),
            config,
            scenarios: Vec::new(),
        }
    }

    pub fn collect(&mut self, report: ScenarioReport) {
        self.scenarios.push(report);
    }

    pub fn collect_load_failure(&mut self, failure: &LoadFailure) {
        self.collect(ScenarioReport::load_failure(failure));
    }

    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }

    pub fn finalize(self) -> RunReport {
        let mut totals = VerdictCounts::default();
        let mut scenario_totals = VerdictCounts::default();
        for scenario in &self.scenarios {
            totals.merge(&scenario.counts);
            scenario_totals.record(scenario.verdict);
        }

        RunReport {
            started_at: self.started_at,
            finished_at: Utc::now(),
            config: self.config,
            pass_rate: totals.pass_rate(),
            skip_ratio: totals.skip_ratio(),
            totals,
            scenario_totals,
            scenarios: self.scenarios,
        }
    }
}
