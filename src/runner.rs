use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use futures_util::{stream::FuturesUnordered, StreamExt};
use tracing::{info, info_span, warn, Instrument};

use crate::{
    assertions::AssertionEngine,
    audio::{ArtifactStore, AudioRoundTrip, ServiceSpeech, VoiceSettings},
    config::RunConfig,
    error::{RunError, StepError},
    gateway::{RetryPolicy, ServiceGateway, ServiceResponse},
    grader::SemanticGrader,
    hooks::{HookFailure, HookRegistry, StepContext},
    outcome::{Outcome, StepInput},
    report::{ResultAggregator, RunReport, ScenarioReport, StepReport},
    runlog::{StepRecord, StepRecorder},
    scenario::{Scenario, ScenarioSet, Step, StepKind},
    timeout::{CancelSignal, TimeoutGuard},
    verdict::Verdict,
};

/// How many scenarios may run at once. Steps inside a scenario are always
/// sequential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    Sequential,
    Bounded(usize),
}

impl Concurrency {
    pub fn from_limit(limit: usize) -> Self {
        if limit <= 1 {
            Self::Sequential
        } else {
            Self::Bounded(limit)
        }
    }

    pub fn limit(self) -> usize {
        match self {
            Self::Sequential => 1,
            Self::Bounded(limit) => limit.max(1),
        }
    }
}

/// Drives scenarios against the assistant service and collects the run report.
pub struct ScenarioRunner {
    config: Arc<RunConfig>,
    gateway: Arc<ServiceGateway>,
    audio: Arc<AudioRoundTrip>,
    engine: AssertionEngine,
    hooks: HookRegistry,
    guard: TimeoutGuard,
    recorder: Option<Arc<dyn StepRecorder>>,
}

impl ScenarioRunner {
    /// Runner with speech from the service TTS endpoint, no semantic grader
    /// and no hooks.
    pub fn new(config: RunConfig, gateway: Arc<ServiceGateway>) -> Self {
        let audio = AudioRoundTrip::new(
            Arc::new(ServiceSpeech::new(Arc::clone(&gateway))),
            ArtifactStore::new(&config.voice.artifacts_dir),
            VoiceSettings::from(&config.voice),
        )
        .keep_artifacts(config.voice.keep_artifacts);
        let guard = TimeoutGuard::new(config.runtime.step_timeout(), config.runtime.grace());

        Self {
            config: Arc::new(config),
            gateway,
            audio: Arc::new(audio),
            engine: AssertionEngine::new(),
            hooks: HookRegistry::new(),
            guard,
            recorder: None,
        }
    }

    /// Wires HTTP gateway, voice backend and grader from configuration.
    pub fn from_config(config: RunConfig) -> Result<Self, RunError> {
        let retry = RetryPolicy::from(&config.retry);
        let gateway = ServiceGateway::from_config(&config.service, retry)
            .map_err(|err| RunError::Setup(err.to_string()))?;
        let gateway = Arc::new(gateway);
        let audio = AudioRoundTrip::from_config(&config.voice, Arc::clone(&gateway), retry)
            .map_err(|err| RunError::Setup(err.to_string()))?;
        let grader = SemanticGrader::from_config(&config.grader)
            .map_err(|err| RunError::Setup(err.to_string()))?
            .with_retry(retry);
        let engine = AssertionEngine::new().with_grader(Arc::new(grader));

        Ok(Self::new(config, gateway).with_audio(audio).with_engine(engine))
    }

    pub fn with_audio(mut self, audio: AudioRoundTrip) -> Self {
        self.audio = Arc::new(audio);
        self
    }

    pub fn with_engine(mut self, engine: AssertionEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn StepRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn gateway(&self) -> &Arc<ServiceGateway> {
        &self.gateway
    }

    pub fn concurrency(&self) -> Concurrency {
        Concurrency::from_limit(self.config.runtime.concurrency)
    }

    /// Runs with the configured concurrency.
    pub async fn run(&self, scenarios: ScenarioSet) -> Result<RunReport, RunError> {
        self.run_with(scenarios, self.concurrency()).await
    }

    pub async fn run_with(
        &self,
        scenarios: ScenarioSet,
        concurrency: Concurrency,
    ) -> Result<RunReport, RunError> {
        if let Some(name) = scenarios.duplicate_name() {
            return Err(RunError::DuplicateScenario(name.to_string()));
        }
        self.preflight().await?;

        let mut aggregator = ResultAggregator::new(self.config.snapshot());
        for failure in &scenarios.failures {
            warn!(path = %failure.path.display(), error = %failure.error, "scenario failed to load");
            aggregator.collect_load_failure(failure);
        }

        info!(
            scenarios = scenarios.scenarios.len(),
            concurrency = concurrency.limit(),
            "starting run"
        );
        for report in self.run_scenarios(&scenarios.scenarios, concurrency).await {
            aggregator.collect(report);
        }

        let removed = self.audio.cleanup().await;
        if removed > 0 {
            info!(removed, "removed audio artifacts");
        }

        let report = aggregator.finalize();
        info!(
            steps = report.totals.total(),
            passed = report.totals.pass,
            skipped = report.totals.skipped,
            pass_rate = report.pass_rate().unwrap_or(0.0),
            "run finished"
        );
        Ok(report)
    }

    /// Service health is fatal, a failed login falls back to the configured
    /// API key, and an unreachable grader only degrades semantic checks.
    pub async fn preflight(&self) -> Result<(), RunError> {
        self.gateway
            .health_check()
            .await
            .map_err(|err| RunError::ServiceUnavailable(err.to_string()))?;

        if let Err(err) = self.gateway.authenticate().await {
            warn!(error = %err, "authentication failed, continuing without a session token");
        }

        if let Some(grader) = self.engine.grader() {
            if let Err(err) = grader.ping().await {
                warn!(error = %err, "semantic grader unavailable, semantic_ok assertions will be skipped");
            }
        }
        Ok(())
    }

    /// Worker pool over scenarios. Reports come back in input order.
    async fn run_scenarios(&self, scenarios: &[Scenario], concurrency: Concurrency) -> Vec<ScenarioReport> {
        let limit = concurrency.limit();
        let mut pending = scenarios.iter().enumerate();
        let mut running = FuturesUnordered::new();
        let mut finished = Vec::with_capacity(scenarios.len());

        loop {
            while running.len() < limit {
                match pending.next() {
                    Some((position, scenario)) => {
                        running.push(async move { (position, self.run_scenario(scenario).await) })
                    }
                    None => break,
                }
            }
            match running.next().await {
                Some(done) => finished.push(done),
                None => break,
            }
        }

        finished.sort_by_key(|(position, _)| *position);
        finished.into_iter().map(|(_, report)| report).collect()
    }

    pub async fn run_scenario(&self, scenario: &Scenario) -> ScenarioReport {
        let span = info_span!("scenario", name = %scenario.name());
        self.execute_scenario(scenario).instrument(span).await
    }

    async fn execute_scenario(&self, scenario: &Scenario) -> ScenarioReport {
        let started = Instant::now();
        let runtime = &self.config.runtime;
        info!(steps = scenario.steps.len(), "scenario started");

        let mut hook_failures: Vec<HookFailure> = Vec::new();
        let mut steps = Vec::with_capacity(scenario.steps.len());

        let setup = self.hooks.before_scenario(scenario).await;
        let mut abort = setup.fatal().map(fatal_reason);
        hook_failures.extend(setup.failures);

        if abort.is_none() {
            for (index, step) in scenario.steps.iter().enumerate() {
                if index > 0 && !runtime.between_steps().is_zero() {
                    tokio::time::sleep(runtime.between_steps()).await;
                }

                let ctx = StepContext {
                    scenario: scenario.name(),
                    index,
                    step,
                };
                let before = self.hooks.before_step(&ctx).await;
                if let Some(fatal) = before.fatal() {
                    abort = Some(fatal_reason(fatal));
                    hook_failures.extend(before.failures);
                    break;
                }

                let report = self
                    .run_step(scenario.name(), index, step)
                    .await
                    .with_hook_failures(before.failures);
                let after = self.hooks.after_step(&ctx, &report).await;
                let fatal_after = after.fatal().map(fatal_reason);
                let report = report.with_hook_failures(after.failures);

                self.record(scenario.name(), &report);
                info!(
                    step = index,
                    kind = report.kind,
                    verdict = %report.verdict,
                    duration_ms = report.duration.as_millis() as u64,
                    "step finished"
                );
                let decisive_failure = !matches!(report.verdict, Verdict::Pass | Verdict::Skipped);
                steps.push(report);

                if fatal_after.is_some() {
                    abort = fatal_after;
                    break;
                }
                if decisive_failure && !runtime.continue_on_failure {
                    info!(step = index, "stopping scenario after failed step");
                    break;
                }
            }
        }

        let mut report = ScenarioReport::from_steps(
            scenario.name(),
            scenario.meta.tags.clone(),
            steps,
            abort,
            hook_failures,
            started.elapsed(),
        );
        let teardown = self.hooks.after_scenario(scenario, &report).await;
        report.hook_failures.extend(teardown.failures);

        info!(verdict = %report.verdict, pass = report.counts.pass, "scenario finished");
        report
    }

    /// The deadline covers the service interaction only; grading runs after it
    /// under the grader's own timeout.
    pub async fn run_step(&self, scenario: &str, index: usize, step: &Step) -> StepReport {
        let deadline = self.guard.deadline_for(step.timeout());
        let kind = step.kind.label();
        let payload = step.kind.payload().to_string();
        let started = Instant::now();

        let gateway = Arc::clone(&self.gateway);
        let audio = Arc::clone(&self.audio);
        let scenario_name = scenario.to_string();
        let step_kind = step.kind.clone();

        let result = self
            .guard
            .run_with_deadline(deadline, move |cancel| {
                interact(gateway, audio, scenario_name, index, step_kind, cancel)
            })
            .await;

        match result {
            Err(signal) => StepReport::timed_out(index, kind, payload, signal),
            Ok(Err(err)) => {
                warn!(step = index, error = %err, "step produced no outcome");
                StepReport::errored(index, kind, payload, err.to_string(), started.elapsed())
            }
            Ok(Ok(outcome)) => {
                let verdicts = self.engine.evaluate_all(&step.expect, &outcome).await;
                StepReport::evaluated(index, kind, payload, outcome, verdicts, started.elapsed())
            }
        }
    }

    fn record(&self, scenario: &str, report: &StepReport) {
        if let Some(recorder) = &self.recorder {
            if let Err(err) = recorder.record(&StepRecord::from_report(scenario, report)) {
                warn!(error = %err, "failed to write run log record");
            }
        }
    }
}

fn fatal_reason(failure: &HookFailure) -> String {
    format!(
        "{} hook `{}` failed: {}",
        failure.phase, failure.hook, failure.message
    )
}

async fn interact(
    gateway: Arc<ServiceGateway>,
    audio: Arc<AudioRoundTrip>,
    scenario: String,
    index: usize,
    kind: StepKind,
    mut cancel: CancelSignal,
) -> Result<Outcome, StepError> {
    tokio::select! {
        result = perform(&gateway, &audio, &scenario, index, &kind) => result,
        _ = cancel.cancelled() => Err(StepError::Cancelled),
    }
}

async fn perform(
    gateway: &ServiceGateway,
    audio: &AudioRoundTrip,
    scenario: &str,
    index: usize,
    kind: &StepKind,
) -> Result<Outcome, StepError> {
    let started = Instant::now();
    match kind {
        StepKind::Text { message } => {
            let response = gateway.query(message).await?;
            Ok(outcome_from(text_input(message), response, started.elapsed()))
        }
        StepKind::Audio { tts_text } => {
            let artifact = audio.synthesize(scenario, index, tts_text).await?;
            let transcript = audio.submit_for_transcription(&artifact, tts_text).await?;
            let response = gateway.query(&transcript).await?;
            let input = StepInput {
                kind: "audio",
                text: transcript,
                audio_path: Some(artifact.path.clone()),
            };
            let mut outcome = outcome_from(input, response, started.elapsed());
            outcome.input_audio = Some(artifact);
            Ok(outcome)
        }
        StepKind::Action { action } => {
            let response = gateway.trigger_action(action).await?;
            let input = StepInput {
                kind: "action",
                text: action.clone(),
                audio_path: None,
            };
            Ok(outcome_from(input, response, started.elapsed()))
        }
    }
}

fn text_input(message: &str) -> StepInput {
    StepInput {
        kind: "text",
        text: message.to_string(),
        audio_path: None,
    }
}

fn outcome_from(input: StepInput, response: ServiceResponse, elapsed: Duration) -> Outcome {
    let mut outcome = Outcome::new(input, response.raw, elapsed);
    outcome.assistant_text = response.text;
    outcome.plugin_result = response.plugin_result;
    outcome.side_effect = response.side_effect;
    outcome
}
