use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use pruefstand::{
    audio::ArtifactStore, config::GraderConfig, Assertion, AssertionEngine, AssistantTransport,
    AudioRoundTrip, ChatMessage, CompletionRequest, CompletionResponse, Concurrency, Credentials,
    Expectation, GatewayError, Hook, HookError, HookRegistry, LLMError, LLMProvider, MemoryRecorder,
    RetryPolicy, RunConfig, RunError, Scenario, ScenarioRunner, ScenarioSet, SemanticGrader,
    ServiceGateway, ServiceReply, ServiceRequest, SpeechSynthesizer, Step, Target, Verdict,
    VoiceSettings,
};
use serde_json::{json, Value};

/// In-memory assistant: remembers things, answers greetings, naps on request
/// and can be told to fail its next queries with a 503.
struct FakeAssistant {
    healthy: bool,
    memories: Mutex<Vec<String>>,
    failing_queries: AtomicU32,
    queries: AtomicU32,
    napping: AtomicU32,
    most_napping: AtomicU32,
}

impl FakeAssistant {
    fn new() -> Self {
        Self {
            healthy: true,
            memories: Mutex::new(Vec::new()),
            failing_queries: AtomicU32::new(0),
            queries: AtomicU32::new(0),
            napping: AtomicU32::new(0),
            most_napping: AtomicU32::new(0),
        }
    }

    fn failing(times: u32) -> Self {
        let fake = Self::new();
        fake.failing_queries.store(times, Ordering::SeqCst);
        fake
    }

    fn unhealthy() -> Self {
        Self {
            healthy: false,
            ..Self::new()
        }
    }

    fn reply(text: impl Into<String>) -> ServiceReply {
        ServiceReply::Json(json!({ "response": { "text": text.into() } }))
    }

    async fn answer(&self, text: &str) -> ServiceReply {
        let lower = text.to_lowercase();
        if let Some(item) = lower.strip_prefix("remember ") {
            self.memories.lock().unwrap().push(item.to_string());
            return Self::reply(format!("Okay, I will remember {item}."));
        }
        if lower.contains("what do you remember") {
            let joined = self.memories.lock().unwrap().join(", ");
            return Self::reply(format!("You asked me to remember: {joined}"));
        }
        if lower.starts_with("nap") {
            let now = self.napping.fetch_add(1, Ordering::SeqCst) + 1;
            self.most_napping.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.napping.fetch_sub(1, Ordering::SeqCst);
            return Self::reply("Rested.");
        }
        if lower.starts_with("stall") {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        if lower.contains("weather") {
            return ServiceReply::Json(json!({
                "response": {
                    "text": "It is 12 degrees in Oslo.",
                    "plugin_result": {"city": "Oslo", "temp": 12}
                }
            }));
        }
        Self::reply("Hello there!")
    }
}

#[async_trait]
impl AssistantTransport for FakeAssistant {
    async fn call(
        &self,
        request: &ServiceRequest,
        _token: Option<&str>,
    ) -> Result<ServiceReply, GatewayError> {
        match request {
            ServiceRequest::Health => {
                let status = if self.healthy { "healthy" } else { "starting" };
                Ok(ServiceReply::Json(json!({ "status": status })))
            }
            ServiceRequest::Login { .. } => {
                Ok(ServiceReply::Json(json!({"success": true, "token": "fake-token"})))
            }
            ServiceRequest::Query { text, .. } => {
                self.queries.fetch_add(1, Ordering::SeqCst);
                let remaining = self.failing_queries.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.failing_queries.store(remaining - 1, Ordering::SeqCst);
                    return Err(GatewayError::Transport {
                        message: "upstream unavailable".into(),
                        status: Some(503),
                    });
                }
                Ok(self.answer(text).await)
            }
            ServiceRequest::Action { name } => Ok(ServiceReply::Json(if name == "restart" {
                json!({"success": true, "action": "service_restarted"})
            } else {
                json!({"success": false, "error": format!("unknown action {name}")})
            })),
            ServiceRequest::Speech { .. } => Ok(ServiceReply::Bytes(vec![0u8; 64])),
            ServiceRequest::Memories => {
                let memories: Vec<Value> = self
                    .memories
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|m| json!({"content": m}))
                    .collect();
                Ok(ServiceReply::Json(Value::Array(memories)))
            }
            ServiceRequest::Plugins => Ok(ServiceReply::Json(json!({"plugins": ["weather"]}))),
        }
    }
}

fn config(artifacts: &std::path::Path) -> RunConfig {
    let mut config = RunConfig::default();
    config.runtime.step_timeout_ms = 2_000;
    config.runtime.grace_ms = 50;
    config.voice.artifacts_dir = artifacts.display().to_string();
    config.voice.keep_artifacts = false;
    config
}

fn gateway(fake: Arc<FakeAssistant>) -> Arc<ServiceGateway> {
    let credentials = Credentials {
        email: "qa@example.com".into(),
        password: "secret".into(),
    };
    Arc::new(
        ServiceGateway::new(fake, credentials).with_retry(
            RetryPolicy::none()
                .with_max_attempts(3)
                .with_initial_backoff(Duration::from_millis(1)),
        ),
    )
}

fn runner(fake: Arc<FakeAssistant>, artifacts: &std::path::Path) -> ScenarioRunner {
    ScenarioRunner::new(config(artifacts), gateway(fake))
}

fn says(message: &str, needle: &str) -> Step {
    Step::text(
        message,
        Expectation::new("answer").with_assertion(Assertion::contains(Target::AssistantText, needle)),
    )
}

#[tokio::test]
async fn single_greeting_step_passes_everything() {
    let dir = tempfile::tempdir().unwrap();
    let runner = runner(Arc::new(FakeAssistant::new()), dir.path());
    let scenario = Scenario::new("greeting").with_step(says("Hi!", "hello"));

    let report = runner.run(ScenarioSet::from_scenarios(vec![scenario])).await.unwrap();

    assert_eq!(report.pass_rate(), Some(1.0));
    assert_eq!(report.totals.skipped, 0);
    assert!(report.is_success());
    assert_eq!(report.scenarios[0].steps[0].verdict, Verdict::Pass);
}

#[tokio::test]
async fn later_step_observes_memory_from_earlier_step() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeAssistant::new());
    let runner = runner(Arc::clone(&fake), dir.path());
    let scenario = Scenario::new("memory")
        .with_step(says("remember oat milk", "remember oat milk"))
        .with_step(says("What do you remember?", "oat milk"))
        .with_step(says("What do you remember now?", "oat milk"));

    let report = runner.run(ScenarioSet::from_scenarios(vec![scenario])).await.unwrap();

    assert!(report.is_success(), "{:#?}", report.scenarios[0].steps);
    let memories = runner.gateway().memories().await.unwrap();
    assert_eq!(memories, vec![json!({"content": "oat milk"})]);
}

#[tokio::test]
async fn transient_failures_below_attempt_budget_still_pass() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeAssistant::failing(2));
    let runner = runner(Arc::clone(&fake), dir.path());
    let scenario = Scenario::new("flaky").with_step(says("Hi", "hello"));

    let report = runner.run(ScenarioSet::from_scenarios(vec![scenario])).await.unwrap();

    assert_eq!(report.scenarios[0].steps[0].verdict, Verdict::Pass);
    assert_eq!(fake.queries.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn exhausting_attempts_errors_the_step() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeAssistant::failing(3));
    let runner = runner(Arc::clone(&fake), dir.path());
    let scenario = Scenario::new("down")
        .with_step(says("Hi", "hello"))
        .with_step(says("Hi again", "hello"));

    let report = runner.run(ScenarioSet::from_scenarios(vec![scenario])).await.unwrap();
    let steps = &report.scenarios[0].steps;

    assert_eq!(steps[0].verdict, Verdict::Error);
    assert!(steps[0].error.as_deref().unwrap().contains("upstream unavailable"));
    assert_eq!(steps[1].verdict, Verdict::Pass, "scenario continues after a failed step");
    assert_eq!(fake.queries.load(Ordering::SeqCst), 4);
}

struct DownGrader;

#[async_trait]
impl LLMProvider for DownGrader {
    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        Err(LLMError::Status {
            status: 503,
            message: "model not loaded".into(),
        })
    }

    fn name(&self) -> &'static str {
        "down"
    }
}

struct GenerousGrader;

#[async_trait]
impl LLMProvider for GenerousGrader {
    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        Ok(CompletionResponse {
            message: ChatMessage::assistant(r#"{"score": 9, "comments": "clear answer"}"#),
            usage: None,
        })
    }

    fn name(&self) -> &'static str {
        "generous"
    }
}

fn graded_runner(provider: Arc<dyn LLMProvider>, dir: &std::path::Path) -> ScenarioRunner {
    let grader = SemanticGrader::new(provider, &GraderConfig::default()).unwrap();
    runner(Arc::new(FakeAssistant::new()), dir)
        .with_engine(AssertionEngine::new().with_grader(Arc::new(grader)))
}

fn semantic_scenario() -> Scenario {
    Scenario::new("weather")
        .with_step(says("Hi", "hello"))
        .with_step(Step::text(
            "What's the weather?",
            Expectation::new("weather").with_assertion(Assertion::semantic_ok()),
        ))
}

#[tokio::test]
async fn unreachable_grader_skips_and_is_excluded_from_pass_rate() {
    let dir = tempfile::tempdir().unwrap();
    let runner = graded_runner(Arc::new(DownGrader), dir.path());

    let report = runner
        .run(ScenarioSet::from_scenarios(vec![semantic_scenario()]))
        .await
        .unwrap();

    let steps = &report.scenarios[0].steps;
    assert_eq!(steps[1].verdict, Verdict::Skipped);
    assert_eq!(steps[1].assertions[0].verdict, Verdict::Skipped);
    assert_eq!(report.totals.skipped, 1);
    assert_eq!(report.pass_rate(), Some(1.0));
    assert!((report.skip_ratio() - 0.5).abs() < f64::EPSILON);
    assert!(!report.is_success());
}

#[tokio::test]
async fn reachable_grader_scores_the_reply() {
    let dir = tempfile::tempdir().unwrap();
    let runner = graded_runner(Arc::new(GenerousGrader), dir.path());

    let report = runner
        .run(ScenarioSet::from_scenarios(vec![semantic_scenario()]))
        .await
        .unwrap();

    let semantic = &report.scenarios[0].steps[1].assertions[0];
    assert_eq!(semantic.verdict, Verdict::Pass);
    assert_eq!(semantic.score, Some(9.0));
    assert!(report.is_success());
}

#[tokio::test]
async fn stalled_step_times_out_without_blocking_the_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let runner = runner(Arc::new(FakeAssistant::new()), dir.path());
    let scenario = Scenario::new("stall")
        .with_step(says("stall please", "hello").with_timeout(Duration::from_millis(150)))
        .with_step(says("Hi", "hello"));

    let started = Instant::now();
    let report = runner.run(ScenarioSet::from_scenarios(vec![scenario])).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    let steps = &report.scenarios[0].steps;
    assert_eq!(steps[0].verdict, Verdict::Timeout);
    assert_eq!(
        steps[0].timeout.map(|signal| signal.deadline),
        Some(Duration::from_millis(150))
    );
    assert_eq!(steps[1].verdict, Verdict::Pass);
    assert_eq!(report.totals.timeout, 1);
}

#[tokio::test]
async fn bounded_pool_runs_scenarios_in_parallel_and_keeps_order() {
    let dir = tempfile::tempdir().unwrap();
    let runner = runner(Arc::new(FakeAssistant::new()), dir.path());
    let scenarios: Vec<Scenario> = (0..4)
        .map(|i| Scenario::new(format!("nap-{i}")).with_step(says("nap time", "rested")))
        .collect();

    let started = Instant::now();
    let report = runner
        .run_with(ScenarioSet::from_scenarios(scenarios), Concurrency::Bounded(4))
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_millis(700), "{:?}", started.elapsed());
    let names: Vec<&str> = report.scenarios.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["nap-0", "nap-1", "nap-2", "nap-3"]);
    assert!(report.is_success());
}

#[tokio::test]
async fn bounded_pool_never_exceeds_its_limit() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeAssistant::new());
    let runner = runner(Arc::clone(&fake), dir.path());
    let scenarios: Vec<Scenario> = (0..4)
        .map(|i| Scenario::new(format!("nap-{i}")).with_step(says("nap time", "rested")))
        .collect();

    let started = Instant::now();
    let report = runner
        .run_with(ScenarioSet::from_scenarios(scenarios), Concurrency::Bounded(2))
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_millis(400), "{:?}", started.elapsed());
    assert_eq!(fake.most_napping.load(Ordering::SeqCst), 2);
    assert!(report.is_success());
}

#[tokio::test]
async fn sequential_runs_one_scenario_at_a_time() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeAssistant::new());
    let runner = runner(Arc::clone(&fake), dir.path());
    let scenarios: Vec<Scenario> = (0..2)
        .map(|i| Scenario::new(format!("nap-{i}")).with_step(says("nap time", "rested")))
        .collect();

    runner
        .run_with(ScenarioSet::from_scenarios(scenarios), Concurrency::Sequential)
        .await
        .unwrap();

    assert_eq!(fake.most_napping.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn configured_pause_separates_steps() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.runtime.between_steps_sleep_ms = 150;
    let runner = ScenarioRunner::new(config, gateway(Arc::new(FakeAssistant::new())));
    let scenario = Scenario::new("paced")
        .with_step(says("Hi", "hello"))
        .with_step(says("Hi", "hello"))
        .with_step(says("Hi", "hello"));

    let started = Instant::now();
    let report = runner.run(ScenarioSet::from_scenarios(vec![scenario])).await.unwrap();

    assert!(started.elapsed() >= Duration::from_millis(300), "{:?}", started.elapsed());
    assert!(report.is_success());
}

#[tokio::test]
async fn stop_on_failure_skips_remaining_steps() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.runtime.continue_on_failure = false;
    let fake = Arc::new(FakeAssistant::new());
    let runner = ScenarioRunner::new(config, gateway(Arc::clone(&fake)));
    let scenario = Scenario::new("strict")
        .with_step(says("Hi", "goodbye"))
        .with_step(says("Hi again", "hello"));

    let report = runner.run(ScenarioSet::from_scenarios(vec![scenario])).await.unwrap();
    let scenario = &report.scenarios[0];

    assert_eq!(scenario.steps.len(), 1);
    assert_eq!(scenario.steps[0].verdict, Verdict::Fail);
    assert_eq!(scenario.verdict, Verdict::Fail);
    assert_eq!(fake.queries.load(Ordering::SeqCst), 1);
}

struct FlakyAudit;

#[async_trait]
impl Hook for FlakyAudit {
    async fn after_step(
        &self,
        ctx: &pruefstand::StepContext<'_>,
        _report: &pruefstand::StepReport,
    ) -> Result<(), HookError> {
        if ctx.index == 0 {
            Err(HookError::new("audit", "audit sink offline"))
        } else {
            Ok(())
        }
    }
}

#[tokio::test]
async fn non_fatal_hook_failure_is_recorded_and_run_continues() {
    let dir = tempfile::tempdir().unwrap();
    let hooks = HookRegistry::new().with_hook("audit", Arc::new(FlakyAudit));
    let runner = runner(Arc::new(FakeAssistant::new()), dir.path()).with_hooks(hooks);
    let scenario = Scenario::new("audited")
        .with_step(says("Hi", "hello"))
        .with_step(says("Hi again", "hello"));

    let report = runner.run(ScenarioSet::from_scenarios(vec![scenario])).await.unwrap();
    let scenario = &report.scenarios[0];

    assert_eq!(scenario.steps.len(), 2);
    assert_eq!(scenario.verdict, Verdict::Pass);
    let failures = &scenario.steps[0].hook_failures;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].hook, "audit");
    assert_eq!(failures[0].phase, pruefstand::HookPhase::AfterStep);
    assert!(!failures[0].fatal);
    assert!(scenario.steps[1].hook_failures.is_empty());
}

struct BrokenSpeech;

#[async_trait]
impl SpeechSynthesizer for BrokenSpeech {
    async fn synthesize(
        &self,
        _text: &str,
        _voice: &VoiceSettings,
    ) -> Result<Vec<u8>, pruefstand::AudioError> {
        Err(pruefstand::AudioError::Synthesis("voice not installed".into()))
    }

    fn name(&self) -> &'static str {
        "broken"
    }
}

#[tokio::test]
async fn synthesis_failure_is_an_error_not_a_failure() {
    let dir = tempfile::tempdir().unwrap();
    let audio = AudioRoundTrip::new(
        Arc::new(BrokenSpeech),
        ArtifactStore::new(dir.path().join("audio")),
        VoiceSettings::from(&pruefstand::config::VoiceConfig::default()),
    );
    let fake = Arc::new(FakeAssistant::new());
    let runner = runner(Arc::clone(&fake), dir.path()).with_audio(audio);
    let scenario = Scenario::new("voice").with_step(Step::audio(
        "Hello there",
        Expectation::new("answer").with_assertion(Assertion::contains(Target::AssistantText, "hello")),
    ));

    let report = runner.run(ScenarioSet::from_scenarios(vec![scenario])).await.unwrap();
    let step = &report.scenarios[0].steps[0];

    assert_eq!(step.verdict, Verdict::Error);
    assert!(step.error.as_deref().unwrap().contains("voice not installed"));
    assert!(step.assertions.is_empty());
    assert_eq!(report.totals.error, 1);
    assert_eq!(report.totals.fail, 0);
    assert_eq!(fake.queries.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unhealthy_service_aborts_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let runner = runner(Arc::new(FakeAssistant::unhealthy()), dir.path());
    let scenario = Scenario::new("greeting").with_step(says("Hi", "hello"));

    let err = runner
        .run(ScenarioSet::from_scenarios(vec![scenario]))
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::ServiceUnavailable(_)));
}

#[tokio::test]
async fn duplicate_scenario_names_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let runner = runner(Arc::new(FakeAssistant::new()), dir.path());
    let scenarios = vec![
        Scenario::new("same").with_step(says("Hi", "hello")),
        Scenario::new("same").with_step(says("Hi", "hello")),
    ];

    let err = runner.run(ScenarioSet::from_scenarios(scenarios)).await.unwrap_err();
    assert!(matches!(err, RunError::DuplicateScenario(name) if name == "same"));
}

struct FailingSetup;

#[async_trait]
impl Hook for FailingSetup {
    async fn before_scenario(&self, scenario: &Scenario) -> Result<(), HookError> {
        if scenario.name() == "needs-fixture" {
            Err(HookError::new("fixture", "fixture service not reachable"))
        } else {
            Ok(())
        }
    }
}

#[tokio::test]
async fn fatal_setup_hook_aborts_only_its_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let mut hooks = HookRegistry::new();
    hooks.register_fatal("fixture", Arc::new(FailingSetup));
    let runner = runner(Arc::new(FakeAssistant::new()), dir.path()).with_hooks(hooks);

    let scenarios = vec![
        Scenario::new("needs-fixture").with_step(says("Hi", "hello")),
        Scenario::new("plain").with_step(says("Hi", "hello")),
    ];
    let report = runner.run(ScenarioSet::from_scenarios(scenarios)).await.unwrap();

    let aborted = report.scenario("needs-fixture").unwrap();
    assert_eq!(aborted.verdict, Verdict::Error);
    assert!(aborted.steps.is_empty());
    assert!(aborted.error.as_deref().unwrap().contains("fixture service not reachable"));
    assert_eq!(report.scenario("plain").unwrap().verdict, Verdict::Pass);
}

struct ToneSpeech;

#[async_trait]
impl SpeechSynthesizer for ToneSpeech {
    async fn synthesize(
        &self,
        _text: &str,
        _voice: &VoiceSettings,
    ) -> Result<Vec<u8>, pruefstand::AudioError> {
        Ok(vec![42u8; 128])
    }

    fn name(&self) -> &'static str {
        "tone"
    }
}

#[tokio::test]
async fn audio_and_action_steps_flow_through_the_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let artifacts = dir.path().join("audio");
    let audio = AudioRoundTrip::new(
        Arc::new(ToneSpeech),
        ArtifactStore::new(&artifacts),
        VoiceSettings::from(&pruefstand::config::VoiceConfig::default()),
    );
    let recorder = Arc::new(MemoryRecorder::new());
    let runner = runner(Arc::new(FakeAssistant::new()), dir.path())
        .with_audio(audio)
        .with_recorder(recorder.clone());

    let scenario = Scenario::new("Voice & actions")
        .with_step(Step::audio(
            "What's the weather in Oslo?",
            Expectation::new("weather")
                .with_assertion(Assertion::contains(Target::AssistantText, "12 degrees"))
                .with_assertion(Assertion::contains(Target::AssistantAudioPath, "voice___actions_0_"))
                .with_assertion(Assertion::jsonpath_eq(Target::PluginResult, "$.city", json!("Oslo"))),
        ))
        .with_step(Step::action(
            "restart",
            Expectation::new("service_restarted")
                .with_assertion(Assertion::effect_ok(Target::SideEffect, "service_restarted")),
        ))
        .with_step(Step::action(
            "teleport",
            Expectation::new("teleported")
                .with_assertion(Assertion::effect_ok(Target::SideEffect, "teleported")),
        ));

    let report = runner.run(ScenarioSet::from_scenarios(vec![scenario])).await.unwrap();
    let steps = &report.scenarios[0].steps;

    assert_eq!(steps[0].verdict, Verdict::Pass, "{:#?}", steps[0].assertions);
    let input_audio = steps[0].outcome.as_ref().unwrap().input_audio.as_ref().unwrap();
    assert_eq!(input_audio.size_bytes, 128);
    assert_eq!(steps[1].verdict, Verdict::Pass);
    assert_eq!(steps[2].verdict, Verdict::Fail);

    let records = recorder.records();
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].kind, "audio");
    assert_eq!(records[2].verdict, Verdict::Fail);
}
