pub mod assertions;
pub mod audio;
pub mod config;
pub mod error;
pub mod gateway;
pub mod grader;
pub mod hooks;
pub mod outcome;
pub mod providers;
pub mod report;
pub mod runlog;
pub mod runner;
pub mod scenario;
pub mod timeout;
pub mod types;
pub mod verdict;

pub use assertions::{AssertionEngine, EffectChecker, EffectRegistry, ResultFlagEffect};
pub use audio::{AudioRoundTrip, SpeechSynthesizer, Transcriber, VoiceSettings};
pub use config::RunConfig;
pub use error::{
    AudioError, ConfigError, EffectError, GatewayError, GraderError, HookError, LLMError, RunError,
    ScenarioError, StepError,
};
pub use gateway::{
    AssistantTransport, Credentials, HttpTransport, RetryPolicy, ServiceGateway, ServiceReply,
    ServiceRequest, ServiceResponse,
};
pub use grader::{Grade, RubricContext, SemanticGrader};
pub use hooks::{Hook, HookFailure, HookPhase, HookRegistry, StepContext};
pub use outcome::{AudioArtifact, Outcome, StepInput};
pub use providers::LLMProvider;
pub use report::{ResultAggregator, RunReport, ScenarioReport, StepReport, VerdictCounts};
pub use runlog::{JsonlRecorder, MemoryRecorder, StepRecord, StepRecorder};
pub use runner::{Concurrency, ScenarioRunner};
pub use scenario::{
    load_scenarios, Assertion, AssertionKind, Expectation, Scenario, ScenarioSet, Step, StepKind,
    Target,
};
pub use timeout::{CancelSignal, TimeoutGuard, TimeoutSignal};
pub use types::{ChatMessage, CompletionRequest, CompletionResponse, MessageRole};
pub use verdict::{AssertionVerdict, Verdict};
