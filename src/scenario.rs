use std::{
    collections::HashSet,
    fmt, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ScenarioError;

/// A named, ordered sequence of steps. Read-only once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub meta: ScenarioMeta,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioMeta {
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(flatten)]
    pub kind: StepKind,
    pub expect: Expectation,
    /// Overrides the run-wide step deadline for known-slow steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Text { message: String },
    Audio { tts_text: String },
    Action { action: String },
}

impl StepKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Audio { .. } => "audio",
            Self::Action { .. } => "action",
        }
    }

    pub fn payload(&self) -> &str {
        match self {
            Self::Text { message } => message,
            Self::Audio { tts_text } => tts_text,
            Self::Action { action } => action,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expectation {
    pub action: String,
    #[serde(default)]
    pub assertions: Vec<Assertion>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assertion {
    pub kind: AssertionKind,
    #[serde(default)]
    pub target: Target,
    /// Needle for `contains`, expected value for `jsonpath_eq`, threshold
    /// override for `semantic_ok`, effect name for `effect_ok`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rubric: Option<String>,
}

impl Assertion {
    pub fn new(kind: AssertionKind, target: Target) -> Self {
        Self {
            kind,
            target,
            value: None,
            path: None,
            rubric: None,
        }
    }

    pub fn contains(target: Target, needle: impl Into<String>) -> Self {
        Self::new(AssertionKind::Contains, target).with_value(Value::String(needle.into()))
    }

    pub fn jsonpath_eq(target: Target, path: impl Into<String>, expected: Value) -> Self {
        let mut assertion = Self::new(AssertionKind::JsonpathEq, target).with_value(expected);
        assertion.path = Some(path.into());
        assertion
    }

    pub fn semantic_ok() -> Self {
        Self::new(AssertionKind::SemanticOk, Target::AssistantText)
    }

    pub fn effect_ok(target: Target, effect: impl Into<String>) -> Self {
        Self::new(AssertionKind::EffectOk, target).with_value(Value::String(effect.into()))
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_rubric(mut self, rubric: impl Into<String>) -> Self {
        self.rubric = Some(rubric.into());
        self
    }

    pub fn value_str(&self) -> Option<&str> {
        self.value.as_ref().and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssertionKind {
    Contains,
    SemanticOk,
    EffectOk,
    JsonpathEq,
}

impl fmt::Display for AssertionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Contains => "contains",
            Self::SemanticOk => "semantic_ok",
            Self::EffectOk => "effect_ok",
            Self::JsonpathEq => "jsonpath_eq",
        };
        f.write_str(name)
    }
}

/// Which field of an outcome an assertion inspects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    #[default]
    AssistantText,
    AssistantAudioPath,
    PluginResult,
    SideEffect,
    RawResponse,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AssistantText => "assistant_text",
            Self::AssistantAudioPath => "assistant_audio_path",
            Self::PluginResult => "plugin_result",
            Self::SideEffect => "side_effect",
            Self::RawResponse => "raw_response",
        };
        f.write_str(name)
    }
}

impl Step {
    pub fn text(message: impl Into<String>, expect: Expectation) -> Self {
        Self {
            kind: StepKind::Text {
                message: message.into(),
            },
            expect,
            timeout_ms: None,
        }
    }

    pub fn audio(tts_text: impl Into<String>, expect: Expectation) -> Self {
        Self {
            kind: StepKind::Audio {
                tts_text: tts_text.into(),
            },
            expect,
            timeout_ms: None,
        }
    }

    pub fn action(action: impl Into<String>, expect: Expectation) -> Self {
        Self {
            kind: StepKind::Action {
                action: action.into(),
            },
            expect,
            timeout_ms: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

impl Expectation {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            assertions: Vec::new(),
        }
    }

    pub fn with_assertion(mut self, assertion: Assertion) -> Self {
        self.assertions.push(assertion);
        self
    }
}

impl Scenario {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            meta: ScenarioMeta {
                name: name.into(),
                tags: Vec::new(),
            },
            steps: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.meta.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ScenarioError> {
        let scenario: Scenario = serde_yaml::from_str(raw)?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ScenarioError> {
        let scenario: Scenario = serde_json::from_str(raw)?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn validate(&self) -> Result<(), ScenarioError> {
        let invalid = |message: String| ScenarioError::Invalid {
            scenario: self.meta.name.clone(),
            message,
        };

        if self.meta.name.trim().is_empty() {
            return Err(invalid("meta.name must not be empty".to_string()));
        }
        if self.steps.is_empty() {
            return Err(invalid("scenario has no steps".to_string()));
        }
        for (index, step) in self.steps.iter().enumerate() {
            if step.kind.payload().trim().is_empty() {
                return Err(invalid(format!(
                    "step {index} ({}) has an empty payload",
                    step.kind.label()
                )));
            }
            if step.timeout_ms == Some(0) {
                return Err(invalid(format!("step {index} has a zero timeout")));
            }
            for assertion in &step.expect.assertions {
                match assertion.kind {
                    AssertionKind::Contains if assertion.value_str().is_none() => {
                        return Err(invalid(format!(
                            "step {index}: `contains` needs a string value"
                        )));
                    }
                    AssertionKind::JsonpathEq if assertion.path.is_none() => {
                        return Err(invalid(format!("step {index}: `jsonpath_eq` needs a path")));
                    }
                    AssertionKind::EffectOk if assertion.value_str().is_none() => {
                        return Err(invalid(format!(
                            "step {index}: `effect_ok` needs an effect name as value"
                        )));
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

/// A scenario file that could not be loaded. Only that scenario is lost.
#[derive(Debug)]
pub struct LoadFailure {
    pub path: PathBuf,
    pub error: ScenarioError,
}

#[derive(Debug, Default)]
pub struct ScenarioSet {
    pub scenarios: Vec<Scenario>,
    pub failures: Vec<LoadFailure>,
}

impl ScenarioSet {
    pub fn from_scenarios(scenarios: Vec<Scenario>) -> Self {
        Self {
            scenarios,
            failures: Vec::new(),
        }
    }

    /// First scenario name that appears more than once, if any.
    pub fn duplicate_name(&self) -> Option<&str> {
        let mut seen = HashSet::new();
        self.scenarios
            .iter()
            .map(Scenario::name)
            .find(|name| !seen.insert(*name))
    }

    /// Keeps scenarios whose name contains one of `filters`. Load failures
    /// have no name, so they are kept only when their file name matches.
    pub fn retain_names(&mut self, filters: &[String]) {
        if filters.is_empty() {
            return;
        }
        let wanted = |text: &str| filters.iter().any(|filter| text.contains(filter.as_str()));
        self.scenarios.retain(|scenario| wanted(scenario.name()));
        self.failures.retain(|failure| {
            failure
                .path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .map_or(false, |stem| wanted(stem))
        });
    }

    pub fn len(&self) -> usize {
        self.scenarios.len() + self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Loads a single scenario file or every `yaml`/`yml`/`json` file in a directory.
pub fn load_scenarios(path: impl AsRef<Path>) -> Result<ScenarioSet, ScenarioError> {
    let path = path.as_ref();
    let io_err = |source| ScenarioError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut files = Vec::new();
    if path.is_dir() {
        for entry in fs::read_dir(path).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            let p = entry.path();
            let ext = p.extension().and_then(|s| s.to_str()).unwrap_or("");
            if matches!(ext, "yaml" | "yml" | "json") {
                files.push(p);
            }
        }
        files.sort();
    } else {
        files.push(path.to_path_buf());
    }

    let mut set = ScenarioSet::default();
    for file in files {
        match load_scenario_file(&file) {
            Ok(scenario) => set.scenarios.push(scenario),
            Err(error) => set.failures.push(LoadFailure { path: file, error }),
        }
    }
    Ok(set)
}

pub fn load_scenario_file(path: &Path) -> Result<Scenario, ScenarioError> {
    let raw = fs::read_to_string(path).map_err(|source| ScenarioError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    match path.extension().and_then(|s| s.to_str()) {
        Some("json") => Scenario::from_json_str(&raw),
        _ => Scenario::from_yaml_str(&raw),
    }
}
