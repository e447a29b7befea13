use std::{env, fmt::Display, fs, path::Path, str::FromStr, time::Duration};

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::ConfigError;

static RE_ENV_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env reference regex"));

const REDACTED: &str = "***";

/// Run-wide configuration, built once at run start and passed down by reference.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub service: ServiceConfig,
    pub voice: VoiceConfig,
    pub grader: GraderConfig,
    pub retry: RetryConfig,
    pub runtime: RuntimeConfig,
    pub report: ReportConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub email: String,
    pub password: String,
    #[serde(deserialize_with = "scalar")]
    pub request_timeout_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8001".to_string(),
            api_key: None,
            email: "test@example.com".to_string(),
            password: "test123".to_string(),
            request_timeout_ms: 60_000,
        }
    }
}

/// Where synthesized speech for audio steps comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeechBackend {
    /// The assistant service's own TTS streaming endpoint.
    #[default]
    Service,
    /// An OpenAI-compatible `audio/speech` endpoint.
    Openai,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub backend: SpeechBackend,
    pub base_url: String,
    pub api_key: Option<String>,
    pub tts_model: String,
    pub tts_voice: String,
    pub output_format: String,
    #[serde(deserialize_with = "scalar")]
    pub sample_rate: u32,
    pub transcription_model: Option<String>,
    pub artifacts_dir: String,
    #[serde(deserialize_with = "scalar")]
    pub keep_artifacts: bool,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            backend: SpeechBackend::Service,
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            tts_model: "tts-1".to_string(),
            tts_voice: "alloy".to_string(),
            output_format: "opus".to_string(),
            sample_rate: 24_000,
            transcription_model: None,
            artifacts_dir: "results/artifacts".to_string(),
            keep_artifacts: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraderConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    #[serde(deserialize_with = "scalar")]
    pub max_tokens: u32,
    #[serde(deserialize_with = "scalar")]
    pub temperature: f32,
    /// Minimum score on the 0-10 scale for `semantic_ok` to pass.
    #[serde(deserialize_with = "scalar")]
    pub threshold: f64,
    #[serde(deserialize_with = "scalar")]
    pub timeout_ms: u64,
    /// Ask the model for a JSON object reply (`response_format`). Off by
    /// default since some local servers reject the option.
    #[serde(deserialize_with = "scalar")]
    pub json_mode: bool,
}

impl Default for GraderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:1234/v1".to_string(),
            api_key: None,
            model: "gpt-oss-20b".to_string(),
            max_tokens: 512,
            temperature: 0.1,
            threshold: 8.0,
            timeout_ms: 30_000,
            json_mode: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    #[serde(deserialize_with = "scalar")]
    pub max_attempts: u32,
    #[serde(deserialize_with = "scalar")]
    pub initial_backoff_ms: u64,
    #[serde(deserialize_with = "scalar")]
    pub multiplier: f64,
    #[serde(deserialize_with = "scalar")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            multiplier: 2.0,
            max_backoff_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    #[serde(deserialize_with = "scalar")]
    pub step_timeout_ms: u64,
    #[serde(deserialize_with = "scalar")]
    pub grace_ms: u64,
    #[serde(deserialize_with = "scalar")]
    pub between_steps_sleep_ms: u64,
    /// 1 runs scenarios strictly one after another.
    #[serde(deserialize_with = "scalar")]
    pub concurrency: usize,
    #[serde(deserialize_with = "scalar")]
    pub continue_on_failure: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            step_timeout_ms: 45_000,
            grace_ms: 250,
            between_steps_sleep_ms: 0,
            concurrency: 1,
            continue_on_failure: true,
        }
    }
}

impl RuntimeConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn between_steps(&self) -> Duration {
        Duration::from_millis(self.between_steps_sleep_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub run_log_dir: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            run_log_dir: "results/logs".to_string(),
        }
    }
}

impl RunConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let mut value: serde_yaml::Value = serde_yaml::from_str(raw)?;
        if value.is_null() {
            value = serde_yaml::Value::Mapping(Default::default());
        }
        substitute_env(&mut value)?;
        let config: RunConfig = serde_yaml::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("service.base_url must not be empty".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid("retry.multiplier must be >= 1.0".into()));
        }
        if !(0.0..=10.0).contains(&self.grader.threshold) {
            return Err(ConfigError::Invalid("grader.threshold must be within 0..=10".into()));
        }
        if self.runtime.concurrency == 0 {
            return Err(ConfigError::Invalid("runtime.concurrency must be at least 1".into()));
        }
        if self.runtime.step_timeout_ms == 0 {
            return Err(ConfigError::Invalid("runtime.step_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    /// Serializable copy for the run report with credentials masked.
    pub fn snapshot(&self) -> Value {
        let mut redacted = self.clone();
        if redacted.service.api_key.is_some() {
            redacted.service.api_key = Some(REDACTED.to_string());
        }
        redacted.service.password = REDACTED.to_string();
        if redacted.voice.api_key.is_some() {
            redacted.voice.api_key = Some(REDACTED.to_string());
        }
        if redacted.grader.api_key.is_some() {
            redacted.grader.api_key = Some(REDACTED.to_string());
        }
        serde_json::to_value(redacted).unwrap_or(Value::Null)
    }
}

/// Numbers and flags also accept their string form, so `${VAR}` references
/// work in non-string fields.
fn scalar<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + FromStr,
    T::Err: Display,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar<T> {
        Value(T),
        Text(String),
    }

    match Scalar::<T>::deserialize(deserializer)? {
        Scalar::Value(value) => Ok(value),
        Scalar::Text(text) => text
            .trim()
            .parse()
            .map_err(|err| de::Error::custom(format!("`{text}`: {err}"))),
    }
}

fn substitute_env(value: &mut serde_yaml::Value) -> Result<(), ConfigError> {
    match value {
        serde_yaml::Value::String(text) => {
            if !RE_ENV_REF.is_match(text) {
                return Ok(());
            }
            let mut missing = None;
            let replaced = RE_ENV_REF.replace_all(text, |caps: &Captures<'_>| {
                match env::var(&caps[1]) {
                    Ok(val) => val,
                    Err(_) => {
                        missing.get_or_insert_with(|| caps[1].to_string());
                        String::new()
                    }
                }
            });
            if let Some(name) = missing {
                return Err(ConfigError::MissingEnv(name));
            }
            *text = replaced.into_owned();
            Ok(())
        }
        serde_yaml::Value::Sequence(items) => items.iter_mut().try_for_each(substitute_env),
        serde_yaml::Value::Mapping(map) => map.iter_mut().try_for_each(|(_, v)| substitute_env(v)),
        _ => Ok(()),
    }
}
