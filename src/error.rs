use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LLMError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("provider returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("invalid response from provider: {0}")]
    InvalidResponse(&'static str),
}

impl LLMError {
    /// Connection failures, timeouts, 408/429 and 5xx are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(err) => !err.is_decode() && (err.is_connect() || err.is_timeout() || err.is_request()),
            Self::Status { status, .. } => crate::gateway::retry::is_transient_status(*status),
            _ => false,
        }
    }
}

/// Failures talking to the assistant service under test.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("transport error: {message}")]
    Transport { message: String, status: Option<u16> },

    #[error("session expired")]
    AuthExpired,

    #[error("request rejected with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("invalid response from service: {0}")]
    InvalidResponse(String),
}

impl GatewayError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            status: None,
        }
    }

    /// Connection resets, timeouts, 5xx and 429 are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return Self::InvalidResponse(err.to_string());
        }
        Self::Transport {
            message: err.to_string(),
            status: err.status().map(|s| s.as_u16()),
        }
    }
}

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("speech synthesis failed: {0}")]
    Synthesis(String),

    #[error("transcription failed: {0}")]
    Transcription(String),

    #[error("audio artifact io error ({path}): {source}")]
    Artifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("speech synthesis is not configured")]
    NotConfigured,

    #[error("audio service unavailable: {0}")]
    Unavailable(String),
}

impl AudioError {
    /// Connection failures, timeouts, 408/429 and 5xx from an audio API.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

#[derive(Debug, Error)]
pub enum GraderError {
    #[error("grader unavailable: {0}")]
    Unavailable(String),

    #[error("invalid grader response: {0}")]
    InvalidResponse(String),

    #[error("grader prompt template error: {0}")]
    Template(String),
}

impl From<LLMError> for GraderError {
    fn from(err: LLMError) -> Self {
        match err {
            LLMError::Http(err) if err.is_decode() => Self::InvalidResponse(err.to_string()),
            LLMError::Http(err) => Self::Unavailable(err.to_string()),
            LLMError::Status { status, message } if status >= 500 || status == 429 => {
                Self::Unavailable(format!("HTTP {status}: {message}"))
            }
            other => Self::InvalidResponse(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("failed to read scenario {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse scenario yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to parse scenario json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid scenario `{scenario}`: {message}")]
    Invalid { scenario: String, message: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("environment variable {0} referenced by config is not set")]
    MissingEnv(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
#[error("hook `{hook}` failed: {message}")]
pub struct HookError {
    pub hook: String,
    pub message: String,
}

impl HookError {
    pub fn new(hook: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            hook: hook.into(),
            message: message.into(),
        }
    }
}

/// Errors that abort a whole run. Everything below run level becomes a verdict.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("assistant service is unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("scenario name `{0}` is used more than once in this run")]
    DuplicateScenario(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to set up run: {0}")]
    Setup(String),
}

/// Why a step produced no outcome.
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error("step cancelled at its deadline")]
    Cancelled,
}

/// An effect oracle could not decide whether its effect happened.
#[derive(Debug, Error)]
#[error("effect check `{effect}` failed: {message}")]
pub struct EffectError {
    pub effect: String,
    pub message: String,
}

impl EffectError {
    pub fn new(effect: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            effect: effect.into(),
            message: message.into(),
        }
    }
}
