use std::{path::PathBuf, time::Duration};

use serde::Serialize;
use serde_json::Value;

use crate::scenario::Target;

/// What the runner sent for a step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepInput {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_path: Option<PathBuf>,
}

/// Reference to an audio file produced or received during a step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioArtifact {
    pub path: PathBuf,
    pub format: String,
    pub sample_rate: u32,
    pub size_bytes: usize,
}

/// Captured result of executing one step. Produced once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome {
    pub input: StepInput,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin_result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub side_effect: Option<Value>,
    pub raw: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio: Option<AudioArtifact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio: Option<AudioArtifact>,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

/// A resolved assertion target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Selected<'a> {
    Text(&'a str),
    Json(&'a Value),
}

impl Selected<'_> {
    /// Text view used by substring checks; structured values are rendered as JSON.
    pub fn as_text(&self) -> String {
        match self {
            Selected::Text(text) => (*text).to_string(),
            Selected::Json(Value::String(text)) => text.clone(),
            Selected::Json(value) => value.to_string(),
        }
    }

    /// Structured view used by path lookups; plain text is parsed as JSON when it can be.
    pub fn as_json(&self) -> Value {
        match self {
            Selected::Text(text) => {
                serde_json::from_str(text).unwrap_or_else(|_| Value::String((*text).to_string()))
            }
            Selected::Json(value) => (*value).clone(),
        }
    }
}

impl Outcome {
    pub fn new(input: StepInput, raw: Value, elapsed: Duration) -> Self {
        Self {
            input,
            assistant_text: None,
            plugin_result: None,
            side_effect: None,
            raw,
            input_audio: None,
            output_audio: None,
            elapsed,
        }
    }

    /// Returns `None` when the outcome does not carry the requested field.
    pub fn select(&self, target: Target) -> Option<Selected<'_>> {
        match target {
            Target::AssistantText => self.assistant_text.as_deref().map(Selected::Text),
            Target::AssistantAudioPath => self
                .output_audio
                .as_ref()
                .or(self.input_audio.as_ref())
                .and_then(|artifact| artifact.path.to_str())
                .map(Selected::Text),
            Target::PluginResult => self.plugin_result.as_ref().map(Selected::Json),
            Target::SideEffect => self.side_effect.as_ref().map(Selected::Json),
            Target::RawResponse => (!self.raw.is_null()).then_some(Selected::Json(&self.raw)),
        }
    }
}

pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }
}
