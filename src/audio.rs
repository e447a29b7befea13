use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{
    multipart::{Form, Part},
    Client, RequestBuilder, StatusCode,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::{
    config::{SpeechBackend, VoiceConfig},
    error::AudioError,
    gateway::{retry::is_transient_status, RetryPolicy, ServiceGateway},
    outcome::AudioArtifact,
};

/// Voice parameters passed to every synthesis call.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceSettings {
    pub model: String,
    pub voice: String,
    pub format: String,
    pub sample_rate: u32,
}

impl From<&VoiceConfig> for VoiceSettings {
    fn from(config: &VoiceConfig) -> Self {
        Self {
            model: config.tts_model.clone(),
            voice: config.tts_voice.clone(),
            format: config.output_format.clone(),
            sample_rate: config.sample_rate,
        }
    }
}

impl VoiceSettings {
    pub fn mime_type(&self) -> &'static str {
        match self.format.as_str() {
            "opus" | "ogg" => "audio/ogg",
            "mp3" => "audio/mpeg",
            "wav" => "audio/wav",
            "flac" => "audio/flac",
            "aac" => "audio/aac",
            _ => "application/octet-stream",
        }
    }
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &VoiceSettings) -> Result<Vec<u8>, AudioError>;

    fn name(&self) -> &'static str;
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &AudioArtifact) -> Result<String, AudioError>;
}

/// Client for an OpenAI-compatible `audio/*` API. Transient failures are
/// retried under the configured policy.
#[derive(Debug, Clone)]
pub struct OpenAIAudio {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    retry: RetryPolicy,
}

impl OpenAIAudio {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, AudioError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| AudioError::Synthesis(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key,
            retry: RetryPolicy::none(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn with_default_headers(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.api_key {
            Some(ref key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn speech_once(&self, text: &str, voice: &VoiceSettings) -> Result<Vec<u8>, AudioError> {
        let body = json!({
            "model": voice.model,
            "input": text,
            "voice": voice.voice,
            "response_format": voice.format,
        });
        let response = self
            .with_default_headers(self.client.post(self.endpoint("audio/speech")))
            .json(&body)
            .send()
            .await
            .map_err(|err| request_failure(err, AudioError::Synthesis))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_failure(status, text, AudioError::Synthesis));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|err| request_failure(err, AudioError::Synthesis))?;
        Ok(bytes.to_vec())
    }

    async fn transcription_once(
        &self,
        bytes: Vec<u8>,
        file_name: String,
        model: &str,
    ) -> Result<String, AudioError> {
        let part = Part::bytes(bytes).file_name(file_name);
        let form = Form::new().part("file", part).text("model", model.to_string());

        let response = self
            .with_default_headers(self.client.post(self.endpoint("audio/transcriptions")))
            .multipart(form)
            .send()
            .await
            .map_err(|err| request_failure(err, AudioError::Transcription))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_failure(status, text, AudioError::Transcription));
        }
        let parsed: TranscriptionResponse = response
            .json()
            .await
            .map_err(|err| AudioError::Transcription(err.to_string()))?;
        Ok(parsed.text)
    }
}

fn request_failure(err: reqwest::Error, permanent: fn(String) -> AudioError) -> AudioError {
    if err.is_connect() || err.is_timeout() {
        AudioError::Unavailable(err.to_string())
    } else {
        permanent(err.to_string())
    }
}

fn status_failure(status: StatusCode, body: String, permanent: fn(String) -> AudioError) -> AudioError {
    let message = format!("HTTP {status}: {body}");
    if is_transient_status(status.as_u16()) {
        AudioError::Unavailable(message)
    } else {
        permanent(message)
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAIAudio {
    async fn synthesize(&self, text: &str, voice: &VoiceSettings) -> Result<Vec<u8>, AudioError> {
        self.retry
            .run("speech", AudioError::is_transient, move || self.speech_once(text, voice))
            .await
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// Speech-to-text over the multipart `audio/transcriptions` endpoint.
#[derive(Debug, Clone)]
pub struct OpenAITranscriber {
    audio: OpenAIAudio,
    model: String,
}

impl OpenAITranscriber {
    pub fn new(audio: OpenAIAudio, model: impl Into<String>) -> Self {
        Self {
            audio,
            model: model.into(),
        }
    }
}

#[async_trait]
impl Transcriber for OpenAITranscriber {
    async fn transcribe(&self, audio: &AudioArtifact) -> Result<String, AudioError> {
        let bytes = tokio::fs::read(&audio.path)
            .await
            .map_err(|source| AudioError::Artifact {
                path: audio.path.clone(),
                source,
            })?;
        let file_name = audio
            .path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("input")
            .to_string();

        let client = &self.audio;
        let model = self.model.as_str();
        client
            .retry
            .run("transcription", AudioError::is_transient, || {
                client.transcription_once(bytes.clone(), file_name.clone(), model)
            })
            .await
    }
}

/// Synthesis through the assistant service's own TTS endpoint.
pub struct ServiceSpeech {
    gateway: Arc<ServiceGateway>,
}

impl ServiceSpeech {
    pub fn new(gateway: Arc<ServiceGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl SpeechSynthesizer for ServiceSpeech {
    async fn synthesize(&self, text: &str, voice: &VoiceSettings) -> Result<Vec<u8>, AudioError> {
        self.gateway
            .synthesize_speech(text, &voice.voice, &voice.format, &voice.model)
            .await
            .map_err(|err| AudioError::Synthesis(err.to_string()))
    }

    fn name(&self) -> &'static str {
        "service"
    }
}

/// Names, writes and removes audio artifacts under one directory.
#[derive(Debug)]
pub struct ArtifactStore {
    dir: PathBuf,
    created: Mutex<Vec<PathBuf>>,
    sequence: AtomicU64,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            created: Mutex::new(Vec::new()),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<scenario>_<step>_<unix-ms>_<seq>.<format>` with the scenario name
    /// slugified. `seq` counts per store, so names never repeat within a run.
    pub fn artifact_path(&self, scenario: &str, step: usize, format: &str) -> PathBuf {
        let millis = Utc::now().timestamp_millis();
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.dir
            .join(format!("{}_{step}_{millis}_{seq}.{format}", slugify(scenario)))
    }

    pub async fn persist(
        &self,
        scenario: &str,
        step: usize,
        bytes: &[u8],
        voice: &VoiceSettings,
    ) -> Result<AudioArtifact, AudioError> {
        let artifact_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| AudioError::Artifact { path, source }
        };
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(artifact_err(&self.dir))?;

        let path = self.artifact_path(scenario, step, &voice.format);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(artifact_err(&path))?;
        self.created
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(path.clone());

        Ok(AudioArtifact {
            path,
            format: voice.format.clone(),
            sample_rate: voice.sample_rate,
            size_bytes: bytes.len(),
        })
    }

    /// Deletes every artifact this store wrote. Returns how many were removed.
    pub async fn cleanup(&self) -> usize {
        let paths: Vec<PathBuf> = self
            .created
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();

        let mut removed = 0;
        for path in paths {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(err) => warn!(path = %path.display(), error = %err, "failed to remove audio artifact"),
            }
        }
        removed
    }
}

fn slugify(name: &str) -> String {
    let slug: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    let slug = slug.trim_matches('_');
    if slug.is_empty() {
        "scenario".to_string()
    } else {
        slug.to_string()
    }
}

/// Sequences an audio step: synthesize, persist, then turn the audio back into
/// the text that is forwarded as a query.
pub struct AudioRoundTrip {
    synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
    transcriber: Option<Arc<dyn Transcriber>>,
    store: ArtifactStore,
    voice: VoiceSettings,
    keep_artifacts: bool,
}

impl AudioRoundTrip {
    pub fn new(synthesizer: Arc<dyn SpeechSynthesizer>, store: ArtifactStore, voice: VoiceSettings) -> Self {
        Self {
            synthesizer: Some(synthesizer),
            transcriber: None,
            store,
            voice,
            keep_artifacts: true,
        }
    }

    /// Audio steps error with `NotConfigured`.
    pub fn disabled(store: ArtifactStore, voice: VoiceSettings) -> Self {
        Self {
            synthesizer: None,
            transcriber: None,
            store,
            voice,
            keep_artifacts: true,
        }
    }

    /// `retry` applies to the OpenAI-compatible backend; the service backend
    /// retries inside the gateway.
    pub fn from_config(
        config: &VoiceConfig,
        gateway: Arc<ServiceGateway>,
        retry: RetryPolicy,
    ) -> Result<Self, AudioError> {
        let store = ArtifactStore::new(&config.artifacts_dir);
        let voice = VoiceSettings::from(config);
        let openai = match config.api_key {
            Some(ref key) => Some(
                OpenAIAudio::new(config.base_url.clone(), Some(key.clone()), Duration::from_secs(60))?
                    .with_retry(retry),
            ),
            None => None,
        };

        let mut round_trip = match (config.backend, &openai) {
            (SpeechBackend::Service, _) => Self::new(Arc::new(ServiceSpeech::new(gateway)), store, voice),
            (SpeechBackend::Openai, Some(audio)) => Self::new(Arc::new(audio.clone()), store, voice),
            (SpeechBackend::Openai, None) => {
                warn!("voice.backend is openai but voice.api_key is unset; audio steps will error");
                Self::disabled(store, voice)
            }
        };
        if let (Some(model), Some(audio)) = (&config.transcription_model, openai) {
            round_trip = round_trip.with_transcriber(Arc::new(OpenAITranscriber::new(audio, model.clone())));
        }
        Ok(round_trip.keep_artifacts(config.keep_artifacts))
    }

    pub fn with_transcriber(mut self, transcriber: Arc<dyn Transcriber>) -> Self {
        self.transcriber = Some(transcriber);
        self
    }

    pub fn keep_artifacts(mut self, keep: bool) -> Self {
        self.keep_artifacts = keep;
        self
    }

    pub fn voice(&self) -> &VoiceSettings {
        &self.voice
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub async fn synthesize(&self, scenario: &str, step: usize, text: &str) -> Result<AudioArtifact, AudioError> {
        let synthesizer = self.synthesizer.as_ref().ok_or(AudioError::NotConfigured)?;
        let bytes = synthesizer.synthesize(text, &self.voice).await?;
        if bytes.is_empty() {
            return Err(AudioError::Synthesis(format!(
                "{} returned no audio",
                synthesizer.name()
            )));
        }
        let artifact = self.store.persist(scenario, step, &bytes, &self.voice).await?;
        debug!(
            path = %artifact.path.display(),
            bytes = artifact.size_bytes,
            synthesizer = synthesizer.name(),
            "synthesized step audio"
        );
        Ok(artifact)
    }

    /// Text to forward as the query. Without a transcriber the source text is
    /// used unchanged.
    pub async fn submit_for_transcription(
        &self,
        artifact: &AudioArtifact,
        source_text: &str,
    ) -> Result<String, AudioError> {
        match &self.transcriber {
            Some(transcriber) => transcriber.transcribe(artifact).await,
            None => Ok(source_text.to_string()),
        }
    }

    /// Removes generated artifacts unless they are configured to be kept.
    pub async fn cleanup(&self) -> usize {
        if self.keep_artifacts {
            return 0;
        }
        self.store.cleanup().await
    }
}
