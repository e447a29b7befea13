use std::{sync::Arc, time::Duration};

use handlebars::Handlebars;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    config::GraderConfig,
    error::{GraderError, LLMError},
    gateway::RetryPolicy,
    providers::{
        openai::{OpenAI, OpenAIConfig},
        LLMProvider,
    },
    types::{ChatMessage, CompletionRequest},
};

static RE_SCORE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:score|grade|ocena)[^0-9\n]{0,20}(\d+(?:[.,]\d+)?)")
        .expect("valid score regex")
});

const SYSTEM_TEMPLATE: &str = "system";
const USER_TEMPLATE: &str = "user";

const SYSTEM_PROMPT: &str = "You grade replies of a voice assistant. \
Judge whether the reply answers the user sensibly, stays on topic and matches the expected action. \
Answer with a single JSON object: {\"score\": <number 0-10>, \"comments\": \"<one sentence>\"}.";

const USER_PROMPT: &str = r#"User input:
{{user_input}}

Assistant reply:
{{candidate}}
{{#if expected_action}}
Expected action: {{expected_action}}
{{/if}}
{{#if rubric}}
Grading notes:
{{rubric}}
{{/if}}
Metadata:
{{metadata}}
"#;

/// What the grader is told besides the candidate text.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RubricContext {
    pub user_input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rubric: Option<String>,
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Grade {
    /// Always within `[0, 10]`.
    pub score: f64,
    pub comments: Option<String>,
}

#[derive(Serialize)]
struct PromptData<'a> {
    candidate: &'a str,
    user_input: &'a str,
    expected_action: Option<&'a str>,
    rubric: Option<&'a str>,
    metadata: String,
}

/// Scores assistant replies through a chat-completion model. Transient
/// provider failures are retried; the whole grading call, retries included,
/// is bounded by its own deadline.
pub struct SemanticGrader {
    provider: Arc<dyn LLMProvider>,
    model: String,
    max_tokens: u32,
    temperature: f32,
    threshold: f64,
    timeout: Duration,
    json_mode: bool,
    retry: RetryPolicy,
    templates: Handlebars<'static>,
}

impl SemanticGrader {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &GraderConfig) -> Result<Self, GraderError> {
        let mut templates = Handlebars::new();
        templates.register_escape_fn(handlebars::no_escape);
        templates
            .register_template_string(SYSTEM_TEMPLATE, SYSTEM_PROMPT)
            .map_err(|err| GraderError::Template(err.to_string()))?;
        templates
            .register_template_string(USER_TEMPLATE, USER_PROMPT)
            .map_err(|err| GraderError::Template(err.to_string()))?;

        Ok(Self {
            provider,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            threshold: config.threshold,
            timeout: Duration::from_millis(config.timeout_ms),
            json_mode: config.json_mode,
            retry: RetryPolicy::none(),
            templates,
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Grader backed by an OpenAI-compatible endpoint (LM Studio by default).
    pub fn from_config(config: &GraderConfig) -> Result<Self, GraderError> {
        let provider = OpenAI::from_config(OpenAIConfig::from(config))?;
        Self::new(Arc::new(provider), config)
    }

    /// Replaces the user prompt template. Same variables as the built-in one.
    pub fn with_user_template(mut self, template: &str) -> Result<Self, GraderError> {
        self.templates
            .register_template_string(USER_TEMPLATE, template)
            .map_err(|err| GraderError::Template(err.to_string()))?;
        Ok(self)
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    pub fn render_prompt(&self, candidate: &str, context: &RubricContext) -> Result<String, GraderError> {
        let metadata = serde_json::to_string_pretty(&context.metadata)
            .map_err(|err| GraderError::Template(err.to_string()))?;
        let data = PromptData {
            candidate,
            user_input: &context.user_input,
            expected_action: context.expected_action.as_deref(),
            rubric: context.rubric.as_deref(),
            metadata,
        };
        self.templates
            .render(USER_TEMPLATE, &data)
            .map_err(|err| GraderError::Template(err.to_string()))
    }

    pub async fn grade(&self, candidate: &str, context: &RubricContext) -> Result<Grade, GraderError> {
        let system = self
            .templates
            .render(SYSTEM_TEMPLATE, &json!({}))
            .map_err(|err| GraderError::Template(err.to_string()))?;
        let prompt = self.render_prompt(candidate, context)?;

        let mut request = CompletionRequest::new(
            self.model.clone(),
            vec![ChatMessage::system(system), ChatMessage::user(prompt)],
        )
        .with_max_tokens(self.max_tokens)
        .with_temperature(self.temperature);
        if self.json_mode {
            request = request.with_response_format(json!({"type": "json_object"}));
        }

        let reply = self.complete(request).await?;
        let grade = parse_grade(&reply)?;
        debug!(score = grade.score, provider = self.provider.name(), "graded reply");
        Ok(grade)
    }

    /// Cheap availability check used before a run starts.
    pub async fn ping(&self) -> Result<(), GraderError> {
        let request = CompletionRequest::new(self.model.clone(), vec![ChatMessage::user("ping")])
            .with_max_tokens(1);
        self.complete(request).await.map(|_| ())
    }

    async fn complete(&self, request: CompletionRequest) -> Result<String, GraderError> {
        let provider = &self.provider;
        let attempts = self.retry.run("grade", LLMError::is_transient, || {
            provider.complete(request.clone())
        });
        let response = tokio::time::timeout(self.timeout, attempts)
            .await
            .map_err(|_| {
                GraderError::Unavailable(format!("no reply within {}ms", self.timeout.as_millis()))
            })??;
        Ok(response.message.text().unwrap_or_default().to_string())
    }
}

/// Reads a score from a grader reply: a JSON object with `score`/`ocena`
/// first, then the first number on a line naming the score. Clamped to 0-10.
pub fn parse_grade(reply: &str) -> Result<Grade, GraderError> {
    let reply = reply.trim();
    if reply.is_empty() {
        return Err(GraderError::InvalidResponse("empty grader reply".into()));
    }

    if let Some(grade) = parse_json_grade(reply) {
        return Ok(grade);
    }

    let score = RE_SCORE_LINE
        .captures(reply)
        .and_then(|caps| caps[1].replace(',', ".").parse::<f64>().ok())
        .ok_or_else(|| GraderError::InvalidResponse(format!("no score found in `{reply}`")))?;

    Ok(Grade {
        score: clamp_score(score),
        comments: None,
    })
}

fn parse_json_grade(reply: &str) -> Option<Grade> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    if end <= start {
        return None;
    }
    let body: Value = serde_json::from_str(&reply[start..=end]).ok()?;
    let score = body.get("score").or_else(|| body.get("ocena"))?;
    let score = match score {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().replace(',', ".").parse().ok()?,
        _ => return None,
    };
    let comments = body
        .get("comments")
        .or_else(|| body.get("uwagi"))
        .and_then(Value::as_str)
        .map(str::to_string);

    Some(Grade {
        score: clamp_score(score),
        comments,
    })
}

fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 10.0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::types::{CompletionResponse, MessageRole};

    struct CannedProvider {
        reply: Result<String, u16>,
        delay: Duration,
        /// Leading calls answered with 503 before `reply` is used.
        outages: Mutex<u32>,
        prompts: Mutex<Vec<String>>,
        formats: Mutex<Vec<Option<Value>>>,
    }

    impl CannedProvider {
        fn replying(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(reply.to_string()),
                delay: Duration::ZERO,
                outages: Mutex::new(0),
                prompts: Mutex::new(Vec::new()),
                formats: Mutex::new(Vec::new()),
            })
        }

        fn failing(status: u16) -> Arc<Self> {
            Arc::new(Self {
                reply: Err(status),
                delay: Duration::ZERO,
                outages: Mutex::new(0),
                prompts: Mutex::new(Vec::new()),
                formats: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LLMProvider for CannedProvider {
        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
            if let Some(user) = request.messages.iter().find(|m| m.role == MessageRole::User) {
                self.prompts
                    .lock()
                    .unwrap()
                    .push(user.text().unwrap_or_default().to_string());
            }
            self.formats.lock().unwrap().push(request.response_format.clone());
            tokio::time::sleep(self.delay).await;
            {
                let mut outages = self.outages.lock().unwrap();
                if *outages > 0 {
                    *outages -= 1;
                    return Err(LLMError::Status {
                        status: 503,
                        message: "loading model".into(),
                    });
                }
            }
            match &self.reply {
                Ok(text) => Ok(CompletionResponse {
                    message: ChatMessage::assistant(text.clone()),
                    usage: None,
                }),
                Err(status) => Err(LLMError::Status {
                    status: *status,
                    message: "down".into(),
                }),
            }
        }

        fn name(&self) -> &'static str {
            "canned"
        }
    }

    fn context() -> RubricContext {
        RubricContext {
            user_input: "What's the weather in Oslo?".into(),
            expected_action: Some("weather".into()),
            rubric: Some("Must mention a temperature.".into()),
            metadata: json!({"scenario": "weather"}),
        }
    }

    #[test]
    fn parses_json_and_fallback_scores() {
        let grade = parse_grade(r#"Sure: {"score": 9, "comments": "good"}"#).unwrap();
        assert_eq!(grade.score, 9.0);
        assert_eq!(grade.comments.as_deref(), Some("good"));

        let grade = parse_grade(r#"{"ocena": "7,5", "uwagi": "ok"}"#).unwrap();
        assert_eq!(grade.score, 7.5);

        assert_eq!(parse_grade("Final score: 6/10").unwrap().score, 6.0);
        assert_eq!(parse_grade(r#"{"score": 14}"#).unwrap().score, 10.0);
    }

    #[test]
    fn unparseable_reply_is_invalid() {
        assert!(matches!(parse_grade("   "), Err(GraderError::InvalidResponse(_))));
        assert!(matches!(
            parse_grade("I liked it a lot"),
            Err(GraderError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn renders_prompt_with_rubric_and_candidate() {
        let provider = CannedProvider::replying(r#"{"score": 8}"#);
        let grader = SemanticGrader::new(provider.clone(), &GraderConfig::default()).unwrap();

        let grade = grader.grade("It is 12°C & sunny", &context()).await.unwrap();
        assert_eq!(grade.score, 8.0);

        let prompts = provider.prompts.lock().unwrap();
        assert!(prompts[0].contains("It is 12°C & sunny"));
        assert!(prompts[0].contains("Expected action: weather"));
        assert!(prompts[0].contains("Must mention a temperature."));
    }

    #[tokio::test]
    async fn slow_grader_is_unavailable() {
        let provider = Arc::new(CannedProvider {
            reply: Ok(r#"{"score": 10}"#.into()),
            delay: Duration::from_millis(500),
            outages: Mutex::new(0),
            prompts: Mutex::new(Vec::new()),
            formats: Mutex::new(Vec::new()),
        });
        let config = GraderConfig {
            timeout_ms: 50,
            ..GraderConfig::default()
        };
        let grader = SemanticGrader::new(provider, &config).unwrap();

        let err = grader.grade("hi", &context()).await.unwrap_err();
        assert!(matches!(err, GraderError::Unavailable(_)));
    }

    #[tokio::test]
    async fn server_errors_map_to_unavailable() {
        let grader = SemanticGrader::new(CannedProvider::failing(503), &GraderConfig::default()).unwrap();
        assert!(matches!(grader.ping().await, Err(GraderError::Unavailable(_))));
    }

    #[tokio::test]
    async fn transient_provider_failure_is_retried() {
        let provider = CannedProvider::replying(r#"{"score": 9}"#);
        *provider.outages.lock().unwrap() = 1;
        let grader = SemanticGrader::new(provider.clone(), &GraderConfig::default())
            .unwrap()
            .with_retry(RetryPolicy::none().with_max_attempts(3));

        let grade = grader.grade("It is 12 degrees", &context()).await.unwrap();
        assert_eq!(grade.score, 9.0);
        assert_eq!(provider.prompts.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn grades_through_http_after_one_server_error() {
        use wiremock::{
            matchers::{method, path},
            Mock, MockServer, ResponseTemplate,
        };

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "{\"score\": 8.5}"}}]
            })))
            .mount(&server)
            .await;

        let config = GraderConfig {
            base_url: format!("{}/v1", server.uri()),
            ..GraderConfig::default()
        };
        let grader = SemanticGrader::from_config(&config)
            .unwrap()
            .with_retry(RetryPolicy::none().with_max_attempts(2));

        let grade = grader.grade("It is 12 degrees", &context()).await.unwrap();
        assert_eq!(grade.score, 8.5);
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let provider = CannedProvider::failing(400);
        let grader = SemanticGrader::new(provider.clone(), &GraderConfig::default())
            .unwrap()
            .with_retry(RetryPolicy::none().with_max_attempts(3));

        assert!(matches!(grader.ping().await, Err(GraderError::InvalidResponse(_))));
        assert_eq!(provider.formats.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn json_mode_requests_a_json_object() {
        let provider = CannedProvider::replying(r#"{"score": 7}"#);
        let config = GraderConfig {
            json_mode: true,
            ..GraderConfig::default()
        };
        let grader = SemanticGrader::new(provider.clone(), &config).unwrap();
        grader.grade("hi", &context()).await.unwrap();

        let plain = SemanticGrader::new(provider.clone(), &GraderConfig::default()).unwrap();
        plain.grade("hi", &context()).await.unwrap();

        let formats = provider.formats.lock().unwrap();
        assert_eq!(formats[0], Some(json!({"type": "json_object"})));
        assert_eq!(formats[1], None);
    }
}
