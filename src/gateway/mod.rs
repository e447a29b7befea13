use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::{config::ServiceConfig, error::GatewayError};

pub mod http;
pub mod retry;

pub use http::HttpTransport;
pub use retry::RetryPolicy;

/// One call against the assistant service API.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceRequest {
    Health,
    Login { email: String, password: String },
    Query { text: String, context: Value },
    Action { name: String },
    Speech { text: String, voice: String, format: String, model: String },
    Memories,
    Plugins,
}

impl ServiceRequest {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Health => "health",
            Self::Login { .. } => "login",
            Self::Query { .. } => "query",
            Self::Action { .. } => "action",
            Self::Speech { .. } => "speech",
            Self::Memories => "memories",
            Self::Plugins => "plugins",
        }
    }

    fn is_authenticated(&self) -> bool {
        !matches!(self, Self::Health | Self::Login { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServiceReply {
    Json(Value),
    Bytes(Vec<u8>),
}

impl ServiceReply {
    pub fn into_json(self) -> Result<Value, GatewayError> {
        match self {
            Self::Json(value) => Ok(value),
            Self::Bytes(bytes) => serde_json::from_slice(&bytes)
                .map_err(|err| GatewayError::InvalidResponse(err.to_string())),
        }
    }

    pub fn into_bytes(self) -> Result<Vec<u8>, GatewayError> {
        match self {
            Self::Bytes(bytes) => Ok(bytes),
            Self::Json(value) => Err(GatewayError::InvalidResponse(format!(
                "expected binary payload, got json: {value}"
            ))),
        }
    }
}

/// Raw request/response contract of the assistant service. The gateway adds
/// session handling and retries on top; implementations only map a request to
/// a reply or a classified error.
#[async_trait]
pub trait AssistantTransport: Send + Sync {
    async fn call(
        &self,
        request: &ServiceRequest,
        token: Option<&str>,
    ) -> Result<ServiceReply, GatewayError>;
}

/// Reply of a conversational query or an action, with the fields assertions
/// select from already pulled out of the raw payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceResponse {
    pub text: Option<String>,
    pub plugin_result: Option<Value>,
    pub side_effect: Option<Value>,
    pub raw: Value,
}

impl ServiceResponse {
    /// `{"response": {"text": ...}}`, `{"response": "..."}` and a top-level
    /// `text` are all accepted. Any other non-null `response` is rendered as
    /// JSON text.
    pub fn from_query(raw: Value) -> Self {
        let response = raw.get("response");
        let text = match response {
            Some(Value::String(text)) => Some(text.clone()),
            Some(body @ Value::Object(fields)) => Some(
                fields
                    .get("text")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| body.to_string()),
            ),
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        }
        .or_else(|| raw.get("text").and_then(Value::as_str).map(str::to_string));

        let field = |name: &str| {
            response
                .and_then(|body| body.get(name))
                .or_else(|| raw.get(name))
                .filter(|value| !value.is_null())
                .cloned()
        };

        Self {
            text,
            plugin_result: field("plugin_result"),
            side_effect: field("side_effect"),
            raw,
        }
    }

    /// The action result itself is both the plugin result and the side effect.
    pub fn from_action(name: &str, raw: Value) -> Self {
        let text = raw
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("Action {name} executed"));
        Self {
            text: Some(text),
            plugin_result: Some(raw.clone()),
            side_effect: Some(raw.clone()),
            raw,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl From<&ServiceConfig> for Credentials {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            email: config.email.clone(),
            password: config.password.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct Session {
    token: Option<String>,
    generation: u64,
}

/// Entry point for everything the runner asks of the assistant service.
///
/// The session is shared by all scenario workers. It is only written by
/// `authenticate` and by the expiry path. Logins run outside the lock; the
/// generation counter decides which token is installed, so concurrent
/// expiries install one token.
pub struct ServiceGateway {
    transport: Arc<dyn AssistantTransport>,
    retry: RetryPolicy,
    credentials: Credentials,
    api_key: Option<String>,
    session: RwLock<Session>,
}

impl ServiceGateway {
    pub fn new(transport: Arc<dyn AssistantTransport>, credentials: Credentials) -> Self {
        Self {
            transport,
            retry: RetryPolicy::default(),
            credentials,
            api_key: None,
            session: RwLock::new(Session::default()),
        }
    }

    pub fn from_config(config: &ServiceConfig, retry: RetryPolicy) -> Result<Self, GatewayError> {
        let transport = HttpTransport::from_config(config)?;
        Ok(Self::new(Arc::new(transport), Credentials::from(config))
            .with_retry(retry)
            .with_api_key(config.api_key.clone()))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Static bearer token used until (or instead of) a login token.
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// `GET /health` must answer `status: healthy`.
    pub async fn health_check(&self) -> Result<(), GatewayError> {
        let body = self.send(&ServiceRequest::Health).await?.into_json()?;
        match body.get("status").and_then(Value::as_str) {
            Some("healthy") => Ok(()),
            Some(other) => Err(GatewayError::InvalidResponse(format!(
                "service reports status `{other}`"
            ))),
            None => Err(GatewayError::InvalidResponse(
                "health response carries no status".into(),
            )),
        }
    }

    /// Logs in and stores the session token for every later call.
    pub async fn authenticate(&self) -> Result<(), GatewayError> {
        let generation = self.session.read().await.generation;
        self.refresh_session(generation).await
    }

    pub async fn is_authenticated(&self) -> bool {
        self.session.read().await.token.is_some()
    }

    pub async fn query(&self, text: &str) -> Result<ServiceResponse, GatewayError> {
        let request = ServiceRequest::Query {
            text: text.to_string(),
            context: json!({}),
        };
        let body = self.send(&request).await?.into_json()?;
        Ok(ServiceResponse::from_query(body))
    }

    pub async fn trigger_action(&self, name: &str) -> Result<ServiceResponse, GatewayError> {
        let request = ServiceRequest::Action {
            name: name.to_string(),
        };
        let body = self.send(&request).await?.into_json()?;
        Ok(ServiceResponse::from_action(name, body))
    }

    /// Speech from the service's own TTS streaming endpoint.
    pub async fn synthesize_speech(
        &self,
        text: &str,
        voice: &str,
        format: &str,
        model: &str,
    ) -> Result<Vec<u8>, GatewayError> {
        let request = ServiceRequest::Speech {
            text: text.to_string(),
            voice: voice.to_string(),
            format: format.to_string(),
            model: model.to_string(),
        };
        self.send(&request).await?.into_bytes()
    }

    pub async fn memories(&self) -> Result<Vec<Value>, GatewayError> {
        let body = self.send(&ServiceRequest::Memories).await?.into_json()?;
        let entries = match body {
            Value::Array(items) => items,
            Value::Object(mut map) => match map.remove("memories") {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };
        Ok(entries)
    }

    pub async fn plugins(&self) -> Result<Value, GatewayError> {
        self.send(&ServiceRequest::Plugins).await?.into_json()
    }

    /// Sends with retries. A session expiry triggers one re-login and exactly
    /// one replay; a second expiry is surfaced.
    pub async fn send(&self, request: &ServiceRequest) -> Result<ServiceReply, GatewayError> {
        let (token, generation) = self.current_session().await;
        match self.send_with_retry(request, token.as_deref()).await {
            Err(GatewayError::AuthExpired) if request.is_authenticated() => {
                info!(request = request.name(), "session expired, re-authenticating");
                self.refresh_session(generation).await?;
                let (token, _) = self.current_session().await;
                self.send_with_retry(request, token.as_deref()).await
            }
            other => other,
        }
    }

    async fn current_session(&self) -> (Option<String>, u64) {
        let session = self.session.read().await;
        let token = session.token.clone().or_else(|| self.api_key.clone());
        (token, session.generation)
    }

    /// Logs in without holding the session lock, then installs the token
    /// unless another worker already did so for `seen_generation`.
    async fn refresh_session(&self, seen_generation: u64) -> Result<(), GatewayError> {
        if self.session.read().await.generation != seen_generation {
            debug!("session already refreshed by another worker");
            return Ok(());
        }

        let request = ServiceRequest::Login {
            email: self.credentials.email.clone(),
            password: self.credentials.password.clone(),
        };
        let body = self.send_with_retry(&request, None).await?.into_json()?;
        let token = match (body.get("success").and_then(Value::as_bool), body.get("token")) {
            (Some(false), _) => {
                let reason = body
                    .get("error")
                    .or_else(|| body.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("login rejected");
                return Err(GatewayError::AuthenticationFailed(reason.to_string()));
            }
            (_, Some(Value::String(token))) => token.clone(),
            _ => {
                return Err(GatewayError::AuthenticationFailed(
                    "login response carries no token".into(),
                ))
            }
        };

        let mut session = self.session.write().await;
        if session.generation != seen_generation {
            debug!("session refreshed concurrently, keeping the newer token");
            return Ok(());
        }
        session.token = Some(token);
        session.generation += 1;
        info!(generation = session.generation, "authenticated against assistant service");
        Ok(())
    }

    async fn send_with_retry(
        &self,
        request: &ServiceRequest,
        token: Option<&str>,
    ) -> Result<ServiceReply, GatewayError> {
        let transport = &self.transport;
        self.retry
            .run(request.name(), GatewayError::is_transient, move || {
                transport.call(request, token)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, sync::Mutex, time::Duration};

    use super::*;

    /// Replays scripted results per request name and records every call.
    #[derive(Default)]
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<ServiceReply, GatewayError>>>,
        calls: Mutex<Vec<(String, Option<String>)>>,
        login_count: Mutex<u32>,
    }

    impl ScriptedTransport {
        fn with_script(script: Vec<Result<ServiceReply, GatewayError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                ..Default::default()
            })
        }

        fn calls(&self) -> Vec<(String, Option<String>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AssistantTransport for ScriptedTransport {
        async fn call(
            &self,
            request: &ServiceRequest,
            token: Option<&str>,
        ) -> Result<ServiceReply, GatewayError> {
            self.calls
                .lock()
                .unwrap()
                .push((request.name().to_string(), token.map(str::to_string)));
            if let ServiceRequest::Login { .. } = request {
                let mut count = self.login_count.lock().unwrap();
                *count += 1;
                return Ok(ServiceReply::Json(
                    json!({"success": true, "token": format!("token-{count}")}),
                ));
            }
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ServiceReply::Json(json!({"response": {"text": "ok"}}))))
        }
    }

    fn gateway(transport: Arc<ScriptedTransport>, attempts: u32) -> ServiceGateway {
        let credentials = Credentials {
            email: "qa@example.com".into(),
            password: "pw".into(),
        };
        ServiceGateway::new(transport, credentials).with_retry(
            RetryPolicy::none()
                .with_max_attempts(attempts)
                .with_initial_backoff(Duration::from_millis(1)),
        )
    }

    fn unavailable() -> Result<ServiceReply, GatewayError> {
        Err(GatewayError::Transport {
            message: "connection reset".into(),
            status: Some(503),
        })
    }

    #[tokio::test]
    async fn recovers_after_transient_failures_within_budget() {
        let transport = ScriptedTransport::with_script(vec![unavailable(), unavailable()]);
        let gateway = gateway(Arc::clone(&transport), 3);

        let response = gateway.query("hi").await.unwrap();
        assert_eq!(response.text.as_deref(), Some("ok"));
        assert_eq!(transport.calls().len(), 3);
    }

    #[tokio::test]
    async fn surfaces_error_when_attempts_are_exhausted() {
        let transport =
            ScriptedTransport::with_script(vec![unavailable(), unavailable(), unavailable()]);
        let gateway = gateway(Arc::clone(&transport), 3);

        let err = gateway.query("hi").await.unwrap_err();
        assert!(matches!(err, GatewayError::Transport { status: Some(503), .. }));
        assert_eq!(transport.calls().len(), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let transport = ScriptedTransport::with_script(vec![Err(GatewayError::Rejected {
            status: 422,
            body: "bad query".into(),
        })]);
        let gateway = gateway(Arc::clone(&transport), 5);

        let err = gateway.query("hi").await.unwrap_err();
        assert!(matches!(err, GatewayError::Rejected { status: 422, .. }));
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test]
    async fn expired_session_is_refreshed_and_call_replayed_once() {
        let transport = ScriptedTransport::with_script(vec![Err(GatewayError::AuthExpired)]);
        let gateway = gateway(Arc::clone(&transport), 1);
        gateway.authenticate().await.unwrap();

        let response = gateway.query("hi").await.unwrap();
        assert_eq!(response.text.as_deref(), Some("ok"));

        let calls = transport.calls();
        let names: Vec<&str> = calls.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["login", "query", "login", "query"]);
        assert_eq!(calls[1].1.as_deref(), Some("token-1"));
        assert_eq!(calls[3].1.as_deref(), Some("token-2"));
    }

    #[tokio::test]
    async fn second_expiry_is_surfaced() {
        let transport = ScriptedTransport::with_script(vec![
            Err(GatewayError::AuthExpired),
            Err(GatewayError::AuthExpired),
        ]);
        let gateway = gateway(Arc::clone(&transport), 3);

        let err = gateway.query("hi").await.unwrap_err();
        assert!(matches!(err, GatewayError::AuthExpired));
        assert_eq!(transport.calls().len(), 3);
    }

    #[tokio::test]
    async fn health_requires_healthy_status() {
        let transport = ScriptedTransport::with_script(vec![Ok(ServiceReply::Json(
            json!({"status": "degraded"}),
        ))]);
        let gateway = gateway(transport, 1);
        assert!(matches!(
            gateway.health_check().await,
            Err(GatewayError::InvalidResponse(_))
        ));
    }

    #[test]
    fn extracts_query_fields_from_nested_response() {
        let response = ServiceResponse::from_query(json!({
            "response": {"text": "Hello there!", "plugin_result": {"city": "Oslo"}}
        }));
        assert_eq!(response.text.as_deref(), Some("Hello there!"));
        assert_eq!(response.plugin_result, Some(json!({"city": "Oslo"})));
        assert!(response.side_effect.is_none());
    }

    #[test]
    fn response_object_without_text_is_rendered() {
        let response = ServiceResponse::from_query(json!({"response": {"temperature": 12}}));
        assert_eq!(response.text.as_deref(), Some(r#"{"temperature":12}"#));

        let response = ServiceResponse::from_query(json!({"response": null, "text": "fallback"}));
        assert_eq!(response.text.as_deref(), Some("fallback"));
    }

    #[tokio::test]
    async fn concurrent_refreshes_install_one_token() {
        let transport = ScriptedTransport::with_script(Vec::new());
        let gateway = Arc::new(gateway(Arc::clone(&transport), 1));

        let (first, second) = tokio::join!(gateway.refresh_session(0), gateway.refresh_session(0));
        first.unwrap();
        second.unwrap();

        assert!(gateway.is_authenticated().await);
        assert_eq!(gateway.session.read().await.generation, 1);
    }

    #[tokio::test]
    async fn stale_refresh_keeps_the_current_token() {
        let transport = ScriptedTransport::with_script(Vec::new());
        let gateway = gateway(Arc::clone(&transport), 1);
        gateway.authenticate().await.unwrap();

        gateway.refresh_session(0).await.unwrap();

        let calls = transport.calls();
        assert_eq!(calls.iter().filter(|(name, _)| name == "login").count(), 1);
        assert_eq!(gateway.current_session().await.0.as_deref(), Some("token-1"));
    }

    #[test]
    fn action_result_is_plugin_result_and_side_effect() {
        let response = ServiceResponse::from_action(
            "restart",
            json!({"success": true, "action": "service_restarted"}),
        );
        assert_eq!(response.text.as_deref(), Some("Action restart executed"));
        assert_eq!(response.side_effect, response.plugin_result);
    }
}
