use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header::CONTENT_TYPE, Client, RequestBuilder, Response, StatusCode};
use serde_json::json;

use crate::{
    config::ServiceConfig,
    error::GatewayError,
    gateway::{retry::is_transient_status, AssistantTransport, ServiceReply, ServiceRequest},
};

/// `reqwest` transport for the assistant service REST API.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, GatewayError> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    pub fn from_config(config: &ServiceConfig) -> Result<Self, GatewayError> {
        Self::new(
            config.base_url.clone(),
            Duration::from_millis(config.request_timeout_ms),
        )
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn build(&self, request: &ServiceRequest) -> RequestBuilder {
        match request {
            ServiceRequest::Health => self.client.get(self.endpoint("health")),
            ServiceRequest::Login { email, password } => self
                .client
                .post(self.endpoint("api/v1/auth/login"))
                .json(&json!({ "email": email, "password": password })),
            ServiceRequest::Query { text, context } => self
                .client
                .post(self.endpoint("api/v1/ai/query"))
                .json(&json!({ "query": text, "context": context })),
            ServiceRequest::Action { name } => self
                .client
                .post(self.endpoint("api/v1/actions"))
                .json(&json!({ "action": name })),
            ServiceRequest::Speech {
                text,
                voice,
                format,
                model,
            } => self.client.post(self.endpoint("api/v1/tts/stream")).json(&json!({
                "text": text,
                "voice": voice,
                "format": format,
                "model": model,
            })),
            ServiceRequest::Memories => self.client.get(self.endpoint("api/v1/memory")),
            ServiceRequest::Plugins => self.client.get(self.endpoint("api/v1/plugins")),
        }
    }
}

#[async_trait]
impl AssistantTransport for HttpTransport {
    async fn call(
        &self,
        request: &ServiceRequest,
        token: Option<&str>,
    ) -> Result<ServiceReply, GatewayError> {
        let mut builder = self.build(request);
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify(status, response).await);
        }

        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.contains("json"))
            .unwrap_or(false);

        if is_json {
            Ok(ServiceReply::Json(response.json().await?))
        } else {
            Ok(ServiceReply::Bytes(response.bytes().await?.to_vec()))
        }
    }
}

/// 401 is a session expiry, 408/429/5xx are transient, any other 4xx is a
/// semantic rejection.
async fn classify(status: StatusCode, response: Response) -> GatewayError {
    let body = response.text().await.unwrap_or_default();
    match status {
        StatusCode::UNAUTHORIZED => GatewayError::AuthExpired,
        s if is_transient_status(s.as_u16()) => GatewayError::Transport {
            message: format!("HTTP {status}: {body}"),
            status: Some(status.as_u16()),
        },
        _ => GatewayError::Rejected {
            status: status.as_u16(),
            body,
        },
    }
}
