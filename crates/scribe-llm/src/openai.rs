use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, instrument};

use scribe_core::context::LlmContext;
use scribe_core::errors::GatewayError;
use scribe_core::provider::{EventStream, LlmProvider, StreamOptions};

use crate::converter;
use crate::sse::SseStream;

pub const DEFAULT_BASE_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";
pub const DEFAULT_MODEL: &str = "qwen-plus";

/// Connection settings for an OpenAI-compatible endpoint.
#[derive(Clone, Debug)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: SecretString,
    pub model: String,
    /// Used when a call does not set its own temperature.
    pub temperature: Option<f64>,
    pub connect_timeout: Duration,
    /// Maximum silence between streamed chunks.
    pub idle_timeout: Duration,
}

impl ProviderConfig {
    pub fn new(api_key: SecretString) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key,
            model: DEFAULT_MODEL.to_string(),
            temperature: Some(0.7),
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Streaming chat-completions client (DashScope, OpenAI, and other compatible gateways).
pub struct OpenAiProvider {
    client: Client,
    config: ProviderConfig,
}

impl OpenAiProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| GatewayError::NetworkError(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    #[instrument(skip(self, context, options), fields(model = %self.config.model, messages = context.messages.len()))]
    async fn stream(
        &self,
        context: &LlmContext,
        options: &StreamOptions,
    ) -> Result<EventStream, GatewayError> {
        let body = converter::build_request_body(
            context,
            options,
            &self.config.model,
            self.config.temperature,
        );

        let resp = self
            .client
            .post(self.endpoint())
            .bearer_auth(self.config.api_key.expose_secret())
            .header("accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout(self.config.connect_timeout)
                } else {
                    GatewayError::NetworkError(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let hint = retry_after(resp.headers());
            let body = resp.text().await.unwrap_or_default();
            debug!(status = status.as_u16(), "provider rejected request");
            return Err(match GatewayError::from_status(status.as_u16(), body) {
                GatewayError::RateLimited { .. } => GatewayError::RateLimited { retry_after: hint },
                other => other,
            });
        }

        Ok(Box::pin(SseStream::new(resp.bytes_stream(), self.config.idle_timeout)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use scribe_core::messages::Message;
    use scribe_core::stream::StreamEvent;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(base_url: String) -> OpenAiProvider {
        let mut config = ProviderConfig::new(SecretString::from("sk-test"));
        config.base_url = base_url;
        OpenAiProvider::new(config).unwrap()
    }

    #[tokio::test]
    async fn streams_completion_from_server() {
        let server = MockServer::start().await;
        let sse = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Py\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"thon\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&server)
            .await;

        let p = provider(server.uri());
        let ctx = LlmContext::new("sys").with_messages(vec![Message::user("hi")]);
        let events: Vec<_> = p
            .stream(&ctx, &StreamOptions::default())
            .await
            .unwrap()
            .collect()
            .await;
        let StreamEvent::Done { message, .. } = events.last().unwrap() else {
            panic!("expected Done, got {:?}", events.last());
        };
        assert_eq!(message.content(), "Python");
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;

        let result = provider(server.uri())
            .stream(&LlmContext::default(), &StreamOptions::default())
            .await;
        match result {
            Err(GatewayError::RateLimited { retry_after }) => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)));
            }
            Err(other) => panic!("expected RateLimited, got {other:?}"),
            Ok(_) => panic!("expected an error"),
        }
    }

    #[tokio::test]
    async fn auth_failure_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
            .mount(&server)
            .await;

        let err = provider(format!("{}/", server.uri()))
            .stream(&LlmContext::default(), &StreamOptions::default())
            .await
            .err()
            .unwrap();
        assert!(err.is_fatal(), "got {err:?}");
    }

    #[test]
    fn config_defaults_match_dashscope() {
        let config = ProviderConfig::new(SecretString::from("k"));
        assert_eq!(config.model, "qwen-plus");
        assert_eq!(config.temperature, Some(0.7));
        assert!(config.base_url.contains("dashscope"));
        assert!(!format!("{config:?}").contains("\"k\""));
    }
}
