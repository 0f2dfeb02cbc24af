use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::{ChatRequest, ChatResponse, ImageRequest, LlmClient, ParleyAiError};

const NO_RESPONSE_TEXT: &str = "No response.";

#[derive(Debug, Clone)]
/// Endpoint and per-call timeouts for an OpenAI-compatible provider.
pub struct OpenAiConfig {
    pub api_base: String,
    pub api_key: String,
    pub completion_timeout_ms: u64,
    pub models_timeout_ms: u64,
    pub image_timeout_ms: u64,
}

impl OpenAiConfig {
    pub fn new(api_base: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            api_key: api_key.into(),
            completion_timeout_ms: 120_000,
            models_timeout_ms: 10_000,
            image_timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiClient {
    client: reqwest::Client,
    config: OpenAiConfig,
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    #[serde(default)]
    message: Option<OpenAiChoiceMessage>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoiceMessage {
    #[serde(default)]
    content: Value,
}

#[derive(Debug, Deserialize)]
struct OpenAiModelList {
    #[serde(default)]
    data: Vec<OpenAiModel>,
}

#[derive(Debug, Deserialize)]
struct OpenAiModel {
    id: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiImageResponse {
    #[serde(default)]
    data: Vec<OpenAiImage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiImage {
    #[serde(default)]
    url: Option<String>,
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig) -> Result<Self, ParleyAiError> {
        if config.api_key.trim().is_empty() {
            return Err(ParleyAiError::MissingApiKey);
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let bearer = format!("Bearer {}", config.api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&bearer).map_err(|e| {
                ParleyAiError::InvalidResponse(format!("invalid API key header: {e}"))
            })?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(Self { client, config })
    }

    fn endpoint(&self, suffix: &str) -> String {
        let base = self.config.api_base.trim_end_matches('/');
        let base = base.strip_suffix("/chat/completions").unwrap_or(base);
        format!("{base}/{suffix}")
    }

    async fn read_json<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ParleyAiError> {
        let status = response.status();
        let raw = response.text().await.map_err(ParleyAiError::from_transport)?;
        if !status.is_success() {
            return Err(ParleyAiError::HttpStatus {
                status: status.as_u16(),
                body: raw,
            });
        }
        Ok(serde_json::from_str(&raw)?)
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, ParleyAiError> {
        tracing::debug!(
            model = %request.model,
            messages = request.messages.len(),
            "sending chat completion request"
        );
        let response = self
            .client
            .post(self.endpoint("chat/completions"))
            .timeout(Duration::from_millis(self.config.completion_timeout_ms.max(1)))
            .json(&request)
            .send()
            .await
            .map_err(ParleyAiError::from_transport)?;
        let parsed: OpenAiChatResponse = Self::read_json(response).await?;
        Ok(parse_chat_choice(parsed))
    }

    async fn list_models(&self) -> Result<Vec<String>, ParleyAiError> {
        let response = self
            .client
            .get(self.endpoint("models"))
            .timeout(Duration::from_millis(self.config.models_timeout_ms.max(1)))
            .send()
            .await
            .map_err(ParleyAiError::from_transport)?;
        let parsed: OpenAiModelList = Self::read_json(response).await?;
        Ok(parsed.data.into_iter().map(|model| model.id).collect())
    }

    async fn generate_image(
        &self,
        request: ImageRequest,
    ) -> Result<Option<String>, ParleyAiError> {
        let response = self
            .client
            .post(self.endpoint("images/generations"))
            .timeout(Duration::from_millis(self.config.image_timeout_ms.max(1)))
            .json(&request)
            .send()
            .await
            .map_err(ParleyAiError::from_transport)?;
        let parsed: OpenAiImageResponse = Self::read_json(response).await?;
        Ok(parsed.data.into_iter().next().and_then(|image| image.url))
    }
}

fn parse_chat_choice(parsed: OpenAiChatResponse) -> ChatResponse {
    let Some(choice) = parsed.choices.into_iter().next() else {
        return ChatResponse {
            content: NO_RESPONSE_TEXT.to_string(),
            finish_reason: None,
        };
    };
    let content = match choice.message.map(|message| message.content) {
        Some(Value::String(text)) => text,
        Some(Value::Null) | None => NO_RESPONSE_TEXT.to_string(),
        Some(other) => other.to_string(),
    };
    ChatResponse {
        content,
        finish_reason: choice.finish_reason,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use httpmock::prelude::*;
    use serde_json::json;

    use super::{OpenAiClient, OpenAiConfig};
    use crate::{ChatRequest, ConversationEntry, ImageRequest, LlmClient, ParleyAiError};

    fn client_for(server: &MockServer) -> OpenAiClient {
        let mut config = OpenAiConfig::new(format!("{}/v1", server.base_url()), "sk-test");
        config.completion_timeout_ms = 2_000;
        OpenAiClient::new(config).expect("client")
    }

    #[test]
    fn unit_new_rejects_blank_api_key() {
        let error = OpenAiClient::new(OpenAiConfig::new("https://api.example.com/v1", "  "))
            .expect_err("blank key");
        assert!(matches!(error, ParleyAiError::MissingApiKey));
    }

    #[tokio::test]
    async fn functional_complete_posts_history_and_reads_first_choice() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("authorization", "Bearer sk-test")
                .json_body(json!({
                    "model": "gpt-5.1",
                    "messages": [
                        {"role": "system", "content": "be brief"},
                        {"role": "user", "content": "hello"}
                    ],
                    "max_tokens": 2000
                }));
            then.status(200).json_body(json!({
                "choices": [{"message": {"content": "hi there"}, "finish_reason": "stop"}]
            }));
        });

        let response = client_for(&server)
            .complete(ChatRequest {
                model: "gpt-5.1".to_string(),
                messages: vec![
                    ConversationEntry::system("be brief"),
                    ConversationEntry::user("hello"),
                ],
                max_tokens: Some(2000),
            })
            .await
            .expect("completion");

        mock.assert();
        assert_eq!(response.content, "hi there");
        assert_eq!(response.finish_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn regression_complete_without_choices_returns_placeholder_text() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).json_body(json!({"choices": []}));
        });

        let response = client_for(&server)
            .complete(ChatRequest {
                model: "gpt-5.1".to_string(),
                messages: vec![ConversationEntry::user("hello")],
                max_tokens: None,
            })
            .await
            .expect("completion");
        assert_eq!(response.content, "No response.");
    }

    #[tokio::test]
    async fn functional_complete_surfaces_status_errors() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(502).body("bad gateway");
        });

        let error = client_for(&server)
            .complete(ChatRequest {
                model: "gpt-5.1".to_string(),
                messages: vec![ConversationEntry::user("hello")],
                max_tokens: None,
            })
            .await
            .expect_err("status error");
        assert!(matches!(error, ParleyAiError::HttpStatus { status: 502, .. }));
    }

    #[tokio::test]
    async fn regression_slow_completion_maps_to_timeout_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200)
                .delay(Duration::from_millis(1_500))
                .json_body(json!({
                    "choices": [{"message": {"content": "too late"}, "finish_reason": "stop"}]
                }));
        });
        let mut config = OpenAiConfig::new(format!("{}/v1", server.base_url()), "sk-test");
        config.completion_timeout_ms = 200;
        let client = OpenAiClient::new(config).expect("client");

        let error = client
            .complete(ChatRequest {
                model: "gpt-5.1".to_string(),
                messages: vec![ConversationEntry::user("hello")],
                max_tokens: None,
            })
            .await
            .expect_err("timeout");
        assert!(matches!(error, ParleyAiError::Timeout), "unexpected error: {error:?}");
    }

    #[tokio::test]
    async fn functional_list_models_returns_ids_in_order() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/v1/models");
            then.status(200).json_body(json!({
                "data": [{"id": "gpt-5.1"}, {"id": "gpt-4o"}, {"id": "dall-e-3"}]
            }));
        });

        let models = client_for(&server).list_models().await.expect("models");
        assert_eq!(models, vec!["gpt-5.1", "gpt-4o", "dall-e-3"]);
    }

    #[tokio::test]
    async fn functional_generate_image_returns_first_url_or_none() {
        let server = MockServer::start();
        let mut with_data = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/images/generations")
                .json_body_includes(json!({"prompt": "a red fox", "n": 1}).to_string());
            then.status(200).json_body(json!({
                "data": [{"url": "https://images.example.com/fox.png"}]
            }));
        });
        let client = client_for(&server);
        let request = ImageRequest {
            prompt: "a red fox".to_string(),
            model: "dall-e-3".to_string(),
            n: 1,
            size: "1024x1024".to_string(),
        };

        let url = client
            .generate_image(request.clone())
            .await
            .expect("image");
        assert_eq!(url.as_deref(), Some("https://images.example.com/fox.png"));
        with_data.delete();

        server.mock(|when, then| {
            when.method(POST).path("/v1/images/generations");
            then.status(200).json_body(json!({"created": 1}));
        });
        let missing = client.generate_image(request).await.expect("image");
        assert_eq!(missing, None);
    }
}
