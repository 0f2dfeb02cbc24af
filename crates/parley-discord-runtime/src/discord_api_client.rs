//! Discord REST API client used for typing, replies and command registration.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::discord_helpers::{parse_retry_after, truncate_for_error};
use crate::typing_throttle::{ChannelId, TypingSignal, TypingSignalError};

const INTERACTION_CALLBACK_DEFERRED_CHANNEL_MESSAGE: u8 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Text attachment sent alongside a message.
pub struct OutboundFile {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct GatewayBotResponse {
    url: String,
}

#[derive(Clone)]
pub struct DiscordApiClient {
    http: reqwest::Client,
    api_base: String,
    bot_token: String,
}

impl DiscordApiClient {
    pub fn new(api_base: &str, bot_token: &str, request_timeout_ms: u64) -> Result<Self> {
        let bot_token = bot_token.trim();
        if bot_token.is_empty() {
            bail!("discord bot token cannot be empty");
        }
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static(concat!(
                "DiscordBot (https://github.com/parley-relay/parley, ",
                env!("CARGO_PKG_VERSION"),
                ")"
            )),
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(request_timeout_ms.max(1)))
            .build()
            .context("failed to create discord api client")?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            bot_token: bot_token.to_string(),
        })
    }

    fn authorization(&self) -> String {
        format!("Bot {}", self.bot_token)
    }

    async fn ensure_success(operation: &str, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        bail!(
            "discord {operation} failed with status {}: {}",
            status.as_u16(),
            truncate_for_error(&body, 400)
        );
    }

    /// Resolves the websocket URL through `GET /gateway/bot`.
    pub async fn gateway_url(&self) -> Result<String> {
        let response = self
            .http
            .get(format!("{}/gateway/bot", self.api_base))
            .header(reqwest::header::AUTHORIZATION, self.authorization())
            .send()
            .await
            .context("discord gateway lookup request failed")?;
        let response = Self::ensure_success("gateway lookup", response).await?;
        let parsed: GatewayBotResponse = response
            .json()
            .await
            .context("failed to decode discord gateway lookup")?;
        if parsed.url.trim().is_empty() {
            return Err(anyhow!("discord gateway lookup returned an empty url"));
        }
        Ok(parsed.url)
    }

    /// Posts a message to a channel, with `files` attached when present.
    pub async fn create_message(
        &self,
        channel_id: ChannelId,
        content: &str,
        files: &[OutboundFile],
    ) -> Result<()> {
        let request = self
            .http
            .post(format!("{}/channels/{channel_id}/messages", self.api_base))
            .header(reqwest::header::AUTHORIZATION, self.authorization());
        let response = attach_message_body(request, content, files)?
            .send()
            .await
            .context("discord create message request failed")?;
        Self::ensure_success("create message", response).await?;
        Ok(())
    }

    /// Acknowledges a slash command so the reply can follow later.
    pub async fn defer_interaction(&self, interaction_id: u64, token: &str) -> Result<()> {
        let response = self
            .http
            .post(format!(
                "{}/interactions/{interaction_id}/{token}/callback",
                self.api_base
            ))
            .json(&json!({ "type": INTERACTION_CALLBACK_DEFERRED_CHANNEL_MESSAGE }))
            .send()
            .await
            .context("discord interaction callback request failed")?;
        Self::ensure_success("interaction callback", response).await?;
        Ok(())
    }

    /// Sends a follow-up message for a deferred interaction.
    pub async fn create_followup(
        &self,
        application_id: u64,
        token: &str,
        content: &str,
        files: &[OutboundFile],
    ) -> Result<()> {
        let request = self
            .http
            .post(format!("{}/webhooks/{application_id}/{token}", self.api_base));
        let response = attach_message_body(request, content, files)?
            .send()
            .await
            .context("discord follow-up request failed")?;
        Self::ensure_success("follow-up", response).await?;
        Ok(())
    }

    /// Replaces the global application command set; returns how many were registered.
    pub async fn overwrite_global_commands(
        &self,
        application_id: u64,
        commands: &Value,
    ) -> Result<usize> {
        let response = self
            .http
            .put(format!(
                "{}/applications/{application_id}/commands",
                self.api_base
            ))
            .header(reqwest::header::AUTHORIZATION, self.authorization())
            .json(commands)
            .send()
            .await
            .context("discord command registration request failed")?;
        let response = Self::ensure_success("command registration", response).await?;
        let registered: Value = response
            .json()
            .await
            .context("failed to decode discord command registration")?;
        Ok(registered.as_array().map(Vec::len).unwrap_or_default())
    }
}

#[async_trait]
impl TypingSignal for DiscordApiClient {
    async fn send_typing(&self, channel_id: ChannelId) -> Result<(), TypingSignalError> {
        let response = self
            .http
            .post(format!("{}/channels/{channel_id}/typing", self.api_base))
            .header(reqwest::header::AUTHORIZATION, self.authorization())
            .send()
            .await
            .map_err(|error| TypingSignalError::Failed(error.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(TypingSignalError::RateLimited {
                retry_after: parse_retry_after(&headers, &body),
            });
        }
        Err(TypingSignalError::Failed(format!(
            "status {}: {}",
            status.as_u16(),
            truncate_for_error(&body, 200)
        )))
    }
}

/// Uses a JSON body for text-only messages and `multipart/form-data` with a
/// `payload_json` part once attachments are involved.
fn attach_message_body(
    request: reqwest::RequestBuilder,
    content: &str,
    files: &[OutboundFile],
) -> Result<reqwest::RequestBuilder> {
    if files.is_empty() {
        return Ok(request.json(&json!({ "content": content })));
    }

    let attachments = files
        .iter()
        .enumerate()
        .map(|(index, file)| json!({ "id": index, "filename": file.name }))
        .collect::<Vec<_>>();
    let payload = json!({ "content": content, "attachments": attachments });
    let mut form = Form::new().text("payload_json", payload.to_string());
    for (index, file) in files.iter().enumerate() {
        let part = Part::bytes(file.content.clone().into_bytes())
            .file_name(file.name.clone())
            .mime_str("text/plain")
            .context("invalid attachment mime type")?;
        form = form.part(format!("files[{index}]"), part);
    }
    Ok(request.multipart(form))
}
