//! Discord bridge runtime that holds the gateway session and relays turns.

use std::{
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use parley_ai::{ChatRequest, ContentPart, ImageRequest, LlmClient, MessageContent, ParleyAiError};
use parley_conversation::{ConversationStore, ModelScope, ModelSettings, UserId, WindowStrategy};
use serde_json::Value;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};

use crate::commands::{
    command_definitions, command_from_interaction, help_text, parse_prefixed_command, BotCommand,
};
use crate::discord_api_client::{DiscordApiClient, OutboundFile};
use crate::discord_gateway::{
    decode_dispatch, gateway_connect_url, heartbeat_payload, hello_interval, identify_payload,
    parse_gateway_frame, GatewayEvent, GatewayPayload, InboundInteraction, InboundMessage,
    ReadyEvent, OP_DISPATCH, OP_HEARTBEAT, OP_HEARTBEAT_ACK, OP_HELLO, OP_INVALID_SESSION,
    OP_RECONNECT,
};
use crate::discord_helpers::{chunk_text, DISCORD_MAX_MESSAGE_CHARS};
use crate::image_inputs::{has_image_input, ImageFetcher};
use crate::message_waiters::MessageWaiters;
use crate::model_catalog::ModelCatalog;
use crate::reply_render::{extract_code_blocks, render_memory_dump, with_mention};
use crate::typing_throttle::{ChannelId, TypingThrottle};

const VISION_DEFAULT_PROMPT: &str = "Describe this image in detail.";
const COMPLETION_TIMEOUT_REPLY: &str = "The completion API took too long to respond.";
const COMPLETION_ERROR_REPLY: &str = "The completion API returned an error. Please try again later.";
const SEND_FAILURE_REPLY: &str = "Error during send.";
const GENERATION_FAILED_REPLY: &str = "Generation failed.";

#[derive(Clone)]
/// Runtime configuration for the Discord bridge.
pub struct DiscordBridgeRuntimeConfig {
    pub client: Arc<dyn LlmClient>,
    pub store: Arc<ConversationStore>,
    pub model_settings: Arc<ModelSettings>,
    pub window_strategy: WindowStrategy,
    pub max_tokens: Option<u32>,
    pub api_base: String,
    /// Fixed gateway URL; resolved through `GET /gateway/bot` when unset.
    pub gateway_url: Option<String>,
    pub bot_token: String,
    pub request_timeout_ms: u64,
    pub typing_cooldown: Duration,
    pub confirmation_timeout: Duration,
    pub command_prefix: String,
    pub quick_chat_sigil: String,
    /// Users allowed to change a global model. Empty allows everyone.
    pub admin_user_ids: Vec<UserId>,
    pub vision_models: Vec<String>,
    pub vision_fallback_model: String,
    pub image_model: String,
    pub image_size: String,
    pub image_fetch_timeout_ms: u64,
    pub image_max_bytes: usize,
    pub reconnect_delay: Duration,
    pub register_commands: bool,
}

/// Runs the Discord bridge until ctrl-c, reconnecting after session failures.
pub async fn run_discord_bridge(config: DiscordBridgeRuntimeConfig) -> Result<()> {
    let mut runtime = DiscordBridgeRuntime::new(config)?;
    runtime.run().await
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ReplyTarget {
    Channel(ChannelId),
    Followup { application_id: u64, token: String },
}

/// Who asked, where to answer, and the message that carried the request.
struct Invocation {
    user_id: UserId,
    channel_id: ChannelId,
    target: ReplyTarget,
    source: Option<InboundMessage>,
}

impl Invocation {
    fn from_message(message: InboundMessage) -> Self {
        Self {
            user_id: message.author_id,
            channel_id: message.channel_id,
            target: ReplyTarget::Channel(message.channel_id),
            source: Some(message),
        }
    }
}

/// State shared by every in-flight event handler.
struct DiscordRelay {
    config: DiscordBridgeRuntimeConfig,
    api: DiscordApiClient,
    throttle: TypingThrottle<DiscordApiClient>,
    images: ImageFetcher,
    waiters: MessageWaiters<InboundMessage>,
    catalog: ModelCatalog,
    identity: RwLock<Option<ReadyEvent>>,
}

impl DiscordRelay {
    fn new(config: DiscordBridgeRuntimeConfig) -> Result<Self> {
        let api = DiscordApiClient::new(
            &config.api_base,
            &config.bot_token,
            config.request_timeout_ms,
        )?;
        let throttle = TypingThrottle::new(api.clone(), config.typing_cooldown);
        let images = ImageFetcher::new(config.image_fetch_timeout_ms, config.image_max_bytes)?;
        Ok(Self {
            config,
            api,
            throttle,
            images,
            waiters: MessageWaiters::new(),
            catalog: ModelCatalog::new(),
            identity: RwLock::new(None),
        })
    }

    fn set_identity(&self, ready: ReadyEvent) {
        *self
            .identity
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(ready);
    }

    fn bot_user_id(&self) -> Option<u64> {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|ready| ready.user_id)
    }

    async fn handle_message(&self, message: InboundMessage) {
        let bot_user_id = self.bot_user_id();
        if message.author_is_bot || Some(message.author_id) == bot_user_id {
            return;
        }
        let message = match self.waiters.offer(message) {
            Ok(()) => return,
            Err(message) => message,
        };

        if let Some(command) = parse_prefixed_command(&message.content, &self.config.command_prefix)
        {
            self.execute_command(command, Invocation::from_message(message))
                .await;
            return;
        }
        let Some(prompt) = self.chat_trigger_prompt(&message, bot_user_id) else {
            return;
        };
        debug!(
            message_id = message.message_id,
            user_id = message.author_id,
            channel_id = message.channel_id,
            "chat turn requested"
        );
        self.chat(&Invocation::from_message(message), &prompt).await;
    }

    /// Prompt for a mention or quick-chat message, or `None` when the message
    /// is not addressed to the bot.
    fn chat_trigger_prompt(
        &self,
        message: &InboundMessage,
        bot_user_id: Option<u64>,
    ) -> Option<String> {
        let content = message.content.as_str();
        let mentioned = bot_user_id.is_some_and(|id| {
            content.contains(&format!("<@{id}>")) || content.contains(&format!("<@!{id}>"))
        });
        let sigil = self.config.quick_chat_sigil.as_str();
        let sigil_used = !sigil.is_empty() && content.starts_with(sigil);
        if !mentioned && !sigil_used {
            return None;
        }

        let mut stripped = content.to_string();
        if let (true, Some(id)) = (mentioned, bot_user_id) {
            stripped = stripped
                .replace(&format!("<@!{id}>"), "")
                .replace(&format!("<@{id}>"), "");
        }
        let mut prompt = stripped.trim();
        if sigil_used {
            prompt = prompt.strip_prefix(sigil).unwrap_or(prompt).trim();
        }

        let prefix = self.config.command_prefix.as_str();
        if !prefix.is_empty() && prompt.starts_with(prefix) {
            return None;
        }
        if prompt.is_empty() && !has_image_input(message) {
            return None;
        }
        Some(prompt.to_string())
    }

    async fn handle_interaction(&self, interaction: InboundInteraction) {
        if let Err(error) = self
            .api
            .defer_interaction(interaction.id, &interaction.token)
            .await
        {
            warn!(
                interaction_id = interaction.id,
                command = %interaction.command_name,
                error = %format!("{error:#}"),
                "failed to acknowledge interaction"
            );
            return;
        }
        let command = command_from_interaction(&interaction.command_name, &interaction.options);
        let invocation = Invocation {
            user_id: interaction.user_id,
            channel_id: interaction.channel_id,
            target: ReplyTarget::Followup {
                application_id: interaction.application_id,
                token: interaction.token,
            },
            source: None,
        };
        self.execute_command(command, invocation).await;
    }

    async fn execute_command(&self, command: BotCommand, invocation: Invocation) {
        debug!(
            command = command.name(),
            user_id = invocation.user_id,
            channel_id = invocation.channel_id,
            "executing command"
        );
        match command {
            BotCommand::Chat { text } => self.chat(&invocation, &text).await,
            BotCommand::Reset => {
                let reply = self.reset_memory(invocation.user_id).await;
                self.reply_inline(&invocation, reply).await;
            }
            BotCommand::Memory => {
                let reply = match self.config.store.history(invocation.user_id) {
                    Some(history) if !history.is_empty() => {
                        format!("Memory:\n{}", render_memory_dump(&history))
                    }
                    _ => "No memory recorded.".to_string(),
                };
                self.reply_inline(&invocation, &reply).await;
            }
            BotCommand::Model { name } => {
                let reply = self.change_model(invocation.user_id, &name).await;
                self.reply_inline(&invocation, &reply).await;
            }
            BotCommand::ListModels => {
                let models = self.catalog.snapshot();
                if models.is_empty() {
                    self.reply_inline(&invocation, "Retrieving models...").await;
                    self.catalog.refresh(self.config.client.as_ref()).await;
                } else {
                    let reply = format!("Available models:\n```\n{}\n```", models.join("\n"));
                    self.reply_inline(&invocation, &reply).await;
                }
            }
            BotCommand::Image { prompt } => self.generate_image(&invocation, &prompt).await,
            BotCommand::Usage => {
                self.reply_inline(&invocation, "Usage: endpoint not implemented.")
                    .await;
            }
            BotCommand::Help => {
                let help = help_text(&self.config.command_prefix, &self.config.quick_chat_sigil);
                self.deliver(&invocation, with_mention(invocation.user_id, &help), Vec::new())
                    .await;
            }
            BotCommand::Invalid { message } => self.reply_inline(&invocation, &message).await,
        }
    }

    async fn chat(&self, invocation: &Invocation, prompt: &str) {
        self.throttle.signal(invocation.channel_id).await;
        let reply = self.run_turn(invocation, prompt).await;
        let extracted = extract_code_blocks(&reply);
        self.deliver(
            invocation,
            with_mention(invocation.user_id, &extracted.text),
            extracted.files,
        )
        .await;
    }

    /// One full conversation turn under the user's turn lock. Always yields
    /// text to show; collaborator failures become short notices.
    async fn run_turn(&self, invocation: &Invocation, prompt: &str) -> String {
        let user_id = invocation.user_id;
        let store = &self.config.store;
        let _turn = store.lock_turn(user_id).await;

        let images = match &invocation.source {
            Some(message) => self.images.collect(message).await,
            None => Vec::new(),
        };
        let has_images = !images.is_empty();
        let mut text = prompt.trim().to_string();
        if text.is_empty() && has_images {
            text = VISION_DEFAULT_PROMPT.to_string();
        }
        let content = if has_images {
            let mut parts = vec![ContentPart::text(text)];
            parts.extend(images);
            MessageContent::Parts(parts)
        } else {
            MessageContent::Text(text)
        };
        store.append_user(user_id, content);

        let model = self.model_for_turn(user_id, has_images);
        let request = ChatRequest {
            model: model.clone(),
            messages: store.window_for_request(user_id, self.config.window_strategy),
            max_tokens: self.config.max_tokens,
        };
        debug!(user_id, %model, messages = request.messages.len(), "sending completion");
        match self.config.client.complete(request).await {
            Ok(response) => {
                let reply = response.content;
                let persisted = reply.clone();
                let store = Arc::clone(store);
                if let Err(error) =
                    tokio::task::spawn_blocking(move || store.append_assistant(user_id, persisted))
                        .await
                {
                    warn!(user_id, %error, "failed to record assistant reply");
                }
                reply
            }
            Err(ParleyAiError::Timeout) => {
                warn!(user_id, %model, "completion timed out");
                COMPLETION_TIMEOUT_REPLY.to_string()
            }
            Err(error) => {
                warn!(user_id, %model, %error, "completion failed");
                COMPLETION_ERROR_REPLY.to_string()
            }
        }
    }

    fn model_for_turn(&self, user_id: UserId, has_images: bool) -> String {
        let model = self.config.model_settings.active_model(user_id);
        if has_images && !self.config.vision_models.iter().any(|vision| vision == &model) {
            info!(
                user_id,
                requested = %model,
                fallback = %self.config.vision_fallback_model,
                "using vision fallback model"
            );
            return self.config.vision_fallback_model.clone();
        }
        model
    }

    async fn reset_memory(&self, user_id: UserId) -> &'static str {
        let _turn = self.config.store.lock_turn(user_id).await;
        let store = Arc::clone(&self.config.store);
        match tokio::task::spawn_blocking(move || store.reset(user_id)).await {
            Ok(true) => "Memory cleared.",
            Ok(false) => "No memory to clear.",
            Err(error) => {
                warn!(user_id, %error, "memory reset task failed");
                "Unable to clear memory."
            }
        }
    }

    async fn change_model(&self, user_id: UserId, requested: &str) -> String {
        let requested = requested.trim();
        let scope = self.config.model_settings.scope();
        if scope == ModelScope::Global
            && !self.config.admin_user_ids.is_empty()
            && !self.config.admin_user_ids.contains(&user_id)
        {
            info!(user_id, model = requested, "rejected global model change from non-admin");
            return "Only bot administrators can change the global model.".to_string();
        }
        if !self.catalog.contains(requested) {
            return format!("Model `{requested}` not available. Use `/dispo`.");
        }

        let settings = Arc::clone(&self.config.model_settings);
        let model = requested.to_string();
        if let Err(error) =
            tokio::task::spawn_blocking(move || settings.set_model(user_id, &model)).await
        {
            warn!(user_id, %error, "model change task failed");
        }
        match scope {
            ModelScope::Global => format!("Global model changed to `{requested}` for everyone."),
            ModelScope::PerUser => format!("Your model is now `{requested}`."),
        }
    }

    async fn generate_image(&self, invocation: &Invocation, prompt: &str) {
        self.reply_inline(
            invocation,
            &format!("Generate an image for: `{prompt}`?\nReply **yes** to confirm."),
        )
        .await;

        let user_id = invocation.user_id;
        let channel_id = invocation.channel_id;
        let confirmation = self
            .waiters
            .wait_for(
                move |message: &InboundMessage| {
                    message.author_id == user_id
                        && message.channel_id == channel_id
                        && message.content.trim().eq_ignore_ascii_case("yes")
                },
                self.config.confirmation_timeout,
            )
            .await;
        if confirmation.is_none() {
            info!(user_id, channel_id, "image generation not confirmed in time");
            self.reply_inline(invocation, "Cancelled (timeout).").await;
            return;
        }

        self.throttle.signal(channel_id).await;
        let request = ImageRequest {
            prompt: prompt.to_string(),
            model: self.config.image_model.clone(),
            n: 1,
            size: self.config.image_size.clone(),
        };
        let reply = match self.config.client.generate_image(request).await {
            Ok(Some(url)) => format!("Here is your image:\n{url}"),
            Ok(None) => {
                warn!(user_id, "image generation returned no data");
                GENERATION_FAILED_REPLY.to_string()
            }
            Err(error) => {
                warn!(user_id, %error, "image generation failed");
                GENERATION_FAILED_REPLY.to_string()
            }
        };
        self.reply_inline(invocation, &reply).await;
    }

    async fn reply_inline(&self, invocation: &Invocation, text: &str) {
        let content = format!("<@{}> {text}", invocation.user_id);
        self.deliver(invocation, content, Vec::new()).await;
    }

    async fn post(&self, target: &ReplyTarget, content: &str, files: &[OutboundFile]) -> Result<()> {
        match target {
            ReplyTarget::Channel(channel_id) => {
                self.api.create_message(*channel_id, content, files).await
            }
            ReplyTarget::Followup {
                application_id,
                token,
            } => {
                self.api
                    .create_followup(*application_id, token, content, files)
                    .await
            }
        }
    }

    /// Sends `content` in message-sized chunks with `files` on the last one.
    /// A failed send stops the reply and posts a short notice instead.
    async fn deliver(&self, invocation: &Invocation, content: String, files: Vec<OutboundFile>) {
        let chunks = chunk_text(&content, DISCORD_MAX_MESSAGE_CHARS);
        let last = chunks.len().saturating_sub(1);
        for (index, chunk) in chunks.iter().enumerate() {
            let attached: &[OutboundFile] = if index == last { &files } else { &[] };
            if let Err(error) = self.post(&invocation.target, chunk, attached).await {
                warn!(
                    user_id = invocation.user_id,
                    channel_id = invocation.channel_id,
                    error = %format!("{error:#}"),
                    "send failed"
                );
                let notice = format!("<@{}> {SEND_FAILURE_REPLY}", invocation.user_id);
                if let Err(error) = self.post(&invocation.target, &notice, &[]).await {
                    warn!(
                        channel_id = invocation.channel_id,
                        error = %format!("{error:#}"),
                        "send failure notice failed"
                    );
                }
                return;
            }
        }
    }

    async fn register_commands(&self, application_id: u64) {
        match self
            .api
            .overwrite_global_commands(application_id, &command_definitions())
            .await
        {
            Ok(count) => info!(count, application_id, "registered global application commands"),
            Err(error) => warn!(
                application_id,
                error = %format!("{error:#}"),
                "failed to register application commands"
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Shutdown,
    Reconnect,
}

struct DiscordBridgeRuntime {
    relay: Arc<DiscordRelay>,
    sequence: Option<u64>,
    commands_registered: bool,
}

impl DiscordBridgeRuntime {
    fn new(config: DiscordBridgeRuntimeConfig) -> Result<Self> {
        Ok(Self {
            relay: Arc::new(DiscordRelay::new(config)?),
            sequence: None,
            commands_registered: false,
        })
    }

    async fn resolve_gateway_url(&self) -> Result<String> {
        match self
            .relay
            .config
            .gateway_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
        {
            Some(url) => Ok(url.to_string()),
            None => self.relay.api.gateway_url().await,
        }
    }

    async fn run(&mut self) -> Result<()> {
        let reconnect_delay = self.relay.config.reconnect_delay;
        loop {
            match self.resolve_gateway_url().await {
                Ok(gateway_url) => {
                    info!(%gateway_url, "discord gateway connecting");
                    match self.run_gateway_session(&gateway_url).await {
                        Ok(SessionEnd::Shutdown) => {
                            info!("discord bridge shutdown requested");
                            return Ok(());
                        }
                        Ok(SessionEnd::Reconnect) => info!("discord gateway session ended"),
                        Err(error) => warn!(
                            error = %format!("{error:#}"),
                            "discord gateway session error"
                        ),
                    }
                }
                Err(error) => warn!(
                    error = %format!("{error:#}"),
                    "discord bridge failed to resolve gateway url"
                ),
            }

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("discord bridge shutdown requested");
                    return Ok(());
                }
                _ = tokio::time::sleep(reconnect_delay) => {}
            }
        }
    }

    async fn run_gateway_session(&mut self, gateway_url: &str) -> Result<SessionEnd> {
        let (stream, _response) = connect_async(gateway_connect_url(gateway_url))
            .await
            .context("failed to connect discord gateway websocket")?;
        let (mut sink, mut source) = stream.split();
        self.sequence = None;

        let hello = loop {
            let Some(frame) = source.next().await else {
                bail!("discord gateway closed before hello");
            };
            let frame = frame.context("failed reading discord gateway message")?;
            if let Some(payload) = parse_gateway_frame(frame)? {
                if payload.op == OP_HELLO {
                    break payload;
                }
            }
        };
        let interval = hello_interval(&hello)?;
        send_payload(&mut sink, &identify_payload(&self.relay.config.bot_token)).await?;
        debug!(interval_ms = interval.as_millis() as u64, "discord gateway identified");

        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        let mut awaiting_ack = false;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    let _ = sink.close().await;
                    return Ok(SessionEnd::Shutdown);
                }
                _ = heartbeat.tick() => {
                    if awaiting_ack {
                        bail!("discord gateway heartbeat was not acknowledged");
                    }
                    send_payload(&mut sink, &heartbeat_payload(self.sequence)).await?;
                    awaiting_ack = true;
                }
                maybe_frame = source.next() => {
                    let Some(frame) = maybe_frame else {
                        return Ok(SessionEnd::Reconnect);
                    };
                    let frame = frame.context("failed reading discord gateway message")?;
                    let Some(payload) = parse_gateway_frame(frame)? else {
                        continue;
                    };
                    if let Some(sequence) = payload.s {
                        self.sequence = Some(sequence);
                    }
                    match payload.op {
                        OP_DISPATCH => self.handle_dispatch(payload),
                        OP_HEARTBEAT => {
                            send_payload(&mut sink, &heartbeat_payload(self.sequence)).await?;
                        }
                        OP_HEARTBEAT_ACK => awaiting_ack = false,
                        OP_RECONNECT => {
                            info!("discord gateway requested reconnect");
                            return Ok(SessionEnd::Reconnect);
                        }
                        OP_INVALID_SESSION => {
                            warn!("discord gateway invalidated the session");
                            return Ok(SessionEnd::Reconnect);
                        }
                        other => debug!(op = other, "ignoring discord gateway opcode"),
                    }
                }
            }
        }
    }

    /// Each inbound event runs on its own task so a slow turn never stalls
    /// the gateway and a failing handler only affects its own event.
    fn handle_dispatch(&mut self, payload: GatewayPayload) {
        let Some(event_type) = payload.t.as_deref() else {
            return;
        };
        let event = match decode_dispatch(event_type, payload.d) {
            Ok(Some(event)) => event,
            Ok(None) => return,
            Err(error) => {
                warn!(event_type, error = %format!("{error:#}"), "failed to decode dispatch");
                return;
            }
        };
        match event {
            GatewayEvent::Ready(ready) => {
                info!(
                    user_id = ready.user_id,
                    application_id = ready.application_id,
                    "discord bridge ready"
                );
                self.relay.set_identity(ready);
                let relay = Arc::clone(&self.relay);
                tokio::spawn(async move {
                    relay.catalog.refresh(relay.config.client.as_ref()).await;
                });
                if self.relay.config.register_commands && !self.commands_registered {
                    match ready.application_id {
                        Some(application_id) => {
                            self.commands_registered = true;
                            let relay = Arc::clone(&self.relay);
                            tokio::spawn(async move {
                                relay.register_commands(application_id).await;
                            });
                        }
                        None => warn!("READY carried no application id; skipping command registration"),
                    }
                }
            }
            GatewayEvent::MessageCreate(message) => {
                let relay = Arc::clone(&self.relay);
                tokio::spawn(async move {
                    relay.handle_message(message).await;
                });
            }
            GatewayEvent::InteractionCreate(interaction) => {
                let relay = Arc::clone(&self.relay);
                tokio::spawn(async move {
                    relay.handle_interaction(interaction).await;
                });
            }
        }
    }
}

async fn send_payload<S>(sink: &mut S, payload: &Value) -> Result<()>
where
    S: futures_util::Sink<WsMessage> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    sink.send(WsMessage::Text(payload.to_string().into()))
        .await
        .context("failed to send discord gateway payload")
}
