//! Discord gateway framing plus the inbound event shapes the relay consumes.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::discord_helpers::parse_snowflake;

pub(crate) const OP_DISPATCH: u8 = 0;
pub(crate) const OP_HEARTBEAT: u8 = 1;
pub(crate) const OP_IDENTIFY: u8 = 2;
pub(crate) const OP_RECONNECT: u8 = 7;
pub(crate) const OP_INVALID_SESSION: u8 = 9;
pub(crate) const OP_HELLO: u8 = 10;
pub(crate) const OP_HEARTBEAT_ACK: u8 = 11;

const INTENT_GUILDS: u64 = 1 << 0;
const INTENT_GUILD_MESSAGES: u64 = 1 << 9;
const INTENT_DIRECT_MESSAGES: u64 = 1 << 12;
const INTENT_MESSAGE_CONTENT: u64 = 1 << 15;
pub(crate) const GATEWAY_INTENTS: u64 =
    INTENT_GUILDS | INTENT_GUILD_MESSAGES | INTENT_DIRECT_MESSAGES | INTENT_MESSAGE_CONTENT;

const INTERACTION_TYPE_APPLICATION_COMMAND: u8 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct GatewayPayload {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default)]
    pub s: Option<u64>,
    #[serde(default)]
    pub t: Option<String>,
}

/// Appends the version and encoding query the gateway expects.
pub(crate) fn gateway_connect_url(base: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.contains('?') {
        base.to_string()
    } else {
        format!("{base}/?v=10&encoding=json")
    }
}

pub(crate) fn identify_payload(bot_token: &str) -> Value {
    json!({
        "op": OP_IDENTIFY,
        "d": {
            "token": bot_token,
            "intents": GATEWAY_INTENTS,
            "properties": {
                "os": std::env::consts::OS,
                "browser": "parley",
                "device": "parley",
            },
        },
    })
}

pub(crate) fn heartbeat_payload(sequence: Option<u64>) -> Value {
    json!({ "op": OP_HEARTBEAT, "d": sequence })
}

pub(crate) fn hello_interval(payload: &GatewayPayload) -> Result<Duration> {
    let interval_ms = payload
        .d
        .get("heartbeat_interval")
        .and_then(Value::as_u64)
        .filter(|interval| *interval > 0)
        .ok_or_else(|| anyhow!("gateway hello is missing heartbeat_interval"))?;
    Ok(Duration::from_millis(interval_ms))
}

/// Decodes one websocket frame. Control frames yield `None`.
pub(crate) fn parse_gateway_frame(message: WsMessage) -> Result<Option<GatewayPayload>> {
    match message {
        WsMessage::Text(text) => serde_json::from_str::<GatewayPayload>(&text)
            .map(Some)
            .context("failed to parse discord gateway payload"),
        WsMessage::Binary(bytes) => {
            let text =
                String::from_utf8(bytes.to_vec()).context("invalid utf-8 discord gateway payload")?;
            serde_json::from_str::<GatewayPayload>(&text)
                .map(Some)
                .context("failed to parse discord gateway payload")
        }
        WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => Ok(None),
        WsMessage::Close(frame) => Err(anyhow!(
            "discord gateway closed the connection: {}",
            frame
                .map(|frame| format!("{} {}", u16::from(frame.code), frame.reason.as_str()))
                .unwrap_or_else(|| "no close frame".to_string())
        )),
    }
}

#[derive(Debug, Deserialize)]
struct DiscordUser {
    id: String,
    #[serde(default)]
    bot: bool,
}

#[derive(Debug, Deserialize)]
struct DiscordAttachment {
    url: String,
    #[serde(default)]
    content_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DiscordMessage {
    id: String,
    channel_id: String,
    author: DiscordUser,
    #[serde(default)]
    content: String,
    #[serde(default)]
    attachments: Vec<DiscordAttachment>,
}

#[derive(Debug, Deserialize)]
struct DiscordMember {
    user: DiscordUser,
}

#[derive(Debug, Deserialize)]
struct DiscordCommandOption {
    name: String,
    #[serde(default)]
    value: Value,
}

#[derive(Debug, Deserialize)]
struct DiscordInteractionData {
    name: String,
    #[serde(default)]
    options: Vec<DiscordCommandOption>,
}

#[derive(Debug, Deserialize)]
struct DiscordInteraction {
    id: String,
    application_id: String,
    #[serde(rename = "type")]
    kind: u8,
    token: String,
    #[serde(default)]
    channel_id: Option<String>,
    #[serde(default)]
    data: Option<DiscordInteractionData>,
    #[serde(default)]
    member: Option<DiscordMember>,
    #[serde(default)]
    user: Option<DiscordUser>,
}

#[derive(Debug, Deserialize)]
struct DiscordApplication {
    id: String,
}

#[derive(Debug, Deserialize)]
struct DiscordReady {
    user: DiscordUser,
    #[serde(default)]
    application: Option<DiscordApplication>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InboundAttachment {
    pub url: String,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InboundMessage {
    pub message_id: u64,
    pub channel_id: u64,
    pub author_id: u64,
    pub author_is_bot: bool,
    pub content: String,
    pub attachments: Vec<InboundAttachment>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct InboundInteraction {
    pub id: u64,
    pub application_id: u64,
    pub token: String,
    pub channel_id: u64,
    pub user_id: u64,
    pub command_name: String,
    pub options: Vec<(String, Value)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReadyEvent {
    pub user_id: u64,
    pub application_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum GatewayEvent {
    Ready(ReadyEvent),
    MessageCreate(InboundMessage),
    InteractionCreate(InboundInteraction),
}

fn snowflake(field: &str, raw: &str) -> Result<u64> {
    parse_snowflake(raw).ok_or_else(|| anyhow!("invalid discord snowflake in {field}: '{raw}'"))
}

/// Maps an op-0 dispatch to an event the relay handles. Dispatch types the
/// relay does not care about yield `None`.
pub(crate) fn decode_dispatch(event_type: &str, data: Value) -> Result<Option<GatewayEvent>> {
    match event_type {
        "READY" => {
            let ready: DiscordReady =
                serde_json::from_value(data).context("failed to decode READY dispatch")?;
            let application_id = match ready.application {
                Some(application) => Some(snowflake("application.id", &application.id)?),
                None => None,
            };
            Ok(Some(GatewayEvent::Ready(ReadyEvent {
                user_id: snowflake("user.id", &ready.user.id)?,
                application_id,
            })))
        }
        "MESSAGE_CREATE" => {
            let message: DiscordMessage =
                serde_json::from_value(data).context("failed to decode MESSAGE_CREATE dispatch")?;
            Ok(Some(GatewayEvent::MessageCreate(InboundMessage {
                message_id: snowflake("message.id", &message.id)?,
                channel_id: snowflake("message.channel_id", &message.channel_id)?,
                author_id: snowflake("message.author.id", &message.author.id)?,
                author_is_bot: message.author.bot,
                content: message.content,
                attachments: message
                    .attachments
                    .into_iter()
                    .map(|attachment| InboundAttachment {
                        url: attachment.url,
                        content_type: attachment.content_type,
                    })
                    .collect(),
            })))
        }
        "INTERACTION_CREATE" => {
            let interaction: DiscordInteraction = serde_json::from_value(data)
                .context("failed to decode INTERACTION_CREATE dispatch")?;
            if interaction.kind != INTERACTION_TYPE_APPLICATION_COMMAND {
                return Ok(None);
            }
            let Some(command) = interaction.data else {
                return Ok(None);
            };
            let invoker = interaction
                .member
                .map(|member| member.user)
                .or(interaction.user)
                .ok_or_else(|| anyhow!("interaction has no invoking user"))?;
            let channel_id = interaction
                .channel_id
                .as_deref()
                .ok_or_else(|| anyhow!("interaction has no channel"))?;
            Ok(Some(GatewayEvent::InteractionCreate(InboundInteraction {
                id: snowflake("interaction.id", &interaction.id)?,
                application_id: snowflake("interaction.application_id", &interaction.application_id)?,
                token: interaction.token,
                channel_id: snowflake("interaction.channel_id", channel_id)?,
                user_id: snowflake("interaction.user.id", &invoker.id)?,
                command_name: command.name,
                options: command
                    .options
                    .into_iter()
                    .map(|option| (option.name, option.value))
                    .collect(),
            })))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    use super::{
        decode_dispatch, gateway_connect_url, heartbeat_payload, hello_interval,
        identify_payload, parse_gateway_frame, GatewayEvent, InboundAttachment, OP_HELLO,
    };

    #[test]
    fn unit_identify_payload_requests_message_content_intents() {
        let payload = identify_payload("secret");
        assert_eq!(payload["op"], 2);
        assert_eq!(payload["d"]["token"], "secret");
        assert_eq!(payload["d"]["intents"], 37377);
    }

    #[test]
    fn unit_heartbeat_payload_carries_last_sequence() {
        assert_eq!(heartbeat_payload(Some(42)), json!({"op": 1, "d": 42}));
        assert_eq!(heartbeat_payload(None), json!({"op": 1, "d": null}));
    }

    #[test]
    fn unit_gateway_connect_url_appends_version_query_once() {
        assert_eq!(
            gateway_connect_url("wss://gateway.discord.gg"),
            "wss://gateway.discord.gg/?v=10&encoding=json"
        );
        assert_eq!(
            gateway_connect_url("ws://127.0.0.1:9000/?v=10&encoding=json"),
            "ws://127.0.0.1:9000/?v=10&encoding=json"
        );
    }

    #[test]
    fn functional_parse_gateway_frame_reads_hello_interval() {
        let frame = WsMessage::Text(
            json!({"op": 10, "d": {"heartbeat_interval": 41250}, "s": null, "t": null})
                .to_string()
                .into(),
        );
        let payload = parse_gateway_frame(frame)
            .expect("parse")
            .expect("payload");
        assert_eq!(payload.op, OP_HELLO);
        assert_eq!(
            hello_interval(&payload).expect("interval"),
            Duration::from_millis(41_250)
        );
    }

    #[test]
    fn regression_parse_gateway_frame_reports_close_frames() {
        assert!(parse_gateway_frame(WsMessage::Close(None)).is_err());
        assert!(parse_gateway_frame(WsMessage::Ping(Vec::new().into()))
            .expect("ping")
            .is_none());
    }

    #[test]
    fn functional_decode_dispatch_reads_ready_identity() {
        let event = decode_dispatch(
            "READY",
            json!({
                "v": 10,
                "user": {"id": "1001", "username": "parley", "bot": true},
                "application": {"id": "2002", "flags": 0},
                "session_id": "abc",
            }),
        )
        .expect("decode")
        .expect("event");
        match event {
            GatewayEvent::Ready(ready) => {
                assert_eq!(ready.user_id, 1001);
                assert_eq!(ready.application_id, Some(2002));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn functional_decode_dispatch_normalizes_message_create() {
        let event = decode_dispatch(
            "MESSAGE_CREATE",
            json!({
                "id": "10",
                "channel_id": "20",
                "author": {"id": "30", "username": "someone"},
                "content": "<@1001> hello",
                "attachments": [
                    {"id": "1", "url": "https://cdn.example/a.png", "content_type": "image/png", "filename": "a.png"},
                    {"id": "2", "url": "https://cdn.example/b.txt", "filename": "b.txt"}
                ],
            }),
        )
        .expect("decode")
        .expect("event");
        let GatewayEvent::MessageCreate(message) = event else {
            panic!("expected message");
        };
        assert_eq!(message.channel_id, 20);
        assert_eq!(message.author_id, 30);
        assert!(!message.author_is_bot);
        assert_eq!(message.content, "<@1001> hello");
        assert_eq!(
            message.attachments,
            vec![
                InboundAttachment {
                    url: "https://cdn.example/a.png".to_string(),
                    content_type: Some("image/png".to_string()),
                },
                InboundAttachment {
                    url: "https://cdn.example/b.txt".to_string(),
                    content_type: None,
                },
            ]
        );
    }

    #[test]
    fn functional_decode_dispatch_reads_guild_interaction_options() {
        let event = decode_dispatch(
            "INTERACTION_CREATE",
            json!({
                "id": "500",
                "application_id": "2002",
                "type": 2,
                "token": "interaction-token",
                "channel_id": "20",
                "member": {"user": {"id": "30"}},
                "data": {"name": "chat", "options": [{"name": "user_message", "type": 3, "value": "hi"}]},
            }),
        )
        .expect("decode")
        .expect("event");
        let GatewayEvent::InteractionCreate(interaction) = event else {
            panic!("expected interaction");
        };
        assert_eq!(interaction.user_id, 30);
        assert_eq!(interaction.command_name, "chat");
        assert_eq!(
            interaction.options,
            vec![("user_message".to_string(), json!("hi"))]
        );
    }

    #[test]
    fn regression_decode_dispatch_ignores_non_command_interactions_and_unknown_events() {
        let ping = decode_dispatch(
            "INTERACTION_CREATE",
            json!({"id": "1", "application_id": "2", "type": 1, "token": "t"}),
        )
        .expect("decode");
        assert!(ping.is_none());
        assert!(decode_dispatch("TYPING_START", json!({}))
            .expect("decode")
            .is_none());
    }

    #[test]
    fn regression_decode_dispatch_rejects_non_numeric_ids() {
        let error = decode_dispatch(
            "MESSAGE_CREATE",
            json!({"id": "x", "channel_id": "20", "author": {"id": "30"}}),
        )
        .expect_err("invalid id");
        assert!(error.to_string().contains("message.id"));
    }
}
