//! Discord bridge for the Parley relay.
//!
//! Connects to the Discord gateway, turns mentions, `,`-prefixed messages,
//! prefix commands and slash-command interactions into conversation turns
//! against the completion API, and posts replies back with code blocks split
//! out as attachments. Typing indicators go through a per-channel
//! [`TypingThrottle`] so the bot stays under Discord's typing rate limit.

mod commands;
mod discord_api_client;
mod discord_gateway;
mod discord_helpers;
mod discord_runtime;
mod image_inputs;
mod message_waiters;
mod model_catalog;
mod reply_render;
mod typing_throttle;

pub use commands::{command_definitions, BotCommand};
pub use image_inputs::{DEFAULT_IMAGE_FETCH_TIMEOUT_MS, DEFAULT_IMAGE_MAX_BYTES};
pub use discord_api_client::{DiscordApiClient, OutboundFile};
pub use discord_runtime::{run_discord_bridge, DiscordBridgeRuntimeConfig};
pub use message_waiters::MessageWaiters;
pub use model_catalog::ModelCatalog;
pub use reply_render::{extract_code_blocks, render_memory_dump, ExtractedReply};
pub use typing_throttle::{
    ChannelId, TypingSignal, TypingSignalError, TypingThrottle, DEFAULT_RATE_LIMIT_BACKOFF,
    DEFAULT_TYPING_COOLDOWN, MAX_RATE_LIMIT_WAIT,
};
