use std::path::PathBuf;

use clap::{ArgAction, Parser};
use parley_conversation::{DEFAULT_HISTORY_CAP, DEFAULT_SYSTEM_PROMPT};

use crate::cli_types::{CliModelScope, CliWindowStrategy};

fn parse_positive_usize(value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_u32(value: &str) -> Result<u32, String> {
    let parsed = value
        .parse::<u32>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_non_empty(value: &str) -> Result<String, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err("value must not be empty".to_string());
    }
    Ok(trimmed.to_string())
}

#[derive(Debug, Parser)]
#[command(
    name = "parley",
    about = "Discord relay bot for OpenAI-compatible chat completion APIs",
    version
)]
pub struct Cli {
    #[arg(
        long = "discord-token",
        env = "DISCORD_TOKEN",
        hide_env_values = true,
        value_parser = parse_non_empty,
        help = "Discord bot token"
    )]
    pub discord_token: String,

    #[arg(
        long = "api-key",
        env = "PARLEY_API_KEY",
        hide_env_values = true,
        value_parser = parse_non_empty,
        help = "API key for the completion provider"
    )]
    pub api_key: String,

    #[arg(
        long = "api-base",
        env = "PARLEY_API_BASE",
        default_value = "https://api.openai.com/v1",
        help = "Base URL of the OpenAI-compatible completion API"
    )]
    pub api_base: String,

    #[arg(
        long = "discord-api-base",
        env = "PARLEY_DISCORD_API_BASE",
        default_value = "https://discord.com/api/v10",
        help = "Base URL of the Discord REST API"
    )]
    pub discord_api_base: String,

    #[arg(
        long = "gateway-url",
        env = "PARLEY_GATEWAY_URL",
        help = "Fixed Discord gateway websocket URL. Looked up from the REST API when unset."
    )]
    pub gateway_url: Option<String>,

    #[arg(
        long = "state-dir",
        env = "PARLEY_STATE_DIR",
        default_value = ".parley",
        help = "Directory holding conversation memory and the model setting"
    )]
    pub state_dir: PathBuf,

    #[arg(
        long = "memory-file",
        env = "PARLEY_MEMORY_FILE",
        default_value = "memory.json",
        help = "Conversation memory file name inside --state-dir"
    )]
    pub memory_file: String,

    #[arg(
        long = "model-file",
        env = "PARLEY_MODEL_FILE",
        default_value = "global_model.json",
        help = "Global model setting file name inside --state-dir"
    )]
    pub model_file: String,

    #[arg(
        long,
        env = "PARLEY_MODEL",
        default_value = "gpt-4o-mini",
        value_parser = parse_non_empty,
        help = "Model used until a model command changes it"
    )]
    pub model: String,

    #[arg(
        long = "model-scope",
        env = "PARLEY_MODEL_SCOPE",
        value_enum,
        default_value = "global",
        help = "Whether a model change applies to everyone or only to the requesting user"
    )]
    pub model_scope: CliModelScope,

    #[arg(
        long = "window-strategy",
        env = "PARLEY_WINDOW_STRATEGY",
        value_enum,
        default_value = "drop-whole",
        help = "How history is cut down to the request character budget"
    )]
    pub window_strategy: CliWindowStrategy,

    #[arg(
        long = "window-chars",
        env = "PARLEY_WINDOW_CHARS",
        value_parser = parse_positive_usize,
        help = "Request character budget. Defaults to 12000 for drop-whole and 3000 for tail-slice."
    )]
    pub window_chars: Option<usize>,

    #[arg(
        long = "image-cost",
        env = "PARLEY_IMAGE_COST",
        default_value_t = 1_000,
        help = "Characters charged per image part by the drop-whole strategy"
    )]
    pub image_cost: usize,

    #[arg(
        long = "max-tokens",
        env = "PARLEY_MAX_TOKENS",
        default_value_t = 2_000,
        value_parser = parse_positive_u32,
        help = "max_tokens sent with every completion request"
    )]
    pub max_tokens: u32,

    #[arg(
        long = "completion-timeout-ms",
        env = "PARLEY_COMPLETION_TIMEOUT_MS",
        default_value_t = 120_000,
        value_parser = parse_positive_u64,
        help = "Timeout for one completion request"
    )]
    pub completion_timeout_ms: u64,

    #[arg(
        long = "models-timeout-ms",
        env = "PARLEY_MODELS_TIMEOUT_MS",
        default_value_t = 10_000,
        value_parser = parse_positive_u64,
        help = "Timeout for the model list request"
    )]
    pub models_timeout_ms: u64,

    #[arg(
        long = "image-timeout-ms",
        env = "PARLEY_IMAGE_TIMEOUT_MS",
        default_value_t = 60_000,
        value_parser = parse_positive_u64,
        help = "Timeout for one image generation request"
    )]
    pub image_timeout_ms: u64,

    #[arg(
        long = "discord-request-timeout-ms",
        env = "PARLEY_DISCORD_REQUEST_TIMEOUT_MS",
        default_value_t = 10_000,
        value_parser = parse_positive_u64,
        help = "Timeout for Discord REST requests"
    )]
    pub discord_request_timeout_ms: u64,

    #[arg(
        long = "image-fetch-timeout-ms",
        env = "PARLEY_IMAGE_FETCH_TIMEOUT_MS",
        default_value_t = parley_discord_runtime::DEFAULT_IMAGE_FETCH_TIMEOUT_MS,
        value_parser = parse_positive_u64,
        help = "Timeout for downloading one image attachment or link"
    )]
    pub image_fetch_timeout_ms: u64,

    #[arg(
        long = "image-max-bytes",
        env = "PARLEY_IMAGE_MAX_BYTES",
        default_value_t = parley_discord_runtime::DEFAULT_IMAGE_MAX_BYTES,
        value_parser = parse_positive_usize,
        help = "Largest image body downloaded for one attachment or link"
    )]
    pub image_max_bytes: usize,

    #[arg(
        long = "typing-cooldown-ms",
        env = "PARLEY_TYPING_COOLDOWN_MS",
        default_value_t = 5_000,
        help = "Minimum spacing between typing indicators in one channel"
    )]
    pub typing_cooldown_ms: u64,

    #[arg(
        long = "confirmation-timeout-ms",
        env = "PARLEY_CONFIRMATION_TIMEOUT_MS",
        default_value_t = 60_000,
        value_parser = parse_positive_u64,
        help = "How long an image request waits for its yes confirmation"
    )]
    pub confirmation_timeout_ms: u64,

    #[arg(
        long = "history-cap",
        env = "PARLEY_HISTORY_CAP",
        default_value_t = DEFAULT_HISTORY_CAP,
        value_parser = parse_positive_usize,
        help = "Maximum stored entries per user, system entry included"
    )]
    pub history_cap: usize,

    #[arg(
        long = "system-prompt",
        env = "PARLEY_SYSTEM_PROMPT",
        default_value = DEFAULT_SYSTEM_PROMPT,
        help = "System entry placed at the start of every new conversation"
    )]
    pub system_prompt: String,

    #[arg(
        long = "admin-user-id",
        env = "PARLEY_ADMIN_USER_IDS",
        value_delimiter = ',',
        help = "Discord user ids allowed to change the global model. Empty allows everyone."
    )]
    pub admin_user_ids: Vec<u64>,

    #[arg(
        long = "vision-model",
        env = "PARLEY_VISION_MODELS",
        value_delimiter = ',',
        default_value = "gpt-5.1,gpt-4o,gpt-4-turbo",
        help = "Models that accept image input"
    )]
    pub vision_models: Vec<String>,

    #[arg(
        long = "vision-fallback-model",
        env = "PARLEY_VISION_FALLBACK_MODEL",
        default_value = "gpt-5.1",
        value_parser = parse_non_empty,
        help = "Model used for turns with images when the active model lacks vision"
    )]
    pub vision_fallback_model: String,

    #[arg(
        long = "image-model",
        env = "PARLEY_IMAGE_MODEL",
        default_value = "dall-e-3",
        help = "Model used by the image command"
    )]
    pub image_model: String,

    #[arg(
        long = "image-size",
        env = "PARLEY_IMAGE_SIZE",
        default_value = "1024x1024",
        help = "Size requested by the image command"
    )]
    pub image_size: String,

    #[arg(
        long = "command-prefix",
        env = "PARLEY_COMMAND_PREFIX",
        default_value = "!",
        value_parser = parse_non_empty,
        help = "Prefix for text commands such as !reset"
    )]
    pub command_prefix: String,

    #[arg(
        long = "quick-chat-sigil",
        env = "PARLEY_QUICK_CHAT_SIGIL",
        default_value = ",",
        help = "Leading text that turns a message into a chat turn. Empty disables it."
    )]
    pub quick_chat_sigil: String,

    #[arg(
        long = "reconnect-delay-ms",
        env = "PARLEY_RECONNECT_DELAY_MS",
        default_value_t = 5_000,
        value_parser = parse_positive_u64,
        help = "Pause before reconnecting to the Discord gateway"
    )]
    pub reconnect_delay_ms: u64,

    #[arg(
        long = "register-commands",
        env = "PARLEY_REGISTER_COMMANDS",
        action = ArgAction::SetTrue,
        help = "Overwrite the global slash-command set once the gateway is ready"
    )]
    pub register_commands: bool,
}
