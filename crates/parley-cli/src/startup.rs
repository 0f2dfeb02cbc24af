//! Startup wiring from parsed flags to a running Discord bridge.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use parley_ai::{LlmClient, OpenAiClient, OpenAiConfig};
use parley_conversation::{
    ConversationStore, ConversationStoreConfig, ModelScope, ModelSettings, WindowStrategy,
    DEFAULT_TAIL_SLICE_CHARS, DEFAULT_WINDOW_CHARS,
};
use parley_discord_runtime::{run_discord_bridge, DiscordBridgeRuntimeConfig};
use tracing::info;

use crate::cli_args::Cli;
use crate::cli_types::CliWindowStrategy;

pub(crate) fn window_strategy_from_cli(cli: &Cli) -> WindowStrategy {
    match cli.window_strategy {
        CliWindowStrategy::DropWhole => WindowStrategy::DropWhole {
            max_chars: cli.window_chars.unwrap_or(DEFAULT_WINDOW_CHARS),
            image_cost: cli.image_cost,
        },
        CliWindowStrategy::TailSlice => WindowStrategy::TailSlice {
            max_chars: cli.window_chars.unwrap_or(DEFAULT_TAIL_SLICE_CHARS),
        },
    }
}

pub(crate) fn build_completion_client(cli: &Cli) -> Result<Arc<dyn LlmClient>> {
    let config = OpenAiConfig {
        completion_timeout_ms: cli.completion_timeout_ms,
        models_timeout_ms: cli.models_timeout_ms,
        image_timeout_ms: cli.image_timeout_ms,
        ..OpenAiConfig::new(cli.api_base.trim(), cli.api_key.trim())
    };
    let client = OpenAiClient::new(config).context("failed to create completion client")?;
    Ok(Arc::new(client))
}

/// Builds the bridge configuration: opens the conversation store, loads the
/// model setting and creates the completion client.
pub(crate) fn build_runtime_config(cli: &Cli) -> Result<DiscordBridgeRuntimeConfig> {
    std::fs::create_dir_all(&cli.state_dir)
        .with_context(|| format!("failed to create {}", cli.state_dir.display()))?;

    let store = Arc::new(ConversationStore::open(ConversationStoreConfig {
        path: cli.state_dir.join(&cli.memory_file),
        system_prompt: cli.system_prompt.clone(),
        history_cap: cli.history_cap,
    }));
    let scope = ModelScope::from(cli.model_scope);
    let model_settings = Arc::new(ModelSettings::load(
        scope,
        cli.model.clone(),
        cli.state_dir.join(&cli.model_file),
        Arc::clone(&store),
    ));
    let client = build_completion_client(cli)?;

    Ok(DiscordBridgeRuntimeConfig {
        client,
        store,
        model_settings,
        window_strategy: window_strategy_from_cli(cli),
        max_tokens: Some(cli.max_tokens),
        api_base: cli.discord_api_base.trim().to_string(),
        gateway_url: cli
            .gateway_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string),
        bot_token: cli.discord_token.clone(),
        request_timeout_ms: cli.discord_request_timeout_ms,
        typing_cooldown: Duration::from_millis(cli.typing_cooldown_ms),
        confirmation_timeout: Duration::from_millis(cli.confirmation_timeout_ms),
        command_prefix: cli.command_prefix.clone(),
        quick_chat_sigil: cli.quick_chat_sigil.trim().to_string(),
        admin_user_ids: cli.admin_user_ids.clone(),
        vision_models: cli
            .vision_models
            .iter()
            .map(|model| model.trim().to_string())
            .filter(|model| !model.is_empty())
            .collect(),
        vision_fallback_model: cli.vision_fallback_model.clone(),
        image_model: cli.image_model.clone(),
        image_size: cli.image_size.clone(),
        image_fetch_timeout_ms: cli.image_fetch_timeout_ms,
        image_max_bytes: cli.image_max_bytes,
        reconnect_delay: Duration::from_millis(cli.reconnect_delay_ms),
        register_commands: cli.register_commands,
    })
}

pub(crate) async fn run_cli(cli: Cli) -> Result<()> {
    let config = build_runtime_config(&cli)?;
    info!(
        state_dir = %cli.state_dir.display(),
        model = %config.model_settings.default_model(),
        model_scope = config.model_settings.scope().as_str(),
        window_chars = config.window_strategy.max_chars(),
        "starting parley discord bridge"
    );
    run_discord_bridge(config).await
}
