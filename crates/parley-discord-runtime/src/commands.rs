//! Bot command parsing for prefix messages and slash-command interactions.

use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotCommand {
    Chat { text: String },
    Reset,
    Memory,
    Model { name: String },
    ListModels,
    Image { prompt: String },
    Usage,
    Help,
    Invalid { message: String },
}

impl BotCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Chat { .. } => "chat",
            Self::Reset => "reset",
            Self::Memory => "memory",
            Self::Model { .. } => "model",
            Self::ListModels => "dispo",
            Self::Image { .. } => "image",
            Self::Usage => "usage",
            Self::Help => "help",
            Self::Invalid { .. } => "invalid",
        }
    }
}

pub(crate) fn help_text(prefix: &str, sigil: &str) -> String {
    [
        "Available commands:".to_string(),
        format!("- `/chat <message>` or `{prefix}chat <message>`: Chat with the AI."),
        format!("- `/reset` or `{prefix}reset`: Clear your conversation memory."),
        format!("- `/memory` or `{prefix}memory`: Display your current memory."),
        format!("- `/model <name>` or `{prefix}model <name>`: Change the AI model (see `/dispo`)."),
        format!("- `/dispo` or `{prefix}dispo`: List available models."),
        format!("- `/usage` or `{prefix}usage`: Display usage (not implemented)."),
        format!("- `/image <prompt>` or `{prefix}image <prompt>`: Generate an image (confirmation required)."),
        format!("- Mention the bot or start a message with `{sigil}` for quick chat."),
        String::new(),
        "For vision: send an image as attachment or URL with your question.".to_string(),
    ]
    .join("\n")
}

fn required_argument(command: &str, argument: &str, prefix: &str, value: &str) -> Result<String, BotCommand> {
    let value = value.trim();
    if value.is_empty() {
        Err(BotCommand::Invalid {
            message: format!("Usage: `{prefix}{command} <{argument}>`"),
        })
    } else {
        Ok(value.to_string())
    }
}

fn no_argument(command: BotCommand, prefix: &str, remainder: &str) -> BotCommand {
    if remainder.trim().is_empty() {
        command
    } else {
        BotCommand::Invalid {
            message: format!("Usage: `{prefix}{}`", command.name()),
        }
    }
}

fn build_command(name: &str, remainder: &str, prefix: &str) -> Option<BotCommand> {
    let command = match name {
        "chat" => match required_argument("chat", "message", prefix, remainder) {
            Ok(text) => BotCommand::Chat { text },
            Err(invalid) => invalid,
        },
        "reset" => no_argument(BotCommand::Reset, prefix, remainder),
        "memory" => no_argument(BotCommand::Memory, prefix, remainder),
        "model" => match required_argument("model", "name", prefix, remainder) {
            Ok(name) => BotCommand::Model { name },
            Err(invalid) => invalid,
        },
        "dispo" | "list-models" | "models" => no_argument(BotCommand::ListModels, prefix, remainder),
        "image" => match required_argument("image", "prompt", prefix, remainder) {
            Ok(prompt) => BotCommand::Image { prompt },
            Err(invalid) => invalid,
        },
        "usage" => no_argument(BotCommand::Usage, prefix, remainder),
        "help" | "whelp" => no_argument(BotCommand::Help, prefix, remainder),
        _ => return None,
    };
    Some(command)
}

/// Parses `!name args` style messages. Unknown command names are not
/// commands at all, so stray `!` messages stay silent.
pub(crate) fn parse_prefixed_command(content: &str, prefix: &str) -> Option<BotCommand> {
    if prefix.is_empty() {
        return None;
    }
    let body = content.trim_start().strip_prefix(prefix)?;
    let mut parts = body.splitn(2, char::is_whitespace);
    let name = parts.next().unwrap_or_default().to_ascii_lowercase();
    let remainder = parts.next().unwrap_or_default();
    build_command(&name, remainder, prefix)
}

/// Maps a slash-command interaction to a command using its option values.
pub(crate) fn command_from_interaction(name: &str, options: &[(String, Value)]) -> BotCommand {
    let remainder = options
        .iter()
        .find_map(|(_, value)| value.as_str())
        .unwrap_or_default();
    build_command(&name.to_ascii_lowercase(), remainder, "/").unwrap_or_else(|| {
        BotCommand::Invalid {
            message: format!("Unknown command `/{name}`. Use `/help`."),
        }
    })
}

fn string_option(name: &str, description: &str) -> Value {
    json!({
        "type": 3,
        "name": name,
        "description": description,
        "required": true,
    })
}

/// Global application command set registered with `--register-commands`.
pub fn command_definitions() -> Value {
    json!([
        {"name": "chat", "description": "Chat with the AI", "options": [string_option("user_message", "Your message to the AI")]},
        {"name": "reset", "description": "Clear your conversation memory"},
        {"name": "memory", "description": "Display your current memory"},
        {"name": "model", "description": "Change the AI model", "options": [string_option("new_model", "The new model name (use /dispo to list)")]},
        {"name": "dispo", "description": "List available models"},
        {"name": "list-models", "description": "List available models"},
        {"name": "usage", "description": "Display usage (not implemented)"},
        {"name": "image", "description": "Generate an image", "options": [string_option("prompt", "The image prompt")]},
        {"name": "help", "description": "Show available commands"},
    ])
}
