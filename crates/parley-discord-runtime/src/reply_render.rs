//! Rendering of model replies and memory dumps for Discord.

use std::sync::OnceLock;

use parley_ai::{ContentPart, ConversationEntry, MessageContent};
use regex::Regex;

use crate::discord_api_client::OutboundFile;

const MEMORY_ENTRY_MAX_CHARS: usize = 600;
const MEMORY_DUMP_MAX_CHARS: usize = 1900;

fn code_block_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?s)```(\w+)?\n(.*?)\n```").expect("code block pattern is valid")
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Reply text with fenced code blocks moved into attachments.
pub struct ExtractedReply {
    pub text: String,
    pub files: Vec<OutboundFile>,
}

fn extension_for_language(language: &str) -> &'static str {
    match language.to_ascii_lowercase().as_str() {
        "python" | "py" => ".py",
        "javascript" | "js" => ".js",
        "typescript" | "ts" => ".ts",
        "java" => ".java",
        "c" => ".c",
        "cpp" | "c++" => ".cpp",
        "rust" | "rs" => ".rs",
        "go" => ".go",
        "html" => ".html",
        "css" => ".css",
        "json" => ".json",
        "bash" | "shell" | "sh" => ".sh",
        "sql" => ".sql",
        "yaml" | "yml" => ".yaml",
        "toml" => ".toml",
        _ => ".txt",
    }
}

/// Splits fenced code blocks out of `reply`. Each block becomes a file named
/// `code<ext>` (`code_2<ext>`, ... for later blocks); the remaining prose is
/// trimmed per segment and joined with newlines.
pub fn extract_code_blocks(reply: &str) -> ExtractedReply {
    let pattern = code_block_pattern();
    let files = pattern
        .captures_iter(reply)
        .enumerate()
        .map(|(index, captures)| {
            let extension = captures
                .get(1)
                .map(|language| extension_for_language(language.as_str()))
                .unwrap_or(".txt");
            let code = captures.get(2).map(|code| code.as_str()).unwrap_or_default();
            let name = if index == 0 {
                format!("code{extension}")
            } else {
                format!("code_{}{extension}", index + 1)
            };
            OutboundFile {
                name,
                content: code.trim().to_string(),
            }
        })
        .collect();
    let text = pattern
        .split(reply)
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    ExtractedReply { text, files }
}

/// Prefixes the author mention, as every bot reply does.
pub(crate) fn with_mention(user_id: u64, text: &str) -> String {
    if text.trim().is_empty() {
        format!("<@{user_id}>")
    } else {
        format!("<@{user_id}>\n{text}")
    }
}

fn entry_preview(entry: &ConversationEntry) -> String {
    let content = match &entry.content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Parts(parts) => parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => text.as_str(),
                ContentPart::ImageUrl { .. } => "[image]",
            })
            .collect::<Vec<_>>()
            .join(" "),
    };
    if content.chars().count() > MEMORY_ENTRY_MAX_CHARS {
        let mut truncated = content
            .chars()
            .take(MEMORY_ENTRY_MAX_CHARS)
            .collect::<String>();
        truncated.push_str("...");
        truncated
    } else {
        content
    }
}

/// One `role: content` line per entry; long dumps keep their newest tail.
pub fn render_memory_dump(history: &[ConversationEntry]) -> String {
    let text = history
        .iter()
        .map(|entry| format!("{}: {}", entry.role.as_str(), entry_preview(entry)))
        .collect::<Vec<_>>()
        .join("\n");
    let length = text.chars().count();
    if length > MEMORY_DUMP_MAX_CHARS {
        let mut tail = text
            .chars()
            .skip(length - MEMORY_DUMP_MAX_CHARS)
            .collect::<String>();
        tail.push_str("\n...(truncated)");
        tail
    } else {
        text
    }
}
