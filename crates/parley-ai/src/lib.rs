//! Completion-API surface for Parley: conversation wire types, the
//! [`LlmClient`] collaborator contract and an OpenAI-compatible HTTP client.
mod openai;
mod types;

pub use openai::{OpenAiClient, OpenAiConfig};
pub use types::{
    ChatRequest, ChatResponse, ContentPart, ConversationEntry, ImageRequest, ImageUrl, LlmClient,
    MessageContent, MessageRole, ParleyAiError,
};
