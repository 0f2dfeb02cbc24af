//! Per-user conversation memory for the Parley relay.
//!
//! [`ConversationStore`] keeps a bounded, durable history per user and builds
//! the size-bounded window submitted upstream; [`ModelSettings`] tracks which
//! backend model is active, either once for everyone or per user.

mod model_settings;
mod store;
mod window;

pub use model_settings::{ModelScope, ModelSettings};
pub use store::{
    ConversationStore, ConversationStoreConfig, ConversationStoreError, UserConversation, UserId,
    DEFAULT_HISTORY_CAP, DEFAULT_SYSTEM_PROMPT,
};
pub use window::{
    estimated_cost, select_window, WindowStrategy, DEFAULT_IMAGE_COST, DEFAULT_TAIL_SLICE_CHARS,
    DEFAULT_WINDOW_CHARS,
};
