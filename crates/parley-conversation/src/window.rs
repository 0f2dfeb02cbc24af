//! Size-bounded request windows over a conversation history.

use parley_ai::{ContentPart, ConversationEntry, MessageContent};

/// Character budget used with [`WindowStrategy::DropWhole`] when none is configured.
pub const DEFAULT_WINDOW_CHARS: usize = 12_000;
/// Character budget used with [`WindowStrategy::TailSlice`] when none is configured.
pub const DEFAULT_TAIL_SLICE_CHARS: usize = 3_000;
/// Flat cost charged for one image part, standing in for its token weight.
pub const DEFAULT_IMAGE_COST: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How the newest-first scan treats the entry that overflows the budget.
pub enum WindowStrategy {
    /// Stop before the overflowing entry; entries are never altered.
    DropWhole { max_chars: usize, image_cost: usize },
    /// Keep the tail of the overflowing entry, flattened to text, then stop.
    TailSlice { max_chars: usize },
}

impl Default for WindowStrategy {
    fn default() -> Self {
        Self::DropWhole {
            max_chars: DEFAULT_WINDOW_CHARS,
            image_cost: DEFAULT_IMAGE_COST,
        }
    }
}

impl WindowStrategy {
    pub fn max_chars(&self) -> usize {
        match self {
            Self::DropWhole { max_chars, .. } | Self::TailSlice { max_chars } => *max_chars,
        }
    }
}

/// Estimated request cost of one entry: characters of text plus `image_cost`
/// per image part.
pub fn estimated_cost(entry: &ConversationEntry, image_cost: usize) -> usize {
    match &entry.content {
        MessageContent::Text(text) => text.chars().count(),
        MessageContent::Parts(parts) => parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => text.chars().count(),
                ContentPart::ImageUrl { .. } => image_cost,
            })
            .sum(),
    }
}

/// Returns the newest contiguous suffix of `history` that fits the strategy's
/// budget, in chronological order.
pub fn select_window(
    history: &[ConversationEntry],
    strategy: WindowStrategy,
) -> Vec<ConversationEntry> {
    match strategy {
        WindowStrategy::DropWhole {
            max_chars,
            image_cost,
        } => drop_whole_window(history, max_chars, image_cost),
        WindowStrategy::TailSlice { max_chars } => tail_slice_window(history, max_chars),
    }
}

fn drop_whole_window(
    history: &[ConversationEntry],
    max_chars: usize,
    image_cost: usize,
) -> Vec<ConversationEntry> {
    let mut selected = Vec::new();
    let mut total = 0_usize;
    for entry in history.iter().rev() {
        let cost = estimated_cost(entry, image_cost);
        if total.saturating_add(cost) > max_chars {
            break;
        }
        selected.push(entry.clone());
        total += cost;
    }
    selected.reverse();
    selected
}

fn tail_slice_window(history: &[ConversationEntry], max_chars: usize) -> Vec<ConversationEntry> {
    let mut selected = Vec::new();
    let mut total = 0_usize;
    for entry in history.iter().rev() {
        let mut text = entry.content.text_content();
        let mut length = text.chars().count();
        if total.saturating_add(length) > max_chars {
            let allowed = max_chars.saturating_sub(total);
            if allowed == 0 {
                break;
            }
            text = text.chars().skip(length - allowed).collect();
            length = allowed;
        }
        selected.push(ConversationEntry {
            role: entry.role,
            content: MessageContent::Text(text),
        });
        total += length;
    }
    selected.reverse();
    selected
}
