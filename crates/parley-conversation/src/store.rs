//! Durable per-user conversation histories.

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use parley_ai::{ConversationEntry, MessageContent};
use parley_core::write_text_atomic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;

use crate::window::{select_window, WindowStrategy};

/// Platform identity of a user.
pub type UserId = u64;

pub const DEFAULT_HISTORY_CAP: usize = 50;
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful, concise and friendly AI assistant with vision capabilities.";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// Stored record for one user. An empty `history` means the user only holds a
/// per-user model choice and has no conversation.
pub struct UserConversation {
    pub history: Vec<ConversationEntry>,
    /// Model selected by this user when the model scope is per-user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConversationStoreError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid user id key `{key}` in {}", .path.display())]
    InvalidUserKey { path: PathBuf, key: String },
    #[error("failed to serialize conversation state: {0}")]
    Serialize(serde_json::Error),
    #[error("failed to write {}: {message}", .path.display())]
    Write { path: PathBuf, message: String },
}

#[derive(Debug, Clone)]
pub struct ConversationStoreConfig {
    pub path: PathBuf,
    pub system_prompt: String,
    pub history_cap: usize,
}

impl ConversationStoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            history_cap: DEFAULT_HISTORY_CAP,
        }
    }
}

/// Per-user histories behind a single mutex, persisted as one JSON document
/// keyed by stringified user id.
///
/// Every mutation that changes the persisted shape rewrites the whole file.
/// Callers that run a full turn (user entry, completion, assistant entry)
/// hold the guard from [`ConversationStore::lock_turn`] for its duration.
pub struct ConversationStore {
    path: PathBuf,
    system_prompt: String,
    history_cap: usize,
    records: Mutex<BTreeMap<UserId, UserConversation>>,
    write_gate: Mutex<()>,
    turn_locks: Mutex<HashMap<UserId, Arc<tokio::sync::Mutex<()>>>>,
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConversationStore {
    /// Opens the store at `config.path`. A missing file yields an empty store;
    /// an unreadable or malformed one is logged and also yields an empty store.
    pub fn open(config: ConversationStoreConfig) -> Self {
        let records = match restore_records(&config.path) {
            Ok(Some(records)) => {
                tracing::info!(
                    path = %config.path.display(),
                    users = records.len(),
                    "conversation memory loaded"
                );
                records
            }
            Ok(None) => {
                tracing::info!(
                    path = %config.path.display(),
                    "no conversation memory file found; starting empty"
                );
                BTreeMap::new()
            }
            Err(error) => {
                tracing::warn!(%error, "unable to load conversation memory; starting empty");
                BTreeMap::new()
            }
        };
        Self::with_records(config, records)
    }

    fn with_records(
        config: ConversationStoreConfig,
        records: BTreeMap<UserId, UserConversation>,
    ) -> Self {
        Self {
            path: config.path,
            system_prompt: config.system_prompt,
            history_cap: config.history_cap.max(1),
            records: Mutex::new(records),
            write_gate: Mutex::new(()),
            turn_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn history_cap(&self) -> usize {
        self.history_cap
    }

    /// Waits for exclusive use of `user_id`'s conversation for one full turn.
    pub async fn lock_turn(&self, user_id: UserId) -> OwnedMutexGuard<()> {
        let lock = lock_or_recover(&self.turn_locks)
            .entry(user_id)
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    /// Creates the record with the default system entry if it does not exist.
    pub fn ensure_user(&self, user_id: UserId) {
        let mut records = lock_or_recover(&self.records);
        self.ensure_record(&mut records, user_id);
    }

    fn ensure_record<'a>(
        &self,
        records: &'a mut BTreeMap<UserId, UserConversation>,
        user_id: UserId,
    ) -> &'a mut UserConversation {
        let record = records.entry(user_id).or_default();
        if record.history.is_empty() {
            record
                .history
                .push(ConversationEntry::system(self.system_prompt.clone()));
        }
        record
    }

    /// Whether `user_id` has a conversation. A stored model choice alone does
    /// not count.
    pub fn contains_user(&self, user_id: UserId) -> bool {
        lock_or_recover(&self.records)
            .get(&user_id)
            .is_some_and(|record| !record.history.is_empty())
    }

    /// Appends a user entry. Not trimmed and not persisted until the
    /// matching assistant reply lands.
    pub fn append_user(&self, user_id: UserId, content: MessageContent) {
        let mut records = lock_or_recover(&self.records);
        let record = self.ensure_record(&mut records, user_id);
        record.history.push(ConversationEntry {
            role: parley_ai::MessageRole::User,
            content,
        });
    }

    /// Appends the assistant reply, evicts the oldest non-system entries above
    /// the history cap and persists the store.
    pub fn append_assistant(&self, user_id: UserId, reply: impl Into<String>) {
        {
            let mut records = lock_or_recover(&self.records);
            let record = self.ensure_record(&mut records, user_id);
            record.history.push(ConversationEntry::assistant(reply));
            trim_history(&mut record.history, self.history_cap);
        }
        self.persist_or_warn();
    }

    /// Entries of `user_id`'s history that fit `strategy`, oldest first.
    pub fn window_for_request(
        &self,
        user_id: UserId,
        strategy: WindowStrategy,
    ) -> Vec<ConversationEntry> {
        let records = lock_or_recover(&self.records);
        records
            .get(&user_id)
            .map(|record| select_window(&record.history, strategy))
            .unwrap_or_default()
    }

    pub fn history(&self, user_id: UserId) -> Option<Vec<ConversationEntry>> {
        lock_or_recover(&self.records)
            .get(&user_id)
            .filter(|record| !record.history.is_empty())
            .map(|record| record.history.clone())
    }

    /// Forgets `user_id`'s conversation; returns whether one existed. A
    /// per-user model choice survives the reset.
    pub fn reset(&self, user_id: UserId) -> bool {
        let existed = {
            let mut records = lock_or_recover(&self.records);
            match records.get_mut(&user_id) {
                Some(record) if record.history.is_empty() => false,
                Some(record) if record.model.is_some() => {
                    record.history.clear();
                    true
                }
                Some(_) => {
                    records.remove(&user_id);
                    true
                }
                None => false,
            }
        };
        if existed {
            self.persist_or_warn();
        }
        existed
    }

    pub fn user_model(&self, user_id: UserId) -> Option<String> {
        lock_or_recover(&self.records)
            .get(&user_id)
            .and_then(|record| record.model.clone())
    }

    /// Records a per-user model choice and persists. Does not start a
    /// conversation for a user without one.
    pub fn set_user_model(&self, user_id: UserId, model: impl Into<String>) {
        {
            let mut records = lock_or_recover(&self.records);
            records.entry(user_id).or_default().model = Some(model.into());
        }
        self.persist_or_warn();
    }

    /// Writes the whole store to disk, replacing the previous file.
    pub fn persist(&self) -> Result<(), ConversationStoreError> {
        let _write = lock_or_recover(&self.write_gate);
        let payload = {
            let records = lock_or_recover(&self.records);
            let keyed = records
                .iter()
                .map(|(user_id, record)| (user_id.to_string(), record))
                .collect::<BTreeMap<_, _>>();
            let mut payload =
                serde_json::to_string_pretty(&keyed).map_err(ConversationStoreError::Serialize)?;
            payload.push('\n');
            payload
        };
        write_text_atomic(&self.path, &payload).map_err(|error| ConversationStoreError::Write {
            path: self.path.clone(),
            message: format!("{error:#}"),
        })
    }

    fn persist_or_warn(&self) {
        if let Err(error) = self.persist() {
            tracing::error!(%error, "unable to save conversation memory");
        }
    }
}

/// Drops entries from the front, skipping a leading system entry, until
/// `history.len() <= cap`.
fn trim_history(history: &mut Vec<ConversationEntry>, cap: usize) {
    if history.len() <= cap {
        return;
    }
    let keep_from = usize::from(history.first().is_some_and(ConversationEntry::is_system));
    let excess = history.len() - cap.max(keep_from);
    history.drain(keep_from..keep_from + excess);
}

fn restore_records(
    path: &Path,
) -> Result<Option<BTreeMap<UserId, UserConversation>>, ConversationStoreError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ConversationStoreError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let parse_error = |source| ConversationStoreError::Parse {
        path: path.to_path_buf(),
        source,
    };
    let keyed: BTreeMap<String, Value> = serde_json::from_str(&raw).map_err(parse_error)?;

    let mut records = BTreeMap::new();
    for (key, value) in keyed {
        let user_id = key
            .trim()
            .parse::<UserId>()
            .map_err(|_| ConversationStoreError::InvalidUserKey {
                path: path.to_path_buf(),
                key: key.clone(),
            })?;
        let record = match value {
            Value::Array(_) => UserConversation {
                history: serde_json::from_value(value).map_err(parse_error)?,
                model: None,
            },
            other => serde_json::from_value(other).map_err(parse_error)?,
        };
        records.insert(user_id, record);
    }
    Ok(Some(records))
}
