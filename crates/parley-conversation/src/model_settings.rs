//! Active backend model selection.

use std::{
    path::{Path, PathBuf},
    str::FromStr,
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::{Context, Result};
use parley_core::write_text_atomic;
use serde::{Deserialize, Serialize};

use crate::store::{ConversationStore, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Whether a model change applies to everyone or only to the requesting user.
pub enum ModelScope {
    #[default]
    Global,
    PerUser,
}

impl ModelScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::PerUser => "per-user",
        }
    }
}

impl FromStr for ModelScope {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "global" => Ok(Self::Global),
            "per-user" | "per_user" | "user" => Ok(Self::PerUser),
            other => Err(format!(
                "unsupported model scope `{other}` (expected global or per-user)"
            )),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ModelFile {
    model: String,
}

/// Resolves the model for a turn. In global scope the choice lives in its own
/// `{"model": ...}` file; in per-user scope it lives on the user's record.
pub struct ModelSettings {
    scope: ModelScope,
    default_model: String,
    path: PathBuf,
    global_model: Mutex<String>,
    store: Arc<ConversationStore>,
}

impl ModelSettings {
    pub fn load(
        scope: ModelScope,
        default_model: impl Into<String>,
        path: impl Into<PathBuf>,
        store: Arc<ConversationStore>,
    ) -> Self {
        let default_model = default_model.into();
        let path = path.into();
        let global_model = match scope {
            ModelScope::Global => load_global_model(&path).unwrap_or_else(|| default_model.clone()),
            ModelScope::PerUser => default_model.clone(),
        };
        tracing::info!(scope = scope.as_str(), model = %global_model, "model setting ready");
        Self {
            scope,
            default_model,
            path,
            global_model: Mutex::new(global_model),
            store,
        }
    }

    pub fn scope(&self) -> ModelScope {
        self.scope
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Model used for `user_id`'s next request.
    pub fn active_model(&self, user_id: UserId) -> String {
        match self.scope {
            ModelScope::Global => self
                .global_model
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            ModelScope::PerUser => self
                .store
                .user_model(user_id)
                .unwrap_or_else(|| self.default_model.clone()),
        }
    }

    /// Applies a model change and persists it; persistence failures are logged.
    pub fn set_model(&self, user_id: UserId, model: &str) {
        let model = model.trim().to_string();
        match self.scope {
            ModelScope::Global => {
                *self
                    .global_model
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = model.clone();
                if let Err(error) = save_global_model(&self.path, &model) {
                    tracing::error!(
                        error = %format!("{error:#}"),
                        path = %self.path.display(),
                        "unable to save global model"
                    );
                }
            }
            ModelScope::PerUser => self.store.set_user_model(user_id, model.clone()),
        }
        tracing::info!(scope = self.scope.as_str(), user_id, %model, "model changed");
    }
}

fn load_global_model(path: &Path) -> Option<String> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "no global model file found; using default");
            return None;
        }
        Err(error) => {
            tracing::warn!(%error, path = %path.display(), "unable to read global model; using default");
            return None;
        }
    };
    match serde_json::from_str::<ModelFile>(&raw) {
        Ok(file) if !file.model.trim().is_empty() => Some(file.model.trim().to_string()),
        Ok(_) => None,
        Err(error) => {
            tracing::warn!(%error, path = %path.display(), "unable to parse global model; using default");
            None
        }
    }
}

fn save_global_model(path: &Path, model: &str) -> Result<()> {
    let mut payload = serde_json::to_string_pretty(&ModelFile {
        model: model.to_string(),
    })
    .context("failed to serialize global model")?;
    payload.push('\n');
    write_text_atomic(path, &payload)?;
    Ok(())
}
