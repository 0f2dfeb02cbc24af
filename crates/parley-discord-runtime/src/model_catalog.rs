//! Cached list of models advertised by the completion provider.

use std::sync::{PoisonError, RwLock};

use parley_ai::LlmClient;
use tracing::{info, warn};

#[derive(Default)]
pub struct ModelCatalog {
    models: RwLock<Vec<String>>,
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_models(models: Vec<String>) -> Self {
        Self {
            models: RwLock::new(models),
        }
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn contains(&self, model: &str) -> bool {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|known| known == model)
    }

    /// Reloads the list from the provider. A failed fetch keeps the previous
    /// list; returns the number of models now cached.
    pub async fn refresh(&self, client: &dyn LlmClient) -> usize {
        match client.list_models().await {
            Ok(models) => {
                let count = models.len();
                *self.models.write().unwrap_or_else(PoisonError::into_inner) = models;
                info!(count, "model catalog refreshed");
                count
            }
            Err(error) => {
                warn!(%error, "unable to retrieve models");
                self.models
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .len()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parley_ai::{ChatRequest, ChatResponse, ImageRequest, LlmClient, ParleyAiError};

    use super::ModelCatalog;

    struct CatalogClient {
        models: Option<Vec<String>>,
    }

    #[async_trait]
    impl LlmClient for CatalogClient {
        async fn complete(&self, _request: ChatRequest) -> Result<ChatResponse, ParleyAiError> {
            Err(ParleyAiError::InvalidResponse("unused".to_string()))
        }

        async fn list_models(&self) -> Result<Vec<String>, ParleyAiError> {
            self.models.clone().ok_or(ParleyAiError::Timeout)
        }

        async fn generate_image(
            &self,
            _request: ImageRequest,
        ) -> Result<Option<String>, ParleyAiError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn functional_refresh_replaces_cached_models() {
        let catalog = ModelCatalog::with_models(vec!["old".to_string()]);
        let client = CatalogClient {
            models: Some(vec!["gpt-4o".to_string(), "gpt-5.1".to_string()]),
        };
        assert_eq!(catalog.refresh(&client).await, 2);
        assert!(catalog.contains("gpt-5.1"));
        assert!(!catalog.contains("old"));
    }

    #[tokio::test]
    async fn regression_failed_refresh_keeps_previous_models() {
        let catalog = ModelCatalog::with_models(vec!["gpt-4o".to_string()]);
        let client = CatalogClient { models: None };
        assert_eq!(catalog.refresh(&client).await, 1);
        assert_eq!(catalog.snapshot(), vec!["gpt-4o".to_string()]);
    }
}
