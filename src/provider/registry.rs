//! Provider registry: routes a model name to a provider.

use super::traits::*;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Routes each request by `request.model`: an exact registration first,
/// then the longest registered prefix, then the default provider.
///
/// The registry is itself a [`ModelProvider`], so a runner can be handed
/// one and serve agents on different backends.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    exact: HashMap<String, Arc<dyn ModelProvider>>,
    prefixes: Vec<(String, Arc<dyn ModelProvider>)>,
    default: Option<Arc<dyn ModelProvider>>,
}

impl ProviderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve exactly `model`.
    pub fn register(mut self, model: impl Into<String>, provider: Arc<dyn ModelProvider>) -> Self {
        self.exact.insert(model.into(), provider);
        self
    }

    /// Serve every model whose name starts with `prefix`.
    pub fn register_prefix(
        mut self,
        prefix: impl Into<String>,
        provider: Arc<dyn ModelProvider>,
    ) -> Self {
        self.prefixes.push((prefix.into(), provider));
        // Longest first, so the first hit is the most specific.
        self.prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        self
    }

    /// Serve anything nothing else claims.
    pub fn with_default(mut self, provider: Arc<dyn ModelProvider>) -> Self {
        self.default = Some(provider);
        self
    }

    /// Get the provider for a model name.
    pub fn resolve(&self, model: &str) -> Option<&Arc<dyn ModelProvider>> {
        self.exact
            .get(model)
            .or_else(|| {
                self.prefixes
                    .iter()
                    .find(|(prefix, _)| model.starts_with(prefix.as_str()))
                    .map(|(_, p)| p)
            })
            .or(self.default.as_ref())
    }
}

#[async_trait]
impl ModelProvider for ProviderRegistry {
    async fn generate(
        &self,
        request: ModelRequest,
        tx: mpsc::UnboundedSender<StreamEvent>,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<ModelResponse, ProviderError> {
        let provider = self.resolve(&request.model).ok_or_else(|| {
            ProviderError::Other(format!(
                "No provider registered for model: {}",
                request.model
            ))
        })?;
        provider.generate(request, tx, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockProvider;
    use tokio_util::sync::CancellationToken;

    async fn answer(registry: &ProviderRegistry, model: &str) -> Result<String, ProviderError> {
        let (tx, _rx) = mpsc::unbounded_channel();
        let response = registry
            .generate(ModelRequest::new("a", model), tx, CancellationToken::new())
            .await?;
        Ok(response.joined_text().unwrap_or_default())
    }

    #[tokio::test]
    async fn test_routing_order() {
        let registry = ProviderRegistry::new()
            .register("gpt-4o", Arc::new(MockProvider::text("exact")))
            .register_prefix("gpt-", Arc::new(MockProvider::text("short prefix")))
            .register_prefix("gpt-4", Arc::new(MockProvider::text("long prefix")))
            .with_default(Arc::new(MockProvider::text("default")));

        assert_eq!(answer(&registry, "gpt-4o").await.unwrap(), "exact");
        assert_eq!(answer(&registry, "gpt-4.1").await.unwrap(), "long prefix");
        assert_eq!(answer(&registry, "gpt-3.5").await.unwrap(), "short prefix");
        assert_eq!(answer(&registry, "gemini-2.0-flash").await.unwrap(), "default");
    }

    #[tokio::test]
    async fn test_unrouted_model_fails() {
        let registry = ProviderRegistry::new().register("a", Arc::new(MockProvider::text("x")));
        assert!(matches!(
            answer(&registry, "b").await,
            Err(ProviderError::Other(_))
        ));
    }
}
