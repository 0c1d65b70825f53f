use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::ProviderError;
use crate::llm::{ChunkStream, CompletionRequest, CompletionResponse, Provider};

/// Availability snapshot of one member of a provider set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderStatus {
    pub name: String,
    pub available: bool,
    pub default_model: String,
}

/// Tries an ordered list of providers until one answers.
///
/// Auth, quota and rate-limit failures always move on to the next provider.
/// Any other failure moves on unless it came from the last provider, in
/// which case it is returned unchanged.
pub struct FallbackProvider {
    providers: Vec<Arc<dyn Provider>>,
    timeout: Duration,
}

impl FallbackProvider {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(providers: Vec<Arc<dyn Provider>>) -> Self {
        Self {
            providers,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    /// Bounds one whole `complete` call across every member.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn providers(&self) -> &[Arc<dyn Provider>] {
        &self.providers
    }

    pub fn add_provider(&mut self, provider: Arc<dyn Provider>) {
        self.providers.push(provider);
    }

    /// Returns whether a provider with that name was removed.
    pub fn remove_provider(&mut self, name: &str) -> bool {
        let before = self.providers.len();
        self.providers.retain(|provider| provider.name() != name);
        self.providers.len() != before
    }

    /// Reorders members; `names` must list every current member exactly once.
    pub fn reorder_providers(&mut self, names: &[&str]) -> Result<(), ProviderError> {
        if names.len() != self.providers.len() {
            return Err(ProviderError::invalid_request(
                self.name(),
                format!(
                    "reorder expects {} provider names, got {}",
                    self.providers.len(),
                    names.len()
                ),
            ));
        }

        let mut remaining = self.providers.clone();
        let mut reordered = Vec::with_capacity(names.len());
        for name in names {
            let Some(position) = remaining.iter().position(|p| p.name() == *name) else {
                return Err(ProviderError::invalid_request(
                    self.name(),
                    format!("provider '{name}' is not part of this fallback set"),
                ));
            };
            reordered.push(remaining.remove(position));
        }

        self.providers = reordered;
        Ok(())
    }

    pub async fn available_providers(&self) -> Vec<String> {
        let mut available = Vec::new();
        for provider in &self.providers {
            if provider.is_available().await {
                available.push(provider.name());
            }
        }
        available
    }

    pub async fn provider_status(&self) -> Vec<ProviderStatus> {
        let mut statuses = Vec::with_capacity(self.providers.len());
        for provider in &self.providers {
            statuses.push(ProviderStatus {
                name: provider.name(),
                available: provider.is_available().await,
                default_model: provider.default_model(),
            });
        }
        statuses
    }

    async fn try_providers(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let last_index = self.providers.len().saturating_sub(1);
        let mut last_error = None;

        for (index, provider) in self.providers.iter().enumerate() {
            let name = provider.name();

            if !provider.is_available().await {
                debug!(provider = %name, "skipping unavailable provider");
                last_error = Some(ProviderError::network(&name, "provider not available"));
                continue;
            }

            match provider.complete(request).await {
                Ok(mut response) => {
                    response.model = format!("{} ({name})", response.model);
                    if index > 0 {
                        info!(provider = %name, "fallback provider served the request");
                    }
                    return Ok(response);
                }
                Err(err) if err.kind().triggers_fallback() || index < last_index => {
                    warn!(provider = %name, kind = %err.kind(), error = %err, "provider failed; trying next");
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(ProviderError::AllProvidersFailed {
            fallback: self.name(),
            last: Box::new(last_error.unwrap_or(ProviderError::NoProvidersConfigured)),
        })
    }
}

#[async_trait]
impl Provider for FallbackProvider {
    fn name(&self) -> String {
        if self.providers.is_empty() {
            return "fallback-empty".to_string();
        }
        let names = self
            .providers
            .iter()
            .map(|provider| provider.name())
            .collect::<Vec<_>>();
        format!("fallback[{}]", names.join(", "))
    }

    async fn is_available(&self) -> bool {
        for provider in &self.providers {
            if provider.is_available().await {
                return true;
            }
        }
        false
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        if self.providers.is_empty() {
            return Err(ProviderError::NoProvidersConfigured);
        }

        match tokio::time::timeout(self.timeout, self.try_providers(request)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::network(
                self.name(),
                format!("no provider answered within {}s", self.timeout.as_secs()),
            )),
        }
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<ChunkStream, ProviderError> {
        if self.providers.is_empty() {
            return Err(ProviderError::NoProvidersConfigured);
        }

        let last_index = self.providers.len().saturating_sub(1);
        let mut last_error = None;

        for (index, provider) in self.providers.iter().enumerate() {
            let name = provider.name();
            if !provider.is_available().await {
                last_error = Some(ProviderError::network(&name, "provider not available"));
                continue;
            }

            match provider.stream(request).await {
                Ok(stream) => return Ok(stream),
                Err(err) if err.kind().triggers_fallback() || index < last_index => {
                    warn!(provider = %name, kind = %err.kind(), error = %err, "stream failed to open; trying next");
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(ProviderError::AllProvidersFailed {
            fallback: self.name(),
            last: Box::new(last_error.unwrap_or(ProviderError::NoProvidersConfigured)),
        })
    }

    fn models(&self) -> Vec<String> {
        let mut models = Vec::new();
        for provider in &self.providers {
            let name = provider.name();
            for model in provider.models() {
                let qualified = format!("{name}/{model}");
                if !models.contains(&qualified) {
                    models.push(qualified);
                }
            }
        }
        models
    }

    fn default_model(&self) -> String {
        self.providers
            .first()
            .map(|provider| format!("{}/{}", provider.name(), provider.default_model()))
            .unwrap_or_else(|| "unknown".to_string())
    }

    fn validate_config(&self) -> Result<(), ProviderError> {
        if self.providers.is_empty() {
            return Err(ProviderError::NoProvidersConfigured);
        }

        let mut last_error = None;
        for provider in &self.providers {
            match provider.validate_config() {
                Ok(()) => return Ok(()),
                Err(err) => last_error = Some(err),
            }
        }

        Err(ProviderError::AllProvidersFailed {
            fallback: self.name(),
            last: Box::new(last_error.unwrap_or(ProviderError::NoProvidersConfigured)),
        })
    }

    fn supports_function_calling(&self) -> bool {
        self.providers
            .iter()
            .any(|provider| provider.supports_function_calling())
    }

    fn shutdown(&self) {
        for provider in &self.providers {
            provider.shutdown();
        }
    }
}
