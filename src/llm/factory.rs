use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{LlmConfig, ProviderSettings, ProviderStrategy};
use crate::error::ProviderError;
use crate::llm::{
    AnthropicProvider, FallbackProvider, GeminiProvider, LazyProvider, MockProvider,
    OpenAiProvider, Provider,
};

/// Builds the provider set owned by an agent.
///
/// Members follow `fallback_order`; disabled entries and entries without an
/// API key are skipped. An empty result is [`ProviderError::NoProvidersConfigured`].
pub fn build_provider_set(config: &LlmConfig) -> Result<Arc<dyn Provider>, ProviderError> {
    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();

    for id in &config.fallback_order {
        let Some(settings) = config.providers.get(id) else {
            warn!(provider = %id, "provider listed in fallback_order has no settings");
            continue;
        };
        if !settings.enabled {
            debug!(provider = %id, "provider disabled");
            continue;
        }
        match build_provider(id, settings)? {
            Some(provider) => providers.push(provider),
            None => debug!(provider = %id, "no API key configured; skipping provider"),
        }
    }

    if providers.is_empty() {
        return Err(ProviderError::NoProvidersConfigured);
    }

    info!(
        strategy = ?config.strategy,
        providers = ?providers.iter().map(|p| p.name()).collect::<Vec<_>>(),
        "provider set configured"
    );

    Ok(match config.strategy {
        ProviderStrategy::Lazy => Arc::new(LazyProvider::new(providers)?),
        ProviderStrategy::Fallback => {
            Arc::new(FallbackProvider::new(providers).with_timeout(config.timeout()))
        }
    })
}

fn build_provider(
    id: &str,
    settings: &ProviderSettings,
) -> Result<Option<Arc<dyn Provider>>, ProviderError> {
    if id == "mock" {
        let model = settings
            .model
            .clone()
            .unwrap_or_else(|| MockProvider::DEFAULT_MODEL.to_string());
        return Ok(Some(Arc::new(MockProvider::new("mock").with_model(model))));
    }

    let Some(api_key) = settings.resolve_api_key(id) else {
        return Ok(None);
    };

    let provider: Arc<dyn Provider> = match id {
        "anthropic" => Arc::new(AnthropicProvider::new(
            settings.to_provider_config(api_key, AnthropicProvider::DEFAULT_MODEL),
        )?),
        "openai" => Arc::new(OpenAiProvider::new(
            settings.to_provider_config(api_key, OpenAiProvider::DEFAULT_MODEL),
        )?),
        "gemini" => Arc::new(GeminiProvider::new(
            settings.to_provider_config(api_key, GeminiProvider::DEFAULT_MODEL),
        )?),
        other => {
            return Err(ProviderError::invalid_request(
                other,
                "unknown provider id; expected anthropic, openai, gemini or mock",
            ));
        }
    };
    Ok(Some(provider))
}
