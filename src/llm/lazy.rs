use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, info, warn};

use crate::error::ProviderError;
use crate::llm::{
    ChunkStream, CompletionRequest, CompletionResponse, Provider, ProviderStatus,
};

const LOADING_NAME: &str = "lazy(loading...)";

/// Timeouts for availability probing.
#[derive(Clone, Copy, Debug)]
pub struct ProbeSettings {
    /// Per-provider bound inside the background probe.
    pub probe_timeout: Duration,
    /// Bound on the whole background probe.
    pub probe_deadline: Duration,
    /// Per-provider bound when a request forces selection.
    pub selection_timeout: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(5),
            probe_deadline: Duration::from_secs(30),
            selection_timeout: Duration::from_secs(20),
        }
    }
}

struct Shared {
    providers: Vec<Arc<dyn Provider>>,
    active: RwLock<Option<usize>>,
    settings: ProbeSettings,
}

impl Shared {
    fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|provider| provider.name()).collect()
    }
}

/// Provider set that picks its active backend lazily.
///
/// Construction spawns one background task that probes every member in
/// parallel; the first available member in list order becomes active. A
/// request that arrives before the probe finishes selects synchronously,
/// trying members in order. Selection is cached for the lifetime of the value.
pub struct LazyProvider {
    shared: Arc<Shared>,
    probe: Mutex<Option<JoinHandle<()>>>,
    probe_done: watch::Receiver<bool>,
}

impl LazyProvider {
    pub fn new(providers: Vec<Arc<dyn Provider>>) -> Result<Self, ProviderError> {
        Self::with_settings(providers, ProbeSettings::default())
    }

    /// Outside a Tokio runtime no background probe is started; selection
    /// then happens on the first request.
    pub fn with_settings(
        providers: Vec<Arc<dyn Provider>>,
        settings: ProbeSettings,
    ) -> Result<Self, ProviderError> {
        if providers.is_empty() {
            return Err(ProviderError::NoProvidersConfigured);
        }

        let shared = Arc::new(Shared {
            providers,
            active: RwLock::new(None),
            settings,
        });
        let (done_tx, probe_done) = watch::channel(false);

        let probe = match tokio::runtime::Handle::try_current() {
            Ok(handle) => Some(handle.spawn(background_probe(Arc::clone(&shared), done_tx))),
            Err(_) => {
                debug!("no async runtime; skipping background provider probe");
                done_tx.send_replace(true);
                None
            }
        };

        Ok(Self {
            shared,
            probe: Mutex::new(probe),
            probe_done,
        })
    }

    /// Waits for the background probe. Returns false on timeout or if the
    /// probe was cancelled.
    pub async fn wait_for_background_probe(&self, wait: Duration) -> bool {
        let mut done = self.probe_done.clone();
        matches!(
            timeout(wait, done.wait_for(|finished| *finished)).await,
            Ok(Ok(_))
        )
    }

    pub fn is_probe_finished(&self) -> bool {
        *self.probe_done.borrow()
    }

    /// Aborts the background probe if it is still running.
    pub fn cancel_probe(&self) {
        let handle = self
            .probe
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    pub async fn active_provider(&self) -> Option<Arc<dyn Provider>> {
        let active = *self.shared.active.read().await;
        active.and_then(|index| self.shared.providers.get(index).cloned())
    }

    /// Probes every member in parallel and reports each result.
    pub async fn provider_status(&self) -> Vec<ProviderStatus> {
        let probe_timeout = self.shared.settings.probe_timeout;
        let probes = self.shared.providers.iter().map(|provider| async move {
            ProviderStatus {
                name: provider.name(),
                available: timeout(probe_timeout, provider.is_available())
                    .await
                    .unwrap_or(false),
                default_model: provider.default_model(),
            }
        });
        join_all(probes).await
    }

    /// Double-checked selection: shared lock for the warm path, exclusive
    /// lock with a re-check before probing.
    async fn ensure_active(&self) -> Option<Arc<dyn Provider>> {
        if let Some(provider) = self.active_provider().await {
            return Some(provider);
        }

        let mut active = self.shared.active.write().await;
        if let Some(index) = *active {
            return self.shared.providers.get(index).cloned();
        }

        for (index, provider) in self.shared.providers.iter().enumerate() {
            let available = timeout(self.shared.settings.selection_timeout, provider.is_available())
                .await
                .unwrap_or(false);
            if available {
                *active = Some(index);
                info!(provider = %provider.name(), "selected active provider on demand");
                return Some(Arc::clone(provider));
            }
        }

        warn!("no provider answered the on-demand availability probe");
        None
    }

    fn no_provider_error(&self) -> ProviderError {
        ProviderError::NoProviderAvailable {
            providers: self.shared.provider_names(),
        }
    }

    fn active_snapshot(&self) -> Option<Arc<dyn Provider>> {
        let index = (*self.shared.active.try_read().ok()?)?;
        self.shared.providers.get(index).cloned()
    }
}

impl Drop for LazyProvider {
    fn drop(&mut self) {
        self.cancel_probe();
    }
}

async fn background_probe(shared: Arc<Shared>, done: watch::Sender<bool>) {
    let probe_timeout = shared.settings.probe_timeout;
    let probes = shared.providers.iter().map(|provider| async move {
        timeout(probe_timeout, provider.is_available())
            .await
            .unwrap_or(false)
    });

    let results = match timeout(shared.settings.probe_deadline, join_all(probes)).await {
        Ok(results) => results,
        Err(_) => {
            warn!("background provider probe hit its deadline");
            Vec::new()
        }
    };

    match results.iter().position(|available| *available) {
        Some(index) => {
            let mut active = shared.active.write().await;
            if active.is_none() {
                *active = Some(index);
                info!(provider = %shared.providers[index].name(), "selected active provider from background probe");
            }
        }
        None => warn!(providers = ?shared.provider_names(), "background probe found no available provider"),
    }

    done.send_replace(true);
}

#[async_trait]
impl Provider for LazyProvider {
    fn name(&self) -> String {
        self.active_snapshot()
            .map(|provider| provider.name())
            .unwrap_or_else(|| LOADING_NAME.to_string())
    }

    async fn is_available(&self) -> bool {
        match self.ensure_active().await {
            Some(provider) => timeout(self.shared.settings.selection_timeout, provider.is_available())
                .await
                .unwrap_or(false),
            None => false,
        }
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let provider = self
            .ensure_active()
            .await
            .ok_or_else(|| self.no_provider_error())?;
        provider.complete(request).await
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<ChunkStream, ProviderError> {
        let provider = self
            .ensure_active()
            .await
            .ok_or_else(|| self.no_provider_error())?;
        provider.stream(request).await
    }

    fn models(&self) -> Vec<String> {
        self.active_snapshot()
            .map(|provider| provider.models())
            .unwrap_or_else(|| vec!["loading...".to_string()])
    }

    fn default_model(&self) -> String {
        self.active_snapshot()
            .map(|provider| provider.default_model())
            .unwrap_or_else(|| "unknown".to_string())
    }

    fn validate_config(&self) -> Result<(), ProviderError> {
        self.shared
            .providers
            .iter()
            .try_for_each(|provider| provider.validate_config())
    }

    async fn ready(&self, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        self.wait_for_background_probe(wait).await;
        timeout_at(deadline, self.ensure_active())
            .await
            .ok()
            .flatten()
            .is_some()
    }

    fn shutdown(&self) {
        self.cancel_probe();
    }

    fn supports_function_calling(&self) -> bool {
        match self.active_snapshot() {
            Some(provider) => provider.supports_function_calling(),
            None => self
                .shared
                .providers
                .iter()
                .any(|provider| provider.supports_function_calling()),
        }
    }
}
