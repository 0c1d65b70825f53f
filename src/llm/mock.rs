use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{ProviderError, ProviderErrorKind};
use crate::llm::{CompletionRequest, CompletionResponse, Provider, Role, TokenUsage};

/// Computes a reply from the request and the zero-based call index.
pub type MockResponder =
    Arc<dyn Fn(&CompletionRequest, usize) -> Result<CompletionResponse, ProviderError> + Send + Sync>;

/// Offline provider with scripted replies.
///
/// Replies come from the queued script first, then from the responder
/// closure, then from a canned echo. Every request is recorded.
pub struct MockProvider {
    name: String,
    model: String,
    available: AtomicBool,
    probe_delay: Option<Duration>,
    script: Mutex<VecDeque<Result<CompletionResponse, ProviderError>>>,
    responder: Option<MockResponder>,
    requests: Mutex<Vec<CompletionRequest>>,
    probes: AtomicUsize,
}

impl MockProvider {
    pub const DEFAULT_MODEL: &'static str = "mock-model";

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: Self::DEFAULT_MODEL.to_string(),
            available: AtomicBool::new(true),
            probe_delay: None,
            script: Mutex::new(VecDeque::new()),
            responder: None,
            requests: Mutex::new(Vec::new()),
            probes: AtomicUsize::new(0),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn unavailable(self) -> Self {
        self.available.store(false, Ordering::SeqCst);
        self
    }

    /// Makes availability probes sleep before answering.
    pub fn with_probe_delay(mut self, delay: Duration) -> Self {
        self.probe_delay = Some(delay);
        self
    }

    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&CompletionRequest, usize) -> Result<CompletionResponse, ProviderError>
            + Send
            + Sync
            + 'static,
    {
        self.responder = Some(Arc::new(responder));
        self
    }

    pub fn push_response(self, response: CompletionResponse) -> Self {
        self.lock_script().push_back(Ok(response));
        self
    }

    pub fn push_error(self, kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        let error = ProviderError::new(self.name.clone(), kind, message);
        self.lock_script().push_back(Err(error));
        self
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    fn lock_script(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<CompletionResponse, ProviderError>>> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn canned_reply(&self, request: &CompletionRequest) -> CompletionResponse {
        let question = request
            .messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
            .map(|message| message.content.as_str())
            .unwrap_or_default();
        let content = format!("This is a mock response from {} to: {question}", self.name);
        let completion_tokens = content.split_whitespace().count() as u32;
        CompletionResponse {
            content,
            usage: TokenUsage::new(10, completion_tokens),
            ..CompletionResponse::default()
        }
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn is_available(&self) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.probe_delay {
            tokio::time::sleep(delay).await;
        }
        self.available.load(Ordering::SeqCst)
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let call_index = {
            let mut requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
            requests.push(request.clone());
            requests.len() - 1
        };

        let scripted = self.lock_script().pop_front();
        let mut response = match (scripted, &self.responder) {
            (Some(result), _) => result?,
            (None, Some(responder)) => responder(request, call_index)?,
            (None, None) => self.canned_reply(request),
        };
        if response.model.is_empty() {
            response.model = self.model.clone();
        }
        Ok(response)
    }

    fn models(&self) -> Vec<String> {
        vec![self.model.clone()]
    }

    fn default_model(&self) -> String {
        self.model.clone()
    }

    fn validate_config(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Message;

    #[tokio::test]
    async fn script_then_responder_then_canned() {
        let provider = MockProvider::new("mock")
            .push_response(CompletionResponse::text("scripted"))
            .push_error(ProviderErrorKind::RateLimit, "slow down");
        let request = CompletionRequest::new(vec![Message::user("ping")]);

        let first = provider.complete(&request).await.expect("scripted reply");
        assert_eq!(first.content, "scripted");
        assert_eq!(first.model, MockProvider::DEFAULT_MODEL);

        let err = provider.complete(&request).await.expect_err("scripted error");
        assert_eq!(err.kind(), ProviderErrorKind::RateLimit);

        let canned = provider.complete(&request).await.expect("canned reply");
        assert!(canned.content.ends_with("to: ping"));
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn responder_sees_call_index() {
        let provider = MockProvider::new("mock")
            .with_responder(|_, index| Ok(CompletionResponse::text(format!("call {index}"))));
        let request = CompletionRequest::default();

        provider.complete(&request).await.expect("first");
        let second = provider.complete(&request).await.expect("second");
        assert_eq!(second.content, "call 1");
    }
}
