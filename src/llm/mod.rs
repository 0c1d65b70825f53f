mod anthropic;
mod factory;
mod fallback;
mod gemini;
mod http;
mod lazy;
mod mock;
mod openai;

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ProviderError, ProviderErrorKind};

pub use anthropic::AnthropicProvider;
pub use factory::build_provider_set;
pub use fallback::{FallbackProvider, ProviderStatus};
pub use gemini::GeminiProvider;
pub use lazy::{LazyProvider, ProbeSettings};
pub use mock::{MockProvider, MockResponder};
pub use openai::OpenAiProvider;

pub const STREAM_CHUNK_DELAY: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One conversation entry in the provider-neutral shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::plain(Role::Assistant, content)
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::plain(Role::Tool, content)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub function: FunctionCall,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    /// Decodes the argument string. Blank arguments decode to an empty object.
    pub fn parsed_arguments(&self) -> Result<Map<String, Value>, serde_json::Error> {
        let raw = self.function.arguments.trim();
        if raw.is_empty() {
            return Ok(Map::new());
        }
        serde_json::from_str(raw)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionTool {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionDefinition,
}

impl FunctionTool {
    pub fn new(function: FunctionDefinition) -> Self {
        Self {
            kind: "function".to_string(),
            function,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ToolChoice {
    #[default]
    Auto,
    Required,
    None,
    Tool(String),
}

#[derive(Clone, Debug, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub tools: Vec<FunctionTool>,
    pub tool_choice: ToolChoice,
}

impl CompletionRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_tools(mut self, tools: Vec<FunctionTool>, tool_choice: ToolChoice) -> Self {
        self.tools = tools;
        self.tool_choice = tool_choice;
        self
    }

    pub fn tools_enabled(&self) -> bool {
        !self.tools.is_empty() && self.tool_choice != ToolChoice::None
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompletionResponse {
    pub content: String,
    pub model: String,
    pub usage: TokenUsage,
    pub tool_calls: Vec<ToolCall>,
    pub response_time: Duration,
}

impl CompletionResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = tool_calls;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamChunk {
    pub content: String,
    pub done: bool,
}

impl StreamChunk {
    pub fn finished() -> Self {
        Self {
            content: String::new(),
            done: true,
        }
    }
}

pub type ChunkStream = BoxStream<'static, StreamChunk>;

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> String;

    /// Performs a cheap real roundtrip. Never errors, any failure reads as unavailable.
    async fn is_available(&self) -> bool;

    async fn complete(&self, request: &CompletionRequest)
    -> Result<CompletionResponse, ProviderError>;

    async fn stream(&self, request: &CompletionRequest) -> Result<ChunkStream, ProviderError> {
        let response = self.complete(request).await?;
        Ok(chunked_stream(response.content, STREAM_CHUNK_DELAY))
    }

    fn models(&self) -> Vec<String>;

    fn default_model(&self) -> String;

    fn validate_config(&self) -> Result<(), ProviderError>;

    fn supports_function_calling(&self) -> bool {
        true
    }

    async fn ready(&self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.is_available())
            .await
            .unwrap_or(false)
    }

    fn shutdown(&self) {}
}

pub fn chunked_stream(content: String, delay: Duration) -> ChunkStream {
    let words = content
        .split_whitespace()
        .map(|word| format!("{word} "))
        .collect::<Vec<_>>();

    Box::pin(async_stream::stream! {
        for word in words {
            yield StreamChunk { content: word, done: false };
            tokio::time::sleep(delay).await;
        }
        yield StreamChunk::finished();
    })
}

pub fn classify_status(status: u16, body: &str) -> ProviderErrorKind {
    match status {
        401 | 403 => ProviderErrorKind::Auth,
        429 if body.to_ascii_lowercase().contains("quota") => ProviderErrorKind::QuotaExceeded,
        429 => ProviderErrorKind::RateLimit,
        400 => ProviderErrorKind::InvalidRequest,
        _ => ProviderErrorKind::ServerError,
    }
}

#[derive(Clone, Debug)]
pub struct ProviderConfig {
    pub api_key: String,
    pub base_url: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
}

impl ProviderConfig {
    pub const DEFAULT_MAX_TOKENS: u32 = 4096;
    pub const DEFAULT_TEMPERATURE: f32 = 0.7;
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: None,
            model: model.into(),
            max_tokens: Self::DEFAULT_MAX_TOKENS,
            temperature: Self::DEFAULT_TEMPERATURE,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub(crate) fn require_api_key(&self, provider: &str) -> Result<(), ProviderError> {
        if self.api_key.trim().is_empty() {
            return Err(ProviderError::invalid_request(provider, "API key is required"));
        }
        Ok(())
    }
}

pub(crate) fn probe_request() -> CompletionRequest {
    CompletionRequest::new(vec![Message::user("Hello")]).with_max_tokens(10)
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::*;

    #[test]
    fn classify_status_covers_taxonomy() {
        assert_eq!(classify_status(401, ""), ProviderErrorKind::Auth);
        assert_eq!(classify_status(403, ""), ProviderErrorKind::Auth);
        assert_eq!(classify_status(429, "slow down"), ProviderErrorKind::RateLimit);
        assert_eq!(
            classify_status(429, r#"{"error":{"type":"insufficient_quota"}}"#),
            ProviderErrorKind::QuotaExceeded
        );
        assert_eq!(classify_status(400, ""), ProviderErrorKind::InvalidRequest);
        assert_eq!(classify_status(500, ""), ProviderErrorKind::ServerError);
        assert_eq!(classify_status(404, ""), ProviderErrorKind::ServerError);
    }

    #[test]
    fn parsed_arguments_handles_blank_and_invalid() {
        let blank = ToolCall::new("c1", "kbase", "  ");
        assert!(blank.parsed_arguments().expect("blank parses").is_empty());

        let valid = ToolCall::new("c2", "kbase", r#"{"query":"customers"}"#);
        assert_eq!(
            valid.parsed_arguments().expect("valid parses")["query"],
            "customers"
        );

        let invalid = ToolCall::new("c3", "kbase", "{not json");
        assert!(invalid.parsed_arguments().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn chunked_stream_emits_words_then_done() {
        let chunks = chunked_stream("hello  brave\nworld".to_string(), STREAM_CHUNK_DELAY)
            .collect::<Vec<_>>()
            .await;

        let words = chunks
            .iter()
            .filter(|chunk| !chunk.done)
            .map(|chunk| chunk.content.as_str())
            .collect::<Vec<_>>();
        assert_eq!(words, vec!["hello ", "brave ", "world "]);
        assert_eq!(chunks.last(), Some(&StreamChunk::finished()));
    }

    #[test]
    fn message_serialization_omits_empty_tool_fields() {
        let value = serde_json::to_value(Message::user("hi")).expect("serialize");
        assert_eq!(value, serde_json::json!({"role": "user", "content": "hi"}));
    }
}
