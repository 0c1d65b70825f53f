use std::time::Instant;

use anthropic_ai_sdk::client::AnthropicClient;
use anthropic_ai_sdk::types::message::{
    ContentBlock, CreateMessageParams, CreateMessageResponse, Message as AnthropicMessage,
    RequiredMessageParams, Role as AnthropicRole, Tool, ToolChoice as AnthropicToolChoice,
};
use async_trait::async_trait;
use serde_json::Value;

use crate::error::ProviderError;
use crate::llm::http::{build_client, send_json};
use crate::llm::{
    CompletionRequest, CompletionResponse, Message, Provider, ProviderConfig, Role, TokenUsage,
    ToolCall, ToolChoice, probe_request,
};

const PROVIDER_NAME: &str = "anthropic";

/// Anthropic Messages API adapter.
#[derive(Debug, Clone)]
pub struct AnthropicProvider {
    client: reqwest::Client,
    config: ProviderConfig,
}

impl AnthropicProvider {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.anthropic.com";
    pub const DEFAULT_MODEL: &'static str = "claude-sonnet-4-5";
    pub const API_KEY_ENV: &'static str = "ANTHROPIC_API_KEY";

    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let client = build_client(PROVIDER_NAME, config.timeout)?;
        Ok(Self { client, config })
    }

    /// Creates an adapter using `ANTHROPIC_API_KEY` from the environment.
    pub fn from_env(model: impl Into<String>) -> Result<Self, ProviderError> {
        let api_key = std::env::var(Self::API_KEY_ENV).map_err(|_| {
            ProviderError::invalid_request(PROVIDER_NAME, "ANTHROPIC_API_KEY is not set")
        })?;
        Self::new(ProviderConfig::new(api_key, model))
    }

    fn endpoint(&self) -> String {
        let base = self
            .config
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
            .trim_end_matches('/');
        format!("{base}/v1/messages")
    }

    fn build_request(&self, request: &CompletionRequest) -> CreateMessageParams {
        let (history, system) = to_anthropic_messages(&request.messages);

        let required = RequiredMessageParams {
            model: request
                .model
                .clone()
                .unwrap_or_else(|| self.config.model.clone()),
            messages: history,
            max_tokens: request.max_tokens.unwrap_or(self.config.max_tokens),
        };

        let mut params = CreateMessageParams::new(required)
            .with_stream(false)
            .with_temperature(request.temperature.unwrap_or(self.config.temperature));

        if let Some(system_prompt) = system {
            params = params.with_system(system_prompt);
        }

        if request.tools_enabled() {
            let tools = request
                .tools
                .iter()
                .map(|tool| Tool {
                    name: tool.function.name.clone(),
                    description: Some(tool.function.description.clone()),
                    input_schema: tool.function.parameters.clone(),
                })
                .collect::<Vec<_>>();

            params = params.with_tools(tools).with_tool_choice(match &request.tool_choice {
                ToolChoice::Auto => AnthropicToolChoice::Auto,
                ToolChoice::Required => AnthropicToolChoice::Any,
                ToolChoice::None => AnthropicToolChoice::None,
                ToolChoice::Tool(name) => AnthropicToolChoice::Tool { name: name.clone() },
            });
        }

        params
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> String {
        PROVIDER_NAME.to_string()
    }

    async fn is_available(&self) -> bool {
        if self.config.require_api_key(PROVIDER_NAME).is_err() {
            return false;
        }
        self.complete(&probe_request()).await.is_ok()
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        self.config.require_api_key(PROVIDER_NAME)?;
        let params = self.build_request(request);
        let started = Instant::now();

        let http_request = self
            .client
            .post(self.endpoint())
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", AnthropicClient::DEFAULT_API_VERSION)
            .json(&params);
        let response: CreateMessageResponse = send_json(PROVIDER_NAME, http_request).await?;

        let mut completion = normalize_response(&response);
        completion.response_time = started.elapsed();
        Ok(completion)
    }

    fn models(&self) -> Vec<String> {
        ["claude-sonnet-4-5", "claude-opus-4-1", "claude-3-5-haiku-latest"]
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    fn default_model(&self) -> String {
        self.config.model.clone()
    }

    fn validate_config(&self) -> Result<(), ProviderError> {
        self.config.require_api_key(PROVIDER_NAME)
    }
}

/// Splits system text out of the history and groups consecutive tool
/// results into a single user turn, as the Messages API expects.
fn to_anthropic_messages(messages: &[Message]) -> (Vec<AnthropicMessage>, Option<String>) {
    let mut system_lines = Vec::new();
    let mut anthropic_messages = Vec::new();
    let mut pending_results: Vec<ContentBlock> = Vec::new();

    for message in messages {
        if message.role != Role::Tool && !pending_results.is_empty() {
            anthropic_messages.push(AnthropicMessage::new_blocks(
                AnthropicRole::User,
                std::mem::take(&mut pending_results),
            ));
        }

        match message.role {
            Role::System => system_lines.push(message.content.clone()),
            Role::User => {
                anthropic_messages.push(AnthropicMessage::new_text(
                    AnthropicRole::User,
                    message.content.clone(),
                ));
            }
            Role::Assistant => {
                let mut blocks = Vec::new();
                if !message.content.is_empty() {
                    blocks.push(ContentBlock::Text {
                        text: message.content.clone(),
                    });
                }
                for call in &message.tool_calls {
                    blocks.push(ContentBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.function.name.clone(),
                        input: call
                            .parsed_arguments()
                            .map(Value::Object)
                            .unwrap_or_else(|_| Value::Object(Default::default())),
                    });
                }
                if !blocks.is_empty() {
                    anthropic_messages.push(AnthropicMessage::new_blocks(
                        AnthropicRole::Assistant,
                        blocks,
                    ));
                }
            }
            Role::Tool => pending_results.push(ContentBlock::ToolResult {
                tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
                content: message.content.clone(),
            }),
        }
    }

    if !pending_results.is_empty() {
        anthropic_messages.push(AnthropicMessage::new_blocks(
            AnthropicRole::User,
            pending_results,
        ));
    }

    let system = if system_lines.is_empty() {
        None
    } else {
        Some(system_lines.join("\n\n"))
    };

    (anthropic_messages, system)
}

fn normalize_response(response: &CreateMessageResponse) -> CompletionResponse {
    let mut text_parts = Vec::new();
    let mut tool_calls = Vec::new();

    for block in &response.content {
        match block {
            ContentBlock::Text { text } => text_parts.push(text.clone()),
            ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(ToolCall::new(id.clone(), name.clone(), input.to_string()));
            }
            _ => {}
        }
    }

    CompletionResponse {
        content: text_parts.join("\n"),
        model: response.model.clone(),
        usage: TokenUsage::new(response.usage.input_tokens, response.usage.output_tokens),
        tool_calls,
        response_time: Default::default(),
    }
}

#[cfg(test)]
mod tests {
    use anthropic_ai_sdk::types::message::{MessageContent, StopReason, Usage};
    use serde_json::json;

    use super::*;
    use crate::llm::{FunctionDefinition, FunctionTool};

    fn provider() -> AnthropicProvider {
        AnthropicProvider::new(ProviderConfig::new("test-key", AnthropicProvider::DEFAULT_MODEL))
            .expect("provider")
    }

    #[test]
    fn normalize_response_flattens_tool_use_blocks() {
        let response = CreateMessageResponse {
            content: vec![
                ContentBlock::Text {
                    text: "Looking up".to_string(),
                },
                ContentBlock::ToolUse {
                    id: "toolu_1".to_string(),
                    name: "kbase".to_string(),
                    input: json!({"query": "create customer"}),
                },
            ],
            id: "msg_1".to_string(),
            model: "claude-test".to_string(),
            role: AnthropicRole::Assistant,
            stop_reason: Some(StopReason::ToolUse),
            stop_sequence: None,
            type_: "message".to_string(),
            usage: Usage {
                input_tokens: 12,
                output_tokens: 3,
            },
        };

        let completion = normalize_response(&response);
        assert_eq!(completion.content, "Looking up");
        assert_eq!(completion.model, "claude-test");
        assert_eq!(completion.usage.total_tokens, 15);
        assert_eq!(completion.tool_calls.len(), 1);
        assert_eq!(completion.tool_calls[0].function.name, "kbase");
        let args = completion.tool_calls[0]
            .parsed_arguments()
            .expect("arguments are JSON");
        assert_eq!(args["query"], "create customer");
    }

    #[test]
    fn consecutive_tool_results_share_one_user_turn() {
        let history = vec![
            Message::system("sys"),
            Message::user("u1"),
            Message::assistant_with_tool_calls(
                "searching",
                vec![
                    ToolCall::new("a", "kbase", r#"{"query":"x"}"#),
                    ToolCall::new("b", "kbase", r#"{"query":"y"}"#),
                ],
            ),
            Message::tool("a", "first"),
            Message::tool("b", "second"),
            Message::system("search harder"),
        ];

        let (messages, system) = to_anthropic_messages(&history);
        assert_eq!(system.as_deref(), Some("sys\n\nsearch harder"));
        assert_eq!(messages.len(), 3);

        let MessageContent::Blocks { content } = &messages[2].content else {
            panic!("expected blocks")
        };
        assert_eq!(content.len(), 2);
        assert_eq!(
            content[1],
            ContentBlock::ToolResult {
                tool_use_id: "b".to_string(),
                content: "second".to_string(),
            }
        );
    }

    #[test]
    fn build_request_omits_tools_when_disabled() {
        let provider = provider();
        let tool = FunctionTool::new(FunctionDefinition {
            name: "kbase".to_string(),
            description: "search".to_string(),
            parameters: json!({"type": "object", "properties": {}}),
        });

        let enabled = CompletionRequest::new(vec![Message::user("hi")])
            .with_tools(vec![tool.clone()], ToolChoice::Auto);
        let body = serde_json::to_value(provider.build_request(&enabled)).expect("serialize");
        assert_eq!(body["tools"][0]["name"], "kbase");
        assert_eq!(body["max_tokens"], 4096);

        let disabled = CompletionRequest::new(vec![Message::user("hi")])
            .with_tools(vec![tool], ToolChoice::None);
        let body = serde_json::to_value(provider.build_request(&disabled)).expect("serialize");
        assert!(body.get("tools").is_none_or(Value::is_null));
    }

    #[tokio::test]
    async fn missing_key_is_unavailable_and_invalid() {
        let provider = AnthropicProvider::new(ProviderConfig::new("", "claude")).expect("provider");
        assert!(!provider.is_available().await);
        assert!(provider.validate_config().is_err());
    }
}
