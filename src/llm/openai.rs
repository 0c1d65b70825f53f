use std::time::Instant;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProviderError;
use crate::llm::http::{build_client, send_json};
use crate::llm::{
    CompletionRequest, CompletionResponse, Message, Provider, ProviderConfig, Role, TokenUsage,
    ToolCall, ToolChoice, probe_request,
};

const PROVIDER_NAME: &str = "openai";
const EMPTY_USER_CONTENT_FALLBACK: &str = " ";

/// OpenAI Chat Completions adapter. Works against any compatible base URL.
#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    client: Client,
    config: ProviderConfig,
}

impl OpenAiProvider {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.openai.com/v1";
    pub const DEFAULT_MODEL: &'static str = "gpt-4o";
    pub const API_KEY_ENV: &'static str = "OPENAI_API_KEY";

    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let client = build_client(PROVIDER_NAME, config.timeout)?;
        Ok(Self { client, config })
    }

    pub fn from_env(model: impl Into<String>) -> Result<Self, ProviderError> {
        let api_key = std::env::var(Self::API_KEY_ENV).map_err(|_| {
            ProviderError::invalid_request(PROVIDER_NAME, "OPENAI_API_KEY is not set")
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
        format!("{base}/chat/completions")
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
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
        let body = build_request(request, &self.config);
        let started = Instant::now();

        let http_request = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&body);
        let payload: ChatCompletionResponse = send_json(PROVIDER_NAME, http_request).await?;

        let mut completion = normalize_response(payload)?;
        completion.response_time = started.elapsed();
        Ok(completion)
    }

    fn models(&self) -> Vec<String> {
        ["gpt-4o", "gpt-4o-mini", "gpt-4-turbo", "gpt-4", "gpt-3.5-turbo"]
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

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<RequestMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<RequestTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<ToolChoicePayload>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
enum RequestMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<WireToolCall>>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Debug, Serialize)]
struct RequestTool {
    #[serde(rename = "type")]
    type_: &'static str,
    function: RequestFunction,
}

#[derive(Debug, Serialize)]
struct RequestFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ToolChoicePayload {
    Mode(&'static str),
    Specific {
        #[serde(rename = "type")]
        type_: &'static str,
        function: NamedFunction,
    },
}

#[derive(Debug, Serialize)]
struct NamedFunction {
    name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    type_: String,
    function: WireFunctionCall,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<AssistantMessage>,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

fn build_request(request: &CompletionRequest, config: &ProviderConfig) -> ChatCompletionRequest {
    let mut messages = to_openai_messages(&request.messages);
    if messages.is_empty() {
        messages.push(RequestMessage::User {
            content: EMPTY_USER_CONTENT_FALLBACK.to_string(),
        });
    }

    let (tools, tool_choice) = if request.tools_enabled() {
        let tools = request
            .tools
            .iter()
            .map(|tool| RequestTool {
                type_: "function",
                function: RequestFunction {
                    name: tool.function.name.clone(),
                    description: tool.function.description.clone(),
                    parameters: tool.function.parameters.clone(),
                },
            })
            .collect::<Vec<_>>();
        let choice = match &request.tool_choice {
            ToolChoice::Auto => ToolChoicePayload::Mode("auto"),
            ToolChoice::Required => ToolChoicePayload::Mode("required"),
            ToolChoice::None => ToolChoicePayload::Mode("none"),
            ToolChoice::Tool(name) => ToolChoicePayload::Specific {
                type_: "function",
                function: NamedFunction { name: name.clone() },
            },
        };
        (Some(tools), Some(choice))
    } else {
        (None, None)
    };

    ChatCompletionRequest {
        model: request.model.clone().unwrap_or_else(|| config.model.clone()),
        messages,
        tools,
        tool_choice,
        temperature: request.temperature.unwrap_or(config.temperature),
        max_tokens: request.max_tokens.unwrap_or(config.max_tokens),
    }
}

fn to_openai_messages(messages: &[Message]) -> Vec<RequestMessage> {
    let mut request_messages = Vec::with_capacity(messages.len());

    for message in messages {
        match message.role {
            Role::System if !message.content.is_empty() => {
                request_messages.push(RequestMessage::System {
                    content: message.content.clone(),
                });
            }
            Role::User if !message.content.is_empty() => {
                request_messages.push(RequestMessage::User {
                    content: message.content.clone(),
                });
            }
            Role::Assistant => {
                let tool_calls = message
                    .tool_calls
                    .iter()
                    .map(|call| WireToolCall {
                        id: call.id.clone(),
                        type_: function_type(),
                        function: WireFunctionCall {
                            name: call.function.name.clone(),
                            arguments: call.function.arguments.clone(),
                        },
                    })
                    .collect::<Vec<_>>();
                let content = Some(message.content.clone()).filter(|text| !text.is_empty());
                if content.is_none() && tool_calls.is_empty() {
                    continue;
                }
                request_messages.push(RequestMessage::Assistant {
                    content,
                    tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                });
            }
            Role::Tool => request_messages.push(RequestMessage::Tool {
                tool_call_id: message.tool_call_id.clone().unwrap_or_default(),
                content: message.content.clone(),
            }),
            Role::System | Role::User => {}
        }
    }

    request_messages
}

fn normalize_response(response: ChatCompletionResponse) -> Result<CompletionResponse, ProviderError> {
    let message = response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message)
        .ok_or_else(|| ProviderError::server(PROVIDER_NAME, "response contained no choices"))?;

    let tool_calls = message
        .tool_calls
        .into_iter()
        .map(|call| {
            let arguments = if call.function.arguments.trim().is_empty() {
                "{}".to_string()
            } else {
                call.function.arguments
            };
            ToolCall::new(call.id, call.function.name, arguments)
        })
        .collect();

    let usage = response
        .usage
        .map(|usage| TokenUsage::new(usage.prompt_tokens, usage.completion_tokens))
        .unwrap_or_default();

    Ok(CompletionResponse {
        content: message.content.unwrap_or_default(),
        model: response.model,
        usage,
        tool_calls,
        response_time: Default::default(),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::ProviderErrorKind;
    use crate::llm::{FunctionDefinition, FunctionTool};

    fn lookup_tool() -> FunctionTool {
        FunctionTool::new(FunctionDefinition {
            name: "kbase".to_string(),
            description: "Search the knowledge base".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {"query": {"type": "string"}},
                "required": ["query"]
            }),
        })
    }

    #[test]
    fn build_request_serializes_history_and_tools() {
        let request = CompletionRequest::new(vec![
            Message::system("You are helpful"),
            Message::user("Find docs"),
            Message::assistant_with_tool_calls(
                "Calling tool",
                vec![ToolCall::new("call_1", "kbase", r#"{"query":"rust"}"#)],
            ),
            Message::tool("call_1", "result"),
        ])
        .with_temperature(0.2)
        .with_max_tokens(512)
        .with_tools(vec![lookup_tool()], ToolChoice::Tool("kbase".to_string()));

        let config = ProviderConfig::new("key", OpenAiProvider::DEFAULT_MODEL);
        let value = serde_json::to_value(build_request(&request, &config)).expect("serializes");

        assert_eq!(value["model"], "gpt-4o");
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(
            value["messages"][2]["tool_calls"][0]["function"]["arguments"],
            r#"{"query":"rust"}"#
        );
        assert_eq!(value["messages"][3]["role"], "tool");
        assert_eq!(value["messages"][3]["tool_call_id"], "call_1");
        assert_eq!(value["tools"][0]["function"]["name"], "kbase");
        assert_eq!(value["tool_choice"]["function"]["name"], "kbase");
        assert_eq!(value["max_tokens"], 512);
    }

    #[test]
    fn build_request_without_tools_falls_back_to_placeholder_user() {
        let request = CompletionRequest::new(vec![Message::user("")]);
        let config = ProviderConfig::new("key", "gpt-4o-mini");
        let value = serde_json::to_value(build_request(&request, &config)).expect("serializes");

        assert_eq!(value["messages"][0]["content"], " ");
        assert!(value.get("tools").is_none());
        assert!(value.get("tool_choice").is_none());
        assert_eq!(value["max_tokens"], 4096);
    }

    #[test]
    fn normalize_response_keeps_arguments_as_json_string() {
        let payload: ChatCompletionResponse = serde_json::from_value(json!({
            "model": "gpt-4o-2024",
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_x",
                        "type": "function",
                        "function": {"name": "kbase", "arguments": ""}
                    }]
                }
            }],
            "usage": {"prompt_tokens": 11, "completion_tokens": 7}
        }))
        .expect("payload");

        let completion = normalize_response(payload).expect("normalizes");
        assert_eq!(completion.content, "");
        assert_eq!(completion.tool_calls[0].function.arguments, "{}");
        assert_eq!(completion.usage.total_tokens, 18);
        assert_eq!(completion.model, "gpt-4o-2024");
    }

    #[test]
    fn normalize_response_requires_choices() {
        let err = normalize_response(ChatCompletionResponse {
            model: String::new(),
            choices: Vec::new(),
            usage: None,
        })
        .expect_err("should fail");
        assert_eq!(err.kind(), ProviderErrorKind::ServerError);
        assert!(err.to_string().contains("no choices"));
    }
}
