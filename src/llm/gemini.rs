use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::ProviderError;
use crate::llm::http::{build_client, send_json};
use crate::llm::{
    CompletionRequest, CompletionResponse, Message, Provider, ProviderConfig, Role, TokenUsage,
    ToolCall, ToolChoice, probe_request,
};

const PROVIDER_NAME: &str = "gemini";

#[derive(Debug, Clone)]
pub struct GeminiProvider {
    client: Client,
    config: ProviderConfig,
}

impl GeminiProvider {
    pub const DEFAULT_BASE_URL: &'static str = "https://generativelanguage.googleapis.com/v1beta";
    pub const DEFAULT_MODEL: &'static str = "gemini-2.5-flash";
    pub const API_KEY_ENV: &'static str = "GEMINI_API_KEY";

    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let client = build_client(PROVIDER_NAME, config.timeout)?;
        Ok(Self { client, config })
    }

    /// Reads `GEMINI_API_KEY`, then `GOOGLE_API_KEY`.
    pub fn from_env(model: impl Into<String>) -> Result<Self, ProviderError> {
        let api_key = std::env::var(Self::API_KEY_ENV)
            .or_else(|_| std::env::var("GOOGLE_API_KEY"))
            .map_err(|_| {
                ProviderError::invalid_request(
                    PROVIDER_NAME,
                    "GEMINI_API_KEY (or GOOGLE_API_KEY) is not set",
                )
            })?;
        Self::new(ProviderConfig::new(api_key, model))
    }

    fn endpoint(&self, model: &str) -> String {
        let base = self
            .config
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
            .trim_end_matches('/');
        format!("{base}/models/{model}:generateContent")
    }
}

#[async_trait]
impl Provider for GeminiProvider {
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
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.config.model.clone());
        let body = build_request(request, &self.config);
        let started = Instant::now();

        let http_request = self
            .client
            .post(self.endpoint(&model))
            .header("x-goog-api-key", &self.config.api_key)
            .json(&body);
        let payload: GenerateContentResponse = send_json(PROVIDER_NAME, http_request).await?;

        let mut completion = normalize_response(payload)?;
        completion.model = model;
        completion.response_time = started.elapsed();
        Ok(completion)
    }

    fn models(&self) -> Vec<String> {
        ["gemini-2.5-pro", "gemini-2.5-flash", "gemini-1.5-pro", "gemini-1.5-flash"]
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
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDeclarations>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_config: Option<ToolConfig>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct Content {
    #[serde(default)]
    role: String,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolDeclarations {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolConfig {
    function_calling_config: FunctionCallingConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FunctionCallingConfig {
    mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    allowed_function_names: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thought: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCallPart>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_response: Option<FunctionResponsePart>,
}

impl Part {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct FunctionCallPart {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    name: Option<String>,
    args: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct FunctionResponsePart {
    name: String,
    response: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

fn build_request(request: &CompletionRequest, config: &ProviderConfig) -> GenerateContentRequest {
    let (mut contents, system) = to_gemini_contents(&request.messages);
    if contents.is_empty() {
        contents.push(Content {
            role: "user".to_string(),
            parts: vec![Part::text(" ")],
        });
    }

    let (tools, tool_config) = if request.tools_enabled() {
        let declarations = request
            .tools
            .iter()
            .map(|tool| FunctionDeclaration {
                name: tool.function.name.clone(),
                description: tool.function.description.clone(),
                parameters: clean_gemini_schema(tool.function.parameters.clone()),
            })
            .collect::<Vec<_>>();
        let (mode, allowed_function_names) = match &request.tool_choice {
            ToolChoice::Auto => ("AUTO", None),
            ToolChoice::Required => ("ANY", None),
            ToolChoice::None => ("NONE", None),
            ToolChoice::Tool(name) => ("ANY", Some(vec![name.clone()])),
        };
        (
            Some(vec![ToolDeclarations {
                function_declarations: declarations,
            }]),
            Some(ToolConfig {
                function_calling_config: FunctionCallingConfig {
                    mode,
                    allowed_function_names,
                },
            }),
        )
    } else {
        (None, None)
    };

    GenerateContentRequest {
        contents,
        system_instruction: system.map(|text| SystemInstruction {
            parts: vec![Part::text(text)],
        }),
        tools,
        tool_config,
        generation_config: GenerationConfig {
            temperature: request.temperature.unwrap_or(config.temperature),
            max_output_tokens: request.max_tokens.unwrap_or(config.max_tokens),
        },
    }
}

/// Function responses are addressed by function name, so tool messages are
/// matched back to the call that produced them.
fn to_gemini_contents(messages: &[Message]) -> (Vec<Content>, Option<String>) {
    let mut system_lines = Vec::new();
    let mut contents = Vec::new();
    let mut call_names: HashMap<&str, &str> = HashMap::new();
    let mut pending_responses: Vec<Part> = Vec::new();

    for message in messages {
        if message.role != Role::Tool && !pending_responses.is_empty() {
            contents.push(Content {
                role: "user".to_string(),
                parts: std::mem::take(&mut pending_responses),
            });
        }

        match message.role {
            Role::System => {
                if !message.content.is_empty() {
                    system_lines.push(message.content.clone());
                }
            }
            Role::User => {
                if !message.content.is_empty() {
                    contents.push(Content {
                        role: "user".to_string(),
                        parts: vec![Part::text(message.content.clone())],
                    });
                }
            }
            Role::Assistant => {
                let mut parts = Vec::new();
                if !message.content.is_empty() {
                    parts.push(Part::text(message.content.clone()));
                }
                for call in &message.tool_calls {
                    call_names.insert(&call.id, &call.function.name);
                    parts.push(Part {
                        function_call: Some(FunctionCallPart {
                            id: Some(call.id.clone()),
                            name: Some(call.function.name.clone()),
                            args: Some(
                                call.parsed_arguments()
                                    .map(Value::Object)
                                    .unwrap_or_else(|_| json!({})),
                            ),
                        }),
                        ..Part::default()
                    });
                }
                if !parts.is_empty() {
                    contents.push(Content {
                        role: "model".to_string(),
                        parts,
                    });
                }
            }
            Role::Tool => {
                let call_id = message.tool_call_id.as_deref().unwrap_or_default();
                let name = call_names.get(call_id).copied().unwrap_or(call_id);
                pending_responses.push(Part {
                    function_response: Some(FunctionResponsePart {
                        name: name.to_string(),
                        response: tool_result_payload(&message.content),
                    }),
                    ..Part::default()
                });
            }
        }
    }

    if !pending_responses.is_empty() {
        contents.push(Content {
            role: "user".to_string(),
            parts: pending_responses,
        });
    }

    let system = if system_lines.is_empty() {
        None
    } else {
        Some(system_lines.join("\n\n"))
    };

    (contents, system)
}

fn tool_result_payload(content: &str) -> Value {
    match serde_json::from_str::<Value>(content) {
        Ok(parsed @ Value::Object(_)) => parsed,
        _ => json!({"result": content}),
    }
}

fn normalize_response(response: GenerateContentResponse) -> Result<CompletionResponse, ProviderError> {
    let Some(candidate) = response.candidates.into_iter().next() else {
        return Err(ProviderError::server(
            PROVIDER_NAME,
            "response contained no candidates",
        ));
    };

    let mut text_parts = Vec::new();
    let mut tool_calls = Vec::new();

    for part in candidate.content.map(|content| content.parts).unwrap_or_default() {
        if let Some(text) = part.text
            && !part.thought.unwrap_or(false)
        {
            text_parts.push(text);
        }

        if let Some(function_call) = part.function_call {
            let Some(name) = function_call.name else {
                return Err(ProviderError::server(
                    PROVIDER_NAME,
                    "functionCall is missing a name",
                ));
            };
            let id = function_call
                .id
                .unwrap_or_else(|| format!("call_{}", tool_calls.len() + 1));
            let arguments = function_call.args.unwrap_or_else(|| json!({})).to_string();
            tool_calls.push(ToolCall::new(id, name, arguments));
        }
    }

    let usage = response
        .usage_metadata
        .map(|usage| TokenUsage::new(usage.prompt_token_count, usage.candidates_token_count))
        .unwrap_or_default();

    Ok(CompletionResponse {
        content: text_parts.join("\n"),
        model: String::new(),
        usage,
        tool_calls,
        response_time: Default::default(),
    })
}

/// Gemini rejects `$ref`, `additionalProperties`, `default` and empty object
/// property maps in function declarations.
fn clean_gemini_schema(schema: Value) -> Value {
    let mut root = schema;
    let defs = match &mut root {
        Value::Object(map) => map
            .remove("$defs")
            .and_then(|value| match value {
                Value::Object(defs) => Some(defs),
                _ => None,
            })
            .unwrap_or_default(),
        _ => Map::new(),
    };

    clean_schema_node(resolve_schema_refs(root, &defs), None)
}

fn resolve_schema_refs(value: Value, defs: &Map<String, Value>) -> Value {
    match value {
        Value::Object(map) => {
            if let Some(name) = map
                .get("$ref")
                .and_then(Value::as_str)
                .and_then(|reference| reference.rsplit('/').next())
                && let Some(Value::Object(definition)) = defs.get(name)
            {
                let mut resolved = definition.clone();
                for (key, value) in map {
                    if key != "$ref" {
                        resolved.insert(key, value);
                    }
                }
                return resolve_schema_refs(Value::Object(resolved), defs);
            }

            Value::Object(
                map.into_iter()
                    .map(|(key, value)| (key, resolve_schema_refs(value, defs)))
                    .collect(),
            )
        }
        Value::Array(values) => Value::Array(
            values
                .into_iter()
                .map(|value| resolve_schema_refs(value, defs))
                .collect(),
        ),
        other => other,
    }
}

fn clean_schema_node(value: Value, parent_key: Option<&str>) -> Value {
    match value {
        Value::Object(map) => {
            let mut cleaned = Map::new();

            for (key, value) in map {
                let is_metadata_title = key == "title" && parent_key != Some("properties");
                if key == "additionalProperties" || key == "default" || is_metadata_title {
                    continue;
                }
                let node = clean_schema_node(value, Some(&key));
                cleaned.insert(key, node);
            }

            let is_object = cleaned
                .get("type")
                .and_then(Value::as_str)
                .is_some_and(|t| t.eq_ignore_ascii_case("object"));
            let empty_properties = cleaned
                .get("properties")
                .and_then(Value::as_object)
                .is_some_and(Map::is_empty);
            if is_object && empty_properties {
                cleaned.insert(
                    "properties".to_string(),
                    json!({"_placeholder": {"type": "string"}}),
                );
            }

            Value::Object(cleaned)
        }
        Value::Array(values) => Value::Array(
            values
                .into_iter()
                .map(|value| clean_schema_node(value, parent_key))
                .collect(),
        ),
        other => other,
    }
}
