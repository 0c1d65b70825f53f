mod fs_search;
mod kbase;
mod registry;
mod schema;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{SchemaError, ToolError};
use crate::llm::{FunctionDefinition, FunctionTool};

pub use fs_search::DirectorySearchEngine;
pub use kbase::{KbaseTool, SearchEngine, SearchHit};
pub use registry::{ExecutionRecord, RegistryStats, ToolRegistry, ToolUsageStats};
pub use schema::{ParameterSchema, PropertySchema, SchemaType};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCategory {
    Api,
    File,
    Web,
    Data,
    System,
    Calculation,
    Text,
    Image,
    Custom,
}

impl ToolCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::File => "file",
            Self::Web => "web",
            Self::Data => "data",
            Self::System => "system",
            Self::Calculation => "calculation",
            Self::Text => "text",
            Self::Image => "image",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one tool execution.
///
/// Expected failures are reported as `success == false` with `error` set;
/// the `Err` channel of [`Tool::execute`] is reserved for faults.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub execution_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub duration: Duration,
}

impl ToolResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: None,
            error: None,
            message: message.into(),
            metadata: Map::new(),
            execution_id: String::new(),
            timestamp: Utc::now(),
            duration: Duration::ZERO,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::success(String::new())
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Text fed back to the model as the tool message.
    pub fn output_text(&self) -> String {
        if self.success {
            self.message.clone()
        } else {
            self.error.clone().unwrap_or_else(|| self.message.clone())
        }
    }
}

/// A request to run one registered tool.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolExecution {
    pub tool_name: String,
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub confirmed: bool,
    pub timestamp: DateTime<Utc>,
}

impl ToolExecution {
    pub fn new(tool_name: impl Into<String>, parameters: Map<String, Value>) -> Self {
        Self {
            tool_name: tool_name.into(),
            parameters,
            request_id: String::new(),
            session_id: String::new(),
            confirmed: false,
            timestamp: Utc::now(),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn confirmed(mut self) -> Self {
        self.confirmed = true;
        self
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub category: ToolCategory,
    pub requires_confirmation: bool,
    pub estimated_cost: u32,
    pub available: bool,
    pub parameters: Value,
}

pub type Validator = Arc<dyn Fn(&Map<String, Value>) -> Result<(), String> + Send + Sync>;

/// How a tool's parameters are checked before it runs. The registry resolves
/// this once, at registration.
#[derive(Clone, Default)]
pub enum ParameterValidation {
    #[default]
    Schema,
    Custom(Validator),
    None,
}

impl fmt::Debug for ParameterValidation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Schema => f.write_str("Schema"),
            Self::Custom(_) => f.write_str("Custom(..)"),
            Self::None => f.write_str("None"),
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn parameters(&self) -> &ParameterSchema;

    fn category(&self) -> ToolCategory {
        ToolCategory::Custom
    }

    fn requires_confirmation(&self) -> bool {
        false
    }

    fn estimated_cost(&self) -> u32 {
        0
    }

    fn validation(&self) -> ParameterValidation {
        ParameterValidation::Schema
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn execute(&self, parameters: Map<String, Value>) -> Result<ToolResult, ToolError>;

    fn function_definition(&self) -> FunctionTool {
        FunctionTool::new(FunctionDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters().to_json_schema(),
        })
    }
}

type ToolHandler =
    dyn Fn(Map<String, Value>) -> BoxFuture<'static, Result<ToolResult, ToolError>> + Send + Sync;

/// Closure-backed [`Tool`].
#[derive(Clone)]
pub struct ToolSpec {
    name: String,
    description: String,
    parameters: ParameterSchema,
    category: ToolCategory,
    requires_confirmation: bool,
    estimated_cost: u32,
    validation: ParameterValidation,
    handler: Arc<ToolHandler>,
}

impl fmt::Debug for ToolSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolSpec")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("parameters", &self.parameters)
            .field("category", &self.category)
            .field("requires_confirmation", &self.requires_confirmation)
            .finish()
    }
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: ParameterSchema::object(),
            category: ToolCategory::Custom,
            requires_confirmation: false,
            estimated_cost: 0,
            validation: ParameterValidation::Schema,
            handler: Arc::new(|_parameters| {
                Box::pin(async {
                    Err(ToolError::Execution(
                        "tool handler not configured".to_string(),
                    ))
                })
            }),
        }
    }

    pub fn with_parameters(mut self, parameters: ParameterSchema) -> Result<Self, SchemaError> {
        parameters.check()?;
        self.parameters = parameters;
        Ok(self)
    }

    pub fn with_category(mut self, category: ToolCategory) -> Self {
        self.category = category;
        self
    }

    pub fn requiring_confirmation(mut self) -> Self {
        self.requires_confirmation = true;
        self
    }

    pub fn with_cost(mut self, estimated_cost: u32) -> Self {
        self.estimated_cost = estimated_cost;
        self
    }

    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Map<String, Value>) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validation = ParameterValidation::Custom(Arc::new(validator));
        self
    }

    pub fn without_validation(mut self) -> Self {
        self.validation = ParameterValidation::None;
        self
    }

    pub fn with_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolResult, ToolError>> + Send + 'static,
    {
        self.handler = Arc::new(move |parameters| Box::pin(handler(parameters)));
        self
    }
}

#[async_trait]
impl Tool for ToolSpec {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> &ParameterSchema {
        &self.parameters
    }

    fn category(&self) -> ToolCategory {
        self.category
    }

    fn requires_confirmation(&self) -> bool {
        self.requires_confirmation
    }

    fn estimated_cost(&self) -> u32 {
        self.estimated_cost
    }

    fn validation(&self) -> ParameterValidation {
        self.validation.clone()
    }

    async fn execute(&self, parameters: Map<String, Value>) -> Result<ToolResult, ToolError> {
        (self.handler)(parameters).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn schema_rejects_non_object_root() {
        let mut schema = ParameterSchema::object();
        schema.kind = SchemaType::String;
        assert!(ToolSpec::new("bad", "bad").with_parameters(schema).is_err());
    }

    #[tokio::test]
    async fn spec_handler_receives_parameters() {
        let tool = ToolSpec::new("echo", "Echo the text back")
            .with_parameters(
                ParameterSchema::object()
                    .required_property("text", PropertySchema::string("Text to echo")),
            )
            .expect("schema valid")
            .with_category(ToolCategory::Text)
            .with_handler(|parameters| async move {
                let text = parameters
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Ok(ToolResult::success(text))
            });

        let params = json!({"text": "hello"}).as_object().cloned().expect("object");
        let result = tool.execute(params).await.expect("executes");
        assert!(result.success);
        assert_eq!(result.output_text(), "hello");

        let definition = tool.function_definition();
        assert_eq!(definition.kind, "function");
        assert_eq!(definition.function.name, "echo");
        assert_eq!(definition.function.parameters["required"], json!(["text"]));
    }

    #[tokio::test]
    async fn unconfigured_handler_is_an_execution_error() {
        let err = ToolSpec::new("noop", "nothing")
            .execute(Map::new())
            .await
            .expect_err("no handler");
        assert!(err.to_string().contains("handler not configured"));
    }

    #[test]
    fn failure_output_prefers_error_text() {
        let result = ToolResult::failure("boom").with_metadata("error_kind", "execution");
        assert!(!result.success);
        assert_eq!(result.output_text(), "boom");
        assert_eq!(result.metadata["error_kind"], "execution");
    }

    #[test]
    fn categories_order_and_serialize_lowercase() {
        assert!(ToolCategory::Api < ToolCategory::Data);
        assert_eq!(
            serde_json::to_value(ToolCategory::Calculation).expect("serialize"),
            json!("calculation")
        );
    }
}
