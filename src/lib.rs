//! Documentation-grounded conversational agent.
//!
//! - [`Agent`] runs a bounded tool-calling loop that keeps searching a
//!   knowledge base until it finds something useful or hits its depth limit
//! - Interchangeable backends behind [`llm::Provider`], composed with
//!   [`llm::FallbackProvider`] or the background-probing [`llm::LazyProvider`]
//! - Tool registry with JSON-schema validation, confirmation gating and
//!   execution history
//! - Per-session conversation memory persisted as JSON

pub mod agent;
pub mod config;
pub mod error;
pub mod llm;
pub mod memory;
pub mod tools;

pub use agent::{
    Agent, AgentBuilder, AgentStats, ConversationOptions, EndpointHeuristic, OrchestrationPolicy,
    ResultJudge, UserContext,
};
pub use config::Config;
pub use error::{
    AgentError, ConfigError, MemoryError, ProviderError, ProviderErrorKind, SchemaError,
    SearchError, ToolError,
};
pub use llm::{CompletionRequest, CompletionResponse, Message, Provider, Role, ToolCall};
pub use memory::ConversationMemory;
pub use tools::{DirectorySearchEngine, KbaseTool, SearchEngine, Tool, ToolRegistry, ToolSpec};
