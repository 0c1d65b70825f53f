use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Classification shared by every backend; drives provider-to-provider fallback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProviderErrorKind {
    Auth,
    RateLimit,
    QuotaExceeded,
    Network,
    InvalidRequest,
    ServerError,
}

impl ProviderErrorKind {
    /// Kinds that are specific to one backend account and worth retrying elsewhere.
    pub fn triggers_fallback(self) -> bool {
        matches!(self, Self::Auth | Self::RateLimit | Self::QuotaExceeded)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth_error",
            Self::RateLimit => "rate_limit",
            Self::QuotaExceeded => "quota_exceeded",
            Self::Network => "network_error",
            Self::InvalidRequest => "invalid_request",
            Self::ServerError => "server_error",
        }
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Error)]
pub enum ProviderError {
    #[error("{provider} {kind}: {message}")]
    Api {
        provider: String,
        kind: ProviderErrorKind,
        message: String,
    },
    #[error("no LLM providers configured")]
    NoProvidersConfigured,
    #[error("all providers failed in {fallback}: {last}")]
    AllProvidersFailed {
        fallback: String,
        #[source]
        last: Box<ProviderError>,
    },
    #[error("no LLM providers available among [{}]", .providers.join(", "))]
    NoProviderAvailable { providers: Vec<String> },
}

impl ProviderError {
    pub fn new(
        provider: impl Into<String>,
        kind: ProviderErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self::Api {
            provider: provider.into(),
            kind,
            message: message.into(),
        }
    }

    pub fn network(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(provider, ProviderErrorKind::Network, message)
    }

    pub fn invalid_request(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(provider, ProviderErrorKind::InvalidRequest, message)
    }

    pub fn server(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(provider, ProviderErrorKind::ServerError, message)
    }

    pub fn kind(&self) -> ProviderErrorKind {
        match self {
            Self::Api { kind, .. } => *kind,
            Self::NoProvidersConfigured => ProviderErrorKind::InvalidRequest,
            Self::AllProvidersFailed { .. } => ProviderErrorKind::ServerError,
            Self::NoProviderAvailable { .. } => ProviderErrorKind::Network,
        }
    }

    /// Name of the backend that produced the error, if it came from a single one.
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::Api { provider, .. } => Some(provider),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("tool schema must declare type=object")]
    RootTypeMustBeObject,
    #[error("required parameter '{0}' is not declared in properties")]
    UnknownRequired(String),
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool '{0}' not found")]
    NotFound(String),
    #[error("tool '{0}' is not available")]
    Unavailable(String),
    #[error("tool '{0}' requires confirmation")]
    ConfirmationRequired(String),
    #[error("invalid parameters for {tool}: {message}")]
    Validation { tool: String, message: String },
    #[error("tool execution failed: {0}")]
    Execution(String),
    #[error("tool name cannot be empty")]
    EmptyName,
    #[error("tool name '{0}' has surrounding whitespace")]
    InvalidName(String),
    #[error("tool '{0}' is already registered")]
    AlreadyRegistered(String),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("knowledge base io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("path escapes the knowledge base root: {0}")]
    OutsideRoot(String),
    #[error("search engine failure: {0}")]
    Engine(String),
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("memory io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("memory file is not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid session id '{0}'")]
    InvalidSessionId(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error("agent build error: {0}")]
    Build(String),
    #[error("conversation turn cancelled")]
    Cancelled,
}
