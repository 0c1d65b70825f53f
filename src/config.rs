//! JSON configuration file.
//!
//! Every field has a default, so an empty object (or no file at all) yields a
//! usable configuration that reads API keys from the environment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;
use crate::llm::ProviderConfig;

/// Locations checked by [`Config::find_config_file`], in order.
const CONFIG_CANDIDATES: &[&str] = &["config.json", "config/config.json", "config/default.json"];

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default, rename = "kbase")]
    pub knowledge_base: KnowledgeBaseConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStrategy {
    /// Background probe, then stick with the first available provider.
    #[default]
    Lazy,
    /// Try every provider in order on each request.
    Fallback,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub strategy: ProviderStrategy,
    #[serde(default = "default_fallback_order")]
    pub fallback_order: Vec<String>,
    /// Overall bound for one fallback `complete` call.
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_providers")]
    pub providers: BTreeMap<String, ProviderSettings>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            strategy: ProviderStrategy::default(),
            fallback_order: default_fallback_order(),
            timeout_secs: default_llm_timeout_secs(),
            providers: default_providers(),
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Falls back to the provider's environment variable when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            model: None,
            max_tokens: None,
            temperature: None,
            timeout_secs: None,
            enabled: true,
        }
    }
}

impl ProviderSettings {
    /// Configured key, or the first non-empty environment variable for `provider_id`.
    pub fn resolve_api_key(&self, provider_id: &str) -> Option<String> {
        self.api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .or_else(|| {
                api_key_env_vars(provider_id)
                    .iter()
                    .find_map(|var| std::env::var(var).ok().filter(|key| !key.trim().is_empty()))
            })
    }

    /// Fills unset values with the backend defaults.
    pub fn to_provider_config(&self, api_key: String, default_model: &str) -> ProviderConfig {
        let mut config = ProviderConfig::new(
            api_key,
            self.model.clone().unwrap_or_else(|| default_model.to_string()),
        );
        config.base_url = self.base_url.clone().filter(|url| !url.is_empty());
        if let Some(max_tokens) = self.max_tokens.filter(|tokens| *tokens > 0) {
            config.max_tokens = max_tokens;
        }
        if let Some(temperature) = self.temperature {
            config.temperature = temperature;
        }
        if let Some(secs) = self.timeout_secs.filter(|secs| *secs > 0) {
            config.timeout = Duration::from_secs(secs);
        }
        config
    }
}

pub fn api_key_env_vars(provider_id: &str) -> &'static [&'static str] {
    match provider_id {
        "anthropic" => &["ANTHROPIC_API_KEY"],
        "openai" => &["OPENAI_API_KEY"],
        "gemini" => &["GEMINI_API_KEY", "GOOGLE_API_KEY"],
        _ => &[],
    }
}

/// Orchestration and conversation knobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    #[serde(default = "default_min_searches")]
    pub min_searches: u32,
    #[serde(default = "default_search_tool")]
    pub search_tool: String,
    #[serde(default = "default_round_timeout_secs")]
    pub round_timeout_secs: u64,
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    #[serde(default = "default_max_tool_output_chars")]
    pub max_tool_output_chars: usize,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_context_limit")]
    pub context_limit: usize,
    /// Replaces the built-in system prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            min_searches: default_min_searches(),
            search_tool: default_search_tool(),
            round_timeout_secs: default_round_timeout_secs(),
            tool_timeout_secs: default_tool_timeout_secs(),
            max_tool_output_chars: default_max_tool_output_chars(),
            history_limit: default_history_limit(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            context_limit: default_context_limit(),
            system_prompt: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KnowledgeBaseConfig {
    #[serde(default = "default_kbase_path")]
    pub path: PathBuf,
    #[serde(default = "default_kbase_max_results")]
    pub max_results: usize,
    #[serde(default = "default_kbase_extensions")]
    pub extensions: Vec<String>,
}

impl Default for KnowledgeBaseConfig {
    fn default() -> Self {
        Self {
            path: default_kbase_path(),
            max_results: default_kbase_max_results(),
            extensions: default_kbase_extensions(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Conversations are saved here after every turn when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_dir: Option<PathBuf>,
    #[serde(default = "default_memory_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_memory_keep_recent")]
    pub keep_recent: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            storage_dir: None,
            max_messages: default_memory_max_messages(),
            keep_recent: default_memory_keep_recent(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path`, or the first discovered config file, or the defaults.
    /// A file that exists but fails to parse is still an error.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path.map(Path::to_path_buf).or_else(Self::find_config_file) {
            Some(path) if path.exists() => {
                debug!(path = %path.display(), "loading config");
                Self::load(path)
            }
            _ => {
                debug!("no config file found; using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let io_error = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }
        let rendered = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, rendered).map_err(io_error)
    }

    pub fn find_config_file() -> Option<PathBuf> {
        let home = std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(".kbase-agent").join("config.json"));

        CONFIG_CANDIDATES
            .iter()
            .map(PathBuf::from)
            .chain(home)
            .find(|candidate| candidate.is_file())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let agent = &self.agent;
        if agent.max_depth == 0 {
            return Err(ConfigError::Invalid("agent.max_depth must be at least 1".to_string()));
        }
        if agent.min_searches > agent.max_depth {
            return Err(ConfigError::Invalid(format!(
                "agent.min_searches ({}) cannot exceed agent.max_depth ({})",
                agent.min_searches, agent.max_depth
            )));
        }
        if agent.search_tool.trim().is_empty() {
            return Err(ConfigError::Invalid("agent.search_tool cannot be empty".to_string()));
        }
        if self.llm.fallback_order.is_empty() {
            return Err(ConfigError::Invalid("llm.fallback_order cannot be empty".to_string()));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_fallback_order() -> Vec<String> {
    ["anthropic", "openai", "gemini"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn default_llm_timeout_secs() -> u64 {
    30
}

fn default_providers() -> BTreeMap<String, ProviderSettings> {
    let mut providers = default_fallback_order()
        .into_iter()
        .map(|id| (id, ProviderSettings::default()))
        .collect::<BTreeMap<_, _>>();
    providers.insert(
        "mock".to_string(),
        ProviderSettings {
            enabled: false,
            ..ProviderSettings::default()
        },
    );
    providers
}

fn default_max_depth() -> u32 {
    20
}

fn default_min_searches() -> u32 {
    8
}

fn default_search_tool() -> String {
    "kbase".to_string()
}

fn default_round_timeout_secs() -> u64 {
    45
}

fn default_tool_timeout_secs() -> u64 {
    30
}

fn default_max_tool_output_chars() -> usize {
    12_000
}

fn default_history_limit() -> usize {
    1000
}

fn default_max_tokens() -> u32 {
    2500
}

fn default_temperature() -> f32 {
    0.7
}

fn default_context_limit() -> usize {
    4000
}

fn default_kbase_path() -> PathBuf {
    PathBuf::from("./kbase")
}

fn default_kbase_max_results() -> usize {
    10
}

fn default_kbase_extensions() -> Vec<String> {
    ["md", "markdown", "txt", "json", "yaml", "yml"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn default_memory_max_messages() -> usize {
    100
}

fn default_memory_keep_recent() -> usize {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let config: Config = serde_json::from_str("{}").expect("parses");
        assert_eq!(config.agent.max_depth, 20);
        assert_eq!(config.agent.min_searches, 8);
        assert_eq!(config.agent.search_tool, "kbase");
        assert_eq!(config.llm.strategy, ProviderStrategy::Lazy);
        assert_eq!(config.llm.fallback_order, vec!["anthropic", "openai", "gemini"]);
        assert!(config.llm.providers["anthropic"].enabled);
        assert!(!config.llm.providers["mock"].enabled);
        assert_eq!(config.knowledge_base.path, PathBuf::from("./kbase"));
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn partial_provider_settings_keep_enabled_default() {
        let config: Config = serde_json::from_str(
            r#"{
                "llm": {
                    "strategy": "fallback",
                    "fallback_order": ["openai"],
                    "providers": {"openai": {"api_key": "sk-test", "model": "gpt-4o-mini"}}
                },
                "agent": {"max_depth": 6, "min_searches": 2}
            }"#,
        )
        .expect("parses");

        let openai = &config.llm.providers["openai"];
        assert!(openai.enabled);
        assert_eq!(openai.resolve_api_key("openai").as_deref(), Some("sk-test"));

        let provider_config = openai.to_provider_config("sk-test".to_string(), "gpt-4o");
        assert_eq!(provider_config.model, "gpt-4o-mini");
        assert_eq!(provider_config.max_tokens, ProviderConfig::DEFAULT_MAX_TOKENS);
        assert_eq!(config.llm.strategy, ProviderStrategy::Fallback);
        assert_eq!(config.agent.round_timeout_secs, 45);
    }

    #[test]
    fn validate_rejects_inconsistent_search_bounds() {
        let mut config = Config::default();
        config.agent.max_depth = 3;
        config.agent.min_searches = 5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn save_and_load_roundtrip_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.json");
        let mut config = Config::default();
        config.agent.min_searches = 3;
        config.save(&path).expect("saves");

        let loaded = Config::load(&path).expect("loads");
        assert_eq!(loaded.agent.min_searches, 3);
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").expect("write");
        assert!(matches!(
            Config::load_or_default(Some(&path)),
            Err(ConfigError::Parse { .. })
        ));
    }
}
