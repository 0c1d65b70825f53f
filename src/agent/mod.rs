mod orchestrator;
mod policy;
mod prompt;

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{AgentError, ToolError};
use crate::llm::{CompletionRequest, CompletionResponse, Message, Provider, ToolChoice, build_provider_set};
use crate::memory::ConversationMemory;
use crate::tools::{KbaseTool, SearchEngine, Tool, ToolExecution, ToolRegistry, ToolResult};

pub use orchestrator::{ConversationOptions, OrchestrationState, Orchestrator, StatusCallback};
pub use policy::{EndpointHeuristic, OrchestrationPolicy, ResultJudge, count_search_attempts};
pub use prompt::UserContext;

use prompt::{PromptInputs, system_prompt, title_prompt};

const INITIAL_FAILURE_REPLY: &str = "I'm experiencing technical difficulties. Please try \
rephrasing your question or ask something simpler.";
const DEFAULT_TITLE: &str = "New conversation";
const TITLE_MAX_CHARS: usize = 50;
const TITLE_MAX_TOKENS: u32 = 20;
const TITLE_TEMPERATURE: f32 = 0.3;

pub struct AgentBuilder {
    provider: Option<Arc<dyn Provider>>,
    tools: Vec<Arc<dyn Tool>>,
    policy: OrchestrationPolicy,
    judge: Arc<dyn ResultJudge>,
    system_prompt: Option<String>,
    user_context: Option<UserContext>,
    memory: Option<ConversationMemory>,
    memory_dir: Option<PathBuf>,
    history_limit: Option<usize>,
    tool_timeout: Option<Duration>,
    defaults: ConversationOptions,
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self {
            provider: None,
            tools: Vec::new(),
            policy: OrchestrationPolicy::default(),
            judge: Arc::new(EndpointHeuristic::default()),
            system_prompt: None,
            user_context: None,
            memory: None,
            memory_dir: None,
            history_limit: None,
            tool_timeout: None,
            defaults: ConversationOptions::default(),
        }
    }
}

impl AgentBuilder {
    pub fn provider<P>(mut self, provider: P) -> Self
    where
        P: Provider + 'static,
    {
        self.provider = Some(Arc::new(provider));
        self
    }

    pub fn shared_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn tool<T>(mut self, tool: T) -> Self
    where
        T: Tool + 'static,
    {
        self.tools.push(Arc::new(tool));
        self
    }

    pub fn shared_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn policy(mut self, policy: OrchestrationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn judge<J>(mut self, judge: J) -> Self
    where
        J: ResultJudge + 'static,
    {
        self.judge = Arc::new(judge);
        self
    }

    pub fn system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn user_context(mut self, user_context: UserContext) -> Self {
        self.user_context = Some(user_context);
        self
    }

    pub fn memory(mut self, memory: ConversationMemory) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn memory_dir(mut self, memory_dir: impl Into<PathBuf>) -> Self {
        self.memory_dir = Some(memory_dir.into());
        self
    }

    pub fn history_limit(mut self, history_limit: usize) -> Self {
        self.history_limit = Some(history_limit);
        self
    }

    pub fn tool_timeout(mut self, tool_timeout: Duration) -> Self {
        self.tool_timeout = Some(tool_timeout);
        self
    }

    pub fn options(mut self, options: ConversationOptions) -> Self {
        self.defaults = options;
        self
    }

    pub fn build(self) -> Result<Agent, AgentError> {
        let Some(provider) = self.provider else {
            return Err(AgentError::Build(
                "agent provider must be configured via AgentBuilder::provider(...)".to_string(),
            ));
        };
        if self.policy.max_depth == 0 {
            return Err(AgentError::Build("max_depth must be at least 1".to_string()));
        }

        let mut registry = ToolRegistry::new();
        if let Some(limit) = self.history_limit {
            registry = registry.with_history_limit(limit);
        }
        if let Some(timeout) = self.tool_timeout {
            registry = registry.with_execution_timeout(timeout);
        }
        for tool in self.tools {
            registry.register(tool)?;
        }
        if !registry.contains(&self.policy.search_tool) {
            warn!(
                search_tool = %self.policy.search_tool,
                "search tool is not registered; minimum-search policy cannot be satisfied"
            );
        }

        Ok(Agent {
            provider,
            tools: registry,
            policy: self.policy,
            judge: self.judge,
            system_prompt: self.system_prompt,
            user_context: self.user_context,
            memory: Mutex::new(self.memory.unwrap_or_default()),
            memory_dir: self.memory_dir,
            defaults: self.defaults,
            cancel: Mutex::new(CancellationToken::new()),
            turns: AtomicUsize::new(0),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AgentStats {
    pub session_id: String,
    pub messages: usize,
    pub turns: usize,
    pub provider: String,
    pub model: String,
    pub provider_available: bool,
    pub total_tools: usize,
    pub tool_executions: usize,
    pub tool_success_rate: f64,
}

/// A conversational agent over one provider set and one tool registry.
pub struct Agent {
    provider: Arc<dyn Provider>,
    tools: ToolRegistry,
    policy: OrchestrationPolicy,
    judge: Arc<dyn ResultJudge>,
    system_prompt: Option<String>,
    user_context: Option<UserContext>,
    memory: Mutex<ConversationMemory>,
    memory_dir: Option<PathBuf>,
    defaults: ConversationOptions,
    cancel: Mutex<CancellationToken>,
    turns: AtomicUsize,
}

impl Agent {
    pub fn builder() -> AgentBuilder {
        AgentBuilder::default()
    }

    pub fn from_config(config: &Config, engine: Arc<dyn SearchEngine>) -> Result<Self, AgentError> {
        config.validate()?;
        let settings = &config.agent;
        let provider = build_provider_set(&config.llm)?;

        let kbase = KbaseTool::new(engine)
            .with_name(settings.search_tool.clone())
            .with_default_max_results(config.knowledge_base.max_results);
        let memory = ConversationMemory::new()
            .with_limits(config.memory.max_messages, config.memory.keep_recent);
        let defaults = ConversationOptions {
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
            context_limit: settings.context_limit,
            ..ConversationOptions::default()
        };

        let mut builder = Agent::builder()
            .shared_provider(provider)
            .tool(kbase)
            .policy(OrchestrationPolicy::from(settings))
            .memory(memory)
            .history_limit(settings.history_limit)
            .tool_timeout(Duration::from_secs(settings.tool_timeout_secs))
            .options(defaults);
        if let Some(prompt) = &settings.system_prompt {
            builder = builder.system_prompt(prompt.clone());
        }
        if let Some(dir) = &config.memory.storage_dir {
            builder = builder.memory_dir(dir.clone());
        }
        builder.build()
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn policy(&self) -> &OrchestrationPolicy {
        &self.policy
    }

    pub fn register_tool(&self, tool: Arc<dyn Tool>) -> Result<(), AgentError> {
        Ok(self.tools.register(tool)?)
    }

    pub fn unregister_tool(&self, name: &str) -> Result<(), AgentError> {
        Ok(self.tools.unregister(name)?)
    }

    pub fn session_id(&self) -> String {
        self.lock_memory().session_id.clone()
    }

    pub fn set_user_context(&mut self, user_context: Option<UserContext>) {
        self.user_context = user_context;
    }

    pub fn memory(&self) -> ConversationMemory {
        self.lock_memory().clone()
    }

    pub async fn wait_until_ready(&self, wait: Duration) -> bool {
        self.provider.ready(wait).await
    }

    pub fn shutdown(&self) {
        self.cancel();
        self.provider.shutdown();
    }

    pub fn cancel(&self) {
        let mut token = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        token.cancel();
        *token = CancellationToken::new();
    }

    pub async fn send_message(&self, message: &str) -> Result<CompletionResponse, AgentError> {
        self.send_message_with(message, self.defaults.clone()).await
    }

    /// Provider failures become apologies; only cancellation and registry faults are errors.
    pub async fn send_message_with(
        &self,
        message: &str,
        options: ConversationOptions,
    ) -> Result<CompletionResponse, AgentError> {
        let cancel = match &options.cancellation {
            Some(token) => token.clone(),
            None => self
                .cancel
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .child_token(),
        };
        options.emit("Processing request...");

        let (context, session_id) = {
            let mut memory = self.lock_memory();
            memory.add_message(Message::user(message));
            (
                memory.get_context_for_query(message, options.context_limit),
                memory.session_id.clone(),
            )
        };

        let tool_count = self.tools.len();
        let mut messages = Vec::with_capacity(context.len() + 1);
        messages.push(Message::system(system_prompt(PromptInputs {
            tool_count,
            search_tool: &self.policy.search_tool,
            base: self.system_prompt.as_deref(),
            extra_instructions: options.extra_instructions.as_deref(),
            user: self.user_context.as_ref(),
        })));
        messages.extend(context);

        let request = CompletionRequest::new(messages.clone())
            .with_max_tokens(options.max_tokens)
            .with_temperature(options.temperature)
            .with_tools(self.tools.function_tools().await, ToolChoice::Auto);

        let orchestrator = Orchestrator::new(
            self.provider.as_ref(),
            &self.tools,
            &self.policy,
            self.judge.as_ref(),
            &options,
        )
        .with_cancellation(cancel)
        .with_session_id(session_id.clone());

        debug!(session_id = %session_id, tools = tool_count, "sending initial completion");
        let response = match orchestrator.bounded_complete(&request).await? {
            Err(err) => {
                warn!(
                    provider = %self.provider.name(),
                    session_id = %session_id,
                    error = %err,
                    "initial completion failed"
                );
                CompletionResponse::text(INITIAL_FAILURE_REPLY)
            }
            Ok(response) if response.tool_calls.is_empty() => response,
            Ok(response) => {
                options.emit(&format!(
                    "Searching documentation ({} searches)...",
                    response.tool_calls.len()
                ));
                let state = OrchestrationState::new(messages, &self.policy.search_tool);
                orchestrator.run(response, state).await?
            }
        };

        self.turns.fetch_add(1, Ordering::SeqCst);
        let snapshot = {
            let mut memory = self.lock_memory();
            memory.add_message(Message::assistant(response.content.clone()));
            self.memory_dir.as_ref().map(|_| memory.clone())
        };
        if let Some(dir) = &self.memory_dir
            && let Some(memory) = snapshot
            && let Err(err) = memory.save(dir)
        {
            warn!(session_id = %session_id, error = %err, "failed to save conversation");
        }
        Ok(response)
    }

    pub async fn execute_tool(
        &self,
        name: &str,
        parameters: Map<String, Value>,
        confirmed: bool,
    ) -> Result<ToolResult, ToolError> {
        let mut execution =
            ToolExecution::new(name, parameters).with_session_id(self.session_id());
        if confirmed {
            execution = execution.confirmed();
        }
        self.tools.execute(execution).await
    }

    pub async fn generate_title(&self) -> String {
        let first = self.lock_memory().first_user_message().map(str::to_string);
        let Some(first) = first else {
            return DEFAULT_TITLE.to_string();
        };

        let request = CompletionRequest::new(vec![Message::user(title_prompt(&first))])
            .with_max_tokens(TITLE_MAX_TOKENS)
            .with_temperature(TITLE_TEMPERATURE);
        let title = match self.provider.complete(&request).await {
            Ok(response) => response
                .content
                .trim()
                .trim_matches(|c| c == '"' || c == '\'')
                .trim()
                .to_string(),
            Err(err) => {
                debug!(error = %err, "title generation failed; using the first words");
                String::new()
            }
        };

        let title = if title.is_empty() {
            fallback_title(&first)
        } else {
            title
        };
        if title.chars().count() > TITLE_MAX_CHARS {
            let cut: String = title.chars().take(TITLE_MAX_CHARS - 3).collect();
            format!("{cut}...")
        } else {
            title
        }
    }

    pub async fn stats(&self) -> AgentStats {
        let (session_id, messages) = {
            let memory = self.lock_memory();
            (memory.session_id.clone(), memory.len())
        };
        let history = self.tools.execution_history(None);
        let successes = history.iter().filter(|record| record.success).count();
        let tool_success_rate = if history.is_empty() {
            0.0
        } else {
            successes as f64 / history.len() as f64
        };

        AgentStats {
            session_id,
            messages,
            turns: self.turns.load(Ordering::SeqCst),
            provider: self.provider.name(),
            model: self.provider.default_model(),
            provider_available: self.provider.is_available().await,
            total_tools: self.tools.len(),
            tool_executions: history.len(),
            tool_success_rate,
        }
    }

    pub fn start_conversation(&self) -> String {
        let mut memory = self.lock_memory();
        let fresh = ConversationMemory::new().with_limits(memory.max_messages, memory.keep_recent);
        *memory = fresh;
        self.turns.store(0, Ordering::SeqCst);
        info!(session_id = %memory.session_id, "started new conversation");
        memory.session_id.clone()
    }

    pub fn load_conversation(&self, session_id: &str) -> Result<(), AgentError> {
        let dir = self.require_memory_dir()?;
        let loaded = ConversationMemory::load(dir, session_id)?;
        *self.lock_memory() = loaded;
        info!(session_id, "loaded conversation");
        Ok(())
    }

    pub fn save_conversation(&self) -> Result<PathBuf, AgentError> {
        let dir = self.require_memory_dir()?;
        let memory = self.memory();
        Ok(memory.save(dir)?)
    }

    fn require_memory_dir(&self) -> Result<&PathBuf, AgentError> {
        self.memory_dir
            .as_ref()
            .ok_or_else(|| AgentError::Build("no memory storage directory configured".to_string()))
    }

    fn lock_memory(&self) -> MutexGuard<'_, ConversationMemory> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn fallback_title(first_message: &str) -> String {
    let words: Vec<&str> = first_message.split_whitespace().take(4).collect();
    if words.is_empty() {
        return DEFAULT_TITLE.to_string();
    }
    format!("{}...", words.join(" "))
}

#[cfg(test)]
mod tests;
