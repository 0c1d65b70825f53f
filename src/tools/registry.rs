use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ToolError;
use crate::llm::FunctionTool;
use crate::tools::{
    ParameterValidation, Tool, ToolCategory, ToolExecution, ToolInfo, ToolResult, Validator,
};

#[derive(Clone)]
struct RegisteredTool {
    tool: Arc<dyn Tool>,
    validator: Option<Validator>,
}

/// One entry of the execution ring.
#[derive(Clone, Debug, Serialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub tool_name: String,
    pub request_id: String,
    pub session_id: String,
    pub success: bool,
    pub error: Option<String>,
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ToolUsageStats {
    pub total_executions: usize,
    pub successful_executions: usize,
    pub failed_executions: usize,
    pub success_rate: f64,
    pub average_duration: Duration,
    pub min_duration: Duration,
    pub max_duration: Duration,
    pub last_used: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RegistryStats {
    pub total_tools: usize,
    pub tools_by_category: BTreeMap<ToolCategory, usize>,
    pub history_len: usize,
    pub history_limit: usize,
    pub usage: BTreeMap<String, ToolUsageStats>,
}

/// Named tools plus a bounded execution history.
///
/// Lookups take a shared lock on the tool map; the lock is always released
/// before a tool runs.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, RegisteredTool>>,
    history: Mutex<VecDeque<ExecutionRecord>>,
    history_limit: usize,
    execution_timeout: Duration,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub const DEFAULT_HISTORY_LIMIT: usize = 1000;
    pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            history_limit: Self::DEFAULT_HISTORY_LIMIT,
            execution_timeout: Self::DEFAULT_EXECUTION_TIMEOUT,
        }
    }

    pub fn with_history_limit(mut self, history_limit: usize) -> Self {
        self.history_limit = history_limit.max(1);
        self
    }

    pub fn with_execution_timeout(mut self, execution_timeout: Duration) -> Self {
        self.execution_timeout = execution_timeout;
        self
    }

    pub fn register(&self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let name = tool.name().to_string();
        if name.trim().is_empty() {
            return Err(ToolError::EmptyName);
        }
        if name.trim() != name.as_str() {
            return Err(ToolError::InvalidName(name));
        }
        tool.parameters().check()?;

        let validator = match tool.validation() {
            ParameterValidation::Schema => {
                let schema = tool.parameters().clone();
                let validator: Validator = Arc::new(move |parameters| schema.validate(parameters));
                Some(validator)
            }
            ParameterValidation::Custom(validator) => Some(validator),
            ParameterValidation::None => None,
        };

        let mut tools = self.tools.write().unwrap_or_else(PoisonError::into_inner);
        if tools.contains_key(&name) {
            return Err(ToolError::AlreadyRegistered(name));
        }
        debug!(tool = %name, category = %tool.category(), "tool registered");
        tools.insert(name, RegisteredTool { tool, validator });
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<(), ToolError> {
        self.tools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ToolError::NotFound(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.lookup(name).map(|entry| entry.tool)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, name: &str) -> Option<RegisteredTool> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn sorted_tools(&self) -> Vec<Arc<dyn Tool>> {
        let mut tools: Vec<Arc<dyn Tool>> = self
            .tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|entry| Arc::clone(&entry.tool))
            .collect();
        tools.sort_by(|a, b| {
            a.category()
                .cmp(&b.category())
                .then_with(|| a.name().cmp(b.name()))
        });
        tools
    }

    /// All tools, sorted by category then name.
    pub async fn list_tools(&self) -> Vec<ToolInfo> {
        let mut infos = Vec::new();
        for tool in self.sorted_tools() {
            infos.push(tool_info(tool.as_ref(), tool.is_available().await));
        }
        infos
    }

    pub async fn list_available_tools(&self) -> Vec<ToolInfo> {
        let mut infos = Vec::new();
        for tool in self.sorted_tools() {
            if tool.is_available().await {
                infos.push(tool_info(tool.as_ref(), true));
            }
        }
        infos
    }

    pub fn tools_by_category(&self, category: ToolCategory) -> Vec<Arc<dyn Tool>> {
        self.sorted_tools()
            .into_iter()
            .filter(|tool| tool.category() == category)
            .collect()
    }

    /// Case-insensitive match on name or description.
    pub fn search_tools(&self, query: &str) -> Vec<Arc<dyn Tool>> {
        let query = query.to_lowercase();
        self.sorted_tools()
            .into_iter()
            .filter(|tool| {
                tool.name().to_lowercase().contains(&query)
                    || tool.description().to_lowercase().contains(&query)
            })
            .collect()
    }

    /// Function-calling descriptors for every available tool.
    pub async fn function_tools(&self) -> Vec<FunctionTool> {
        let mut definitions = Vec::new();
        for tool in self.sorted_tools() {
            if tool.is_available().await {
                definitions.push(tool.function_definition());
            }
        }
        definitions
    }

    /// Runs one tool. Only an unknown tool name is an `Err`; every other
    /// failure comes back as `success == false` and is recorded in history.
    pub async fn execute(&self, execution: ToolExecution) -> Result<ToolResult, ToolError> {
        let entry = self
            .lookup(&execution.tool_name)
            .ok_or_else(|| ToolError::NotFound(execution.tool_name.clone()))?;

        let started = Instant::now();
        let mut result = self.run(&entry, &execution).await;
        result.execution_id = format!("exec_{}", Uuid::new_v4());
        result.timestamp = Utc::now();
        result.duration = started.elapsed();

        if result.success {
            debug!(tool = %execution.tool_name, duration = ?result.duration, "tool executed");
        } else {
            warn!(
                tool = %execution.tool_name,
                error = result.error.as_deref().unwrap_or_default(),
                "tool execution failed"
            );
        }

        self.record(&execution, &result);
        Ok(result)
    }

    async fn run(&self, entry: &RegisteredTool, execution: &ToolExecution) -> ToolResult {
        let tool = entry.tool.as_ref();
        let name = execution.tool_name.as_str();

        if !tool.is_available().await {
            return ToolResult::failure(ToolError::Unavailable(name.to_string()).to_string())
                .with_metadata("error_kind", "unavailable");
        }

        if tool.requires_confirmation() && !execution.confirmed {
            return ToolResult::failure(
                ToolError::ConfirmationRequired(name.to_string()).to_string(),
            )
            .with_metadata("error_kind", "confirmation_required")
            .with_metadata("requires_confirmation", true)
            .with_metadata("estimated_cost", tool.estimated_cost());
        }

        if let Some(validator) = &entry.validator
            && let Err(message) = validator(&execution.parameters)
        {
            let err = ToolError::Validation {
                tool: name.to_string(),
                message,
            };
            return ToolResult::failure(err.to_string()).with_metadata("error_kind", "validation");
        }

        match timeout(
            self.execution_timeout,
            tool.execute(execution.parameters.clone()),
        )
        .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => ToolResult::failure(err.to_string()).with_metadata("error_kind", "execution"),
            Err(_) => ToolResult::failure(format!(
                "tool '{name}' timed out after {}s",
                self.execution_timeout.as_secs()
            ))
            .with_metadata("error_kind", "timeout"),
        }
    }

    fn record(&self, execution: &ToolExecution, result: &ToolResult) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        while history.len() >= self.history_limit {
            history.pop_front();
        }
        history.push_back(ExecutionRecord {
            execution_id: result.execution_id.clone(),
            tool_name: execution.tool_name.clone(),
            request_id: execution.request_id.clone(),
            session_id: execution.session_id.clone(),
            success: result.success,
            error: result.error.clone(),
            duration: result.duration,
            timestamp: result.timestamp,
        });
    }

    /// Most recent records, newest last. `None` returns the whole ring.
    pub fn execution_history(&self, limit: Option<usize>) -> Vec<ExecutionRecord> {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = limit.map_or(0, |limit| history.len().saturating_sub(limit));
        history.iter().skip(skip).cloned().collect()
    }

    pub fn tool_usage_stats(&self, name: &str) -> ToolUsageStats {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        usage_stats(history.iter().filter(|record| record.tool_name == name))
    }

    pub fn registry_stats(&self) -> RegistryStats {
        let mut tools_by_category = BTreeMap::new();
        let names: Vec<String> = {
            let tools = self.tools.read().unwrap_or_else(PoisonError::into_inner);
            for entry in tools.values() {
                *tools_by_category.entry(entry.tool.category()).or_insert(0) += 1;
            }
            tools.keys().cloned().collect()
        };

        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let usage = names
            .into_iter()
            .map(|name| {
                let stats = usage_stats(history.iter().filter(|record| record.tool_name == name));
                (name, stats)
            })
            .collect();

        RegistryStats {
            total_tools: tools_by_category.values().sum(),
            tools_by_category,
            history_len: history.len(),
            history_limit: self.history_limit,
            usage,
        }
    }

    pub fn clear_history(&self) {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

fn tool_info(tool: &dyn Tool, available: bool) -> ToolInfo {
    ToolInfo {
        name: tool.name().to_string(),
        description: tool.description().to_string(),
        category: tool.category(),
        requires_confirmation: tool.requires_confirmation(),
        estimated_cost: tool.estimated_cost(),
        available,
        parameters: tool.parameters().to_json_schema(),
    }
}

fn usage_stats<'a>(records: impl Iterator<Item = &'a ExecutionRecord>) -> ToolUsageStats {
    let mut stats = ToolUsageStats::default();
    let mut total = Duration::ZERO;

    for record in records {
        if stats.total_executions == 0 {
            stats.min_duration = record.duration;
        }
        stats.total_executions += 1;
        if record.success {
            stats.successful_executions += 1;
        } else {
            stats.failed_executions += 1;
        }
        total += record.duration;
        stats.min_duration = stats.min_duration.min(record.duration);
        stats.max_duration = stats.max_duration.max(record.duration);
        stats.last_used = Some(
            stats
                .last_used
                .map_or(record.timestamp, |last| last.max(record.timestamp)),
        );
    }

    if stats.total_executions > 0 {
        let count = stats.total_executions as u32;
        stats.average_duration = total / count;
        stats.success_rate = stats.successful_executions as f64 / stats.total_executions as f64;
    }
    stats
}
