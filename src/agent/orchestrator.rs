use std::fmt;
use std::future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::policy::{OrchestrationPolicy, ResultJudge, count_search_attempts};
use crate::error::{AgentError, ProviderError};
use crate::llm::{
    CompletionRequest, CompletionResponse, Message, Provider, Role, ToolCall, ToolChoice,
};
use crate::tools::{ToolExecution, ToolRegistry};

const TOOL_USE_PLACEHOLDER: &str = "I'll use some tools to help answer your question.";
const EMPTY_TOOL_OUTPUT: &str = "Tool executed successfully with no output.";
const TRUNCATION_MARKER: &str = "\n[output truncated]";
const RETRY_QUERY: &str = r#"{"query": "alternative search terms"}"#;
const MIN_FINAL_ANSWER_CHARS: usize = 100;
const APOLOGY_EXCERPT_CHARS: usize = 1500;

const FINAL_ANSWER_INSTRUCTION: &str = "IMPORTANT: You've reached the maximum search depth. \
Provide a complete final answer based on the information you've already gathered. \
Do not promise further searches.";

pub type StatusCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone)]
pub struct ConversationOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    pub context_limit: usize,
    pub extra_instructions: Option<String>,
    /// Once passed, no further tools or completions run.
    pub deadline: Option<Instant>,
    pub status: Option<StatusCallback>,
    pub cancellation: Option<CancellationToken>,
}

impl Default for ConversationOptions {
    fn default() -> Self {
        Self {
            max_tokens: 2500,
            temperature: 0.7,
            context_limit: 4000,
            extra_instructions: None,
            deadline: None,
            status: None,
            cancellation: None,
        }
    }
}

impl fmt::Debug for ConversationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationOptions")
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("context_limit", &self.context_limit)
            .field("extra_instructions", &self.extra_instructions)
            .field("deadline", &self.deadline)
            .field("status", &self.status.is_some())
            .finish()
    }
}

impl ConversationOptions {
    pub fn with_status<F>(mut self, status: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.status = Some(Arc::new(status));
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub(crate) fn emit(&self, message: &str) {
        if let Some(status) = &self.status {
            status(message);
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrchestrationState {
    pub depth: u32,
    pub search_count: u32,
    pub messages: Vec<Message>,
}

impl OrchestrationState {
    pub fn new(messages: Vec<Message>, search_tool: &str) -> Self {
        Self {
            depth: 0,
            search_count: count_search_attempts(&messages, search_tool),
            messages,
        }
    }

    pub fn at_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    fn recount(&mut self, search_tool: &str) {
        self.search_count = count_search_attempts(&self.messages, search_tool);
    }
}

/// Drives tool-calling rounds until the model answers or a bound is hit.
pub struct Orchestrator<'a> {
    provider: &'a dyn Provider,
    tools: &'a ToolRegistry,
    policy: &'a OrchestrationPolicy,
    judge: &'a dyn ResultJudge,
    options: &'a ConversationOptions,
    cancel: CancellationToken,
    session_id: String,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        provider: &'a dyn Provider,
        tools: &'a ToolRegistry,
        policy: &'a OrchestrationPolicy,
        judge: &'a dyn ResultJudge,
        options: &'a ConversationOptions,
    ) -> Self {
        Self {
            provider,
            tools,
            policy,
            judge,
            options,
            cancel: CancellationToken::new(),
            session_id: String::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    /// Only cancellation is an outer error; a timeout reads as a network error.
    pub async fn bounded_complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<Result<CompletionResponse, ProviderError>, AgentError> {
        if self.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        if self.deadline_passed() {
            return Ok(Err(ProviderError::network(
                self.provider.name(),
                "caller deadline exceeded",
            )));
        }
        let budget = self.round_budget();
        let call = timeout(budget, self.provider.complete(request));
        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(AgentError::Cancelled),
            outcome = call => outcome,
        };
        Ok(outcome.unwrap_or_else(|_| {
            Err(ProviderError::network(
                self.provider.name(),
                format!("completion timed out after {}ms", budget.as_millis()),
            ))
        }))
    }

    fn round_budget(&self) -> Duration {
        match self.options.deadline {
            Some(deadline) => self
                .policy
                .round_timeout
                .min(deadline.saturating_duration_since(Instant::now())),
            None => self.policy.round_timeout,
        }
    }

    fn deadline_passed(&self) -> bool {
        self.options
            .deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    async fn deadline_elapsed(&self) {
        match self.options.deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => future::pending().await,
        }
    }

    fn out_of_time(&self, state: &OrchestrationState) -> CompletionResponse {
        warn!(
            depth = state.depth,
            search_count = state.search_count,
            "caller deadline passed inside tool loop"
        );
        self.options.emit("Deadline reached...");
        self.apology(state)
    }

    pub async fn run(
        &self,
        mut response: CompletionResponse,
        mut state: OrchestrationState,
    ) -> Result<CompletionResponse, AgentError> {
        loop {
            if state.depth >= self.policy.max_depth {
                return Ok(self.force_final(response, state.search_count));
            }
            if self.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            if self.deadline_passed() {
                return Ok(self.out_of_time(&state));
            }

            let calls = std::mem::take(&mut response.tool_calls);
            let content = if response.content.trim().is_empty() {
                TOOL_USE_PLACEHOLDER.to_string()
            } else {
                response.content
            };
            state
                .messages
                .push(Message::assistant_with_tool_calls(content, calls.clone()));

            for (index, call) in calls.iter().enumerate() {
                self.options
                    .emit(&format!("Searching {}/{}...", index + 1, calls.len()));
                let Some(output) = self.execute_tool_call(call).await? else {
                    state.recount(&self.policy.search_tool);
                    return Ok(self.out_of_time(&state));
                };
                state.messages.push(Message::tool(call.id.clone(), output));
            }
            state.recount(&self.policy.search_tool);
            debug!(
                depth = state.depth,
                search_count = state.search_count,
                calls = calls.len(),
                "tool round finished"
            );

            self.options.emit("Processing results...");
            let request = self.next_request(&mut state).await;

            match self.bounded_complete(&request).await? {
                Ok(next) if next.tool_calls.is_empty() => return Ok(next),
                Ok(next) if state.depth + 1 < self.policy.max_depth => {
                    state.depth += 1;
                    self.options
                        .emit(&format!("Continuing search (depth {})...", state.depth));
                    response = next;
                }
                Ok(next) => return Ok(self.force_final(next, state.search_count)),
                Err(err) => {
                    warn!(
                        provider = %self.provider.name(),
                        depth = state.depth,
                        search_count = state.search_count,
                        error = %err,
                        "completion failed inside tool loop"
                    );
                    if self.deadline_passed() {
                        return Ok(self.out_of_time(&state));
                    }
                    if state.search_count < self.policy.min_searches
                        && state.depth + 2 < self.policy.max_depth
                    {
                        response = self.synthetic_retry(&state);
                        state.depth += 1;
                        self.options
                            .emit(&format!("Continuing search (depth {})...", state.depth));
                    } else {
                        return Ok(self.apology(&state));
                    }
                }
            }
        }
    }

    /// `None` once the caller deadline has passed.
    async fn execute_tool_call(&self, call: &ToolCall) -> Result<Option<String>, AgentError> {
        if self.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        if self.deadline_passed() {
            return Ok(None);
        }

        let name = call.function.name.as_str();
        let output = match call.parsed_arguments() {
            Err(err) => format!("Error executing {name}: failed to parse arguments: {err}"),
            Ok(parameters) => {
                let mut execution = ToolExecution::new(name, parameters)
                    .with_request_id(call.id.clone())
                    .with_session_id(self.session_id.clone());
                if self.policy.auto_confirm_tools {
                    execution = execution.confirmed();
                }

                let outcome = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(AgentError::Cancelled),
                    _ = self.deadline_elapsed() => return Ok(None),
                    outcome = self.tools.execute(execution) => outcome,
                };
                match outcome {
                    Ok(result) if result.success => result.output_text(),
                    Ok(result) => format!("Error executing {name}: {}", result.output_text()),
                    Err(err) => format!("Error executing {name}: {err}"),
                }
            }
        };

        if output.trim().is_empty() {
            return Ok(Some(EMPTY_TOOL_OUTPUT.to_string()));
        }
        Ok(Some(truncate_output(output, self.policy.max_tool_output_chars)))
    }

    async fn next_request(&self, state: &mut OrchestrationState) -> CompletionRequest {
        let (tools, choice) = if state.depth + 1 >= self.policy.max_depth {
            state.messages.push(Message::system(FINAL_ANSWER_INSTRUCTION));
            self.options.emit("Max search depth reached...");
            (Vec::new(), ToolChoice::None)
        } else {
            if state.search_count < self.policy.min_searches {
                if self.judge.is_result_useful(&state.messages) {
                    self.options.emit(&format!(
                        "Found useful information after {} searches...",
                        state.search_count
                    ));
                } else {
                    let last_is_tool = state
                        .messages
                        .last()
                        .is_some_and(|message| message.role == Role::Tool);
                    if last_is_tool {
                        state
                            .messages
                            .push(Message::system(self.search_requirement(state.search_count)));
                    }
                    self.options.emit(&format!(
                        "Forcing more searches ({}/{})...",
                        state.search_count, self.policy.min_searches
                    ));
                }
            }
            (self.tools.function_tools().await, ToolChoice::Auto)
        };

        CompletionRequest::new(state.messages.clone())
            .with_max_tokens(self.options.max_tokens)
            .with_temperature(self.options.temperature)
            .with_tools(tools, choice)
    }

    fn search_requirement(&self, search_count: u32) -> String {
        let min = self.policy.min_searches;
        format!(
            "SEARCH REQUIREMENT\n\
             You have made {search_count}/{min} searches. Continue searching until you find \
             useful information or reach {min} total searches.\n\n\
             SEARCH STRATEGIES:\n\
             - Try business domain alternatives (bonus -> voucher, reservation -> booking)\n\
             - Use singular and plural variations\n\
             - Combine with API terms (endpoint, list, get, create)\n\
             - Think about which business function the user wants\n\
             - Try abbreviated forms and technical variations\n\n\
             If recent searches returned useful information, you may answer. Otherwise call \
             the {tool} tool again with COMPLETELY DIFFERENT search terms.",
            tool = self.policy.search_tool,
        )
    }

    fn synthetic_retry(&self, state: &OrchestrationState) -> CompletionResponse {
        info!(
            depth = state.depth,
            search_count = state.search_count,
            "provider failed below the search minimum; retrying with a synthetic search"
        );
        CompletionResponse::text(format!(
            "Continuing search... ({}/{} attempts made)",
            state.search_count, self.policy.min_searches
        ))
        .with_tool_calls(vec![ToolCall::new(
            format!("retry_search_{}", state.depth),
            self.policy.search_tool.clone(),
            RETRY_QUERY,
        )])
    }

    fn apology(&self, state: &OrchestrationState) -> CompletionResponse {
        let count = state.search_count;
        let excerpt = state
            .messages
            .iter()
            .rev()
            .filter(|message| message.role == Role::Tool)
            .map(|message| message.content.trim())
            .find(|content| !content.is_empty() && !content.starts_with("Error executing"));

        let content = match excerpt {
            Some(excerpt) => format!(
                "After {count} searches, I found some information but am having trouble \
                 presenting it properly. This is the most relevant result I retrieved:\n\n{}\n\n\
                 Could you please rephrase your question?",
                truncate_output(excerpt.to_string(), APOLOGY_EXCERPT_CHARS)
            ),
            None => format!(
                "After {count} search attempts, I'm experiencing technical difficulties. \
                 Please try rephrasing your question."
            ),
        };
        CompletionResponse::text(content)
    }

    fn force_final(&self, mut response: CompletionResponse, search_count: u32) -> CompletionResponse {
        response.tool_calls.clear();

        let trimmed = response.content.trim();
        if trimmed.is_empty()
            || trimmed.ends_with(':')
            || trimmed.chars().count() < MIN_FINAL_ANSWER_CHARS
        {
            response.content = format!(
                "After exhaustive search ({search_count} attempts), I could not find the specific \
                 information you requested in the available documentation. This may mean:\n\n\
                 1. The information is in a different location or format\n\
                 2. The documentation is incomplete for this query\n\
                 3. The feature is not documented yet\n\n\
                 Please:\n\
                 - Rephrase your question with different keywords\n\
                 - Name the exact API operation you need\n\
                 - Check whether other documentation sources exist\n\n\
                 Search attempts made: {search_count}"
            );
        }
        response
    }
}

fn truncate_output(output: String, max_chars: usize) -> String {
    match output.char_indices().nth(max_chars) {
        Some((end, _)) => {
            let mut truncated = output[..end].to_string();
            truncated.push_str(TRUNCATION_MARKER);
            truncated
        }
        None => output,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_marks_cut_output() {
        assert_eq!(truncate_output("short".to_string(), 10), "short");
        let cut = truncate_output("ééééé".to_string(), 3);
        assert_eq!(cut, format!("ééé{TRUNCATION_MARKER}"));
    }

    #[test]
    fn state_counts_existing_searches() {
        let messages = vec![Message::assistant_with_tool_calls(
            "searching",
            vec![ToolCall::new("1", "kbase", "{}")],
        )];
        let state = OrchestrationState::new(messages, "kbase").at_depth(3);
        assert_eq!(state.search_count, 1);
        assert_eq!(state.depth, 3);
    }
}
