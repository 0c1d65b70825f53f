use std::future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::*;
use crate::error::{ProviderError, ProviderErrorKind, SearchError};
use crate::llm::{MockProvider, Role, ToolCall};
use crate::tools::{ParameterSchema, PropertySchema, SearchHit, ToolCategory, ToolSpec};

type Log = Arc<Mutex<Vec<String>>>;

fn log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().expect("log").clone()
}

/// `kbase` stand-in that records every query and answers with `output`.
fn search_tool(output: &'static str, queries: Log) -> ToolSpec {
    ToolSpec::new("kbase", "Search the documentation")
        .with_parameters(
            ParameterSchema::object()
                .required_property("query", PropertySchema::string("Search terms")),
        )
        .expect("schema")
        .with_category(ToolCategory::Data)
        .with_handler(move |parameters| {
            let queries = Arc::clone(&queries);
            async move {
                let query = parameters
                    .get("query")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                queries.lock().expect("queries").push(query);
                Ok(ToolResult::success(output))
            }
        })
}

fn kbase_call(id: impl Into<String>, query: &str) -> ToolCall {
    ToolCall::new(id, "kbase", json!({ "query": query }).to_string())
}

fn asks_for_more_searches(request: &CompletionRequest) -> bool {
    request.messages.last().is_some_and(|message| {
        message.role == Role::System && message.content.starts_with("SEARCH REQUIREMENT")
    })
}

fn policy(max_depth: u32, min_searches: u32) -> OrchestrationPolicy {
    OrchestrationPolicy {
        max_depth,
        min_searches,
        ..OrchestrationPolicy::default()
    }
}

fn status_options(statuses: &Log) -> ConversationOptions {
    let statuses = Arc::clone(statuses);
    ConversationOptions::default()
        .with_status(move |status| statuses.lock().expect("statuses").push(status.to_string()))
}

/// Provider whose completions never finish.
struct StalledProvider;

#[async_trait]
impl Provider for StalledProvider {
    fn name(&self) -> String {
        "stalled".to_string()
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn complete(
        &self,
        _request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        future::pending().await
    }

    fn models(&self) -> Vec<String> {
        vec![self.default_model()]
    }

    fn default_model(&self) -> String {
        "stalled-model".to_string()
    }

    fn validate_config(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

#[tokio::test]
async fn tool_loop_stops_exactly_at_max_depth() {
    let queries = log();
    let provider = Arc::new(MockProvider::new("mock").with_responder(|_, index| {
        Ok(CompletionResponse::text("Looking again.")
            .with_tool_calls(vec![kbase_call(format!("call_{index}"), "customers")]))
    }));
    let agent = Agent::builder()
        .shared_provider(provider.clone())
        .tool(search_tool("nothing relevant here", Arc::clone(&queries)))
        .policy(policy(5, 3))
        .build()
        .expect("agent");

    let response = agent
        .send_message("how do I list customers")
        .await
        .expect("turn");

    assert_eq!(provider.call_count(), 6);
    assert_eq!(entries(&queries).len(), 5);
    assert!(response.tool_calls.is_empty());
    assert!(response.content.contains("(5 attempts)"));

    let requests = provider.requests();
    let last = requests.last().expect("final request");
    assert!(last.tools.is_empty());
    assert_eq!(last.tool_choice, ToolChoice::None);
    assert!(
        last.messages
            .iter()
            .any(|message| message.content.starts_with("IMPORTANT: You've reached the maximum"))
    );

    let counts: Vec<u32> = requests
        .iter()
        .map(|request| count_search_attempts(&request.messages, "kbase"))
        .collect();
    assert_eq!(counts, vec![0, 1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn search_requirement_is_injected_until_the_minimum_is_met() {
    let queries = log();
    let statuses = log();
    let provider = Arc::new(MockProvider::new("mock").with_responder(|request, index| {
        if index == 0 || asks_for_more_searches(request) {
            return Ok(CompletionResponse::text("")
                .with_tool_calls(vec![kbase_call(format!("call_{index}"), "customer")]));
        }
        Ok(CompletionResponse::text("Customers are managed through the customer API."))
    }));
    let agent = Agent::builder()
        .shared_provider(provider.clone())
        .tool(search_tool("no endpoints found", Arc::clone(&queries)))
        .policy(policy(10, 3))
        .build()
        .expect("agent");

    let response = agent
        .send_message_with("customers?", status_options(&statuses))
        .await
        .expect("turn");

    assert_eq!(response.content, "Customers are managed through the customer API.");
    assert_eq!(entries(&queries).len(), 3);
    assert_eq!(provider.call_count(), 4);

    let requests = provider.requests();
    assert_eq!(requests.iter().filter(|r| asks_for_more_searches(r)).count(), 2);
    let assistant_turns: Vec<&Message> = requests[3]
        .messages
        .iter()
        .filter(|message| message.role == Role::Assistant)
        .collect();
    assert!(
        assistant_turns
            .iter()
            .all(|message| message.content == "I'll use some tools to help answer your question.")
    );

    let statuses = entries(&statuses);
    assert_eq!(statuses.first().map(String::as_str), Some("Processing request..."));
    assert!(statuses.contains(&"Forcing more searches (1/3)...".to_string()));
    assert!(statuses.contains(&"Forcing more searches (2/3)...".to_string()));
    assert!(statuses.contains(&"Searching 1/1...".to_string()));
}

#[tokio::test]
async fn provider_failures_below_the_minimum_become_synthetic_searches() {
    let queries = log();
    let provider = Arc::new(MockProvider::new("mock").with_responder(|_, index| {
        if index == 0 {
            return Ok(CompletionResponse::text("Searching.")
                .with_tool_calls(vec![kbase_call("call_0", "customers")]));
        }
        Err(ProviderError::network("mock", "connection reset"))
    }));
    let agent = Agent::builder()
        .shared_provider(provider.clone())
        .tool(search_tool("Customer guide: customers have a name.", Arc::clone(&queries)))
        .policy(policy(10, 3))
        .build()
        .expect("agent");

    let response = agent.send_message("customers").await.expect("turn");

    assert!(response.content.starts_with("After 3 search"), "{}", response.content);
    assert!(response.content.contains("Customer guide: customers have a name."));
    assert_eq!(
        entries(&queries),
        vec!["customers", "alternative search terms", "alternative search terms"]
    );
    assert_eq!(provider.call_count(), 4);

    let retried: Vec<String> = provider.requests()[3]
        .messages
        .iter()
        .flat_map(|message| &message.tool_calls)
        .map(|call| call.id.clone())
        .collect();
    assert_eq!(retried, vec!["call_0", "retry_search_0", "retry_search_1"]);
}

#[tokio::test]
async fn exhausted_depth_reports_the_attempt_count() {
    let provider = MockProvider::new("mock");
    let tools = ToolRegistry::new();
    let policy = policy(4, 2);
    let judge = EndpointHeuristic::default();
    let options = ConversationOptions::default();
    let orchestrator = Orchestrator::new(&provider, &tools, &policy, &judge, &options);

    let messages: Vec<Message> = (0..3)
        .map(|i| Message::assistant_with_tool_calls("searching", vec![kbase_call(i.to_string(), "x")]))
        .collect();
    let state = OrchestrationState::new(messages, "kbase").at_depth(policy.max_depth);
    let pending = CompletionResponse::text("").with_tool_calls(vec![kbase_call("late", "y")]);

    let response = orchestrator.run(pending, state.clone()).await.expect("run");
    assert!(response.tool_calls.is_empty());
    assert!(response.content.contains("(3 attempts)"));
    assert!(response.content.ends_with("Search attempts made: 3"));
    assert_eq!(provider.call_count(), 0);

    let complete_answer = "A".repeat(150);
    let response = orchestrator
        .run(CompletionResponse::text(complete_answer.clone()), state)
        .await
        .expect("run");
    assert_eq!(response.content, complete_answer);
}

struct DocsEngine;

const CUSTOMER_DOC: &str = "POST /api/customers creates a customer record. ";

#[async_trait]
impl SearchEngine for DocsEngine {
    async fn find_relevant_files(
        &self,
        _query: &str,
        _max_results: usize,
    ) -> Result<Vec<SearchHit>, SearchError> {
        Ok(vec![SearchHit {
            path: PathBuf::from("api/customers.md"),
            filename: "customers.md".to_string(),
            score: 0.9,
            reason: "name matches customers".to_string(),
        }])
    }

    async fn extract_relevant_content(
        &self,
        _path: &Path,
        _query: &str,
        max_chars: usize,
    ) -> Result<String, SearchError> {
        Ok(CUSTOMER_DOC.repeat(13).chars().take(max_chars).collect())
    }
}

#[tokio::test]
async fn useful_results_end_the_search_early() {
    let statuses = log();
    let provider = Arc::new(MockProvider::new("mock").with_responder(|request, index| {
        if index == 0 {
            return Ok(CompletionResponse::text("")
                .with_tool_calls(vec![kbase_call("call_0", "create customer")]));
        }
        let saw_docs = request.messages.last().is_some_and(|message| {
            message.role == Role::Tool && message.content.contains("POST /api/customers")
        });
        Ok(CompletionResponse::text(if saw_docs {
            "Send POST /api/customers with the customer fields in the JSON body."
        } else {
            "I don't know."
        }))
    }));
    let agent = Agent::builder()
        .shared_provider(provider.clone())
        .tool(KbaseTool::new(Arc::new(DocsEngine)))
        .build()
        .expect("agent");

    let response = agent
        .send_message_with("how do I create a customer", status_options(&statuses))
        .await
        .expect("turn");

    assert!(response.content.contains("POST /api/customers"));
    assert_eq!(agent.tools().execution_history(None).len(), 1);
    assert_eq!(provider.call_count(), 2);
    assert!(
        provider
            .requests()
            .iter()
            .flat_map(|request| &request.messages)
            .all(|message| !message.content.starts_with("SEARCH REQUIREMENT"))
    );
    assert!(entries(&statuses).contains(&"Found useful information after 1 searches...".to_string()));
}

#[tokio::test]
async fn direct_tool_execution_honours_confirmation() {
    let agent = Agent::builder()
        .provider(MockProvider::new("mock"))
        .tool(
            ToolSpec::new("purge_cache", "Drop cached documents")
                .requiring_confirmation()
                .with_cost(5)
                .with_handler(|_| async { Ok(ToolResult::success("purged")) }),
        )
        .build()
        .expect("agent");

    let gated = agent
        .execute_tool("purge_cache", Map::new(), false)
        .await
        .expect("known tool");
    assert!(!gated.success);
    assert_eq!(gated.metadata["error_kind"], "confirmation_required");
    assert_eq!(gated.metadata["estimated_cost"], 5);

    let confirmed = agent
        .execute_tool("purge_cache", Map::new(), true)
        .await
        .expect("known tool");
    assert!(confirmed.success);
    assert_eq!(confirmed.output_text(), "purged");

    assert!(matches!(
        agent.execute_tool("missing", Map::new(), true).await,
        Err(ToolError::NotFound(_))
    ));
}

#[tokio::test]
async fn cancellation_stops_remaining_tool_calls() {
    let token = CancellationToken::new();
    let runs = log();
    let provider = MockProvider::new("mock").push_response(
        CompletionResponse::text("Two searches.")
            .with_tool_calls(vec![kbase_call("a", "first"), kbase_call("b", "second")]),
    );
    let handler_token = token.clone();
    let handler_runs = Arc::clone(&runs);
    let agent = Agent::builder()
        .provider(provider)
        .tool(
            ToolSpec::new("kbase", "Search")
                .without_validation()
                .with_handler(move |_| {
                    let token = handler_token.clone();
                    let runs = Arc::clone(&handler_runs);
                    async move {
                        runs.lock().expect("runs").push("ran".to_string());
                        token.cancel();
                        Ok(ToolResult::success("partial"))
                    }
                }),
        )
        .build()
        .expect("agent");

    let outcome = agent
        .send_message_with(
            "search twice",
            ConversationOptions::default().with_cancellation(token),
        )
        .await;

    assert!(matches!(outcome, Err(AgentError::Cancelled)));
    assert_eq!(entries(&runs).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn agent_cancel_aborts_an_in_flight_completion() {
    let agent = Arc::new(
        Agent::builder()
            .provider(StalledProvider)
            .build()
            .expect("agent"),
    );

    let turn = tokio::spawn({
        let agent = Arc::clone(&agent);
        async move { agent.send_message("hello").await }
    });
    tokio::time::sleep(Duration::from_secs(1)).await;
    agent.cancel();

    let outcome = turn.await.expect("join");
    assert!(matches!(outcome, Err(AgentError::Cancelled)));
}

#[tokio::test(start_paused = true)]
async fn stalled_first_completion_times_out_into_an_apology() {
    let agent = Agent::builder()
        .provider(StalledProvider)
        .policy(OrchestrationPolicy {
            round_timeout: Duration::from_secs(5),
            ..OrchestrationPolicy::default()
        })
        .build()
        .expect("agent");

    let response = agent.send_message("hello").await.expect("turn");
    assert_eq!(response.content, INITIAL_FAILURE_REPLY);
}

fn searches_then_fails(_: &CompletionRequest, index: usize) -> Result<CompletionResponse, ProviderError> {
    if index == 0 {
        return Ok(CompletionResponse::text("")
            .with_tool_calls(vec![kbase_call("call_0", "customers")]));
    }
    Err(ProviderError::network("mock", "connection reset"))
}

#[tokio::test(start_paused = true)]
async fn deadline_cuts_a_running_tool_and_skips_retries() {
    let queries = log();
    let statuses = log();
    let slow_queries = Arc::clone(&queries);
    let slow_search = ToolSpec::new("kbase", "Search the documentation")
        .with_parameters(
            ParameterSchema::object()
                .required_property("query", PropertySchema::string("Search terms")),
        )
        .expect("schema")
        .with_handler(move |_| {
            let queries = Arc::clone(&slow_queries);
            async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                queries.lock().expect("queries").push("finished".to_string());
                Ok(ToolResult::success("late result"))
            }
        });
    let provider = Arc::new(MockProvider::new("mock").with_responder(searches_then_fails));
    let agent = Agent::builder()
        .shared_provider(provider.clone())
        .tool(slow_search)
        .policy(policy(10, 3))
        .build()
        .expect("agent");

    let options = status_options(&statuses)
        .with_deadline(tokio::time::Instant::now() + Duration::from_secs(5));
    let response = agent
        .send_message_with("customers", options)
        .await
        .expect("turn");

    assert!(response.content.contains("technical difficulties"), "{}", response.content);
    assert!(entries(&queries).is_empty());
    assert!(agent.tools().execution_history(None).is_empty());
    assert_eq!(provider.call_count(), 1);
    assert!(entries(&statuses).contains(&"Deadline reached...".to_string()));
}

#[tokio::test]
async fn expired_deadline_runs_no_tools_and_calls_no_provider() {
    let queries = log();
    let provider = Arc::new(MockProvider::new("mock").with_responder(searches_then_fails));
    let registry = ToolRegistry::new();
    registry
        .register(Arc::new(search_tool("result", Arc::clone(&queries))))
        .expect("register");
    let policy = policy(10, 3);
    let judge = EndpointHeuristic::default();
    let options = ConversationOptions::default().with_deadline(tokio::time::Instant::now());

    let orchestrator = Orchestrator::new(provider.as_ref(), &registry, &policy, &judge, &options);
    let first = CompletionResponse::text("")
        .with_tool_calls(vec![kbase_call("call_0", "customers")]);
    let state = OrchestrationState::new(vec![Message::user("customers")], "kbase");
    let response = orchestrator.run(first, state).await.expect("turn");

    assert!(response.tool_calls.is_empty());
    assert!(response.content.starts_with("After 0 search attempts"), "{}", response.content);
    assert!(entries(&queries).is_empty());
    assert!(registry.execution_history(None).is_empty());
    assert_eq!(provider.call_count(), 0);

    let agent = Agent::builder()
        .shared_provider(provider.clone())
        .tool(search_tool("result", Arc::clone(&queries)))
        .build()
        .expect("agent");
    let options = ConversationOptions::default().with_deadline(tokio::time::Instant::now());
    let reply = agent
        .send_message_with("customers", options)
        .await
        .expect("turn");
    assert_eq!(reply.content, INITIAL_FAILURE_REPLY);
    assert_eq!(provider.call_count(), 0);
    assert!(entries(&queries).is_empty());
}

#[tokio::test]
async fn initial_failure_is_an_apology_and_is_remembered() {
    let agent = Agent::builder()
        .provider(MockProvider::new("mock").push_error(ProviderErrorKind::ServerError, "boom"))
        .build()
        .expect("agent");

    let response = agent.send_message("anyone there?").await.expect("turn");
    assert_eq!(response.content, INITIAL_FAILURE_REPLY);

    let memory = agent.memory();
    assert_eq!(memory.len(), 2);
    assert_eq!(memory.messages[1].content, INITIAL_FAILURE_REPLY);
}

#[tokio::test]
async fn turns_are_saved_and_titled() {
    let dir = tempfile::tempdir().expect("tempdir");
    let provider = MockProvider::new("mock")
        .push_response(CompletionResponse::text("Use the customers endpoint."))
        .push_response(CompletionResponse::text("\"Creating customers\""))
        .push_error(ProviderErrorKind::RateLimit, "slow down");
    let agent = Agent::builder()
        .provider(provider)
        .memory_dir(dir.path())
        .build()
        .expect("agent");

    assert_eq!(agent.generate_title().await, "New conversation");

    agent
        .send_message("how do I create a customer")
        .await
        .expect("turn");
    assert_eq!(agent.generate_title().await, "Creating customers");
    assert_eq!(agent.generate_title().await, "how do I create...");

    let sessions = ConversationMemory::list_sessions(dir.path()).expect("sessions");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].session_id, agent.session_id());
    assert_eq!(sessions[0].message_count, 2);

    let stats = agent.stats().await;
    assert_eq!(stats.turns, 1);
    assert_eq!(stats.messages, 2);
    assert_eq!(stats.provider, "mock");
    assert_eq!(stats.model, MockProvider::DEFAULT_MODEL);

    let previous = agent.session_id();
    let fresh = agent.start_conversation();
    assert_ne!(fresh, previous);
    assert!(agent.memory().is_empty());

    agent.load_conversation(&previous).expect("load");
    assert_eq!(agent.session_id(), previous);
    assert_eq!(agent.memory().len(), 2);
}

#[tokio::test]
async fn system_prompt_carries_user_context_and_history() {
    let provider = Arc::new(MockProvider::new("mock"));
    let agent = Agent::builder()
        .shared_provider(provider.clone())
        .tool(search_tool("unused", log()))
        .user_context(UserContext {
            name: Some("Marta".to_string()),
            api_host: Some("https://api.club.test".to_string()),
            ..UserContext::default()
        })
        .build()
        .expect("agent");

    agent.send_message("first question").await.expect("turn");
    agent.send_message("second question").await.expect("turn");

    let request = provider.requests().pop().expect("request");
    assert_eq!(request.messages[0].role, Role::System);
    assert!(request.messages[0].content.contains("Use the kbase tool"));
    assert!(request.messages[0].content.contains("User name: Marta"));
    assert!(request.messages[0].content.contains("https://api.club.test"));
    assert_eq!(request.messages.last().map(|m| m.content.as_str()), Some("second question"));
    assert_eq!(request.tools.len(), 1);
    assert_eq!(request.tool_choice, ToolChoice::Auto);
}

#[tokio::test(start_paused = true)]
async fn readiness_waits_at_most_the_given_time() {
    let slow = Agent::builder()
        .provider(MockProvider::new("slow").with_probe_delay(Duration::from_secs(30)))
        .build()
        .expect("agent");
    assert!(!slow.wait_until_ready(Duration::from_secs(1)).await);

    let ready = Agent::builder()
        .provider(MockProvider::new("ready"))
        .build()
        .expect("agent");
    assert!(ready.wait_until_ready(Duration::from_secs(1)).await);
}

#[test]
fn builder_rejects_missing_provider_and_duplicate_tools() {
    assert!(matches!(Agent::builder().build(), Err(AgentError::Build(_))));

    let duplicate = Agent::builder()
        .provider(MockProvider::new("mock"))
        .tool(search_tool("a", log()))
        .tool(search_tool("b", log()))
        .build();
    assert!(matches!(
        duplicate,
        Err(AgentError::Tool(ToolError::AlreadyRegistered(_)))
    ));

    let zero_depth = Agent::builder()
        .provider(MockProvider::new("mock"))
        .policy(policy(0, 0))
        .build();
    assert!(matches!(zero_depth, Err(AgentError::Build(_))));
}

#[test]
fn from_config_without_keys_is_fatal() {
    let mut config = Config::default();
    for settings in config.llm.providers.values_mut() {
        settings.api_key = None;
        settings.enabled = false;
    }
    let outcome = Agent::from_config(&config, Arc::new(DocsEngine));
    assert!(matches!(
        outcome,
        Err(AgentError::Provider(ProviderError::NoProvidersConfigured))
    ));
}

#[test]
fn fallback_titles_use_the_first_four_words() {
    assert_eq!(fallback_title("how do I create a customer"), "how do I create...");
    assert_eq!(fallback_title("   "), "New conversation");
}
