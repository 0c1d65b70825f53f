use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::config::AgentSettings;
use crate::llm::{Message, Role};

/// Limits that bound one orchestration run.
#[derive(Clone, Debug, PartialEq)]
pub struct OrchestrationPolicy {
    pub max_depth: u32,
    pub min_searches: u32,
    /// Tool whose calls count as search attempts.
    pub search_tool: String,
    pub round_timeout: Duration,
    pub max_tool_output_chars: usize,
    /// Model-requested tool calls pass the confirmation gate.
    pub auto_confirm_tools: bool,
}

impl Default for OrchestrationPolicy {
    fn default() -> Self {
        Self {
            max_depth: 20,
            min_searches: 8,
            search_tool: "kbase".to_string(),
            round_timeout: Duration::from_secs(45),
            max_tool_output_chars: 12_000,
            auto_confirm_tools: true,
        }
    }
}

impl From<&AgentSettings> for OrchestrationPolicy {
    fn from(settings: &AgentSettings) -> Self {
        Self {
            max_depth: settings.max_depth,
            min_searches: settings.min_searches,
            search_tool: settings.search_tool.clone(),
            round_timeout: Duration::from_secs(settings.round_timeout_secs),
            max_tool_output_chars: settings.max_tool_output_chars,
            auto_confirm_tools: true,
        }
    }
}

/// Decides whether the latest tool output answers the question well enough
/// to stop forcing searches.
pub trait ResultJudge: Send + Sync {
    fn is_result_useful(&self, messages: &[Message]) -> bool;
}

impl<F> ResultJudge for F
where
    F: Fn(&[Message]) -> bool + Send + Sync,
{
    fn is_result_useful(&self, messages: &[Message]) -> bool {
        self(messages)
    }
}

static ENDPOINT_SHAPE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)endpoint|/api/|\b(get|post|put|patch|delete)\s|https?://|\bhttp\b|model/").ok()
});

/// Looks for HTTP-method or endpoint-shaped text in the trailing tool
/// messages.
#[derive(Clone, Debug, PartialEq)]
pub struct EndpointHeuristic {
    /// How many trailing messages to inspect.
    pub lookback: usize,
    /// Tool messages at or below this length are ignored.
    pub min_message_chars: usize,
    /// Matching messages must add up to at least this many characters.
    pub min_combined_chars: usize,
}

impl Default for EndpointHeuristic {
    fn default() -> Self {
        Self {
            lookback: 4,
            min_message_chars: 200,
            min_combined_chars: 500,
        }
    }
}

impl ResultJudge for EndpointHeuristic {
    fn is_result_useful(&self, messages: &[Message]) -> bool {
        let start = messages.len().saturating_sub(self.lookback);
        let combined: usize = messages[start..]
            .iter()
            .filter(|message| message.role == Role::Tool)
            .filter(|message| message.content.chars().count() > self.min_message_chars)
            .filter(|message| {
                ENDPOINT_SHAPE
                    .as_ref()
                    .is_some_and(|shape| shape.is_match(&message.content))
            })
            .map(|message| message.content.chars().count())
            .sum();
        combined > 0 && combined >= self.min_combined_chars
    }
}

/// Number of calls to `search_tool` across every assistant message.
///
/// Recomputed from the transcript instead of tracked incrementally, so any
/// message list yields the same count.
pub fn count_search_attempts(messages: &[Message], search_tool: &str) -> u32 {
    messages
        .iter()
        .filter(|message| message.role == Role::Assistant)
        .flat_map(|message| &message.tool_calls)
        .filter(|call| call.function.name == search_tool)
        .count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ToolCall;

    fn padded(text: &str, len: usize) -> String {
        format!("{text} {}", "x".repeat(len))
    }

    #[test]
    fn counts_only_assistant_calls_to_the_search_tool() {
        let messages = vec![
            Message::user("find it"),
            Message::assistant_with_tool_calls(
                "searching",
                vec![
                    ToolCall::new("1", "kbase", r#"{"query":"a"}"#),
                    ToolCall::new("2", "calculator", "{}"),
                ],
            ),
            Message::tool("1", "result"),
            Message::assistant_with_tool_calls(
                "again",
                vec![ToolCall::new("3", "kbase", r#"{"query":"b"}"#)],
            ),
        ];

        assert_eq!(count_search_attempts(&messages, "kbase"), 2);
        assert_eq!(count_search_attempts(&messages, "calculator"), 1);
        assert_eq!(count_search_attempts(&messages[..2], "kbase"), 1);
    }

    #[test]
    fn heuristic_needs_endpoint_text_and_enough_length() {
        let judge = EndpointHeuristic::default();

        let useful = vec![Message::tool("1", padded("POST /api/customers", 600))];
        assert!(judge.is_result_useful(&useful));

        let short = vec![Message::tool("1", padded("POST /api/customers", 250))];
        assert!(!judge.is_result_useful(&short));

        let no_endpoint = vec![Message::tool("1", padded("general prose", 600))];
        assert!(!judge.is_result_useful(&no_endpoint));

        let two_halves = vec![
            Message::tool("1", padded("GET /api/a", 260)),
            Message::tool("2", padded("see endpoint b", 260)),
        ];
        assert!(judge.is_result_useful(&two_halves));
    }

    #[test]
    fn heuristic_only_looks_at_the_trailing_window() {
        let judge = EndpointHeuristic::default();
        let mut messages = vec![Message::tool("1", padded("POST /api/customers", 600))];
        messages.extend((0..4).map(|i| Message::assistant(format!("filler {i}"))));
        assert!(!judge.is_result_useful(&messages));
    }

    #[test]
    fn closures_are_judges() {
        let always = |_: &[Message]| true;
        assert!(always.is_result_useful(&[]));
    }
}
