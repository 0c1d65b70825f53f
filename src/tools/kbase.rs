use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::error::{SearchError, ToolError};
use crate::tools::{ParameterSchema, PropertySchema, Tool, ToolCategory, ToolResult};

const SHOWN_HITS: usize = 3;
const CONTENT_PER_HIT: usize = 1000;
const CONTENT_TOTAL: usize = 5000;
const LOW_SCORE: f64 = 0.3;
const MAX_SUGGESTIONS: usize = 6;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SearchHit {
    pub path: PathBuf,
    pub filename: String,
    /// Relevance in `[0, 1]`.
    pub score: f64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

/// Backend that finds and excerpts knowledge-base documents.
#[async_trait]
pub trait SearchEngine: Send + Sync {
    async fn find_relevant_files(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchHit>, SearchError>;

    async fn extract_relevant_content(
        &self,
        path: &Path,
        query: &str,
        max_chars: usize,
    ) -> Result<String, SearchError>;
}

/// The documentation search tool the orchestration loop counts attempts of.
pub struct KbaseTool {
    name: String,
    engine: Arc<dyn SearchEngine>,
    default_max_results: usize,
    parameters: ParameterSchema,
}

impl KbaseTool {
    pub const DEFAULT_NAME: &'static str = "kbase";
    pub const DEFAULT_MAX_RESULTS: usize = 10;

    pub fn new(engine: Arc<dyn SearchEngine>) -> Self {
        Self {
            name: Self::DEFAULT_NAME.to_string(),
            engine,
            default_max_results: Self::DEFAULT_MAX_RESULTS,
            parameters: ParameterSchema::object()
                .required_property(
                    "query",
                    PropertySchema::string(
                        "Search terms: endpoint names, operations or domain words",
                    ),
                )
                .property(
                    "max_results",
                    PropertySchema::number("Maximum number of files to return")
                        .with_default(Self::DEFAULT_MAX_RESULTS as u64)
                        .with_range(1.0, 50.0),
                ),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_default_max_results(mut self, max_results: usize) -> Self {
        self.default_max_results = max_results.clamp(1, 50);
        self
    }

    async fn format_hits(&self, query: &str, hits: &[SearchHit]) -> String {
        if hits.is_empty() {
            return format!("No relevant files found for '{query}' in knowledge base.");
        }

        let mut output = format!("Found {} relevant files for '{query}':\n\n", hits.len());
        let mut content_budget = CONTENT_TOTAL;

        for (index, hit) in hits.iter().take(SHOWN_HITS).enumerate() {
            let _ = writeln!(output, "{}. {} (Score: {:.2})", index + 1, hit.filename, hit.score);
            if !hit.reason.is_empty() {
                let _ = writeln!(output, "   Reason: {}", hit.reason);
            }

            match self
                .engine
                .extract_relevant_content(&hit.path, query, CONTENT_PER_HIT)
                .await
            {
                Ok(content) if !content.trim().is_empty() && content_budget > 0 => {
                    let (content, truncated) = clip(&content, content_budget);
                    content_budget -= content.chars().count();
                    let ellipsis = if truncated { "..." } else { "" };
                    let _ = writeln!(output, "   Content: {content}{ellipsis}");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(path = %hit.path.display(), error = %err, "content extraction failed");
                }
            }
            output.push('\n');
        }

        if hits.len() > SHOWN_HITS {
            let _ = writeln!(
                output,
                "... and {} more files available",
                hits.len() - SHOWN_HITS
            );
        }
        output
    }
}

#[async_trait]
impl Tool for KbaseTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Search the documentation knowledge base for API endpoints, request formats and \
         usage examples. Returns the most relevant files with excerpts."
    }

    fn parameters(&self) -> &ParameterSchema {
        &self.parameters
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Data
    }

    fn estimated_cost(&self) -> u32 {
        1
    }

    async fn execute(&self, parameters: Map<String, Value>) -> Result<ToolResult, ToolError> {
        let query = parameters
            .get("query")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if query.is_empty() {
            return Ok(ToolResult::failure("query parameter is required"));
        }

        let max_results = parameters
            .get("max_results")
            .and_then(Value::as_f64)
            .filter(|value| *value >= 1.0)
            .map_or(self.default_max_results, |value| value as usize);

        debug!(tool = %self.name, query, max_results, "searching knowledge base");
        let hits = match self.engine.find_relevant_files(query, max_results).await {
            Ok(hits) => hits,
            Err(err) => return Ok(ToolResult::failure(format!("Search failed: {err}"))),
        };

        let mut message = self.format_hits(query, &hits).await;
        if hits.first().is_none_or(|top| top.score < LOW_SCORE) {
            let suggestions = search_suggestions(query);
            if !suggestions.is_empty() {
                let _ = write!(
                    message,
                    "\n\nSUGGESTED ALTERNATIVE SEARCHES:\nTry these terms: {}",
                    suggestions.join(", ")
                );
            }
        }

        Ok(ToolResult::success(message).with_data(json!({
            "query": query,
            "total_results": hits.len(),
            "results": hits,
        })))
    }
}

/// Cuts to at most `max_chars` characters; reports whether anything was cut.
fn clip(text: &str, max_chars: usize) -> (&str, bool) {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => (&text[..end], true),
        None => (text, false),
    }
}

/// Alternative phrasings for a query that found little.
fn search_suggestions(query: &str) -> Vec<String> {
    let lower = query.to_lowercase();
    let mut candidates: Vec<String> = Vec::new();

    let domain_terms: [(&[&str], [&str; 4]); 5] = [
        (
            &["pay", "payment"],
            ["paySales", "billing pay", "payment method", "sale payment"],
        ),
        (
            &["customer", "client"],
            ["customer endpoint", "get customers", "customer API", "read customers"],
        ),
        (
            &["invoice"],
            ["invoice endpoint", "create invoice", "invoice API", "billing invoice"],
        ),
        (
            &["sale"],
            ["sale endpoint", "save sale", "sales API", "billing sale"],
        ),
        (
            &["booking", "reservation"],
            ["booking endpoint", "cancel booking", "booking API", "save booking"],
        ),
    ];
    for (triggers, terms) in domain_terms {
        if triggers.iter().any(|trigger| lower.contains(trigger)) {
            candidates.extend(terms.iter().map(|term| term.to_string()));
        }
    }

    for word in lower.split_whitespace() {
        candidates.push(format!("{word} endpoint"));
        candidates.push(format!("{word} API"));
        if !word.starts_with("get") && !word.starts_with("create") {
            for verb in ["get", "create", "update", "delete"] {
                candidates.push(format!("{verb} {word}"));
            }
        }
    }

    let mut suggestions: Vec<String> = Vec::new();
    for candidate in candidates {
        if candidate != lower && !suggestions.contains(&candidate) {
            suggestions.push(candidate);
        }
        if suggestions.len() == MAX_SUGGESTIONS {
            break;
        }
    }
    suggestions
}
