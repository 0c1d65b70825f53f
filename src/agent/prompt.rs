use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

/// Who the agent is talking to; rendered into the system prompt.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub preferences: BTreeMap<String, String>,
    /// Host used in every API example.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_host: Option<String>,
}

impl UserContext {
    fn render(&self) -> Option<String> {
        let mut lines = Vec::new();
        if let Some(name) = &self.name {
            lines.push(format!("User name: {name}"));
        }
        if let Some(organization) = &self.organization {
            lines.push(format!("Organization: {organization}"));
        }
        if let Some(role) = &self.role {
            lines.push(format!("Role: {role}"));
        }
        if !self.preferences.is_empty() {
            let preferences = self
                .preferences
                .iter()
                .map(|(key, value)| format!("{key}: {value}"))
                .collect::<Vec<_>>()
                .join(", ");
            lines.push(format!("Preferences: {preferences}"));
        }
        if lines.is_empty() && self.api_host.is_none() {
            return None;
        }

        let mut rendered = String::from("CONVERSATION CONTEXT:\n");
        rendered.push_str(&lines.join("\n"));
        rendered.push_str(
            "\n\nUse this to personalize answers. Address the user naturally and adapt to \
             their role, without being overly familiar.",
        );
        if let Some(host) = &self.api_host {
            let _ = write!(
                rendered,
                "\n\nAPI HOST RULE: every API example (curl, HTTP request, URL) must use {host}. \
                 Never use placeholder hosts such as example.com."
            );
        }
        Some(rendered)
    }
}

pub(crate) struct PromptInputs<'a> {
    pub tool_count: usize,
    pub search_tool: &'a str,
    pub base: Option<&'a str>,
    pub extra_instructions: Option<&'a str>,
    pub user: Option<&'a UserContext>,
}

pub(crate) fn system_prompt(inputs: PromptInputs<'_>) -> String {
    let mut prompt = match inputs.base {
        Some(base) => base.to_string(),
        None if inputs.tool_count > 0 => tool_prompt(inputs.tool_count, inputs.search_tool),
        None => "You are a helpful technical assistant.".to_string(),
    };

    if let Some(context) = inputs.user.and_then(UserContext::render) {
        prompt.push_str("\n\n");
        prompt.push_str(&context);
    }
    if let Some(extra) = inputs.extra_instructions.filter(|extra| !extra.trim().is_empty()) {
        let _ = write!(prompt, "\n\nAdditional instructions: {extra}");
    }
    prompt
}

fn tool_prompt(tool_count: usize, search_tool: &str) -> String {
    format!(
        "You are a technical assistant that answers questions about an API from its \
documentation. You have {tool_count} tool(s) available.

SEARCH STRATEGY:
- Use the {search_tool} tool before answering any question about endpoints, parameters or workflows.
- If a search returns nothing useful, search again with different terms: synonyms, singular or \
plural forms, and API words such as endpoint, list, get or create.
- Prefer several focused searches over one broad one.

ANSWER RULES:
- Base every endpoint, parameter and example on retrieved documentation.
- Never invent endpoints, fields or hosts. If the documentation does not cover something, say so.
- Include the HTTP method and path for every endpoint you mention."
    )
}

pub(crate) fn title_prompt(first_user_message: &str) -> String {
    format!(
        "Write a short title (at most six words) for a conversation that starts with the \
         message below. Reply with the title only, without quotes.\n\nMessage: {first_user_message}"
    )
}
