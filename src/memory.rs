//! Per-session conversation history with JSON persistence.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::MemoryError;
use crate::llm::{Message, Role};

/// Rough token cost of one message when sizing context.
const TOKENS_PER_MESSAGE: usize = 200;
const MIN_CONTEXT_MESSAGES: usize = 5;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationMemory {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    #[serde(default)]
    pub compressed_messages: usize,
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,
}

fn default_max_messages() -> usize {
    100
}

fn default_keep_recent() -> usize {
    30
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub message_count: usize,
    /// First user message, shortened.
    pub preview: String,
}

impl Default for ConversationMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationMemory {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4().to_string(),
            started_at: now,
            last_access: now,
            messages: Vec::new(),
            summary: String::new(),
            compressed_messages: 0,
            max_messages: default_max_messages(),
            keep_recent: default_keep_recent(),
        }
    }

    pub fn with_limits(mut self, max_messages: usize, keep_recent: usize) -> Self {
        self.max_messages = max_messages.max(1);
        self.keep_recent = keep_recent.clamp(1, self.max_messages);
        self
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn add_message(&mut self, message: Message) {
        self.messages.push(message);
        self.last_access = Utc::now();
        self.compress_if_needed();
    }

    pub fn recent_messages(&self, count: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(count);
        &self.messages[start..]
    }

    pub fn first_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .find(|message| message.role == Role::User)
            .map(|message| message.content.as_str())
    }

    /// Messages to send ahead of a query, sized by an approximate token
    /// budget: the most recent third plus older messages sharing a keyword
    /// with `query`, in conversation order. A summary of compressed history
    /// is prepended as a system message.
    pub fn get_context_for_query(&self, query: &str, token_budget: usize) -> Vec<Message> {
        let max_count = (token_budget / TOKENS_PER_MESSAGE).max(MIN_CONTEXT_MESSAGES);
        let total = self.messages.len();

        let mut selected: BTreeSet<usize> = (total.saturating_sub((max_count / 3).max(1))..total).collect();

        let words: Vec<String> = query
            .split_whitespace()
            .map(str::to_lowercase)
            .filter(|word| word.chars().count() > 2)
            .collect();
        let keyword_cap = max_count / 2;
        let mut keyword_hits = 0;
        for index in (0..total).rev() {
            if keyword_hits >= keyword_cap || selected.len() >= max_count {
                break;
            }
            if selected.contains(&index) {
                continue;
            }
            let content = self.messages[index].content.to_lowercase();
            if words.iter().any(|word| content.contains(word.as_str())) {
                selected.insert(index);
                keyword_hits += 1;
            }
        }

        let mut context = Vec::with_capacity(selected.len() + 1);
        if !self.summary.is_empty() {
            context.push(Message::system(format!("Previous context: {}", self.summary)));
        }
        context.extend(selected.into_iter().map(|index| self.messages[index].clone()));
        context
    }

    fn compress_if_needed(&mut self) {
        if self.messages.len() <= self.max_messages {
            return;
        }
        let drop = self.messages.len() - self.keep_recent.min(self.messages.len());
        let dropped: Vec<Message> = self.messages.drain(..drop).collect();
        self.compressed_messages += dropped.len();

        let topics: Vec<&str> = dropped
            .iter()
            .filter(|message| message.role == Role::User)
            .map(|message| message.content.lines().next().unwrap_or_default())
            .filter(|line| !line.is_empty())
            .take(5)
            .collect();
        self.summary = if topics.is_empty() {
            format!("{} earlier messages compressed.", self.compressed_messages)
        } else {
            format!(
                "{} earlier messages compressed. Earlier questions: {}",
                self.compressed_messages,
                topics.join(" | ")
            )
        };
        debug!(
            session_id = %self.session_id,
            dropped = dropped.len(),
            kept = self.messages.len(),
            "conversation memory compressed"
        );
    }

    /// Session ids must be UUIDs so the file stays inside `dir`.
    pub fn file_path(dir: &Path, session_id: &str) -> Result<PathBuf, MemoryError> {
        let id = Uuid::parse_str(session_id)
            .map_err(|_| MemoryError::InvalidSessionId(session_id.to_string()))?;
        Ok(dir.join(format!("session_{}.json", id.hyphenated())))
    }

    pub fn save(&self, dir: impl AsRef<Path>) -> Result<PathBuf, MemoryError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = Self::file_path(dir, &self.session_id)?;
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }

    pub fn load(dir: impl AsRef<Path>, session_id: &str) -> Result<Self, MemoryError> {
        let path = Self::file_path(dir.as_ref(), session_id)?;
        let mut memory: Self = serde_json::from_str(&fs::read_to_string(path)?)?;
        memory.last_access = Utc::now();
        Ok(memory)
    }

    /// Sessions saved in `dir`, most recently used first. Unreadable files
    /// are skipped.
    pub fn list_sessions(dir: impl AsRef<Path>) -> Result<Vec<SessionSummary>, MemoryError> {
        let dir = dir.as_ref();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut sessions = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let is_session = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("session_") && name.ends_with(".json"));
            if !is_session {
                continue;
            }

            let memory: Self = match fs::read_to_string(&path)
                .map_err(MemoryError::from)
                .and_then(|raw| serde_json::from_str(&raw).map_err(MemoryError::from))
            {
                Ok(memory) => memory,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable session file");
                    continue;
                }
            };
            sessions.push(SessionSummary {
                preview: memory
                    .first_user_message()
                    .map(|text| text.chars().take(60).collect())
                    .unwrap_or_default(),
                session_id: memory.session_id,
                started_at: memory.started_at,
                last_access: memory.last_access,
                message_count: memory.messages.len(),
            });
        }

        sessions.sort_by(|a, b| b.last_access.cmp(&a.last_access));
        Ok(sessions)
    }
}
