//! Conversation sessions and their append-only message log

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::identifiers::{InstanceId, MessageId, SessionId};
use super::knowledge::GraphChanges;
use crate::CoreError;

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Session is accepting messages
    Active,
    /// Session is suspended but still accepts messages
    Paused,
    /// Session has finished normally
    Completed,
    /// Session has been archived
    Archived,
}

impl SessionStatus {
    /// Whether messages may still be appended
    pub fn is_open(self) -> bool {
        matches!(self, SessionStatus::Active | SessionStatus::Paused)
    }
}

/// How a session is closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    Completed,
    Archived,
}

impl From<SessionOutcome> for SessionStatus {
    fn from(outcome: SessionOutcome) -> Self {
        match outcome {
            SessionOutcome::Completed => SessionStatus::Completed,
            SessionOutcome::Archived => SessionStatus::Archived,
        }
    }
}

/// Token totals accumulated over a session's executions
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    /// Provider-reported counts are untrusted; totals saturate
    pub fn total(&self) -> u64 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(other.completion_tokens);
    }
}

/// Aggregate: a bounded conversation owned by one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub instance_id: InstanceId,
    pub status: SessionStatus,
    /// Caller-maintained context, visible to rule conditions as `session.context`
    #[serde(default)]
    pub context: Map<String, Value>,
    /// Number of messages appended so far; also the last assigned sequence
    pub message_count: u64,
    #[serde(default)]
    pub token_usage: TokenUsage,
    #[serde(default)]
    pub total_cost: f64,
    /// Storage revision observed when the session opened
    pub graph_revision_at_open: u64,
    /// Graph diff captured when the session closed
    #[serde(default)]
    pub knowledge_updates: Option<GraphChanges>,
    #[serde(default)]
    pub version: u64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Create a new active session
    pub fn new(instance_id: InstanceId, context: Map<String, Value>, graph_revision: u64) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new_v4(),
            instance_id,
            status: SessionStatus::Active,
            context,
            message_count: 0,
            token_usage: TokenUsage::default(),
            total_cost: 0.0,
            graph_revision_at_open: graph_revision,
            knowledge_updates: None,
            version: 0,
            started_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Fail with `SessionClosed` unless the session still accepts messages
    pub fn ensure_open(&self) -> Result<(), CoreError> {
        if self.status.is_open() {
            Ok(())
        } else {
            Err(CoreError::SessionClosed(format!(
                "session {} is {:?}",
                self.id, self.status
            )))
        }
    }

    /// Suspend an active session
    pub fn pause(&mut self) -> Result<(), CoreError> {
        match self.status {
            SessionStatus::Active => {
                self.status = SessionStatus::Paused;
                self.touch();
                Ok(())
            }
            SessionStatus::Paused => Ok(()),
            other => Err(CoreError::InvalidTransition(format!(
                "cannot pause session {} in state {:?}",
                self.id, other
            ))),
        }
    }

    /// Resume a paused session
    pub fn resume(&mut self) -> Result<(), CoreError> {
        match self.status {
            SessionStatus::Paused => {
                self.status = SessionStatus::Active;
                self.touch();
                Ok(())
            }
            SessionStatus::Active => Ok(()),
            other => Err(CoreError::InvalidTransition(format!(
                "cannot resume session {} in state {:?}",
                self.id, other
            ))),
        }
    }

    /// Close the session and stamp the knowledge delta
    pub fn close(&mut self, outcome: SessionOutcome, knowledge_updates: GraphChanges) -> Result<(), CoreError> {
        self.ensure_open()?;
        let now = Utc::now();
        self.status = outcome.into();
        self.knowledge_updates = Some(knowledge_updates);
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Update the timestamp
    #[inline]
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

/// A tool invocation requested by the assistant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Result of a tool invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub is_error: bool,
}

/// Opaque attachment reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub media_type: String,
    pub uri: String,
}

/// Message content as supplied by a caller, before sequencing
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MessageDraft {
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub tool_results: Vec<ToolResult>,
}

impl MessageDraft {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn with_tool_call(mut self, call: ToolCall) -> Self {
        self.tool_calls.push(call);
        self
    }

    pub fn with_tool_result(mut self, result: ToolResult) -> Self {
        self.tool_results.push(result);
        self
    }
}

/// Append-only unit of a session; `sequence` starts at 1 and has no gaps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub session_id: SessionId,
    pub sequence: u64,
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub tool_results: Vec<ToolResult>,
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(session_id: SessionId, sequence: u64, role: MessageRole, draft: MessageDraft) -> Self {
        Self {
            id: MessageId::new_v4(),
            session_id,
            sequence,
            role,
            content: draft.content,
            attachments: draft.attachments,
            tool_calls: draft.tool_calls,
            tool_results: draft.tool_results,
            version: 0,
            created_at: Utc::now(),
        }
    }
}
