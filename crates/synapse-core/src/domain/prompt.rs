//! Prompt templates, execution records and the model provider seam

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use thiserror::Error;

use super::identifiers::{ExecutionId, InstanceId, SessionId, TemplateId};
use super::session::TokenUsage;
use crate::CoreError;

lazy_static! {
    // {{ name }} with optional inner whitespace
    static ref PLACEHOLDER_REGEX: Regex = Regex::new(
        r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}"
    ).unwrap();
}

/// Template with `{{variable}}` placeholders
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub id: TemplateId,
    pub name: String,
    pub body: String,
    /// Variables required in addition to the placeholders found in `body`
    #[serde(default)]
    pub required_variables: Vec<String>,
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PromptTemplate {
    pub fn new(name: impl Into<String>, body: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: TemplateId::new_v4(),
            name: name.into(),
            body: body.into(),
            required_variables: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn requiring(mut self, variable: impl Into<String>) -> Self {
        self.required_variables.push(variable.into());
        self
    }

    /// Explicitly required variables plus every placeholder, sorted
    pub fn variables(&self) -> BTreeSet<String> {
        let mut names: BTreeSet<String> = self.required_variables.iter().cloned().collect();
        for captures in PLACEHOLDER_REGEX.captures_iter(&self.body) {
            names.insert(captures[1].to_string());
        }
        names
    }

    /// Substitute placeholders; strings are inserted verbatim, other values as JSON
    pub fn render(&self, variables: &HashMap<String, Value>) -> Result<String, CoreError> {
        if let Some(missing) = self.variables().into_iter().find(|name| !variables.contains_key(name)) {
            return Err(CoreError::MissingVariable(missing));
        }
        let rendered = PLACEHOLDER_REGEX.replace_all(&self.body, |captures: &regex::Captures<'_>| {
            match variables.get(&captures[1]) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            }
        });
        Ok(rendered.into_owned())
    }
}

/// Execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Success,
    /// Explicit failure reported by the model provider; not safe to blindly retry
    Error,
    /// Deadline passed; safe to retry with backoff
    Timeout,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionStatus::Pending)
    }
}

/// Response that arrived after the execution had already timed out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LateResponse {
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub usage: TokenUsage,
}

/// One render + invoke round trip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptExecution {
    pub id: ExecutionId,
    pub template_id: TemplateId,
    pub instance_id: InstanceId,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    pub rendered_prompt: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub usage: TokenUsage,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    pub timeout_ms: u64,
    #[serde(default)]
    pub late_response: Option<LateResponse>,
    #[serde(default)]
    pub version: u64,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl PromptExecution {
    /// New pending record
    pub fn pending(
        template_id: TemplateId,
        instance_id: InstanceId,
        session_id: Option<SessionId>,
        rendered_prompt: String,
        timeout: Duration,
    ) -> Self {
        Self {
            id: ExecutionId::new_v4(),
            template_id,
            instance_id,
            session_id,
            rendered_prompt,
            status: ExecutionStatus::Pending,
            response: None,
            error: None,
            usage: TokenUsage::default(),
            cost: 0.0,
            duration_ms: None,
            timeout_ms: timeout.as_millis() as u64,
            late_response: None,
            version: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    fn finish(&mut self, status: ExecutionStatus, elapsed: Duration) {
        self.status = status;
        self.duration_ms = Some(elapsed.as_millis() as u64);
        self.finished_at = Some(Utc::now());
    }

    pub fn succeed(&mut self, text: String, usage: TokenUsage, cost: f64, elapsed: Duration) {
        self.response = Some(text);
        self.usage = usage;
        self.cost = cost;
        self.finish(ExecutionStatus::Success, elapsed);
    }

    pub fn fail(&mut self, message: String, elapsed: Duration) {
        self.error = Some(message);
        self.finish(ExecutionStatus::Error, elapsed);
    }

    pub fn time_out(&mut self, elapsed: Duration) {
        self.error = Some(format!("model call exceeded {}ms", self.timeout_ms));
        self.finish(ExecutionStatus::Timeout, elapsed);
    }

    /// The response text, or the failure as a `CoreError`
    pub fn response_text(&self) -> Result<&str, CoreError> {
        let detail = || self.error.clone().unwrap_or_else(|| format!("execution {}", self.id));
        match self.status {
            ExecutionStatus::Success => Ok(self.response.as_deref().unwrap_or_default()),
            ExecutionStatus::Timeout => Err(CoreError::ExternalTimeout(detail())),
            ExecutionStatus::Error => Err(CoreError::ExternalError(detail())),
            ExecutionStatus::Pending => Err(CoreError::InvalidTransition(format!(
                "execution {} has not finished",
                self.id
            ))),
        }
    }
}

/// Configuration passed to the model provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model: String,
    pub temperature: f32,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

/// Successful model reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub text: String,
    pub usage: TokenUsage,
    /// Provider-measured latency, if reported
    #[serde(default)]
    pub latency_ms: Option<u64>,
}

/// Failure reported by the model provider
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("model call failed: {0}")]
    Failed(String),
    #[error("model call timed out")]
    Timeout,
}

/// External model collaborator; wire protocol is up to the implementation
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Invoke the model with a rendered prompt
    async fn invoke_model(&self, prompt: &str, config: &ModelConfig) -> Result<ModelResponse, ModelError>;
}
