//! Agent modes (role templates) and the instances configured from them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::identifiers::{InstanceId, ModeId, TemplateId};
use crate::CoreError;

/// Role template shared by many instances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMode {
    /// Unique identifier
    pub id: ModeId,
    /// Display name, e.g. "support-triage"
    pub name: String,
    /// Optional description
    #[serde(default)]
    pub description: Option<String>,
    /// Capability labels, e.g. "web_search", "code_review"
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Default instance configuration
    #[serde(default)]
    pub default_config: Value,
    /// Prompt template used when the instance has no override
    #[serde(default)]
    pub prompt_template: Option<TemplateId>,
    /// Optimistic concurrency version
    #[serde(default)]
    pub version: u64,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl AgentMode {
    /// Create a new mode with the given name
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ModeId::new_v4(),
            name: name.into(),
            description: None,
            capabilities: Vec::new(),
            default_config: Value::Object(Default::default()),
            prompt_template: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Add a capability label
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    /// Set the prompt template reference
    pub fn with_prompt_template(mut self, template: TemplateId) -> Self {
        self.prompt_template = Some(template);
        self
    }
}

/// Lifecycle status of an agent instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Configured but not accepting sessions
    Inactive,
    /// Ready for work
    Active,
    /// Working on a request
    Busy,
    /// Faulted, needs attention
    Error,
    /// Temporarily suspended
    Paused,
}

impl InstanceStatus {
    /// Whether sessions may be opened against an instance in this status
    pub fn accepts_sessions(self) -> bool {
        matches!(self, InstanceStatus::Active | InstanceStatus::Busy)
    }

    /// Whether the lifecycle allows moving from `self` to `next`
    pub fn can_transition_to(self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        matches!(
            (self, next),
            (Inactive, Active)
                | (Active, Busy)
                | (Active, Paused)
                | (Active, Error)
                | (Active, Inactive)
                | (Busy, Active)
                | (Busy, Error)
                | (Busy, Paused)
                | (Paused, Active)
                | (Paused, Inactive)
                | (Error, Active)
                | (Error, Inactive)
        )
    }
}

/// Model parameters used when the instance invokes a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    /// Provider-specific model name
    pub model: String,
    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Completion token limit
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Price per 1000 prompt tokens
    #[serde(default)]
    pub prompt_cost_per_1k: f64,
    /// Price per 1000 completion tokens
    #[serde(default)]
    pub completion_cost_per_1k: f64,
}

fn default_temperature() -> f32 {
    0.7
}

impl ModelParameters {
    /// Parameters for a named model with no pricing
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: default_temperature(),
            max_tokens: None,
            prompt_cost_per_1k: 0.0,
            completion_cost_per_1k: 0.0,
        }
    }

    /// Set per-1k token prices
    pub fn with_pricing(mut self, prompt_per_1k: f64, completion_per_1k: f64) -> Self {
        self.prompt_cost_per_1k = prompt_per_1k;
        self.completion_cost_per_1k = completion_per_1k;
        self
    }

    /// Cost of a call with the given token counts
    pub fn cost_for(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        (prompt_tokens as f64 / 1000.0) * self.prompt_cost_per_1k
            + (completion_tokens as f64 / 1000.0) * self.completion_cost_per_1k
    }
}

/// Aggregated execution metrics of an instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub executions: u64,
    pub successes: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub mean_latency_ms: f64,
}

impl PerformanceMetrics {
    /// Fold one finished execution into the aggregate
    pub fn record(&mut self, outcome: ExecutionOutcome, tokens: u64, cost: f64, latency_ms: u64) {
        self.executions += 1;
        match outcome {
            ExecutionOutcome::Success => self.successes += 1,
            ExecutionOutcome::Error => self.errors += 1,
            ExecutionOutcome::Timeout => self.timeouts += 1,
        }
        self.total_tokens = self.total_tokens.saturating_add(tokens);
        self.total_cost += cost;
        // running mean over all executions
        let n = self.executions as f64;
        self.mean_latency_ms += (latency_ms as f64 - self.mean_latency_ms) / n;
    }

    /// Fraction of executions that succeeded
    pub fn success_rate(&self) -> f64 {
        if self.executions == 0 {
            0.0
        } else {
            self.successes as f64 / self.executions as f64
        }
    }
}

/// Terminal outcome of an execution, as seen by instance metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Success,
    Error,
    Timeout,
}

/// A configured agent bound to exactly one mode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInstance {
    /// Unique identifier
    pub id: InstanceId,
    /// Owning mode
    pub mode_id: ModeId,
    /// Display name
    pub name: String,
    /// Current lifecycle status
    pub status: InstanceStatus,
    /// Model parameters
    pub model: ModelParameters,
    /// Enabled tool ids
    #[serde(default)]
    pub tool_ids: Vec<String>,
    /// Enabled service ids
    #[serde(default)]
    pub service_ids: Vec<String>,
    /// Instance-level configuration, layered over the mode default
    #[serde(default)]
    pub config: Value,
    /// Execution metrics
    #[serde(default)]
    pub metrics: PerformanceMetrics,
    /// Optimistic concurrency version
    #[serde(default)]
    pub version: u64,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl AgentInstance {
    /// Create a new, inactive instance of a mode
    pub fn new(mode_id: ModeId, name: impl Into<String>, model: ModelParameters) -> Self {
        let now = Utc::now();
        Self {
            id: InstanceId::new_v4(),
            mode_id,
            name: name.into(),
            status: InstanceStatus::Inactive,
            model,
            tool_ids: Vec::new(),
            service_ids: Vec::new(),
            config: Value::Object(Default::default()),
            metrics: PerformanceMetrics::default(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to a new lifecycle status
    pub fn transition(&mut self, next: InstanceStatus) -> Result<(), CoreError> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidTransition(format!(
                "instance {} cannot move from {:?} to {:?}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    /// Update the timestamp
    #[inline]
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
