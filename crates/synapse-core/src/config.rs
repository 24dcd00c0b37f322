//! Engine configuration
//!
//! Defaults come from serde default functions; `from_env` layers `SYNAPSE_*`
//! environment variables on top.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::env;
use std::time::Duration;
use tracing::warn;

use crate::domain::learning::LearningEventType;
use crate::{CoreError, CoreResult};

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Confidence at or above which a learning event validates automatically.
    /// A partial map only overrides the types it names.
    #[serde(
        default = "default_validation_thresholds",
        deserialize_with = "merge_validation_thresholds"
    )]
    pub validation_thresholds: HashMap<LearningEventType, f64>,

    /// Deadline for a model call when the caller gives none
    #[serde(default = "default_prompt_timeout_ms")]
    pub default_prompt_timeout_ms: u64,

    /// How long a timed-out call may still deliver a late response
    #[serde(default = "default_late_response_grace_ms")]
    pub late_response_grace_ms: u64,

    /// Evidence entries kept per edge
    #[serde(default = "default_max_edge_evidence")]
    pub max_edge_evidence: usize,

    /// Confidence given to nodes created without one
    #[serde(default = "default_node_confidence")]
    pub default_node_confidence: f64,

    /// Upper bound on optimistic-concurrency retries per operation
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,
}

fn default_validation_thresholds() -> HashMap<LearningEventType, f64> {
    let mut thresholds = HashMap::new();
    thresholds.insert(LearningEventType::ConceptLearned, 0.6);
    thresholds.insert(LearningEventType::RelationshipLearned, 0.6);
    thresholds.insert(LearningEventType::PatternRecognized, 0.6);
    thresholds.insert(LearningEventType::RuleLearned, 0.8);
    thresholds.insert(LearningEventType::FeedbackIncorporated, 0.6);
    thresholds
}

fn merge_validation_thresholds<'de, D>(deserializer: D) -> Result<HashMap<LearningEventType, f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let overrides = HashMap::<LearningEventType, f64>::deserialize(deserializer)?;
    let mut thresholds = default_validation_thresholds();
    thresholds.extend(overrides);
    Ok(thresholds)
}

fn default_prompt_timeout_ms() -> u64 {
    30_000
}

fn default_late_response_grace_ms() -> u64 {
    60_000
}

fn default_max_edge_evidence() -> usize {
    32
}

fn default_node_confidence() -> f64 {
    0.5
}

fn default_max_conflict_retries() -> u32 {
    1_000
}

const FALLBACK_THRESHOLD: f64 = 0.6;

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            validation_thresholds: default_validation_thresholds(),
            default_prompt_timeout_ms: default_prompt_timeout_ms(),
            late_response_grace_ms: default_late_response_grace_ms(),
            max_edge_evidence: default_max_edge_evidence(),
            default_node_confidence: default_node_confidence(),
            max_conflict_retries: default_max_conflict_retries(),
        }
    }
}

impl EngineConfig {
    /// Load defaults and apply `SYNAPSE_*` environment overrides
    pub fn from_env() -> CoreResult<Self> {
        let mut config = Self::default();

        if let Ok(value) = env::var("SYNAPSE_DEFAULT_PROMPT_TIMEOUT_MS") {
            match value.parse::<u64>() {
                Ok(ms) => config.default_prompt_timeout_ms = ms,
                Err(_) => warn!("Invalid SYNAPSE_DEFAULT_PROMPT_TIMEOUT_MS value: {}", value),
            }
        }

        if let Ok(value) = env::var("SYNAPSE_LATE_RESPONSE_GRACE_MS") {
            match value.parse::<u64>() {
                Ok(ms) => config.late_response_grace_ms = ms,
                Err(_) => warn!("Invalid SYNAPSE_LATE_RESPONSE_GRACE_MS value: {}", value),
            }
        }

        if let Ok(value) = env::var("SYNAPSE_MAX_EDGE_EVIDENCE") {
            match value.parse::<usize>() {
                Ok(n) => config.max_edge_evidence = n,
                Err(_) => warn!("Invalid SYNAPSE_MAX_EDGE_EVIDENCE value: {}", value),
            }
        }

        if let Ok(value) = env::var("SYNAPSE_DEFAULT_NODE_CONFIDENCE") {
            match value.parse::<f64>() {
                Ok(c) => config.default_node_confidence = c,
                Err(_) => warn!("Invalid SYNAPSE_DEFAULT_NODE_CONFIDENCE value: {}", value),
            }
        }

        if let Ok(value) = env::var("SYNAPSE_MAX_CONFLICT_RETRIES") {
            match value.parse::<u32>() {
                Ok(n) => config.max_conflict_retries = n,
                Err(_) => warn!("Invalid SYNAPSE_MAX_CONFLICT_RETRIES value: {}", value),
            }
        }

        // one threshold applied to every event type
        if let Ok(value) = env::var("SYNAPSE_VALIDATION_THRESHOLD") {
            match value.parse::<f64>() {
                Ok(t) => {
                    for threshold in config.validation_thresholds.values_mut() {
                        *threshold = t;
                    }
                }
                Err(_) => warn!("Invalid SYNAPSE_VALIDATION_THRESHOLD value: {}", value),
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document; missing keys take their defaults
    pub fn from_yaml_str(yaml: &str) -> CoreResult<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> CoreResult<()> {
        for (event_type, threshold) in &self.validation_thresholds {
            if !(0.0..=1.0).contains(threshold) {
                return Err(CoreError::ConfigurationError(format!(
                    "validation threshold for {:?} must be within [0, 1], got {}",
                    event_type, threshold
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.default_node_confidence) {
            return Err(CoreError::ConfigurationError(format!(
                "default_node_confidence must be within [0, 1], got {}",
                self.default_node_confidence
            )));
        }
        if self.max_edge_evidence == 0 {
            return Err(CoreError::ConfigurationError(
                "max_edge_evidence must be at least 1".to_string(),
            ));
        }
        if self.default_prompt_timeout_ms == 0 {
            return Err(CoreError::ConfigurationError(
                "default_prompt_timeout_ms must be positive".to_string(),
            ));
        }
        if self.max_conflict_retries == 0 {
            return Err(CoreError::ConfigurationError(
                "max_conflict_retries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Threshold for an event type
    pub fn threshold_for(&self, event_type: LearningEventType) -> f64 {
        self.validation_thresholds
            .get(&event_type)
            .copied()
            .unwrap_or(FALLBACK_THRESHOLD)
    }

    pub fn default_prompt_timeout(&self) -> Duration {
        Duration::from_millis(self.default_prompt_timeout_ms)
    }

    pub fn late_response_grace(&self) -> Duration {
        Duration::from_millis(self.late_response_grace_ms)
    }
}
