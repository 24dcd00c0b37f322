//! Engine metrics emitted as tracing events.

use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

static ENABLED: AtomicBool = AtomicBool::new(true);

/// Turn metric events on or off process-wide
pub fn set_enabled(enabled: bool) {
    ENABLED.store(enabled, Ordering::Relaxed);
}

/// Whether metric events are emitted
pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

/// Synapse engine metrics
pub struct EngineMetrics;

impl EngineMetrics {
    /// Record a node upsert
    pub fn record_node_upsert(scope: &str, created: bool) {
        if is_enabled() {
            info!(target: "synapse::metrics", scope, created, "Node upsert");
        }
    }

    /// Record an edge reinforcement and the resulting strength
    pub fn record_edge_reinforcement(scope: &str, strength: f64, created: bool) {
        if is_enabled() {
            info!(target: "synapse::metrics", scope, strength, created, "Edge reinforcement");
        }
    }

    /// Record a rule evaluation
    pub fn record_rule_evaluation(scope: &str, candidates: usize, matched: usize, unmet_mandatory: usize) {
        if is_enabled() {
            info!(
                target: "synapse::metrics",
                scope, candidates, matched, unmet_mandatory,
                "Rule evaluation"
            );
        }
    }

    /// Record a session lifecycle change
    pub fn record_session_transition(session_id: &str, status: &str) {
        if is_enabled() {
            info!(target: "synapse::metrics", session_id, status, "Session transition");
        }
    }

    /// Record a message append
    pub fn record_message_appended(session_id: &str, sequence: u64, attempts: u32) {
        if is_enabled() {
            info!(target: "synapse::metrics", session_id, sequence, attempts, "Message appended");
        }
    }

    /// Record a finished prompt execution
    pub fn record_prompt_execution(instance_id: &str, status: &str, duration_ms: u64, tokens: u64, cost: f64) {
        if is_enabled() {
            info!(
                target: "synapse::metrics",
                instance_id, status, duration_ms, tokens, cost,
                "Prompt execution"
            );
        }
    }

    /// Record a response that arrived after its execution timed out
    pub fn record_late_response(execution_id: &str, delay_ms: u64) {
        if is_enabled() {
            info!(target: "synapse::metrics", execution_id, delay_ms, "Late model response");
        }
    }

    /// Record a learning event status change
    pub fn record_learning_transition(event_type: &str, status: &str, confidence: f64) {
        if is_enabled() {
            info!(target: "synapse::metrics", event_type, status, confidence, "Learning transition");
        }
    }

    /// Record an optimistic concurrency retry
    pub fn record_conflict_retry(operation: &str, attempt: u32) {
        if is_enabled() {
            info!(target: "synapse::metrics", operation, attempt, "Conflict retry");
        }
    }
}
