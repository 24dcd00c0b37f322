//! Application services
//!
//! Each service owns one area of the engine and talks to persistence only
//! through [`Storage`](crate::domain::repository::Storage).

use synapse_monitoring::EngineMetrics;
use tracing::debug;

use crate::{CoreResult, StorageError};

/// Agent modes and instances
pub mod agent_registry;

/// Knowledge graph operations
pub mod graph_store;

/// Rule administration and evaluation
pub mod rule_engine;

/// Session lifecycle and message log
pub mod session_manager;

/// Prompt rendering, model invocation and accounting
pub mod prompt_tracker;

/// Learning event validation and incorporation
pub mod learning_pipeline;

/// Service wiring and query surface
pub mod runtime;

/// Bounded retry budget for optimistic-concurrency conflicts
pub(crate) struct ConflictRetry {
    operation: &'static str,
    max_attempts: u32,
    attempts: u32,
}

impl ConflictRetry {
    pub(crate) fn new(operation: &'static str, max_attempts: u32) -> Self {
        Self {
            operation,
            max_attempts,
            attempts: 0,
        }
    }

    /// Swallow a conflict and yield before the caller re-reads; anything
    /// else, or an exhausted budget, becomes a `CoreError`
    pub(crate) async fn absorb(&mut self, err: StorageError) -> CoreResult<()> {
        if !err.is_conflict() || self.attempts >= self.max_attempts {
            return Err(err.into());
        }
        self.attempts += 1;
        debug!(operation = self.operation, attempt = self.attempts, error = %err, "Retrying after storage conflict");
        EngineMetrics::record_conflict_retry(self.operation, self.attempts);
        tokio::task::yield_now().await;
        Ok(())
    }

    /// Number of commits attempted so far, counting the one in flight
    pub(crate) fn attempts(&self) -> u32 {
        self.attempts + 1
    }
}
