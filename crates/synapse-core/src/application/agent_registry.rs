use std::sync::Arc;
use tracing::{info, instrument};

use super::ConflictRetry;
use crate::config::EngineConfig;
use crate::domain::agent::{AgentInstance, AgentMode, ExecutionOutcome, InstanceStatus, ModelParameters};
use crate::domain::identifiers::{InstanceId, ModeId};
use crate::domain::repository::{Storage, Write, WriteBatch};
use crate::{CoreError, CoreResult};

/// Administration of agent modes and instances
pub struct AgentRegistry {
    storage: Arc<dyn Storage>,
    config: Arc<EngineConfig>,
}

impl AgentRegistry {
    /// Create a new agent registry
    pub fn new(storage: Arc<dyn Storage>, config: Arc<EngineConfig>) -> Self {
        Self { storage, config }
    }

    /// Store a new mode
    #[instrument(skip(self, mode), fields(mode_id = %mode.id, name = %mode.name))]
    pub async fn create_mode(&self, mode: AgentMode) -> CoreResult<ModeId> {
        if mode.name.trim().is_empty() {
            return Err(CoreError::ValidationError("mode name must not be empty".into()));
        }
        if mode.version != 0 {
            return Err(CoreError::ValidationError(format!("mode {} is already stored", mode.id)));
        }
        let mode_id = mode.id;
        self.storage.commit(WriteBatch::single(Write::Mode(mode))).await?;
        info!("Agent mode created");
        Ok(mode_id)
    }

    /// Apply an administrative edit to a mode
    pub async fn update_mode<F>(&self, mode_id: ModeId, edit: F) -> CoreResult<AgentMode>
    where
        F: Fn(&mut AgentMode),
    {
        let mut retry = ConflictRetry::new("update_mode", self.config.max_conflict_retries);
        loop {
            let mut mode = self.require_mode(&mode_id).await?;
            edit(&mut mode);
            mode.id = mode_id;
            mode.updated_at = chrono::Utc::now();
            match self.storage.commit(WriteBatch::single(Write::Mode(mode.clone()))).await {
                Ok(_) => {
                    mode.version += 1;
                    info!(mode_id = %mode_id, "Agent mode updated");
                    return Ok(mode);
                }
                Err(err) => retry.absorb(err).await?,
            }
        }
    }

    /// Create an inactive instance of an existing mode
    #[instrument(skip(self, model))]
    pub async fn create_instance(&self, mode_id: ModeId, name: &str, model: ModelParameters) -> CoreResult<InstanceId> {
        let mode = self.require_mode(&mode_id).await?;
        if name.trim().is_empty() {
            return Err(CoreError::ValidationError("instance name must not be empty".into()));
        }
        let mut instance = AgentInstance::new(mode_id, name, model);
        instance.config = mode.default_config.clone();
        let instance_id = instance.id;
        self.storage.commit(WriteBatch::single(Write::Instance(instance))).await?;
        info!(instance_id = %instance_id, "Agent instance created");
        Ok(instance_id)
    }

    /// Move an instance through its lifecycle
    #[instrument(skip(self))]
    pub async fn set_instance_status(&self, instance_id: InstanceId, status: InstanceStatus) -> CoreResult<AgentInstance> {
        let instance = self
            .update_instance(instance_id, "set_instance_status", |instance| instance.transition(status))
            .await?;
        info!(status = ?instance.status, "Instance status changed");
        Ok(instance)
    }

    /// Replace the enabled tool and service ids
    pub async fn set_instance_tools(
        &self,
        instance_id: InstanceId,
        tool_ids: Vec<String>,
        service_ids: Vec<String>,
    ) -> CoreResult<AgentInstance> {
        self.update_instance(instance_id, "set_instance_tools", |instance| {
            instance.tool_ids = tool_ids.clone();
            instance.service_ids = service_ids.clone();
            instance.touch();
            Ok(())
        })
        .await
    }

    /// Fold one finished execution into the instance metrics
    pub async fn record_execution_metrics(
        &self,
        instance_id: InstanceId,
        outcome: ExecutionOutcome,
        tokens: u64,
        cost: f64,
        latency_ms: u64,
    ) -> CoreResult<AgentInstance> {
        self.update_instance(instance_id, "record_execution_metrics", |instance| {
            instance.metrics.record(outcome, tokens, cost, latency_ms);
            instance.touch();
            Ok(())
        })
        .await
    }

    pub async fn get_mode(&self, mode_id: ModeId) -> CoreResult<Option<AgentMode>> {
        Ok(self.storage.get_mode(&mode_id).await?)
    }

    pub async fn list_modes(&self) -> CoreResult<Vec<AgentMode>> {
        Ok(self.storage.list_modes().await?)
    }

    pub async fn get_instance(&self, instance_id: InstanceId) -> CoreResult<Option<AgentInstance>> {
        Ok(self.storage.get_instance(&instance_id).await?)
    }

    pub async fn list_instances(&self, mode_id: Option<ModeId>) -> CoreResult<Vec<AgentInstance>> {
        Ok(self.storage.list_instances(mode_id.as_ref()).await?)
    }

    async fn require_mode(&self, mode_id: &ModeId) -> CoreResult<AgentMode> {
        self.storage
            .get_mode(mode_id)
            .await?
            .ok_or_else(|| CoreError::not_found("AgentMode", mode_id))
    }

    async fn update_instance<F>(&self, instance_id: InstanceId, operation: &'static str, mutate: F) -> CoreResult<AgentInstance>
    where
        F: Fn(&mut AgentInstance) -> CoreResult<()>,
    {
        let mut retry = ConflictRetry::new(operation, self.config.max_conflict_retries);
        loop {
            let mut instance = self
                .storage
                .get_instance(&instance_id)
                .await?
                .ok_or_else(|| CoreError::not_found("AgentInstance", instance_id))?;
            mutate(&mut instance)?;
            match self.storage.commit(WriteBatch::single(Write::Instance(instance.clone()))).await {
                Ok(_) => {
                    instance.version += 1;
                    return Ok(instance);
                }
                Err(err) => retry.absorb(err).await?,
            }
        }
    }
}
