//! Prompt rendering, model invocation and execution accounting.
//!
//! The model call runs in its own task under a deadline. A call that misses
//! the deadline is not cancelled right away: a detached task keeps waiting for
//! up to `late_response_grace` and, if an answer arrives, stores it on the
//! execution record only. Sessions and instances never see late responses.

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use synapse_monitoring::EngineMetrics;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::agent_registry::AgentRegistry;
use super::session_manager::SessionManager;
use super::ConflictRetry;
use crate::config::EngineConfig;
use crate::domain::agent::{ExecutionOutcome, ModelParameters};
use crate::domain::identifiers::{ExecutionId, InstanceId, SessionId, TemplateId};
use crate::domain::prompt::{
    ExecutionStatus, LateResponse, ModelConfig, ModelError, ModelProvider, ModelResponse, PromptExecution,
    PromptTemplate,
};
use crate::domain::repository::{Storage, Write, WriteBatch};
use crate::{CoreError, CoreResult};

type ModelCall = JoinHandle<Result<ModelResponse, ModelError>>;

/// Input to [`PromptTracker::execute`]
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub template_id: TemplateId,
    pub instance_id: InstanceId,
    pub session_id: Option<SessionId>,
    pub variables: HashMap<String, Value>,
    /// Falls back to the configured default
    pub timeout: Option<Duration>,
}

impl ExecutionRequest {
    pub fn new(template_id: TemplateId, instance_id: InstanceId) -> Self {
        Self {
            template_id,
            instance_id,
            session_id: None,
            variables: HashMap::new(),
            timeout: None,
        }
    }

    pub fn in_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Renders templates, calls the model and records every execution
pub struct PromptTracker {
    storage: Arc<dyn Storage>,
    provider: Arc<dyn ModelProvider>,
    registry: Arc<AgentRegistry>,
    sessions: Arc<SessionManager>,
    config: Arc<EngineConfig>,
    templates: DashMap<TemplateId, Arc<PromptTemplate>>,
}

impl PromptTracker {
    /// Create a new prompt tracker
    pub fn new(
        storage: Arc<dyn Storage>,
        provider: Arc<dyn ModelProvider>,
        registry: Arc<AgentRegistry>,
        sessions: Arc<SessionManager>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            storage,
            provider,
            registry,
            sessions,
            config,
            templates: DashMap::new(),
        }
    }

    /// Store a template
    #[instrument(skip(self, template), fields(template_id = %template.id, name = %template.name))]
    pub async fn register_template(&self, template: PromptTemplate) -> CoreResult<TemplateId> {
        if template.name.trim().is_empty() {
            return Err(CoreError::ValidationError("template name must not be empty".into()));
        }
        if template.body.trim().is_empty() {
            return Err(CoreError::ValidationError("template body must not be empty".into()));
        }
        let template_id = template.id;
        self.storage
            .commit(WriteBatch::single(Write::Template(template.clone())))
            .await?;
        self.templates.insert(template_id, Arc::new(template));
        info!("Prompt template registered");
        Ok(template_id)
    }

    pub async fn get_template(&self, template_id: TemplateId) -> CoreResult<Option<PromptTemplate>> {
        Ok(self.load_template(template_id).await?.map(|t| (*t).clone()))
    }

    /// Render, invoke and record one execution.
    ///
    /// Returns the finalized record; model failures and timeouts are reported
    /// through its status (see [`PromptExecution::response_text`]). Nothing is
    /// recorded when a variable is missing.
    #[instrument(skip(self, request), fields(template_id = %request.template_id, instance_id = %request.instance_id))]
    pub async fn execute(&self, request: ExecutionRequest) -> CoreResult<PromptExecution> {
        let template = self
            .load_template(request.template_id)
            .await?
            .ok_or_else(|| CoreError::not_found("PromptTemplate", request.template_id))?;
        let rendered = template.render(&request.variables)?;

        let instance = self
            .registry
            .get_instance(request.instance_id)
            .await?
            .ok_or_else(|| CoreError::not_found("AgentInstance", request.instance_id))?;
        if let Some(session_id) = request.session_id {
            let session = self
                .sessions
                .get_session(session_id)
                .await?
                .ok_or_else(|| CoreError::not_found("Session", session_id))?;
            if session.instance_id != instance.id {
                return Err(CoreError::ValidationError(format!(
                    "session {} belongs to instance {}",
                    session_id, session.instance_id
                )));
            }
        }

        let timeout = request.timeout.unwrap_or_else(|| self.config.default_prompt_timeout());
        let execution = PromptExecution::pending(
            template.id,
            instance.id,
            request.session_id,
            rendered.clone(),
            timeout,
        );
        let execution_id = execution.id;
        self.storage.commit(WriteBatch::single(Write::Execution(execution))).await?;
        debug!(execution_id = %execution_id, "Execution pending");

        let model_config = ModelConfig {
            model: instance.model.model.clone(),
            temperature: instance.model.temperature,
            max_tokens: instance.model.max_tokens,
        };
        let provider = Arc::clone(&self.provider);
        let started = Instant::now();
        let mut call: ModelCall =
            tokio::spawn(async move { provider.invoke_model(&rendered, &model_config).await });

        let (execution, outcome) = match tokio::time::timeout(timeout, &mut call).await {
            Ok(joined) => {
                let elapsed = started.elapsed();
                let result = joined.unwrap_or_else(|join_err| {
                    Err(ModelError::Failed(format!("model task failed: {}", join_err)))
                });
                self.finish_in_time(execution_id, result, elapsed, &instance.model).await?
            }
            Err(_) => {
                let elapsed = started.elapsed();
                let execution = self
                    .update_execution(execution_id, "finalize_execution", |e| e.time_out(elapsed))
                    .await?;
                warn!(execution_id = %execution_id, timeout_ms = execution.timeout_ms, "Model call timed out");
                tokio::spawn(capture_late_response(
                    Arc::clone(&self.storage),
                    execution_id,
                    call,
                    self.config.late_response_grace(),
                    self.config.max_conflict_retries,
                ));
                (execution, ExecutionOutcome::Timeout)
            }
        };

        self.account(&execution, outcome).await?;
        Ok(execution)
    }

    pub async fn get_execution(&self, execution_id: ExecutionId) -> CoreResult<Option<PromptExecution>> {
        Ok(self.storage.get_execution(&execution_id).await?)
    }

    /// Executions recorded against a session, oldest first
    pub async fn list_executions(&self, session_id: SessionId) -> CoreResult<Vec<PromptExecution>> {
        Ok(self.storage.list_executions(&session_id).await?)
    }

    async fn finish_in_time(
        &self,
        execution_id: ExecutionId,
        result: Result<ModelResponse, ModelError>,
        elapsed: Duration,
        pricing: &ModelParameters,
    ) -> CoreResult<(PromptExecution, ExecutionOutcome)> {
        match result {
            Ok(response) => {
                let cost = pricing.cost_for(response.usage.prompt_tokens, response.usage.completion_tokens);
                let execution = self
                    .update_execution(execution_id, "finalize_execution", |e| {
                        e.succeed(response.text.clone(), response.usage, cost, elapsed)
                    })
                    .await?;
                Ok((execution, ExecutionOutcome::Success))
            }
            // provider-side deadline; still a timeout, not an error
            Err(ModelError::Timeout) => {
                let execution = self
                    .update_execution(execution_id, "finalize_execution", |e| e.time_out(elapsed))
                    .await?;
                Ok((execution, ExecutionOutcome::Timeout))
            }
            Err(err) => {
                warn!(execution_id = %execution_id, error = %err, "Model call failed");
                let execution = self
                    .update_execution(execution_id, "finalize_execution", |e| e.fail(err.to_string(), elapsed))
                    .await?;
                Ok((execution, ExecutionOutcome::Error))
            }
        }
    }

    /// Session usage on success only; instance metrics for every outcome
    async fn account(&self, execution: &PromptExecution, outcome: ExecutionOutcome) -> CoreResult<()> {
        let duration_ms = execution.duration_ms.unwrap_or_default();
        if execution.status == ExecutionStatus::Success {
            if let Some(session_id) = execution.session_id {
                self.sessions
                    .record_usage(session_id, execution.usage, execution.cost)
                    .await?;
            }
        }
        self.registry
            .record_execution_metrics(
                execution.instance_id,
                outcome,
                execution.usage.total(),
                execution.cost,
                duration_ms,
            )
            .await?;

        EngineMetrics::record_prompt_execution(
            &execution.instance_id.to_string(),
            status_label(execution.status),
            duration_ms,
            execution.usage.total(),
            execution.cost,
        );
        Ok(())
    }

    async fn load_template(&self, template_id: TemplateId) -> CoreResult<Option<Arc<PromptTemplate>>> {
        if let Some(cached) = self.templates.get(&template_id) {
            return Ok(Some(Arc::clone(cached.value())));
        }
        match self.storage.get_template(&template_id).await? {
            Some(template) => {
                let template = Arc::new(template);
                self.templates.insert(template_id, Arc::clone(&template));
                Ok(Some(template))
            }
            None => Ok(None),
        }
    }

    async fn update_execution<F>(&self, execution_id: ExecutionId, operation: &'static str, mutate: F) -> CoreResult<PromptExecution>
    where
        F: Fn(&mut PromptExecution),
    {
        let mut retry = ConflictRetry::new(operation, self.config.max_conflict_retries);
        loop {
            let mut execution = self
                .storage
                .get_execution(&execution_id)
                .await?
                .ok_or_else(|| CoreError::not_found("PromptExecution", execution_id))?;
            mutate(&mut execution);
            match self
                .storage
                .commit(WriteBatch::single(Write::Execution(execution.clone())))
                .await
            {
                Ok(_) => {
                    execution.version += 1;
                    return Ok(execution);
                }
                Err(err) => retry.absorb(err).await?,
            }
        }
    }
}

fn status_label(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Pending => "pending",
        ExecutionStatus::Success => "success",
        ExecutionStatus::Error => "error",
        ExecutionStatus::Timeout => "timeout",
    }
}

/// Wait out the grace period for a timed-out call and store whatever arrives
/// on the execution record
async fn capture_late_response(
    storage: Arc<dyn Storage>,
    execution_id: ExecutionId,
    mut call: ModelCall,
    grace: Duration,
    max_retries: u32,
) {
    let waiting_since = Instant::now();
    let result = match tokio::time::timeout(grace, &mut call).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => {
            warn!(execution_id = %execution_id, error = %join_err, "Late model task failed");
            return;
        }
        Err(_) => {
            call.abort();
            debug!(execution_id = %execution_id, "No late response within grace period");
            return;
        }
    };

    let late = match result {
        Ok(response) => LateResponse {
            received_at: Utc::now(),
            text: Some(response.text),
            error: None,
            usage: response.usage,
        },
        Err(err) => LateResponse {
            received_at: Utc::now(),
            text: None,
            error: Some(err.to_string()),
            usage: Default::default(),
        },
    };

    let mut retry = ConflictRetry::new("record_late_response", max_retries);
    loop {
        let mut execution = match storage.get_execution(&execution_id).await {
            Ok(Some(execution)) => execution,
            Ok(None) => {
                warn!(execution_id = %execution_id, "Execution vanished before late response");
                return;
            }
            Err(err) => {
                warn!(execution_id = %execution_id, error = %err, "Could not load execution for late response");
                return;
            }
        };
        if execution.late_response.is_some() {
            return;
        }
        execution.late_response = Some(late.clone());
        match storage.commit(WriteBatch::single(Write::Execution(execution))).await {
            Ok(_) => {
                let delay_ms = waiting_since.elapsed().as_millis() as u64;
                info!(execution_id = %execution_id, delay_ms, "Late response recorded");
                EngineMetrics::record_late_response(&execution_id.to_string(), delay_ms);
                return;
            }
            Err(err) => {
                if let Err(err) = retry.absorb(err).await {
                    warn!(execution_id = %execution_id, error = %err, "Failed to record late response");
                    return;
                }
            }
        }
    }
}
