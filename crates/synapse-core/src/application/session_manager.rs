use serde_json::{json, Map, Value};
use std::sync::Arc;
use synapse_monitoring::EngineMetrics;
use tracing::{debug, info, instrument};

use super::ConflictRetry;
use crate::config::EngineConfig;
use crate::domain::agent::{AgentInstance, AgentMode};
use crate::domain::identifiers::{InstanceId, MessageId, SessionId};
use crate::domain::knowledge::OwnerScope;
use crate::domain::repository::{Storage, Write, WriteBatch};
use crate::domain::session::{Message, MessageDraft, MessageRole, Session, SessionOutcome, TokenUsage};
use crate::{CoreError, CoreResult};

/// Session lifecycle and the append-only message log
pub struct SessionManager {
    storage: Arc<dyn Storage>,
    config: Arc<EngineConfig>,
}

impl SessionManager {
    /// Create a new session manager
    pub fn new(storage: Arc<dyn Storage>, config: Arc<EngineConfig>) -> Self {
        Self { storage, config }
    }

    /// Open a session on an active or busy instance.
    ///
    /// The session is committed together with a guard on the instance version
    /// the status check read, so a concurrent status change forces a re-check.
    #[instrument(skip(self, context))]
    pub async fn open_session(&self, instance_id: InstanceId, context: Option<Map<String, Value>>) -> CoreResult<SessionId> {
        let context = context.unwrap_or_default();
        let mut retry = ConflictRetry::new("open_session", self.config.max_conflict_retries);
        loop {
            let instance = self.require_instance(&instance_id).await?;
            if !instance.status.accepts_sessions() {
                return Err(CoreError::InstanceNotActive(format!(
                    "instance {} is {:?}",
                    instance_id, instance.status
                )));
            }
            let revision = self.storage.current_revision().await?;
            let session = Session::new(instance_id, context.clone(), revision);
            let session_id = session.id;
            let batch = WriteBatch::new()
                .with(Write::InstanceGuard {
                    id: instance_id,
                    version: instance.version,
                })
                .with(Write::Session(session));
            match self.storage.commit(batch).await {
                Ok(_) => {
                    info!(session_id = %session_id, graph_revision = revision, "Session opened");
                    EngineMetrics::record_session_transition(&session_id.to_string(), "active");
                    return Ok(session_id);
                }
                Err(err) => retry.absorb(err).await?,
            }
        }
    }

    /// Append a message; its sequence number is assigned here, gap-free
    #[instrument(skip(self, draft))]
    pub async fn append_message(&self, session_id: SessionId, role: MessageRole, draft: MessageDraft) -> CoreResult<MessageId> {
        let mut retry = ConflictRetry::new("append_message", self.config.max_conflict_retries);
        loop {
            let mut session = self.require_session(&session_id).await?;
            session.ensure_open()?;

            let sequence = session.message_count + 1;
            session.message_count = sequence;
            session.touch();
            let message = Message::new(session_id, sequence, role, draft.clone());
            let message_id = message.id;

            let batch = WriteBatch::new()
                .with(Write::Session(session))
                .with(Write::Message(message));
            match self.storage.commit(batch).await {
                Ok(_) => {
                    debug!(message_id = %message_id, sequence, "Message appended");
                    EngineMetrics::record_message_appended(&session_id.to_string(), sequence, retry.attempts());
                    return Ok(message_id);
                }
                Err(err) => retry.absorb(err).await?,
            }
        }
    }

    /// Append a plain-text message
    pub async fn append_text(&self, session_id: SessionId, role: MessageRole, content: &str) -> CoreResult<MessageId> {
        self.append_message(session_id, role, MessageDraft::text(content)).await
    }

    /// Close a session, stamping the instance-scope graph changes made since it opened.
    /// In-flight executions are not awaited.
    #[instrument(skip(self))]
    pub async fn close_session(&self, session_id: SessionId, outcome: SessionOutcome) -> CoreResult<Session> {
        let mut retry = ConflictRetry::new("close_session", self.config.max_conflict_retries);
        loop {
            let mut session = self.require_session(&session_id).await?;
            session.ensure_open()?;
            let changes = self
                .storage
                .changes_since(&OwnerScope::Instance(session.instance_id), session.graph_revision_at_open)
                .await?;
            session.close(outcome, changes)?;

            match self.storage.commit(WriteBatch::single(Write::Session(session.clone()))).await {
                Ok(_) => {
                    session.version += 1;
                    info!(
                        session_id = %session_id,
                        status = ?session.status,
                        messages = session.message_count,
                        "Session closed"
                    );
                    EngineMetrics::record_session_transition(&session_id.to_string(), status_label(&session));
                    return Ok(session);
                }
                Err(err) => retry.absorb(err).await?,
            }
        }
    }

    /// active -> paused
    pub async fn pause_session(&self, session_id: SessionId) -> CoreResult<Session> {
        let session = self.update_session(session_id, "pause_session", |s| s.pause()).await?;
        EngineMetrics::record_session_transition(&session_id.to_string(), "paused");
        Ok(session)
    }

    /// paused -> active
    pub async fn resume_session(&self, session_id: SessionId) -> CoreResult<Session> {
        let session = self.update_session(session_id, "resume_session", |s| s.resume()).await?;
        EngineMetrics::record_session_transition(&session_id.to_string(), "active");
        Ok(session)
    }

    /// Shallow-merge `patch` into the session context
    pub async fn update_context(&self, session_id: SessionId, patch: Map<String, Value>) -> CoreResult<Session> {
        self.update_session(session_id, "update_context", |session| {
            session.ensure_open()?;
            for (key, value) in patch.clone() {
                session.context.insert(key, value);
            }
            session.touch();
            Ok(())
        })
        .await
    }

    /// Add token usage and cost to a session that is still open.
    /// Returns `false` without writing if the session has closed.
    pub async fn record_usage(&self, session_id: SessionId, usage: TokenUsage, cost: f64) -> CoreResult<bool> {
        let mut retry = ConflictRetry::new("record_usage", self.config.max_conflict_retries);
        loop {
            let mut session = self.require_session(&session_id).await?;
            if !session.status.is_open() {
                debug!(session_id = %session_id, "Session closed; usage not recorded");
                return Ok(false);
            }
            session.token_usage.add(usage);
            session.total_cost += cost;
            session.touch();
            match self.storage.commit(WriteBatch::single(Write::Session(session))).await {
                Ok(_) => return Ok(true),
                Err(err) => retry.absorb(err).await?,
            }
        }
    }

    pub async fn get_session(&self, session_id: SessionId) -> CoreResult<Option<Session>> {
        Ok(self.storage.get_session(&session_id).await?)
    }

    /// Messages in sequence order
    pub async fn get_session_history(&self, session_id: SessionId) -> CoreResult<Vec<Message>> {
        self.require_session(&session_id).await?;
        Ok(self.storage.list_messages(&session_id).await?)
    }

    pub async fn list_sessions(&self, instance_id: InstanceId) -> CoreResult<Vec<Session>> {
        Ok(self.storage.list_sessions(&instance_id).await?)
    }

    /// Rule-evaluation context for a session:
    /// `session.{id,status,turn_count,context,...}`, `instance.*` and `mode.*`
    pub async fn evaluation_context(&self, session_id: SessionId) -> CoreResult<(Session, AgentInstance, Value)> {
        let session = self.require_session(&session_id).await?;
        let instance = self.require_instance(&session.instance_id).await?;
        let mode = self
            .storage
            .get_mode(&instance.mode_id)
            .await?
            .ok_or_else(|| CoreError::not_found("AgentMode", instance.mode_id))?;
        let context = build_context(&session, &instance, &mode)?;
        Ok((session, instance, context))
    }

    async fn require_session(&self, session_id: &SessionId) -> CoreResult<Session> {
        self.storage
            .get_session(session_id)
            .await?
            .ok_or_else(|| CoreError::not_found("Session", session_id))
    }

    async fn require_instance(&self, instance_id: &InstanceId) -> CoreResult<AgentInstance> {
        self.storage
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| CoreError::not_found("AgentInstance", instance_id))
    }

    async fn update_session<F>(&self, session_id: SessionId, operation: &'static str, mutate: F) -> CoreResult<Session>
    where
        F: Fn(&mut Session) -> CoreResult<()>,
    {
        let mut retry = ConflictRetry::new(operation, self.config.max_conflict_retries);
        loop {
            let mut session = self.require_session(&session_id).await?;
            mutate(&mut session)?;
            match self.storage.commit(WriteBatch::single(Write::Session(session.clone()))).await {
                Ok(_) => {
                    session.version += 1;
                    return Ok(session);
                }
                Err(err) => retry.absorb(err).await?,
            }
        }
    }
}

fn status_label(session: &Session) -> &'static str {
    use crate::domain::session::SessionStatus::*;
    match session.status {
        Active => "active",
        Paused => "paused",
        Completed => "completed",
        Archived => "archived",
    }
}

fn build_context(session: &Session, instance: &AgentInstance, mode: &AgentMode) -> CoreResult<Value> {
    Ok(json!({
        "session": {
            "id": session.id,
            "status": serde_json::to_value(session.status)?,
            "turn_count": session.message_count,
            "message_count": session.message_count,
            "context": session.context,
            "total_tokens": session.token_usage.total(),
            "total_cost": session.total_cost,
        },
        "instance": {
            "id": instance.id,
            "name": instance.name,
            "status": serde_json::to_value(instance.status)?,
            "model": instance.model.model,
            "tool_ids": instance.tool_ids,
            "service_ids": instance.service_ids,
            "config": instance.config,
            "metrics": serde_json::to_value(&instance.metrics)?,
        },
        "mode": {
            "id": mode.id,
            "name": mode.name,
            "capabilities": mode.capabilities,
            "config": mode.default_config,
        },
    }))
}
