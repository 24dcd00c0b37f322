//! In-memory storage backend for the Synapse engine
//!
//! Implements every repository trait of `synapse-core` over one set of
//! tables behind a single async lock, so each commit is atomic and each read
//! sees a consistent snapshot. Useful for development, tests and single-node
//! deployments where persistence is not required.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use synapse_core::{
    AgentInstance, AgentMode, AgentRepository, CommitReceipt, EdgeId, ExecutionId, GraphChanges, GraphView,
    InstanceId, KnowledgeEdge, KnowledgeNode, KnowledgeRepository, LearningEvent, LearningEventId,
    LearningRepository, LearningStatus, Message, ModeId, NodeId, NodeType, OwnerScope, PromptExecution,
    PromptRepository, PromptTemplate, RelationType, Rule, RuleId, RuleRepository, Session, SessionId,
    SessionRepository, Storage, StorageError, StorageResult, TemplateId, VectorIndex, WriteBatch,
};

mod tables;

use tables::{cosine_similarity, Tables};

/// Storage backend keeping every table in process memory
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    tables: Arc<RwLock<Tables>>,
    offline: Arc<AtomicBool>,
}

impl InMemoryStorage {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: while unavailable every call fails with
    /// `StorageError::Unavailable` and nothing is written
    pub fn set_available(&self, available: bool) {
        if !available {
            warn!("In-memory storage switched offline");
        }
        self.offline.store(!available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> StorageResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable("in-memory storage is offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl AgentRepository for InMemoryStorage {
    async fn get_mode(&self, id: &ModeId) -> StorageResult<Option<AgentMode>> {
        self.ensure_available()?;
        Ok(self.tables.read().await.modes.get(id).cloned())
    }

    async fn list_modes(&self) -> StorageResult<Vec<AgentMode>> {
        self.ensure_available()?;
        let tables = self.tables.read().await;
        let mut modes: Vec<AgentMode> = tables.modes.values().cloned().collect();
        modes.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(modes)
    }

    async fn get_instance(&self, id: &InstanceId) -> StorageResult<Option<AgentInstance>> {
        self.ensure_available()?;
        Ok(self.tables.read().await.instances.get(id).cloned())
    }

    async fn list_instances(&self, mode_id: Option<&ModeId>) -> StorageResult<Vec<AgentInstance>> {
        self.ensure_available()?;
        let tables = self.tables.read().await;
        let mut instances: Vec<AgentInstance> = tables
            .instances
            .values()
            .filter(|i| mode_id.map_or(true, |m| i.mode_id == *m))
            .cloned()
            .collect();
        instances.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(instances)
    }
}

#[async_trait]
impl SessionRepository for InMemoryStorage {
    async fn get_session(&self, id: &SessionId) -> StorageResult<Option<Session>> {
        self.ensure_available()?;
        Ok(self.tables.read().await.sessions.get(id).cloned())
    }

    async fn list_sessions(&self, instance_id: &InstanceId) -> StorageResult<Vec<Session>> {
        self.ensure_available()?;
        let tables = self.tables.read().await;
        let mut sessions: Vec<Session> = tables
            .sessions
            .values()
            .filter(|s| s.instance_id == *instance_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        Ok(sessions)
    }

    async fn list_messages(&self, session_id: &SessionId) -> StorageResult<Vec<Message>> {
        self.ensure_available()?;
        let tables = self.tables.read().await;
        let messages = tables
            .message_index
            .range((*session_id, 0)..=(*session_id, u64::MAX))
            .filter_map(|(_, id)| tables.messages.get(id).cloned())
            .collect();
        Ok(messages)
    }
}

#[async_trait]
impl KnowledgeRepository for InMemoryStorage {
    async fn get_node(&self, id: &NodeId) -> StorageResult<Option<KnowledgeNode>> {
        self.ensure_available()?;
        Ok(self.tables.read().await.nodes.get(id).cloned())
    }

    async fn get_edge(&self, id: &EdgeId) -> StorageResult<Option<KnowledgeEdge>> {
        self.ensure_available()?;
        Ok(self.tables.read().await.edges.get(id).cloned())
    }

    async fn find_node_by_key(
        &self,
        scope: &OwnerScope,
        node_type: NodeType,
        name: &str,
    ) -> StorageResult<Option<KnowledgeNode>> {
        self.ensure_available()?;
        let tables = self.tables.read().await;
        let key = (*scope, node_type, name.to_string());
        Ok(tables.node_index.get(&key).and_then(|id| tables.nodes.get(id)).cloned())
    }

    async fn find_edge_by_key(
        &self,
        from: &NodeId,
        to: &NodeId,
        relation: &RelationType,
    ) -> StorageResult<Option<KnowledgeEdge>> {
        self.ensure_available()?;
        let tables = self.tables.read().await;
        let key = (*from, *to, relation.clone());
        Ok(tables.edge_index.get(&key).and_then(|id| tables.edges.get(id)).cloned())
    }

    async fn edges_from(&self, node_id: &NodeId) -> StorageResult<Vec<KnowledgeEdge>> {
        self.ensure_available()?;
        let tables = self.tables.read().await;
        let mut edges: Vec<KnowledgeEdge> = tables.edges.values().filter(|e| e.from == *node_id).cloned().collect();
        edges.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(edges)
    }

    async fn graph_for_scope(&self, scope: &OwnerScope) -> StorageResult<GraphView> {
        self.ensure_available()?;
        let tables = self.tables.read().await;
        let mut nodes: Vec<KnowledgeNode> = tables.nodes.values().filter(|n| n.scope == *scope).cloned().collect();
        nodes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        let mut edges: Vec<KnowledgeEdge> = tables.edges.values().filter(|e| e.scope == *scope).cloned().collect();
        edges.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(GraphView { nodes, edges })
    }

    async fn changes_since(&self, scope: &OwnerScope, revision: u64) -> StorageResult<GraphChanges> {
        self.ensure_available()?;
        Ok(self.tables.read().await.changes_since(scope, revision))
    }

    async fn current_revision(&self) -> StorageResult<u64> {
        self.ensure_available()?;
        Ok(self.tables.read().await.revision)
    }
}

#[async_trait]
impl VectorIndex for InMemoryStorage {
    async fn nearest_nodes(
        &self,
        scope: &OwnerScope,
        embedding: &[f32],
        limit: usize,
    ) -> StorageResult<Vec<(KnowledgeNode, f32)>> {
        self.ensure_available()?;
        let tables = self.tables.read().await;
        let mut scored: Vec<(KnowledgeNode, f32)> = tables
            .nodes
            .values()
            .filter(|n| n.scope == *scope)
            .filter_map(|n| {
                let candidate = n.embedding.as_deref()?;
                cosine_similarity(embedding, candidate).map(|score| (n.clone(), score))
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.id.cmp(&b.0.id)));
        scored.truncate(limit);
        Ok(scored)
    }
}

#[async_trait]
impl RuleRepository for InMemoryStorage {
    async fn get_rule(&self, id: &RuleId) -> StorageResult<Option<Rule>> {
        self.ensure_available()?;
        Ok(self.tables.read().await.rules.get(id).cloned())
    }

    async fn rules_for(&self, mode_id: &ModeId, instance_id: Option<&InstanceId>) -> StorageResult<Vec<Rule>> {
        self.ensure_available()?;
        let tables = self.tables.read().await;
        let mut rules: Vec<Rule> = tables
            .rules
            .values()
            .filter(|r| match r.scope {
                OwnerScope::Mode(owner) => owner == *mode_id,
                OwnerScope::Instance(owner) => instance_id.map_or(false, |i| owner == *i),
            })
            .cloned()
            .collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rules)
    }
}

#[async_trait]
impl LearningRepository for InMemoryStorage {
    async fn get_event(&self, id: &LearningEventId) -> StorageResult<Option<LearningEvent>> {
        self.ensure_available()?;
        Ok(self.tables.read().await.events.get(id).cloned())
    }

    async fn list_events(
        &self,
        instance_id: &InstanceId,
        status: Option<LearningStatus>,
    ) -> StorageResult<Vec<LearningEvent>> {
        self.ensure_available()?;
        let tables = self.tables.read().await;
        let mut events: Vec<LearningEvent> = tables
            .events
            .values()
            .filter(|e| e.instance_id == *instance_id && status.map_or(true, |s| e.status == s))
            .cloned()
            .collect();
        events.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(events)
    }
}

#[async_trait]
impl PromptRepository for InMemoryStorage {
    async fn get_template(&self, id: &TemplateId) -> StorageResult<Option<PromptTemplate>> {
        self.ensure_available()?;
        Ok(self.tables.read().await.templates.get(id).cloned())
    }

    async fn get_execution(&self, id: &ExecutionId) -> StorageResult<Option<PromptExecution>> {
        self.ensure_available()?;
        Ok(self.tables.read().await.executions.get(id).cloned())
    }

    async fn list_executions(&self, session_id: &SessionId) -> StorageResult<Vec<PromptExecution>> {
        self.ensure_available()?;
        let tables = self.tables.read().await;
        let mut executions: Vec<PromptExecution> = tables
            .executions
            .values()
            .filter(|e| e.session_id == Some(*session_id))
            .cloned()
            .collect();
        executions.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        Ok(executions)
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn commit(&self, batch: WriteBatch) -> StorageResult<CommitReceipt> {
        self.ensure_available()?;
        let writes = batch.len();
        let mut tables = self.tables.write().await;
        let revision = tables.commit(batch).map_err(|err| {
            debug!(error = %err, "Commit rejected");
            err
        })?;
        debug!(writes, revision, "Commit applied");
        Ok(CommitReceipt { revision })
    }
}
