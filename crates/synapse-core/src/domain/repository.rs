//! Repository traits for the Synapse engine
//!
//! Reads go through per-aggregate repository traits. All writes go through
//! [`Storage::commit`], which applies a [`WriteBatch`] atomically under
//! optimistic versioning:
//!
//! - a record with `version == 0` is inserted only if neither its id nor its
//!   unique key exists yet (`DuplicateKey` otherwise) and is stored at version 1;
//! - any other record replaces the stored one only if the stored version equals
//!   the record's version (`VersionConflict` otherwise) and is stored at `version + 1`.
//!
//! Every commit that touches nodes or edges advances a global monotonic
//! revision and stamps it on the written records.

use async_trait::async_trait;

use super::agent::{AgentInstance, AgentMode};
use super::identifiers::{
    EdgeId, ExecutionId, InstanceId, LearningEventId, ModeId, NodeId, RuleId, SessionId, TemplateId,
};
use super::knowledge::{GraphChanges, GraphView, KnowledgeEdge, KnowledgeNode, NodeType, OwnerScope, RelationType};
use super::learning::{LearningEvent, LearningStatus};
use super::prompt::{PromptExecution, PromptTemplate};
use super::rule::Rule;
use super::session::{Message, Session};
use crate::StorageResult;

/// One record write inside a batch
#[derive(Debug, Clone)]
pub enum Write {
    Mode(AgentMode),
    Instance(AgentInstance),
    Session(Session),
    Message(Message),
    Node(KnowledgeNode),
    Edge(KnowledgeEdge),
    Rule(Rule),
    LearningEvent(LearningEvent),
    Template(PromptTemplate),
    Execution(PromptExecution),
    /// Check-only: fails the batch unless the instance is still at `version`
    InstanceGuard { id: InstanceId, version: u64 },
}

impl Write {
    /// Entity label used in errors and logs
    pub fn entity(&self) -> &'static str {
        match self {
            Write::Mode(_) => "agent_mode",
            Write::Instance(_) | Write::InstanceGuard { .. } => "agent_instance",
            Write::Session(_) => "session",
            Write::Message(_) => "message",
            Write::Node(_) => "knowledge_node",
            Write::Edge(_) => "knowledge_edge",
            Write::Rule(_) => "rule",
            Write::LearningEvent(_) => "learning_event",
            Write::Template(_) => "prompt_template",
            Write::Execution(_) => "prompt_execution",
        }
    }

    /// Version the writer read the record at
    pub fn version(&self) -> u64 {
        match self {
            Write::Mode(r) => r.version,
            Write::Instance(r) => r.version,
            Write::Session(r) => r.version,
            Write::Message(r) => r.version,
            Write::Node(r) => r.version,
            Write::Edge(r) => r.version,
            Write::Rule(r) => r.version,
            Write::LearningEvent(r) => r.version,
            Write::Template(r) => r.version,
            Write::Execution(r) => r.version,
            Write::InstanceGuard { version, .. } => *version,
        }
    }

    /// Whether the write touches the knowledge graph
    pub fn is_graph_write(&self) -> bool {
        matches!(self, Write::Node(_) | Write::Edge(_))
    }
}

/// Writes applied all-or-nothing
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    writes: Vec<Write>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single-write batch
    pub fn single(write: Write) -> Self {
        Self { writes: vec![write] }
    }

    pub fn push(&mut self, write: Write) {
        self.writes.push(write);
    }

    pub fn with(mut self, write: Write) -> Self {
        self.writes.push(write);
        self
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn writes(&self) -> &[Write] {
        &self.writes
    }

    pub fn into_writes(self) -> Vec<Write> {
        self.writes
    }
}

/// Result of a successful commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitReceipt {
    /// Global revision after the commit; unchanged if no graph record was written
    pub revision: u64,
}

/// Agent modes and instances
#[async_trait]
pub trait AgentRepository: Send + Sync {
    async fn get_mode(&self, id: &ModeId) -> StorageResult<Option<AgentMode>>;

    async fn list_modes(&self) -> StorageResult<Vec<AgentMode>>;

    async fn get_instance(&self, id: &InstanceId) -> StorageResult<Option<AgentInstance>>;

    /// Instances, optionally filtered to one mode
    async fn list_instances(&self, mode_id: Option<&ModeId>) -> StorageResult<Vec<AgentInstance>>;
}

/// Sessions and their message logs
#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn get_session(&self, id: &SessionId) -> StorageResult<Option<Session>>;

    async fn list_sessions(&self, instance_id: &InstanceId) -> StorageResult<Vec<Session>>;

    /// Messages of a session in ascending sequence order
    async fn list_messages(&self, session_id: &SessionId) -> StorageResult<Vec<Message>>;
}

/// Knowledge graph reads
#[async_trait]
pub trait KnowledgeRepository: Send + Sync {
    async fn get_node(&self, id: &NodeId) -> StorageResult<Option<KnowledgeNode>>;

    async fn get_edge(&self, id: &EdgeId) -> StorageResult<Option<KnowledgeEdge>>;

    /// Node by its unique key `(scope, type, name)`
    async fn find_node_by_key(
        &self,
        scope: &OwnerScope,
        node_type: NodeType,
        name: &str,
    ) -> StorageResult<Option<KnowledgeNode>>;

    /// Edge by its unique key `(from, to, relation)`
    async fn find_edge_by_key(
        &self,
        from: &NodeId,
        to: &NodeId,
        relation: &RelationType,
    ) -> StorageResult<Option<KnowledgeEdge>>;

    /// Outgoing edges of a node
    async fn edges_from(&self, node_id: &NodeId) -> StorageResult<Vec<KnowledgeEdge>>;

    /// Consistent snapshot of every node and edge in a scope
    async fn graph_for_scope(&self, scope: &OwnerScope) -> StorageResult<GraphView>;

    /// Nodes and edges of a scope written after `revision`
    async fn changes_since(&self, scope: &OwnerScope, revision: u64) -> StorageResult<GraphChanges>;

    /// Latest committed revision
    async fn current_revision(&self) -> StorageResult<u64>;
}

/// Similarity lookup over node embeddings
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Up to `limit` nodes of `scope` with an embedding, most similar first
    async fn nearest_nodes(
        &self,
        scope: &OwnerScope,
        embedding: &[f32],
        limit: usize,
    ) -> StorageResult<Vec<(KnowledgeNode, f32)>>;
}

/// Rule reads
#[async_trait]
pub trait RuleRepository: Send + Sync {
    async fn get_rule(&self, id: &RuleId) -> StorageResult<Option<Rule>>;

    /// Snapshot of the rules of a mode and, if given, one of its instances
    async fn rules_for(&self, mode_id: &ModeId, instance_id: Option<&InstanceId>) -> StorageResult<Vec<Rule>>;
}

/// Learning event reads
#[async_trait]
pub trait LearningRepository: Send + Sync {
    async fn get_event(&self, id: &LearningEventId) -> StorageResult<Option<LearningEvent>>;

    /// Events of an instance in creation order, optionally filtered by status
    async fn list_events(
        &self,
        instance_id: &InstanceId,
        status: Option<LearningStatus>,
    ) -> StorageResult<Vec<LearningEvent>>;
}

/// Prompt template and execution reads
#[async_trait]
pub trait PromptRepository: Send + Sync {
    async fn get_template(&self, id: &TemplateId) -> StorageResult<Option<PromptTemplate>>;

    async fn get_execution(&self, id: &ExecutionId) -> StorageResult<Option<PromptExecution>>;

    /// Executions linked to a session, oldest first
    async fn list_executions(&self, session_id: &SessionId) -> StorageResult<Vec<PromptExecution>>;
}

/// Full persistence seam used by the engine services
#[async_trait]
pub trait Storage:
    AgentRepository
    + SessionRepository
    + KnowledgeRepository
    + VectorIndex
    + RuleRepository
    + LearningRepository
    + PromptRepository
{
    /// Apply a batch atomically
    async fn commit(&self, batch: WriteBatch) -> StorageResult<CommitReceipt>;
}
