//! Table storage and the versioned commit protocol

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Display;
use std::hash::Hash;

use synapse_core::{
    AgentInstance, AgentMode, EdgeId, ExecutionId, GraphChanges, InstanceId, KnowledgeEdge, KnowledgeNode,
    LearningEvent, LearningEventId, Message, MessageId, ModeId, NodeId, NodeType, OwnerScope, PromptExecution,
    PromptTemplate, RelationType, Rule, RuleId, Session, SessionId, StorageError, StorageResult, TemplateId, Write,
    WriteBatch,
};

/// Records carrying an optimistic concurrency version
pub(crate) trait Versioned {
    fn version(&self) -> u64;
    fn set_version(&mut self, version: u64);
}

macro_rules! versioned {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Versioned for $ty {
                fn version(&self) -> u64 {
                    self.version
                }

                fn set_version(&mut self, version: u64) {
                    self.version = version;
                }
            }
        )*
    };
}

versioned!(
    AgentMode,
    AgentInstance,
    Session,
    Message,
    KnowledgeNode,
    KnowledgeEdge,
    Rule,
    LearningEvent,
    PromptTemplate,
    PromptExecution,
);

type NodeKey = (OwnerScope, NodeType, String);
type EdgeKey = (NodeId, NodeId, RelationType);

fn node_key(node: &KnowledgeNode) -> NodeKey {
    (node.scope, node.node_type, node.name.clone())
}

fn edge_key(edge: &KnowledgeEdge) -> EdgeKey {
    (edge.from, edge.to, edge.relation.clone())
}

/// Version check shared by every table
fn check_version<K, V>(table: &HashMap<K, V>, id: &K, version: u64, entity: &'static str) -> StorageResult<()>
where
    K: Eq + Hash + Display,
    V: Versioned,
{
    match (table.get(id), version) {
        (None, 0) => Ok(()),
        (Some(_), 0) => Err(StorageError::DuplicateKey {
            entity,
            key: id.to_string(),
        }),
        (None, expected) => Err(StorageError::VersionConflict {
            entity,
            id: id.to_string(),
            expected,
            found: 0,
        }),
        (Some(stored), expected) if stored.version() == expected => Ok(()),
        (Some(stored), expected) => Err(StorageError::VersionConflict {
            entity,
            id: id.to_string(),
            expected,
            found: stored.version(),
        }),
    }
}

/// Unique-key claim: the key must be free or already owned by `id`
fn check_unique<K, I>(
    owner: Option<&I>,
    claimed: &HashSet<K>,
    key: &K,
    id: &I,
    entity: &'static str,
    label: String,
) -> StorageResult<()>
where
    K: Eq + Hash,
    I: Eq,
{
    let taken_by_other = owner.map_or(false, |owner| owner != id);
    if taken_by_other || claimed.contains(key) {
        return Err(StorageError::DuplicateKey { entity, key: label });
    }
    Ok(())
}

fn store<K, V>(table: &mut HashMap<K, V>, id: K, mut record: V)
where
    K: Eq + Hash,
    V: Versioned,
{
    record.set_version(record.version() + 1);
    table.insert(id, record);
}

/// All tables plus the global graph revision
#[derive(Debug, Default)]
pub(crate) struct Tables {
    pub(crate) modes: HashMap<ModeId, AgentMode>,
    pub(crate) instances: HashMap<InstanceId, AgentInstance>,
    pub(crate) sessions: HashMap<SessionId, Session>,
    pub(crate) messages: HashMap<MessageId, Message>,
    pub(crate) message_index: BTreeMap<(SessionId, u64), MessageId>,
    pub(crate) nodes: HashMap<NodeId, KnowledgeNode>,
    pub(crate) node_index: HashMap<NodeKey, NodeId>,
    pub(crate) node_created: HashMap<NodeId, u64>,
    pub(crate) edges: HashMap<EdgeId, KnowledgeEdge>,
    pub(crate) edge_index: HashMap<EdgeKey, EdgeId>,
    pub(crate) edge_created: HashMap<EdgeId, u64>,
    pub(crate) rules: HashMap<RuleId, Rule>,
    pub(crate) events: HashMap<LearningEventId, LearningEvent>,
    pub(crate) templates: HashMap<TemplateId, PromptTemplate>,
    pub(crate) executions: HashMap<ExecutionId, PromptExecution>,
    pub(crate) revision: u64,
}

impl Tables {
    /// Validate every write, then apply all of them; nothing is applied on error
    pub(crate) fn commit(&mut self, batch: WriteBatch) -> StorageResult<u64> {
        self.check(&batch)?;

        let touches_graph = batch.writes().iter().any(Write::is_graph_write);
        if touches_graph {
            self.revision += 1;
        }
        let revision = self.revision;
        for write in batch.into_writes() {
            self.apply(write, revision);
        }
        Ok(revision)
    }

    fn check(&self, batch: &WriteBatch) -> StorageResult<()> {
        let mut seen: HashSet<(&'static str, String)> = HashSet::new();
        let mut node_keys: HashSet<NodeKey> = HashSet::new();
        let mut edge_keys: HashSet<EdgeKey> = HashSet::new();
        let mut message_keys: HashSet<(SessionId, u64)> = HashSet::new();

        for write in batch.writes() {
            let entity = write.entity();
            let id = match write {
                Write::Mode(r) => {
                    check_version(&self.modes, &r.id, r.version, entity)?;
                    r.id.to_string()
                }
                Write::Instance(r) => {
                    check_version(&self.instances, &r.id, r.version, entity)?;
                    r.id.to_string()
                }
                Write::Session(r) => {
                    check_version(&self.sessions, &r.id, r.version, entity)?;
                    r.id.to_string()
                }
                Write::Message(r) => {
                    check_version(&self.messages, &r.id, r.version, entity)?;
                    let key = (r.session_id, r.sequence);
                    let label = format!("{}#{}", r.session_id, r.sequence);
                    check_unique(self.message_index.get(&key), &message_keys, &key, &r.id, entity, label)?;
                    message_keys.insert(key);
                    r.id.to_string()
                }
                Write::Node(r) => {
                    check_version(&self.nodes, &r.id, r.version, entity)?;
                    let key = node_key(r);
                    let label = format!("{}/{:?}/{}", r.scope, r.node_type, r.name);
                    check_unique(self.node_index.get(&key), &node_keys, &key, &r.id, entity, label)?;
                    node_keys.insert(key);
                    r.id.to_string()
                }
                Write::Edge(r) => {
                    check_version(&self.edges, &r.id, r.version, entity)?;
                    let key = edge_key(r);
                    let label = format!("{}->{} {:?}", r.from, r.to, r.relation);
                    check_unique(self.edge_index.get(&key), &edge_keys, &key, &r.id, entity, label)?;
                    edge_keys.insert(key);
                    r.id.to_string()
                }
                Write::Rule(r) => {
                    check_version(&self.rules, &r.id, r.version, entity)?;
                    r.id.to_string()
                }
                Write::LearningEvent(r) => {
                    check_version(&self.events, &r.id, r.version, entity)?;
                    r.id.to_string()
                }
                Write::Template(r) => {
                    check_version(&self.templates, &r.id, r.version, entity)?;
                    r.id.to_string()
                }
                Write::Execution(r) => {
                    check_version(&self.executions, &r.id, r.version, entity)?;
                    r.id.to_string()
                }
                Write::InstanceGuard { id, version } => {
                    check_version(&self.instances, id, *version, entity)?;
                    id.to_string()
                }
            };
            if !seen.insert((entity, id.clone())) {
                return Err(StorageError::MappingError(format!("{} {} written twice in one batch", entity, id)));
            }
        }
        Ok(())
    }

    fn apply(&mut self, write: Write, revision: u64) {
        match write {
            Write::Mode(r) => store(&mut self.modes, r.id, r),
            Write::Instance(r) => store(&mut self.instances, r.id, r),
            Write::Session(r) => store(&mut self.sessions, r.id, r),
            Write::Message(r) => {
                self.message_index.insert((r.session_id, r.sequence), r.id);
                store(&mut self.messages, r.id, r);
            }
            Write::Node(mut r) => {
                if let Some(previous) = self.nodes.get(&r.id) {
                    self.node_index.remove(&node_key(previous));
                }
                self.node_index.insert(node_key(&r), r.id);
                self.node_created.entry(r.id).or_insert(revision);
                r.revision = revision;
                store(&mut self.nodes, r.id, r);
            }
            Write::Edge(mut r) => {
                if let Some(previous) = self.edges.get(&r.id) {
                    self.edge_index.remove(&edge_key(previous));
                }
                self.edge_index.insert(edge_key(&r), r.id);
                self.edge_created.entry(r.id).or_insert(revision);
                r.revision = revision;
                store(&mut self.edges, r.id, r);
            }
            Write::Rule(r) => store(&mut self.rules, r.id, r),
            Write::LearningEvent(r) => store(&mut self.events, r.id, r),
            Write::Template(r) => store(&mut self.templates, r.id, r),
            Write::Execution(r) => store(&mut self.executions, r.id, r),
            Write::InstanceGuard { .. } => {}
        }
    }

    /// Nodes and edges of `scope` written after `since`
    pub(crate) fn changes_since(&self, scope: &OwnerScope, since: u64) -> GraphChanges {
        let mut nodes: Vec<&KnowledgeNode> = self
            .nodes
            .values()
            .filter(|n| n.scope == *scope && n.revision > since)
            .collect();
        nodes.sort_by(|a, b| a.revision.cmp(&b.revision).then_with(|| a.id.cmp(&b.id)));
        let mut edges: Vec<&KnowledgeEdge> = self
            .edges
            .values()
            .filter(|e| e.scope == *scope && e.revision > since)
            .collect();
        edges.sort_by(|a, b| a.revision.cmp(&b.revision).then_with(|| a.id.cmp(&b.id)));

        let mut changes = GraphChanges {
            revision: self.revision,
            ..GraphChanges::default()
        };
        for node in nodes {
            let created = self.node_created.get(&node.id).copied().unwrap_or_default();
            if created > since {
                changes.nodes_added.push(node.id);
            } else {
                changes.nodes_updated.push(node.id);
            }
        }
        for edge in edges {
            let created = self.edge_created.get(&edge.id).copied().unwrap_or_default();
            if created > since {
                changes.edges_added.push(edge.id);
            } else {
                changes.edges_reinforced.push((edge.id, edge.strength));
            }
        }
        changes
    }
}

/// Cosine similarity; `None` on dimension mismatch or zero vectors
pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot / (norm_a * norm_b))
}
