//! Knowledge graph vertices and edges
//!
//! Nodes and edges are flat records addressed by stable identifiers; the
//! storage layer keeps them in per-table arenas. Edges may only connect
//! nodes of the same owner scope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use super::identifiers::{EdgeId, InstanceId, ModeId, NodeId};
use crate::CoreError;

/// The AgentInstance/AgentMode boundary within which nodes, edges and rules are visible
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum OwnerScope {
    Instance(InstanceId),
    Mode(ModeId),
}

impl fmt::Display for OwnerScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnerScope::Instance(id) => write!(f, "instance:{}", id),
            OwnerScope::Mode(id) => write!(f, "mode:{}", id),
        }
    }
}

/// Kind of knowledge a node represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Concept,
    Entity,
    Skill,
    Tool,
    Pattern,
    Rule,
}

/// Relation carried by an edge
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    RelatesTo,
    DependsOn,
    PartOf,
    Uses,
    Causes,
    SimilarTo,
    Contradicts,
    Custom(String),
}

impl RelationType {
    /// Parse a relation label; unknown labels become `Custom`
    pub fn parse(label: &str) -> Self {
        match label {
            "relates_to" => RelationType::RelatesTo,
            "depends_on" => RelationType::DependsOn,
            "part_of" => RelationType::PartOf,
            "uses" => RelationType::Uses,
            "causes" => RelationType::Causes,
            "similar_to" => RelationType::SimilarTo,
            "contradicts" => RelationType::Contradicts,
            other => RelationType::Custom(other.to_string()),
        }
    }
}

/// Check that a score lies in the closed unit interval
pub fn ensure_unit_interval(what: &str, value: f64) -> Result<f64, CoreError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(CoreError::ValidationError(format!(
            "{} must be within [0, 1], got {}",
            what, value
        )))
    }
}

/// Diminishing-returns accumulation of edge strength.
///
/// `s' = min(1, s + delta * (1 - s))`; never decreases for `delta` in [0, 1].
pub fn accumulate_strength(current: f64, delta: f64) -> f64 {
    (current + delta * (1.0 - current)).clamp(0.0, 1.0)
}

/// Typed vertex of the knowledge graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeNode {
    pub id: NodeId,
    pub scope: OwnerScope,
    pub node_type: NodeType,
    pub name: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
    /// Estimated correctness in [0, 1]
    pub confidence: f64,
    /// Number of times the node was upserted or referenced
    pub usage_count: u64,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    /// Storage revision of the last write
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl KnowledgeNode {
    /// Create a node with usage 1
    pub fn new(
        scope: OwnerScope,
        node_type: NodeType,
        name: impl Into<String>,
        properties: Map<String, Value>,
        confidence: f64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: NodeId::new_v4(),
            scope,
            node_type,
            name: name.into(),
            properties,
            confidence,
            usage_count: 1,
            embedding: None,
            revision: 0,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Merge properties (incoming keys win) and count one more use
    pub fn reinforce(&mut self, properties: Map<String, Value>) {
        for (key, value) in properties {
            self.properties.insert(key, value);
        }
        self.usage_count += 1;
        self.touch();
    }

    /// Update the timestamp
    #[inline]
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// A piece of evidence backing an edge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    /// Free-form origin, e.g. "session:<id>" or "learning_event:<id>"
    pub source: String,
    #[serde(default)]
    pub detail: Option<String>,
    pub observed_at: DateTime<Utc>,
}

impl Evidence {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            detail: None,
            observed_at: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Directed, weighted relation between two nodes of one scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEdge {
    pub id: EdgeId,
    pub scope: OwnerScope,
    pub from: NodeId,
    pub to: NodeId,
    pub relation: RelationType,
    /// Accumulated evidence weight in [0, 1]
    pub strength: f64,
    #[serde(default)]
    pub evidence: Vec<Evidence>,
    pub reinforcement_count: u64,
    pub last_reinforced_at: DateTime<Utc>,
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl KnowledgeEdge {
    /// Create an edge at `min(1, delta)`
    pub fn new(
        scope: OwnerScope,
        from: NodeId,
        to: NodeId,
        relation: RelationType,
        delta: f64,
        evidence: Vec<Evidence>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: EdgeId::new_v4(),
            scope,
            from,
            to,
            relation,
            strength: delta.min(1.0),
            evidence,
            reinforcement_count: 1,
            last_reinforced_at: now,
            revision: 0,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply one reinforcement with diminishing returns, keeping at most
    /// `max_evidence` evidence entries (oldest dropped first)
    pub fn reinforce(&mut self, delta: f64, evidence: Vec<Evidence>, max_evidence: usize) {
        self.strength = accumulate_strength(self.strength, delta);
        self.evidence.extend(evidence);
        if self.evidence.len() > max_evidence {
            let excess = self.evidence.len() - max_evidence;
            self.evidence.drain(..excess);
        }
        self.reinforcement_count += 1;
        let now = Utc::now();
        self.last_reinforced_at = now;
        self.updated_at = now;
    }
}

/// All nodes and edges of one owner scope
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphView {
    pub nodes: Vec<KnowledgeNode>,
    pub edges: Vec<KnowledgeEdge>,
}

/// Nodes and edges written after a given storage revision
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphChanges {
    pub nodes_added: Vec<NodeId>,
    pub nodes_updated: Vec<NodeId>,
    pub edges_added: Vec<EdgeId>,
    /// Reinforced edges with their strength at the time of the diff
    pub edges_reinforced: Vec<(EdgeId, f64)>,
    /// Storage revision the diff was taken at
    pub revision: u64,
}

impl GraphChanges {
    pub fn is_empty(&self) -> bool {
        self.nodes_added.is_empty()
            && self.nodes_updated.is_empty()
            && self.edges_added.is_empty()
            && self.edges_reinforced.is_empty()
    }
}

/// A neighbor reached over an outgoing edge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub edge: KnowledgeEdge,
    pub node: KnowledgeNode,
}

/// Order neighbors by strength desc, then most recent reinforcement, then edge id
pub fn sort_neighbors(neighbors: &mut [Neighbor]) {
    neighbors.sort_by(|a, b| {
        b.edge
            .strength
            .total_cmp(&a.edge.strength)
            .then_with(|| b.edge.last_reinforced_at.cmp(&a.edge.last_reinforced_at))
            .then_with(|| a.edge.id.cmp(&b.edge.id))
    });
}
