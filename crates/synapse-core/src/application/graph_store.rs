use serde_json::{Map, Value};
use std::sync::Arc;
use synapse_monitoring::EngineMetrics;
use tracing::{debug, instrument};

use super::ConflictRetry;
use crate::config::EngineConfig;
use crate::domain::identifiers::{EdgeId, NodeId};
use crate::domain::knowledge::{
    ensure_unit_interval, sort_neighbors, Evidence, GraphChanges, GraphView, KnowledgeEdge, KnowledgeNode,
    Neighbor, NodeType, OwnerScope, RelationType,
};
use crate::domain::repository::{Storage, Write, WriteBatch};
use crate::{CoreError, CoreResult};

/// Filters for [`GraphStore::query_neighbors`]
#[derive(Debug, Clone, Default)]
pub struct NeighborQuery {
    /// Only follow edges with one of these relations
    pub relations: Option<Vec<RelationType>>,
    /// Only follow edges at least this strong
    pub min_strength: Option<f64>,
}

impl NeighborQuery {
    pub fn relation(mut self, relation: RelationType) -> Self {
        self.relations.get_or_insert_with(Vec::new).push(relation);
        self
    }

    pub fn min_strength(mut self, min_strength: f64) -> Self {
        self.min_strength = Some(min_strength);
        self
    }

    fn accepts(&self, edge: &KnowledgeEdge) -> bool {
        let relation_ok = self
            .relations
            .as_ref()
            .map_or(true, |relations| relations.contains(&edge.relation));
        let strength_ok = self.min_strength.map_or(true, |min| edge.strength >= min);
        relation_ok && strength_ok
    }
}

/// Upsert target for a node: merge into `existing` or create a fresh record.
/// Returns the record to write and whether it is new.
pub(crate) fn plan_node(
    existing: Option<KnowledgeNode>,
    scope: OwnerScope,
    node_type: NodeType,
    name: &str,
    properties: Map<String, Value>,
    confidence: f64,
) -> (KnowledgeNode, bool) {
    match existing {
        Some(mut node) => {
            node.reinforce(properties);
            (node, false)
        }
        None => (KnowledgeNode::new(scope, node_type, name, properties, confidence), true),
    }
}

/// Reinforcement target for an edge; see [`plan_node`]
#[allow(clippy::too_many_arguments)]
pub(crate) fn plan_edge(
    existing: Option<KnowledgeEdge>,
    scope: OwnerScope,
    from: NodeId,
    to: NodeId,
    relation: RelationType,
    delta: f64,
    evidence: Vec<Evidence>,
    max_evidence: usize,
) -> (KnowledgeEdge, bool) {
    match existing {
        Some(mut edge) => {
            edge.reinforce(delta, evidence, max_evidence);
            (edge, false)
        }
        None => {
            let mut edge = KnowledgeEdge::new(scope, from, to, relation, delta, evidence);
            if edge.evidence.len() > max_evidence {
                let excess = edge.evidence.len() - max_evidence;
                edge.evidence.drain(..excess);
            }
            (edge, true)
        }
    }
}

/// Endpoints must be distinct and share one owner scope
pub(crate) fn check_endpoints(from: &KnowledgeNode, to: &KnowledgeNode) -> CoreResult<()> {
    if from.id == to.id {
        return Err(CoreError::InvalidEdgeScope(format!("edge would loop on node {}", from.id)));
    }
    if from.scope != to.scope {
        return Err(CoreError::InvalidEdgeScope(format!(
            "node {} is in {} but node {} is in {}",
            from.id, from.scope, to.id, to.scope
        )));
    }
    Ok(())
}

/// Typed, weighted knowledge graph per owner scope
pub struct GraphStore {
    storage: Arc<dyn Storage>,
    config: Arc<EngineConfig>,
}

impl GraphStore {
    /// Create a new graph store
    pub fn new(storage: Arc<dyn Storage>, config: Arc<EngineConfig>) -> Self {
        Self { storage, config }
    }

    /// Insert a node or, if `(scope, type, name)` exists, merge its properties
    /// and count one more use
    #[instrument(skip(self, properties), fields(scope = %scope))]
    pub async fn upsert_node(
        &self,
        scope: OwnerScope,
        node_type: NodeType,
        name: &str,
        properties: Map<String, Value>,
    ) -> CoreResult<NodeId> {
        if name.trim().is_empty() {
            return Err(CoreError::ValidationError("node name must not be empty".into()));
        }
        let mut retry = ConflictRetry::new("upsert_node", self.config.max_conflict_retries);
        loop {
            let existing = self.storage.find_node_by_key(&scope, node_type, name).await?;
            let (node, created) = plan_node(
                existing,
                scope,
                node_type,
                name,
                properties.clone(),
                self.config.default_node_confidence,
            );
            let node_id = node.id;
            match self.storage.commit(WriteBatch::single(Write::Node(node))).await {
                Ok(receipt) => {
                    debug!(node_id = %node_id, created, revision = receipt.revision, "Node upserted");
                    EngineMetrics::record_node_upsert(&scope.to_string(), created);
                    return Ok(node_id);
                }
                Err(err) => retry.absorb(err).await?,
            }
        }
    }

    /// Create an edge at `min(1, delta)` or strengthen the existing one with
    /// diminishing returns
    #[instrument(skip(self, evidence))]
    pub async fn add_or_strengthen_edge(
        &self,
        from: NodeId,
        to: NodeId,
        relation: RelationType,
        delta_strength: f64,
        evidence: Vec<Evidence>,
    ) -> CoreResult<EdgeId> {
        self.strengthen_edge(from, to, relation, delta_strength, evidence)
            .await
            .map(|edge| edge.id)
    }

    /// Same as [`add_or_strengthen_edge`](Self::add_or_strengthen_edge) but
    /// returns the stored edge
    pub async fn strengthen_edge(
        &self,
        from: NodeId,
        to: NodeId,
        relation: RelationType,
        delta_strength: f64,
        evidence: Vec<Evidence>,
    ) -> CoreResult<KnowledgeEdge> {
        ensure_unit_interval("delta strength", delta_strength)?;
        if from == to {
            return Err(CoreError::InvalidEdgeScope(format!("edge would loop on node {}", from)));
        }
        let from_node = self.require_node(&from).await?;
        let to_node = self.require_node(&to).await?;
        check_endpoints(&from_node, &to_node)?;

        let mut retry = ConflictRetry::new("add_or_strengthen_edge", self.config.max_conflict_retries);
        loop {
            let existing = self.storage.find_edge_by_key(&from, &to, &relation).await?;
            let (mut edge, created) = plan_edge(
                existing,
                from_node.scope,
                from,
                to,
                relation.clone(),
                delta_strength,
                evidence.clone(),
                self.config.max_edge_evidence,
            );
            match self.storage.commit(WriteBatch::single(Write::Edge(edge.clone()))).await {
                Ok(receipt) => {
                    edge.version += 1;
                    edge.revision = receipt.revision;
                    debug!(edge_id = %edge.id, strength = edge.strength, created, "Edge reinforced");
                    EngineMetrics::record_edge_reinforcement(&edge.scope.to_string(), edge.strength, created);
                    return Ok(edge);
                }
                Err(err) => retry.absorb(err).await?,
            }
        }
    }

    /// Outgoing neighbors ordered by strength desc, most recent reinforcement,
    /// then edge id
    #[instrument(skip(self, query))]
    pub async fn query_neighbors(&self, node_id: NodeId, query: &NeighborQuery) -> CoreResult<Vec<Neighbor>> {
        self.require_node(&node_id).await?;
        let edges = self.storage.edges_from(&node_id).await?;
        let mut neighbors = Vec::with_capacity(edges.len());
        for edge in edges.into_iter().filter(|edge| query.accepts(edge)) {
            if let Some(node) = self.storage.get_node(&edge.to).await? {
                neighbors.push(Neighbor { edge, node });
            }
        }
        sort_neighbors(&mut neighbors);
        Ok(neighbors)
    }

    pub async fn get_node(&self, node_id: NodeId) -> CoreResult<Option<KnowledgeNode>> {
        Ok(self.storage.get_node(&node_id).await?)
    }

    pub async fn get_edge(&self, edge_id: EdgeId) -> CoreResult<Option<KnowledgeEdge>> {
        Ok(self.storage.get_edge(&edge_id).await?)
    }

    pub async fn find_node(
        &self,
        scope: OwnerScope,
        node_type: NodeType,
        name: &str,
    ) -> CoreResult<Option<KnowledgeNode>> {
        Ok(self.storage.find_node_by_key(&scope, node_type, name).await?)
    }

    /// Overwrite a node's confidence
    pub async fn set_node_confidence(&self, node_id: NodeId, confidence: f64) -> CoreResult<KnowledgeNode> {
        ensure_unit_interval("confidence", confidence)?;
        self.update_node(node_id, "set_node_confidence", |node| node.confidence = confidence)
            .await
    }

    /// Attach an embedding used by [`similar_nodes`](Self::similar_nodes)
    pub async fn set_node_embedding(&self, node_id: NodeId, embedding: Vec<f32>) -> CoreResult<KnowledgeNode> {
        if embedding.is_empty() {
            return Err(CoreError::ValidationError("embedding must not be empty".into()));
        }
        self.update_node(node_id, "set_node_embedding", |node| node.embedding = Some(embedding.clone()))
            .await
    }

    /// Nodes of `scope` nearest to `embedding`, most similar first
    pub async fn similar_nodes(
        &self,
        scope: OwnerScope,
        embedding: &[f32],
        limit: usize,
    ) -> CoreResult<Vec<(KnowledgeNode, f32)>> {
        Ok(self.storage.nearest_nodes(&scope, embedding, limit).await?)
    }

    /// Every node and edge of a scope
    pub async fn graph_view(&self, scope: OwnerScope) -> CoreResult<GraphView> {
        Ok(self.storage.graph_for_scope(&scope).await?)
    }

    /// Nodes and edges of a scope written after `revision`
    pub async fn changes_since(&self, scope: OwnerScope, revision: u64) -> CoreResult<GraphChanges> {
        Ok(self.storage.changes_since(&scope, revision).await?)
    }

    pub async fn current_revision(&self) -> CoreResult<u64> {
        Ok(self.storage.current_revision().await?)
    }

    async fn require_node(&self, node_id: &NodeId) -> CoreResult<KnowledgeNode> {
        self.storage
            .get_node(node_id)
            .await?
            .ok_or_else(|| CoreError::not_found("KnowledgeNode", node_id))
    }

    async fn update_node<F>(&self, node_id: NodeId, operation: &'static str, mutate: F) -> CoreResult<KnowledgeNode>
    where
        F: Fn(&mut KnowledgeNode),
    {
        let mut retry = ConflictRetry::new(operation, self.config.max_conflict_retries);
        loop {
            let mut node = self.require_node(&node_id).await?;
            mutate(&mut node);
            node.touch();
            match self.storage.commit(WriteBatch::single(Write::Node(node.clone()))).await {
                Ok(receipt) => {
                    node.version += 1;
                    node.revision = receipt.revision;
                    return Ok(node);
                }
                Err(err) => retry.absorb(err).await?,
            }
        }
    }
}
