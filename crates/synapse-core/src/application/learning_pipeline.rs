use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use synapse_monitoring::EngineMetrics;
use tracing::{debug, info, instrument};

use super::graph_store::{check_endpoints, plan_edge, plan_node};
use super::ConflictRetry;
use crate::config::EngineConfig;
use crate::domain::identifiers::{InstanceId, LearningEventId, NodeId};
use crate::domain::knowledge::{ensure_unit_interval, Evidence, KnowledgeEdge, KnowledgeNode, OwnerScope, RelationType};
use crate::domain::learning::{
    AppliedChanges, LearningEvent, LearningEventDraft, LearningEventType, LearningStatus, NodeKey, Validation,
};
use crate::domain::repository::{Storage, Write, WriteBatch};
use crate::domain::rule::{Rule, RuleOrigin};
use crate::{CoreError, CoreResult};

/// Graph records touched by one incorporation, before commit
#[derive(Default)]
struct StagedGraph {
    nodes: HashMap<NodeKey, KnowledgeNode>,
    node_order: Vec<NodeKey>,
    /// Endpoints that already exist and are only referenced
    referenced: HashMap<NodeKey, KnowledgeNode>,
    edges: HashMap<(NodeId, NodeId, RelationType), KnowledgeEdge>,
    edge_order: Vec<(NodeId, NodeId, RelationType)>,
}

/// Validates learning events and writes them into the graph and rule set
pub struct LearningPipeline {
    storage: Arc<dyn Storage>,
    config: Arc<EngineConfig>,
}

impl LearningPipeline {
    /// Create a new learning pipeline
    pub fn new(storage: Arc<dyn Storage>, config: Arc<EngineConfig>) -> Self {
        Self { storage, config }
    }

    /// Record a proposed change; validates it automatically when its
    /// confidence reaches the threshold for its type
    #[instrument(skip(self, draft), fields(instance_id = %draft.instance_id, event_type = ?draft.event_type))]
    pub async fn submit(&self, draft: LearningEventDraft) -> CoreResult<LearningEvent> {
        ensure_unit_interval("confidence", draft.confidence)?;
        ensure_unit_interval("impact risk", draft.impact.risk)?;
        draft.payload.validate(draft.event_type)?;
        if self.storage.get_instance(&draft.instance_id).await?.is_none() {
            return Err(CoreError::not_found("AgentInstance", draft.instance_id));
        }

        let mut event = LearningEvent::from_draft(draft);
        let threshold = self.config.threshold_for(event.event_type);
        if event.confidence >= threshold {
            event.validate(Validation::Automatic { threshold })?;
        }
        self.storage
            .commit(WriteBatch::single(Write::LearningEvent(event.clone())))
            .await?;
        event.version += 1;

        info!(
            event_id = %event.id,
            confidence = event.confidence,
            threshold,
            status = ?event.status,
            "Learning event submitted"
        );
        EngineMetrics::record_learning_transition(type_label(event.event_type), status_label(event.status), event.confidence);
        Ok(event)
    }

    /// Administrative approval: pending -> validated
    pub async fn approve(&self, event_id: LearningEventId, reviewer: &str) -> CoreResult<LearningEvent> {
        let event = self
            .update_event(event_id, "approve_learning_event", |event| {
                event.validate(Validation::Administrative {
                    reviewer: reviewer.to_string(),
                })
            })
            .await?;
        info!(event_id = %event_id, reviewer, "Learning event approved");
        EngineMetrics::record_learning_transition(type_label(event.event_type), "validated", event.confidence);
        Ok(event)
    }

    /// pending -> rejected; terminal
    pub async fn reject(&self, event_id: LearningEventId, reason: &str) -> CoreResult<LearningEvent> {
        let event = self
            .update_event(event_id, "reject_learning_event", |event| event.reject(reason))
            .await?;
        info!(event_id = %event_id, reason, "Learning event rejected");
        EngineMetrics::record_learning_transition(type_label(event.event_type), "rejected", event.confidence);
        Ok(event)
    }

    /// Apply a validated event in one atomic commit: node upserts, edge
    /// reinforcement, an optional new inactive rule and the event's own status.
    ///
    /// Incorporating an already incorporated event returns its original
    /// applied changes and writes nothing.
    #[instrument(skip(self))]
    pub async fn incorporate(&self, event_id: LearningEventId) -> CoreResult<AppliedChanges> {
        let mut retry = ConflictRetry::new("incorporate", self.config.max_conflict_retries);
        loop {
            let mut event = self.require_event(&event_id).await?;
            match event.status {
                LearningStatus::Incorporated => {
                    debug!("Event already incorporated");
                    return Ok(event.applied.clone().unwrap_or_default());
                }
                LearningStatus::Validated => {}
                other => {
                    return Err(CoreError::InvalidTransition(format!(
                        "learning event {} is {:?}; only validated events can be incorporated",
                        event_id, other
                    )))
                }
            }

            let (batch, applied) = self.stage(&mut event).await?;
            match self.storage.commit(batch).await {
                Ok(receipt) => {
                    info!(
                        nodes = applied.node_ids.len(),
                        edges = applied.edge_ids.len(),
                        rule_created = applied.rule_id.is_some(),
                        revision = receipt.revision,
                        "Learning event incorporated"
                    );
                    EngineMetrics::record_learning_transition(type_label(event.event_type), "incorporated", event.confidence);
                    return Ok(applied);
                }
                Err(err) => retry.absorb(err).await?,
            }
        }
    }

    pub async fn get_event(&self, event_id: LearningEventId) -> CoreResult<Option<LearningEvent>> {
        Ok(self.storage.get_event(&event_id).await?)
    }

    /// Events of an instance, optionally filtered by status
    pub async fn list_events(&self, instance_id: InstanceId, status: Option<LearningStatus>) -> CoreResult<Vec<LearningEvent>> {
        Ok(self.storage.list_events(&instance_id, status).await?)
    }

    pub async fn get_pending_learning_events(&self, instance_id: InstanceId) -> CoreResult<Vec<LearningEvent>> {
        self.list_events(instance_id, Some(LearningStatus::Pending)).await
    }

    /// Build the incorporation batch from the current graph; marks `event`
    async fn stage(&self, event: &mut LearningEvent) -> CoreResult<(WriteBatch, AppliedChanges)> {
        let scope = OwnerScope::Instance(event.instance_id);
        let mut staged = StagedGraph::default();

        for proposal in &event.payload.nodes {
            let confidence = proposal.confidence.unwrap_or(event.confidence);
            self.stage_node(&mut staged, scope, &proposal.key, proposal.properties.clone(), confidence)
                .await?;
        }

        let source = Evidence::new(format!("learning_event:{}", event.id));
        for proposal in &event.payload.edges {
            let from = self.resolve_endpoint(&mut staged, scope, &proposal.from).await?;
            let to = self.resolve_endpoint(&mut staged, scope, &proposal.to).await?;
            check_endpoints(&from, &to)?;

            let key = (from.id, to.id, proposal.relation.clone());
            let existing = match staged.edges.remove(&key) {
                Some(edge) => Some(edge),
                None => {
                    staged.edge_order.push(key.clone());
                    self.storage.find_edge_by_key(&from.id, &to.id, &proposal.relation).await?
                }
            };
            let mut evidence = proposal.evidence.clone();
            evidence.push(source.clone());
            let (edge, _) = plan_edge(
                existing,
                scope,
                from.id,
                to.id,
                proposal.relation.clone(),
                proposal.delta_strength,
                evidence,
                self.config.max_edge_evidence,
            );
            staged.edges.insert(key, edge);
        }

        let mut batch = WriteBatch::new();
        let mut applied = AppliedChanges::default();
        for key in &staged.node_order {
            if let Some(node) = staged.nodes.remove(key) {
                applied.node_ids.push(node.id);
                batch.push(Write::Node(node));
            }
        }
        for key in &staged.edge_order {
            if let Some(edge) = staged.edges.remove(key) {
                applied.edge_ids.push(edge.id);
                batch.push(Write::Edge(edge));
            }
        }
        if let Some(proposal) = &event.payload.rule {
            let mut rule = Rule::new(scope, proposal.name.clone(), proposal.condition.clone(), proposal.action.clone())
                .with_priority(proposal.priority)
                .inactive();
            rule.description = proposal.description.clone();
            rule.mandatory = proposal.mandatory;
            rule.origin = RuleOrigin::Learned { event_id: event.id };
            applied.rule_id = Some(rule.id);
            batch.push(Write::Rule(rule));
        }

        event.mark_incorporated(applied.clone())?;
        batch.push(Write::LearningEvent(event.clone()));
        Ok((batch, applied))
    }

    async fn stage_node(
        &self,
        staged: &mut StagedGraph,
        scope: OwnerScope,
        key: &NodeKey,
        properties: Map<String, Value>,
        confidence: f64,
    ) -> CoreResult<NodeId> {
        let existing = match staged.nodes.remove(key) {
            Some(node) => Some(node),
            None => {
                staged.node_order.push(key.clone());
                match staged.referenced.remove(key) {
                    Some(node) => Some(node),
                    None => self.storage.find_node_by_key(&scope, key.node_type, &key.name).await?,
                }
            }
        };
        let (node, _) = plan_node(existing, scope, key.node_type, &key.name, properties, confidence);
        let node_id = node.id;
        staged.nodes.insert(key.clone(), node);
        Ok(node_id)
    }

    /// Node an edge proposal points at: staged, existing, or created with
    /// the default confidence
    async fn resolve_endpoint(
        &self,
        staged: &mut StagedGraph,
        scope: OwnerScope,
        key: &NodeKey,
    ) -> CoreResult<KnowledgeNode> {
        if let Some(node) = staged.nodes.get(key).or_else(|| staged.referenced.get(key)) {
            return Ok(node.clone());
        }
        if let Some(node) = self.storage.find_node_by_key(&scope, key.node_type, &key.name).await? {
            staged.referenced.insert(key.clone(), node.clone());
            return Ok(node);
        }
        let node_id = self
            .stage_node(staged, scope, key, Map::new(), self.config.default_node_confidence)
            .await?;
        staged
            .nodes
            .get(key)
            .cloned()
            .ok_or_else(|| CoreError::Other(format!("staged node {} missing", node_id)))
    }

    async fn require_event(&self, event_id: &LearningEventId) -> CoreResult<LearningEvent> {
        self.storage
            .get_event(event_id)
            .await?
            .ok_or_else(|| CoreError::not_found("LearningEvent", event_id))
    }

    async fn update_event<F>(&self, event_id: LearningEventId, operation: &'static str, mutate: F) -> CoreResult<LearningEvent>
    where
        F: Fn(&mut LearningEvent) -> CoreResult<()>,
    {
        let mut retry = ConflictRetry::new(operation, self.config.max_conflict_retries);
        loop {
            let mut event = self.require_event(&event_id).await?;
            mutate(&mut event)?;
            match self
                .storage
                .commit(WriteBatch::single(Write::LearningEvent(event.clone())))
                .await
            {
                Ok(_) => {
                    event.version += 1;
                    return Ok(event);
                }
                Err(err) => retry.absorb(err).await?,
            }
        }
    }
}

fn type_label(event_type: LearningEventType) -> &'static str {
    match event_type {
        LearningEventType::ConceptLearned => "concept_learned",
        LearningEventType::RelationshipLearned => "relationship_learned",
        LearningEventType::PatternRecognized => "pattern_recognized",
        LearningEventType::RuleLearned => "rule_learned",
        LearningEventType::FeedbackIncorporated => "feedback_incorporated",
    }
}

fn status_label(status: LearningStatus) -> &'static str {
    match status {
        LearningStatus::Pending => "pending",
        LearningStatus::Validated => "validated",
        LearningStatus::Incorporated => "incorporated",
        LearningStatus::Rejected => "rejected",
    }
}
