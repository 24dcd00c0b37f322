//! Learning events: proposed graph/rule changes and their validation state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::identifiers::{EdgeId, InstanceId, LearningEventId, NodeId, RuleId, SessionId};
use super::knowledge::{ensure_unit_interval, Evidence, NodeType, RelationType};
use super::rule::{Condition, RuleAction};
use crate::CoreError;

/// Kind of change an event proposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningEventType {
    ConceptLearned,
    RelationshipLearned,
    PatternRecognized,
    RuleLearned,
    FeedbackIncorporated,
}

/// Validation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningStatus {
    Pending,
    Validated,
    Incorporated,
    Rejected,
}

/// How an event got validated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum Validation {
    /// Confidence met the type's threshold
    Automatic { threshold: f64 },
    /// Explicit administrative approval
    Administrative { reviewer: String },
}

/// Node named by type and name within the event's scope
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeKey {
    pub node_type: NodeType,
    pub name: String,
}

impl NodeKey {
    pub fn new(node_type: NodeType, name: impl Into<String>) -> Self {
        Self { node_type, name: name.into() }
    }
}

/// Node to upsert on incorporation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeProposal {
    pub key: NodeKey,
    #[serde(default)]
    pub properties: Map<String, Value>,
    /// Confidence for a newly created node; defaults to the event confidence
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// Edge to create or strengthen on incorporation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeProposal {
    pub from: NodeKey,
    pub to: NodeKey,
    pub relation: RelationType,
    pub delta_strength: f64,
    #[serde(default)]
    pub evidence: Vec<Evidence>,
}

/// Rule to create (inactive) on incorporation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleProposal {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub condition: Condition,
    pub action: RuleAction,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub mandatory: bool,
}

/// The change an event carries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LearningPayload {
    #[serde(default)]
    pub nodes: Vec<NodeProposal>,
    #[serde(default)]
    pub edges: Vec<EdgeProposal>,
    #[serde(default)]
    pub rule: Option<RuleProposal>,
}

impl LearningPayload {
    pub fn with_node(mut self, key: NodeKey, properties: Map<String, Value>) -> Self {
        self.nodes.push(NodeProposal { key, properties, confidence: None });
        self
    }

    pub fn with_edge(mut self, from: NodeKey, to: NodeKey, relation: RelationType, delta_strength: f64) -> Self {
        self.edges.push(EdgeProposal {
            from,
            to,
            relation,
            delta_strength,
            evidence: Vec::new(),
        });
        self
    }

    pub fn with_rule(mut self, rule: RuleProposal) -> Self {
        self.rule = Some(rule);
        self
    }

    /// Range-check scores and edge endpoints
    pub fn validate(&self, event_type: LearningEventType) -> Result<(), CoreError> {
        for node in &self.nodes {
            if node.key.name.trim().is_empty() {
                return Err(CoreError::ValidationError("node name must not be empty".into()));
            }
            if let Some(confidence) = node.confidence {
                ensure_unit_interval("node confidence", confidence)?;
            }
        }
        for edge in &self.edges {
            ensure_unit_interval("delta strength", edge.delta_strength)?;
            if edge.from == edge.to {
                return Err(CoreError::InvalidEdgeScope(format!(
                    "edge proposal loops on {:?} '{}'",
                    edge.from.node_type, edge.from.name
                )));
            }
        }
        if event_type == LearningEventType::RuleLearned && self.rule.is_none() {
            return Err(CoreError::ValidationError(
                "rule_learned events must carry a rule proposal".into(),
            ));
        }
        Ok(())
    }
}

/// Expected effect of applying an event, kept for audit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImpactAssessment {
    #[serde(default)]
    pub summary: String,
    /// Estimated blast radius in [0, 1]
    #[serde(default)]
    pub risk: f64,
    #[serde(default)]
    pub affected_nodes: usize,
    #[serde(default)]
    pub details: Value,
}

/// What incorporation wrote
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppliedChanges {
    pub node_ids: Vec<NodeId>,
    pub edge_ids: Vec<EdgeId>,
    #[serde(default)]
    pub rule_id: Option<RuleId>,
}

/// Caller input to the learning pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningEventDraft {
    pub instance_id: InstanceId,
    pub event_type: LearningEventType,
    pub confidence: f64,
    pub payload: LearningPayload,
    #[serde(default)]
    pub impact: ImpactAssessment,
    #[serde(default)]
    pub source_session: Option<SessionId>,
}

/// One proposed change to the graph or rule set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningEvent {
    pub id: LearningEventId,
    pub instance_id: InstanceId,
    pub event_type: LearningEventType,
    pub confidence: f64,
    pub payload: LearningPayload,
    pub impact: ImpactAssessment,
    #[serde(default)]
    pub source_session: Option<SessionId>,
    pub status: LearningStatus,
    #[serde(default)]
    pub validation: Option<Validation>,
    #[serde(default)]
    pub rejection_reason: Option<String>,
    #[serde(default)]
    pub applied: Option<AppliedChanges>,
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub validated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub incorporated_at: Option<DateTime<Utc>>,
}

impl LearningEvent {
    /// Create a pending event from a draft
    pub fn from_draft(draft: LearningEventDraft) -> Self {
        let now = Utc::now();
        Self {
            id: LearningEventId::new_v4(),
            instance_id: draft.instance_id,
            event_type: draft.event_type,
            confidence: draft.confidence,
            payload: draft.payload,
            impact: draft.impact,
            source_session: draft.source_session,
            status: LearningStatus::Pending,
            validation: None,
            rejection_reason: None,
            applied: None,
            version: 0,
            created_at: now,
            updated_at: now,
            validated_at: None,
            incorporated_at: None,
        }
    }

    fn require(&self, expected: LearningStatus, target: LearningStatus) -> Result<(), CoreError> {
        if self.status == expected {
            Ok(())
        } else {
            Err(CoreError::InvalidTransition(format!(
                "learning event {} cannot move from {:?} to {:?}",
                self.id, self.status, target
            )))
        }
    }

    /// pending -> validated
    pub fn validate(&mut self, validation: Validation) -> Result<(), CoreError> {
        self.require(LearningStatus::Pending, LearningStatus::Validated)?;
        let now = Utc::now();
        self.status = LearningStatus::Validated;
        self.validation = Some(validation);
        self.validated_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// pending -> rejected; the impact assessment is kept
    pub fn reject(&mut self, reason: impl Into<String>) -> Result<(), CoreError> {
        self.require(LearningStatus::Pending, LearningStatus::Rejected)?;
        self.status = LearningStatus::Rejected;
        self.rejection_reason = Some(reason.into());
        self.updated_at = Utc::now();
        Ok(())
    }

    /// validated -> incorporated
    pub fn mark_incorporated(&mut self, applied: AppliedChanges) -> Result<(), CoreError> {
        self.require(LearningStatus::Validated, LearningStatus::Incorporated)?;
        let now = Utc::now();
        self.status = LearningStatus::Incorporated;
        self.applied = Some(applied);
        self.incorporated_at = Some(now);
        self.updated_at = now;
        Ok(())
    }
}
