//! Learning event validation and incorporation

use pretty_assertions::assert_eq;
use serde_json::{json, Map};
use std::sync::Arc;
use synapse_core::{
    Condition, CoreError, EngineConfig, ImpactAssessment, LearningEventDraft, LearningEventType, LearningPayload,
    LearningStatus, NodeKey, NodeType, OwnerScope, RelationType, RuleAction, RuleOrigin, RuleProposal, Validation,
};
use synapse_tests::{Fixture, ScriptedProvider};

fn draft(fx: &Fixture, event_type: LearningEventType, confidence: f64, payload: LearningPayload) -> LearningEventDraft {
    LearningEventDraft {
        instance_id: fx.instance_id,
        event_type,
        confidence,
        payload,
        impact: ImpactAssessment::default(),
        source_session: None,
    }
}

fn refunds_payload() -> LearningPayload {
    let mut properties = Map::new();
    properties.insert("window_days".into(), json!(30));
    LearningPayload::default()
        .with_node(NodeKey::new(NodeType::Concept, "refund"), properties)
        .with_node(NodeKey::new(NodeType::Concept, "receipt"), Map::new())
        .with_edge(
            NodeKey::new(NodeType::Concept, "refund"),
            NodeKey::new(NodeType::Concept, "receipt"),
            RelationType::DependsOn,
            0.5,
        )
}

#[tokio::test]
async fn test_confidence_threshold_decides_auto_validation() {
    let fx = Fixture::new().await;
    let learning = fx.runtime.learning();

    let low = learning
        .submit(draft(&fx, LearningEventType::ConceptLearned, 0.4, refunds_payload()))
        .await
        .unwrap();
    assert_eq!(low.status, LearningStatus::Pending);
    assert!(low.validation.is_none());

    let high = learning
        .submit(draft(&fx, LearningEventType::ConceptLearned, 0.9, refunds_payload()))
        .await
        .unwrap();
    assert_eq!(high.status, LearningStatus::Validated);
    assert_eq!(high.validation, Some(Validation::Automatic { threshold: 0.6 }));

    let pending = fx.runtime.get_pending_learning_events(fx.instance_id).await.unwrap();
    let ids: Vec<_> = pending.iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![low.id]);
}

#[tokio::test]
async fn test_configured_threshold_is_respected() {
    let mut config = EngineConfig::default();
    config.validation_thresholds.insert(LearningEventType::ConceptLearned, 0.95);
    let provider = Arc::new(ScriptedProvider::replying("ok", Default::default()));
    let fx = Fixture::with_config(provider, config).await;

    let event = fx
        .runtime
        .learning()
        .submit(draft(&fx, LearningEventType::ConceptLearned, 0.9, refunds_payload()))
        .await
        .unwrap();
    assert_eq!(event.status, LearningStatus::Pending);
}

#[tokio::test]
async fn test_submit_validates_input() {
    let fx = Fixture::new().await;
    let learning = fx.runtime.learning();

    let err = learning
        .submit(draft(&fx, LearningEventType::ConceptLearned, 1.2, refunds_payload()))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ValidationError(_)));

    let err = learning
        .submit(draft(&fx, LearningEventType::RuleLearned, 0.9, refunds_payload()))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ValidationError(_)));

    let mut orphan = draft(&fx, LearningEventType::ConceptLearned, 0.9, refunds_payload());
    orphan.instance_id = synapse_core::InstanceId::new_v4();
    let err = learning.submit(orphan).await.unwrap_err();
    assert!(matches!(err, CoreError::NotFound { .. }));
}

#[tokio::test]
async fn test_incorporate_writes_graph_once() {
    let fx = Fixture::new().await;
    let learning = fx.runtime.learning();
    let event = learning
        .submit(draft(&fx, LearningEventType::RelationshipLearned, 0.9, refunds_payload()))
        .await
        .unwrap();

    let applied = learning.incorporate(event.id).await.unwrap();
    assert_eq!(applied.node_ids.len(), 2);
    assert_eq!(applied.edge_ids.len(), 1);
    assert!(applied.rule_id.is_none());

    let again = learning.incorporate(event.id).await.unwrap();
    assert_eq!(again, applied);

    let graph = fx.runtime.get_instance_knowledge_graph(fx.instance_id).await.unwrap();
    assert_eq!(graph.nodes.len(), 2);
    assert_eq!(graph.edges.len(), 1);
    let edge = &graph.edges[0];
    assert!((edge.strength - 0.5).abs() < 1e-9);
    assert_eq!(edge.relation, RelationType::DependsOn);
    let source = format!("learning_event:{}", event.id);
    assert!(edge.evidence.iter().any(|e| e.source == source));

    let stored = learning.get_event(event.id).await.unwrap().unwrap();
    assert_eq!(stored.status, LearningStatus::Incorporated);
    assert!(stored.incorporated_at.is_some());
    assert_eq!(stored.applied, Some(applied));
}

#[tokio::test]
async fn test_incorporate_reinforces_existing_knowledge() {
    let fx = Fixture::new().await;
    let learning = fx.runtime.learning();
    let first = learning
        .submit(draft(&fx, LearningEventType::RelationshipLearned, 0.9, refunds_payload()))
        .await
        .unwrap();
    let second = learning
        .submit(draft(&fx, LearningEventType::RelationshipLearned, 0.9, refunds_payload()))
        .await
        .unwrap();

    let a = learning.incorporate(first.id).await.unwrap();
    let b = learning.incorporate(second.id).await.unwrap();
    assert_eq!(a.node_ids, b.node_ids);
    assert_eq!(a.edge_ids, b.edge_ids);

    let edge = fx.runtime.graph().get_edge(a.edge_ids[0]).await.unwrap().unwrap();
    assert!((edge.strength - 0.75).abs() < 1e-9);
    let refund = fx
        .runtime
        .graph()
        .find_node(OwnerScope::Instance(fx.instance_id), NodeType::Concept, "refund")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(refund.usage_count, 2);
}

#[tokio::test]
async fn test_edge_only_event_creates_missing_endpoints() {
    let fx = Fixture::new().await;
    let scope = OwnerScope::Instance(fx.instance_id);
    let existing = fx
        .runtime
        .graph()
        .upsert_node(scope, NodeType::Tool, "crm", Map::new())
        .await
        .unwrap();

    let payload = LearningPayload::default().with_edge(
        NodeKey::new(NodeType::Skill, "lookup customer"),
        NodeKey::new(NodeType::Tool, "crm"),
        RelationType::Uses,
        0.8,
    );
    let event = fx
        .runtime
        .learning()
        .submit(draft(&fx, LearningEventType::RelationshipLearned, 0.7, payload))
        .await
        .unwrap();
    let applied = fx.runtime.learning().incorporate(event.id).await.unwrap();
    assert_eq!(applied.node_ids.len(), 1);
    assert!(!applied.node_ids.contains(&existing));

    let created = fx.runtime.graph().get_node(applied.node_ids[0]).await.unwrap().unwrap();
    assert_eq!(created.name, "lookup customer");
    assert_eq!(created.confidence, fx.runtime.config().default_node_confidence);

    let edge = fx.runtime.graph().get_edge(applied.edge_ids[0]).await.unwrap().unwrap();
    assert_eq!(edge.from, created.id);
    assert_eq!(edge.to, existing);
}

#[tokio::test]
async fn test_only_validated_events_are_incorporated() {
    let fx = Fixture::new().await;
    let learning = fx.runtime.learning();
    let event = learning
        .submit(draft(&fx, LearningEventType::ConceptLearned, 0.3, refunds_payload()))
        .await
        .unwrap();

    let err = learning.incorporate(event.id).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidTransition(_)));
    assert!(fx
        .runtime
        .get_instance_knowledge_graph(fx.instance_id)
        .await
        .unwrap()
        .nodes
        .is_empty());

    let approved = learning.approve(event.id, "reviewer@example.com").await.unwrap();
    assert_eq!(approved.status, LearningStatus::Validated);
    assert_eq!(
        approved.validation,
        Some(Validation::Administrative {
            reviewer: "reviewer@example.com".to_string()
        })
    );
    assert!(learning.incorporate(event.id).await.is_ok());
}

#[tokio::test]
async fn test_rejected_events_stay_rejected() {
    let fx = Fixture::new().await;
    let learning = fx.runtime.learning();
    let event = learning
        .submit(draft(&fx, LearningEventType::ConceptLearned, 0.3, refunds_payload()))
        .await
        .unwrap();

    let rejected = learning.reject(event.id, "contradicts policy").await.unwrap();
    assert_eq!(rejected.status, LearningStatus::Rejected);
    assert_eq!(rejected.rejection_reason.as_deref(), Some("contradicts policy"));

    assert!(matches!(
        learning.incorporate(event.id).await,
        Err(CoreError::InvalidTransition(_))
    ));
    assert!(matches!(
        learning.approve(event.id, "admin").await,
        Err(CoreError::InvalidTransition(_))
    ));
    assert!(fx.runtime.get_pending_learning_events(fx.instance_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_learned_rule_starts_inactive() {
    let fx = Fixture::new().await;
    let payload = LearningPayload::default().with_rule(RuleProposal {
        name: "offer callback".to_string(),
        description: Some("learned from escalations".to_string()),
        condition: Condition::eq("session.context.channel", "phone"),
        action: RuleAction::InjectInstruction {
            text: "offer a callback".to_string(),
        },
        priority: 3,
        mandatory: false,
    });
    let event = fx
        .runtime
        .learning()
        .submit(draft(&fx, LearningEventType::RuleLearned, 0.85, payload))
        .await
        .unwrap();
    assert_eq!(event.status, LearningStatus::Validated);

    let applied = fx.runtime.learning().incorporate(event.id).await.unwrap();
    let rule_id = applied.rule_id.expect("rule created");
    let rule = fx.runtime.rules().get_rule(rule_id).await.unwrap().unwrap();
    assert!(!rule.active);
    assert_eq!(rule.scope, OwnerScope::Instance(fx.instance_id));
    assert_eq!(rule.origin, RuleOrigin::Learned { event_id: event.id });

    let scope = OwnerScope::Instance(fx.instance_id);
    assert!(fx.runtime.get_active_rules(scope).await.unwrap().is_empty());
    fx.runtime.rules().set_rule_active(rule_id, true).await.unwrap();
    assert_eq!(fx.runtime.get_active_rules(scope).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_storage_outage_leaves_event_validated() {
    let fx = Fixture::new().await;
    let learning = fx.runtime.learning();
    let event = learning
        .submit(draft(&fx, LearningEventType::ConceptLearned, 0.9, refunds_payload()))
        .await
        .unwrap();

    fx.storage.set_available(false);
    let err = learning.incorporate(event.id).await.unwrap_err();
    assert!(matches!(err, CoreError::StorageUnavailable(_)));
    assert!(err.is_retryable());
    fx.storage.set_available(true);

    let stored = learning.get_event(event.id).await.unwrap().unwrap();
    assert_eq!(stored.status, LearningStatus::Validated);
    assert!(fx
        .runtime
        .get_instance_knowledge_graph(fx.instance_id)
        .await
        .unwrap()
        .nodes
        .is_empty());

    assert!(learning.incorporate(event.id).await.is_ok());
}
