//! Runtime wiring, agent registry and the read-only query surface

use pretty_assertions::assert_eq;
use serde_json::{json, Map};
use std::sync::Arc;
use synapse_core::{
    AgentMode, CoreError, EngineConfig, InstanceId, InstanceStatus, MessageRole, ModelParameters, NodeType,
    OwnerScope, SessionId, SynapseRuntime,
};
use synapse_state_inmemory::InMemoryStorage;
use synapse_tests::{Fixture, ScriptedProvider};

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let config = EngineConfig {
        default_prompt_timeout_ms: 0,
        ..EngineConfig::default()
    };
    let result = SynapseRuntime::new(
        Arc::new(InMemoryStorage::new()),
        Arc::new(ScriptedProvider::replying("ok", Default::default())),
        config,
    );
    assert!(matches!(result, Err(CoreError::ConfigurationError(_))));
}

#[tokio::test]
async fn test_instance_inherits_mode_defaults() {
    let fx = Fixture::new().await;
    let agents = fx.runtime.agents();
    let mut mode = AgentMode::new("research").with_capability("web_search");
    mode.default_config = json!({"max_sources": 5});
    let mode_id = agents.create_mode(mode).await.unwrap();

    let instance_id = agents
        .create_instance(mode_id, "researcher", ModelParameters::new("test-model"))
        .await
        .unwrap();
    let instance = agents.get_instance(instance_id).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Inactive);
    assert_eq!(instance.config, json!({"max_sources": 5}));

    let listed = agents.list_instances(Some(mode_id)).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(agents.list_instances(None).await.unwrap().len(), 2);

    let modes: Vec<String> = agents.list_modes().await.unwrap().into_iter().map(|m| m.name).collect();
    assert_eq!(modes, vec!["research".to_string(), "support".to_string()]);
}

#[tokio::test]
async fn test_instance_lifecycle_is_enforced() {
    let fx = Fixture::new().await;
    let agents = fx.runtime.agents();
    let instance_id = agents
        .create_instance(fx.mode_id, "fresh", ModelParameters::new("test-model"))
        .await
        .unwrap();

    let err = agents
        .set_instance_status(instance_id, InstanceStatus::Busy)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidTransition(_)));

    let active = agents.set_instance_status(instance_id, InstanceStatus::Active).await.unwrap();
    assert_eq!(active.status, InstanceStatus::Active);

    let tooled = agents
        .set_instance_tools(instance_id, vec!["crm".into()], vec!["billing-api".into()])
        .await
        .unwrap();
    assert_eq!(tooled.tool_ids, vec!["crm".to_string()]);

    let renamed = agents
        .update_mode(fx.mode_id, |mode| mode.description = Some("first line support".into()))
        .await
        .unwrap();
    assert_eq!(renamed.description.as_deref(), Some("first line support"));
}

#[tokio::test]
async fn test_query_surface() {
    let fx = Fixture::new().await;
    let scope = OwnerScope::Instance(fx.instance_id);
    fx.runtime
        .graph()
        .upsert_node(scope, NodeType::Entity, "acme corp", Map::new())
        .await
        .unwrap();
    fx.runtime
        .graph()
        .upsert_node(OwnerScope::Mode(fx.mode_id), NodeType::Concept, "shared", Map::new())
        .await
        .unwrap();

    let graph = fx.runtime.get_instance_knowledge_graph(fx.instance_id).await.unwrap();
    let names: Vec<&str> = graph.nodes.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(names, vec!["acme corp"]);

    let session_id = fx.runtime.sessions().open_session(fx.instance_id, None).await.unwrap();
    fx.runtime
        .sessions()
        .append_text(session_id, MessageRole::User, "hello")
        .await
        .unwrap();
    let history = fx.runtime.get_session_history(session_id).await.unwrap();
    assert_eq!(history.len(), 1);

    assert!(fx.runtime.get_active_rules(scope).await.unwrap().is_empty());
    assert!(fx.runtime.get_pending_learning_events(fx.instance_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_query_surface_unknown_ids() {
    let fx = Fixture::new().await;
    assert!(matches!(
        fx.runtime.get_instance_knowledge_graph(InstanceId::new_v4()).await,
        Err(CoreError::NotFound { .. })
    ));
    assert!(matches!(
        fx.runtime.get_session_history(SessionId::new_v4()).await,
        Err(CoreError::NotFound { .. })
    ));
    assert!(matches!(
        fx.runtime.get_active_rules(OwnerScope::Instance(InstanceId::new_v4())).await,
        Err(CoreError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_storage_outage_surfaces_as_unavailable() {
    let fx = Fixture::new().await;
    fx.storage.set_available(false);

    let err = fx.runtime.sessions().open_session(fx.instance_id, None).await.unwrap_err();
    assert!(matches!(err, CoreError::StorageUnavailable(_)));
    let err = fx
        .runtime
        .get_instance_knowledge_graph(fx.instance_id)
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    fx.storage.set_available(true);
    assert!(fx.runtime.sessions().list_sessions(fx.instance_id).await.unwrap().is_empty());
}
