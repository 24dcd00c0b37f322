use std::sync::Arc;
use synapse_monitoring::LogExt;

use crate::application::agent_registry::AgentRegistry;
use crate::application::graph_store::GraphStore;
use crate::application::learning_pipeline::LearningPipeline;
use crate::application::prompt_tracker::PromptTracker;
use crate::application::rule_engine::RuleEngine;
use crate::application::session_manager::SessionManager;
use crate::config::EngineConfig;
use crate::domain::identifiers::{InstanceId, SessionId};
use crate::domain::knowledge::{GraphView, OwnerScope};
use crate::domain::learning::LearningEvent;
use crate::domain::prompt::ModelProvider;
use crate::domain::repository::Storage;
use crate::domain::rule::Rule;
use crate::domain::session::Message;
use crate::{CoreError, CoreResult};

/// The engine's services wired over one storage backend and one model provider
#[derive(Clone)]
pub struct SynapseRuntime {
    config: Arc<EngineConfig>,
    agents: Arc<AgentRegistry>,
    graph: Arc<GraphStore>,
    sessions: Arc<SessionManager>,
    rules: Arc<RuleEngine>,
    prompts: Arc<PromptTracker>,
    learning: Arc<LearningPipeline>,
}

impl SynapseRuntime {
    /// Wire every service; fails if the configuration is invalid
    pub fn new(
        storage: Arc<dyn Storage>,
        provider: Arc<dyn ModelProvider>,
        config: EngineConfig,
    ) -> CoreResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let agents = Arc::new(AgentRegistry::new(Arc::clone(&storage), Arc::clone(&config)));
        let graph = Arc::new(GraphStore::new(Arc::clone(&storage), Arc::clone(&config)));
        let sessions = Arc::new(SessionManager::new(Arc::clone(&storage), Arc::clone(&config)));
        let rules = Arc::new(RuleEngine::new(
            Arc::clone(&storage),
            Arc::clone(&sessions),
            Arc::clone(&config),
        ));
        let prompts = Arc::new(PromptTracker::new(
            Arc::clone(&storage),
            provider,
            Arc::clone(&agents),
            Arc::clone(&sessions),
            Arc::clone(&config),
        ));
        let learning = Arc::new(LearningPipeline::new(storage, Arc::clone(&config)));

        tracing::info!("Synapse runtime initialized");
        Ok(Self {
            config,
            agents,
            graph,
            sessions,
            rules,
            prompts,
            learning,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    pub fn graph(&self) -> &GraphStore {
        &self.graph
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn rules(&self) -> &RuleEngine {
        &self.rules
    }

    pub fn prompts(&self) -> &PromptTracker {
        &self.prompts
    }

    pub fn learning(&self) -> &LearningPipeline {
        &self.learning
    }

    /// All nodes and edges owned by an instance
    pub async fn get_instance_knowledge_graph(&self, instance_id: InstanceId) -> CoreResult<GraphView> {
        if self.agents.get_instance(instance_id).await?.is_none() {
            return Err(CoreError::not_found("AgentInstance", instance_id));
        }
        self.graph
            .graph_view(OwnerScope::Instance(instance_id))
            .await
            .log_err("Failed to load instance knowledge graph")
    }

    /// Messages of a session in sequence order
    pub async fn get_session_history(&self, session_id: SessionId) -> CoreResult<Vec<Message>> {
        self.sessions
            .get_session_history(session_id)
            .await
            .log_err("Failed to load session history")
    }

    /// Active rules visible to a scope, in evaluation order
    pub async fn get_active_rules(&self, scope: OwnerScope) -> CoreResult<Vec<Rule>> {
        self.rules
            .get_active_rules(scope)
            .await
            .log_err("Failed to load active rules")
    }

    /// Learning events of an instance still awaiting validation
    pub async fn get_pending_learning_events(&self, instance_id: InstanceId) -> CoreResult<Vec<LearningEvent>> {
        self.learning
            .get_pending_learning_events(instance_id)
            .await
            .log_err("Failed to load pending learning events")
    }
}
