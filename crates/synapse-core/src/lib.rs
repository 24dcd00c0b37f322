//!
//! Synapse Core - knowledge graph and rule evaluation engine for agents
//!
//! This crate defines the domain model (modes, instances, sessions, graph,
//! rules, learning events, prompt executions), the storage interfaces it
//! persists through, and the application services that operate on them.

#![forbid(unsafe_code)]

/// Domain layer - entities, invariants and storage interfaces
pub mod domain;

/// Application services
pub mod application;

/// Engine configuration
pub mod config;

/// Error types
pub mod error;

pub use error::{CoreError, CoreResult, StorageError, StorageResult};

pub use application::agent_registry::AgentRegistry;
pub use application::graph_store::{GraphStore, NeighborQuery};
pub use application::learning_pipeline::LearningPipeline;
pub use application::prompt_tracker::{ExecutionRequest, PromptTracker};
pub use application::rule_engine::RuleEngine;
pub use application::runtime::SynapseRuntime;
pub use application::session_manager::SessionManager;
pub use config::EngineConfig;

pub use domain::agent::{AgentInstance, AgentMode, ExecutionOutcome, InstanceStatus, ModelParameters, PerformanceMetrics};
pub use domain::identifiers::{
    EdgeId, ExecutionId, InstanceId, LearningEventId, MessageId, ModeId, NodeId, RuleId, SessionId, TemplateId,
};
pub use domain::knowledge::{
    Evidence, GraphChanges, GraphView, KnowledgeEdge, KnowledgeNode, Neighbor, NodeType, OwnerScope, RelationType,
};
pub use domain::learning::{
    AppliedChanges, EdgeProposal, ImpactAssessment, LearningEvent, LearningEventDraft, LearningEventType,
    LearningPayload, LearningStatus, NodeKey, NodeProposal, RuleProposal, Validation,
};
pub use domain::prompt::{
    ExecutionStatus, LateResponse, ModelConfig, ModelError, ModelProvider, ModelResponse, PromptExecution,
    PromptTemplate,
};
pub use domain::repository::{
    AgentRepository, CommitReceipt, KnowledgeRepository, LearningRepository, PromptRepository, RuleRepository,
    SessionRepository, Storage, VectorIndex, Write, WriteBatch,
};
pub use domain::rule::{
    evaluate_rules, Condition, MatchedAction, Rule, RuleAction, RuleEvaluation, RuleOrigin, UnmetMandatoryRule,
};
pub use domain::session::{
    Attachment, Message, MessageDraft, MessageRole, Session, SessionOutcome, SessionStatus, TokenUsage, ToolCall,
    ToolResult,
};
