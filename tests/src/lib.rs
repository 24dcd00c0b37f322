//! Shared fixtures for the Synapse cross-crate tests

use async_trait::async_trait;
use mockall::mock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use synapse_core::{
    AgentMode, EngineConfig, InstanceId, InstanceStatus, ModeId, ModelConfig, ModelError, ModelParameters,
    ModelProvider, ModelResponse, SynapseRuntime, TokenUsage,
};
use synapse_state_inmemory::InMemoryStorage;

pub use synapse_monitoring::init_test_tracing;

mock! {
    pub Model {}

    #[async_trait]
    impl ModelProvider for Model {
        async fn invoke_model(&self, prompt: &str, config: &ModelConfig) -> Result<ModelResponse, ModelError>;
    }
}

/// Provider that answers every call the same way after a fixed delay
pub struct ScriptedProvider {
    delay: Duration,
    reply: Result<ModelResponse, ModelError>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn replying(text: &str, usage: TokenUsage) -> Self {
        Self {
            delay: Duration::ZERO,
            reply: Ok(ModelResponse {
                text: text.to_string(),
                usage,
                latency_ms: None,
            }),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            delay: Duration::ZERO,
            reply: Err(ModelError::Failed(message.to_string())),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    async fn invoke_model(&self, _prompt: &str, _config: &ModelConfig) -> Result<ModelResponse, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.reply.clone()
    }
}

/// A runtime over fresh in-memory storage with one active instance
pub struct Fixture {
    pub runtime: SynapseRuntime,
    pub storage: InMemoryStorage,
    pub mode_id: ModeId,
    pub instance_id: InstanceId,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_provider(Arc::new(ScriptedProvider::replying("ok", TokenUsage::new(1, 1)))).await
    }

    pub async fn with_provider(provider: Arc<dyn ModelProvider>) -> Self {
        Self::with_config(provider, EngineConfig::default()).await
    }

    pub async fn with_config(provider: Arc<dyn ModelProvider>, config: EngineConfig) -> Self {
        let storage = InMemoryStorage::new();
        let runtime = SynapseRuntime::new(Arc::new(storage.clone()), provider, config)
            .expect("valid engine configuration");

        let mode_id = runtime
            .agents()
            .create_mode(AgentMode::new("support").with_capability("ticket_triage"))
            .await
            .expect("mode created");
        let instance_id = runtime
            .agents()
            .create_instance(
                mode_id,
                "support-1",
                ModelParameters::new("test-model").with_pricing(1.0, 2.0),
            )
            .await
            .expect("instance created");
        runtime
            .agents()
            .set_instance_status(instance_id, InstanceStatus::Active)
            .await
            .expect("instance activated");

        Self {
            runtime,
            storage,
            mode_id,
            instance_id,
        }
    }
}
