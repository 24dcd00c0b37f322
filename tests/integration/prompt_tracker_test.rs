//! Prompt execution accounting, including late responses

use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use synapse_core::{
    CoreError, ExecutionRequest, ExecutionStatus, MessageRole, ModelError, ModelResponse, PromptTemplate,
    SessionOutcome, SessionStatus, TokenUsage,
};
use synapse_tests::{Fixture, MockModel, ScriptedProvider};

fn summary_template() -> PromptTemplate {
    PromptTemplate::new("summarize", "Summarize for {{ customer }}: {{topic}}").requiring("customer")
}

#[tokio::test]
async fn test_success_updates_session_and_instance() {
    let mut model = MockModel::new();
    model
        .expect_invoke_model()
        .withf(|prompt, config| prompt == "Summarize for Ada: billing" && config.model == "test-model")
        .times(1)
        .returning(|_, _| {
            Ok(ModelResponse {
                text: "Ada was double charged".to_string(),
                usage: TokenUsage::new(1000, 500),
                latency_ms: Some(12),
            })
        });
    let fx = Fixture::with_provider(Arc::new(model)).await;
    let template_id = fx.runtime.prompts().register_template(summary_template()).await.unwrap();
    let session_id = fx.runtime.sessions().open_session(fx.instance_id, None).await.unwrap();

    let execution = fx
        .runtime
        .prompts()
        .execute(
            ExecutionRequest::new(template_id, fx.instance_id)
                .in_session(session_id)
                .variable("customer", "Ada")
                .variable("topic", "billing"),
        )
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Success);
    assert_eq!(execution.response_text().unwrap(), "Ada was double charged");
    assert_eq!(execution.rendered_prompt, "Summarize for Ada: billing");
    // pricing is 1.0 per 1k prompt tokens and 2.0 per 1k completion tokens
    assert!((execution.cost - 2.0).abs() < 1e-9);

    let session = fx.runtime.sessions().get_session(session_id).await.unwrap().unwrap();
    assert_eq!(session.token_usage.total(), 1500);
    assert!((session.total_cost - 2.0).abs() < 1e-9);

    let instance = fx.runtime.agents().get_instance(fx.instance_id).await.unwrap().unwrap();
    assert_eq!(instance.metrics.executions, 1);
    assert_eq!(instance.metrics.successes, 1);
    assert_eq!(instance.metrics.total_tokens, 1500);

    let recorded = fx.runtime.prompts().list_executions(session_id).await.unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].id, execution.id);
}

#[tokio::test]
async fn test_missing_variable_records_nothing() {
    let mut model = MockModel::new();
    model.expect_invoke_model().never();
    let fx = Fixture::with_provider(Arc::new(model)).await;
    let template_id = fx.runtime.prompts().register_template(summary_template()).await.unwrap();
    let session_id = fx.runtime.sessions().open_session(fx.instance_id, None).await.unwrap();

    let err = fx
        .runtime
        .prompts()
        .execute(
            ExecutionRequest::new(template_id, fx.instance_id)
                .in_session(session_id)
                .variable("topic", "billing"),
        )
        .await
        .unwrap_err();
    assert_eq!(err, CoreError::MissingVariable("customer".to_string()));

    assert!(fx.runtime.prompts().list_executions(session_id).await.unwrap().is_empty());
    let instance = fx.runtime.agents().get_instance(fx.instance_id).await.unwrap().unwrap();
    assert_eq!(instance.metrics.executions, 0);
}

#[tokio::test]
async fn test_model_failure_is_recorded_not_raised() {
    let provider = Arc::new(ScriptedProvider::failing("rate limited"));
    let fx = Fixture::with_provider(provider.clone()).await;
    let template_id = fx
        .runtime
        .prompts()
        .register_template(PromptTemplate::new("ping", "ping"))
        .await
        .unwrap();
    let session_id = fx.runtime.sessions().open_session(fx.instance_id, None).await.unwrap();

    let execution = fx
        .runtime
        .prompts()
        .execute(ExecutionRequest::new(template_id, fx.instance_id).in_session(session_id))
        .await
        .unwrap();

    assert_eq!(provider.calls(), 1);
    assert_eq!(execution.status, ExecutionStatus::Error);
    assert!(execution.error.as_deref().unwrap_or_default().contains("rate limited"));
    assert!(matches!(execution.response_text(), Err(CoreError::ExternalError(_))));

    let session = fx.runtime.sessions().get_session(session_id).await.unwrap().unwrap();
    assert_eq!(session.token_usage.total(), 0);
    let instance = fx.runtime.agents().get_instance(fx.instance_id).await.unwrap().unwrap();
    assert_eq!(instance.metrics.errors, 1);
}

#[tokio::test]
async fn test_provider_timeout_maps_to_timeout_status() {
    let mut model = MockModel::new();
    model.expect_invoke_model().returning(|_, _| Err(ModelError::Timeout));
    let fx = Fixture::with_provider(Arc::new(model)).await;
    let template_id = fx
        .runtime
        .prompts()
        .register_template(PromptTemplate::new("ping", "ping"))
        .await
        .unwrap();

    let execution = fx
        .runtime
        .prompts()
        .execute(ExecutionRequest::new(template_id, fx.instance_id))
        .await
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Timeout);
    assert!(matches!(execution.response_text(), Err(CoreError::ExternalTimeout(_))));
}

#[tokio::test(start_paused = true)]
async fn test_late_response_only_touches_the_execution() {
    let provider = Arc::new(
        ScriptedProvider::replying("finally", TokenUsage::new(400, 100)).after(Duration::from_secs(31)),
    );
    let fx = Fixture::with_provider(provider).await;
    let template_id = fx
        .runtime
        .prompts()
        .register_template(PromptTemplate::new("slow", "take your time"))
        .await
        .unwrap();
    let session_id = fx.runtime.sessions().open_session(fx.instance_id, None).await.unwrap();

    let execution = fx
        .runtime
        .prompts()
        .execute(
            ExecutionRequest::new(template_id, fx.instance_id)
                .in_session(session_id)
                .timeout(Duration::from_secs(30)),
        )
        .await
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Timeout);
    assert!(execution.late_response.is_none());
    assert_eq!(execution.timeout_ms, 30_000);

    // let the model answer at 31s and the detached capture task record it
    tokio::time::sleep(Duration::from_secs(5)).await;

    let stored = fx.runtime.prompts().get_execution(execution.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExecutionStatus::Timeout);
    assert_eq!(stored.usage, TokenUsage::default());
    let late = stored.late_response.expect("late response recorded");
    assert_eq!(late.text.as_deref(), Some("finally"));
    assert_eq!(late.usage.total(), 500);

    let session = fx.runtime.sessions().get_session(session_id).await.unwrap().unwrap();
    assert_eq!(session.token_usage.total(), 0);
    assert_eq!(session.total_cost, 0.0);

    let instance = fx.runtime.agents().get_instance(fx.instance_id).await.unwrap().unwrap();
    assert_eq!(instance.metrics.executions, 1);
    assert_eq!(instance.metrics.timeouts, 1);
    assert_eq!(instance.metrics.total_tokens, 0);
}

#[tokio::test(start_paused = true)]
async fn test_late_response_is_dropped_after_grace() {
    let provider = Arc::new(
        ScriptedProvider::replying("too late", TokenUsage::new(1, 1)).after(Duration::from_secs(600)),
    );
    let fx = Fixture::with_provider(provider).await;
    let template_id = fx
        .runtime
        .prompts()
        .register_template(PromptTemplate::new("slow", "take your time"))
        .await
        .unwrap();

    let execution = fx
        .runtime
        .prompts()
        .execute(ExecutionRequest::new(template_id, fx.instance_id))
        .await
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Timeout);
    assert_eq!(execution.timeout_ms, 30_000);

    // default grace is 60s; the answer would arrive at 600s
    tokio::time::sleep(Duration::from_secs(900)).await;
    let stored = fx.runtime.prompts().get_execution(execution.id).await.unwrap().unwrap();
    assert!(stored.late_response.is_none());
}

#[tokio::test]
async fn test_closed_session_gets_no_usage() {
    let fx = Fixture::new().await;
    let template_id = fx
        .runtime
        .prompts()
        .register_template(PromptTemplate::new("ping", "ping"))
        .await
        .unwrap();
    let session_id = fx.runtime.sessions().open_session(fx.instance_id, None).await.unwrap();
    fx.runtime
        .sessions()
        .append_text(session_id, MessageRole::User, "bye")
        .await
        .unwrap();
    fx.runtime
        .sessions()
        .close_session(session_id, SessionOutcome::Completed)
        .await
        .unwrap();

    let execution = fx
        .runtime
        .prompts()
        .execute(ExecutionRequest::new(template_id, fx.instance_id).in_session(session_id))
        .await
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Success);

    let session = fx.runtime.sessions().get_session(session_id).await.unwrap().unwrap();
    assert_eq!(session.token_usage.total(), 0);
}

#[tokio::test]
async fn test_session_of_other_instance_is_rejected() {
    let fx = Fixture::new().await;
    let other = fx
        .runtime
        .agents()
        .create_instance(fx.mode_id, "support-2", synapse_core::ModelParameters::new("test-model"))
        .await
        .unwrap();
    let template_id = fx
        .runtime
        .prompts()
        .register_template(PromptTemplate::new("ping", "ping"))
        .await
        .unwrap();
    let session_id = fx.runtime.sessions().open_session(fx.instance_id, None).await.unwrap();

    let err = fx
        .runtime
        .prompts()
        .execute(ExecutionRequest::new(template_id, other).in_session(session_id))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ValidationError(_)));
}

#[tokio::test]
async fn test_huge_token_counts_saturate() {
    let provider = Arc::new(ScriptedProvider::replying("verbose", TokenUsage::new(u64::MAX, 1)));
    let fx = Fixture::with_provider(provider).await;
    let template_id = fx
        .runtime
        .prompts()
        .register_template(PromptTemplate::new("ping", "ping"))
        .await
        .unwrap();
    let session_id = fx.runtime.sessions().open_session(fx.instance_id, None).await.unwrap();

    let execution = fx
        .runtime
        .prompts()
        .execute(ExecutionRequest::new(template_id, fx.instance_id).in_session(session_id))
        .await
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Success);
    assert_eq!(execution.usage.total(), u64::MAX);

    let session = fx.runtime.sessions().get_session(session_id).await.unwrap().unwrap();
    assert_eq!(session.token_usage.total(), u64::MAX);
    let instance = fx.runtime.agents().get_instance(fx.instance_id).await.unwrap().unwrap();
    assert_eq!(instance.metrics.executions, 1);
    assert_eq!(instance.metrics.successes, 1);
    assert_eq!(instance.metrics.total_tokens, u64::MAX);
}

#[tokio::test(start_paused = true)]
async fn test_close_does_not_wait_for_in_flight_execution() {
    let provider = Arc::new(
        ScriptedProvider::replying("done", TokenUsage::new(300, 200)).after(Duration::from_secs(10)),
    );
    let fx = Fixture::with_provider(provider).await;
    let template_id = fx
        .runtime
        .prompts()
        .register_template(PromptTemplate::new("slow", "take your time"))
        .await
        .unwrap();
    let session_id = fx.runtime.sessions().open_session(fx.instance_id, None).await.unwrap();

    let runtime = fx.runtime.clone();
    let instance_id = fx.instance_id;
    let in_flight = tokio::spawn(async move {
        runtime
            .prompts()
            .execute(ExecutionRequest::new(template_id, instance_id).in_session(session_id))
            .await
    });

    // the model call is now sleeping
    tokio::time::sleep(Duration::from_secs(1)).await;
    let closed = fx
        .runtime
        .sessions()
        .close_session(session_id, SessionOutcome::Completed)
        .await
        .unwrap();
    assert_eq!(closed.status, SessionStatus::Completed);
    assert!(!in_flight.is_finished());

    let execution = in_flight.await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Success);
    assert_eq!(execution.usage.total(), 500);

    let session = fx.runtime.sessions().get_session(session_id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.token_usage.total(), 0);
    assert_eq!(session.total_cost, 0.0);

    let instance = fx.runtime.agents().get_instance(fx.instance_id).await.unwrap().unwrap();
    assert_eq!(instance.metrics.successes, 1);
    assert_eq!(instance.metrics.total_tokens, 500);
}
