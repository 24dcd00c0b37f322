//! Session lifecycle and message ordering

use pretty_assertions::assert_eq;
use serde_json::{json, Map};
use synapse_core::{
    CoreError, InstanceStatus, MessageDraft, MessageRole, ModelParameters, SessionOutcome, SessionStatus, ToolCall,
};
use synapse_tests::Fixture;
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn test_inactive_instance_cannot_open_sessions() {
    let fx = Fixture::new().await;
    let idle = fx
        .runtime
        .agents()
        .create_instance(fx.mode_id, "idle", ModelParameters::new("test-model"))
        .await
        .unwrap();

    let err = assert_err!(fx.runtime.sessions().open_session(idle, None).await);
    assert!(matches!(err, CoreError::InstanceNotActive(_)));

    fx.runtime
        .agents()
        .set_instance_status(fx.instance_id, InstanceStatus::Paused)
        .await
        .unwrap();
    let err = assert_err!(fx.runtime.sessions().open_session(fx.instance_id, None).await);
    assert!(matches!(err, CoreError::InstanceNotActive(_)));
}

#[tokio::test]
async fn test_messages_are_sequenced_from_one() {
    let fx = Fixture::new().await;
    let sessions = fx.runtime.sessions();
    let session_id = sessions.open_session(fx.instance_id, None).await.unwrap();

    sessions.append_text(session_id, MessageRole::User, "my order is late").await.unwrap();
    sessions
        .append_message(
            session_id,
            MessageRole::Assistant,
            MessageDraft::text("checking").with_tool_call(ToolCall {
                call_id: "c1".into(),
                tool: "order_lookup".into(),
                arguments: json!({"order": 42}),
            }),
        )
        .await
        .unwrap();
    sessions.append_text(session_id, MessageRole::Tool, "shipped yesterday").await.unwrap();

    let history = sessions.get_session_history(session_id).await.unwrap();
    let sequences: Vec<u64> = history.iter().map(|m| m.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
    assert_eq!(history[1].tool_calls[0].tool, "order_lookup");

    let session = sessions.get_session(session_id).await.unwrap().unwrap();
    assert_eq!(session.message_count, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_appends_have_no_gaps() {
    let fx = Fixture::new().await;
    let session_id = fx.runtime.sessions().open_session(fx.instance_id, None).await.unwrap();

    let mut handles = Vec::new();
    for writer in 0..10 {
        let runtime = fx.runtime.clone();
        handles.push(tokio::spawn(async move {
            for turn in 0..5 {
                let content = format!("writer {} turn {}", writer, turn);
                runtime
                    .sessions()
                    .append_text(session_id, MessageRole::User, &content)
                    .await?;
            }
            Ok::<_, CoreError>(())
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let history = fx.runtime.sessions().get_session_history(session_id).await.unwrap();
    let sequences: Vec<u64> = history.iter().map(|m| m.sequence).collect();
    assert_eq!(sequences, (1..=50).collect::<Vec<u64>>());

    let session = fx.runtime.sessions().get_session(session_id).await.unwrap().unwrap();
    assert_eq!(session.message_count, 50);
}

#[tokio::test]
async fn test_closed_session_rejects_messages() {
    let fx = Fixture::new().await;
    let sessions = fx.runtime.sessions();
    let session_id = sessions.open_session(fx.instance_id, None).await.unwrap();
    sessions.append_text(session_id, MessageRole::User, "hi").await.unwrap();

    let closed = sessions.close_session(session_id, SessionOutcome::Completed).await.unwrap();
    assert_eq!(closed.status, SessionStatus::Completed);
    assert!(closed.completed_at.is_some());

    let err = assert_err!(sessions.append_text(session_id, MessageRole::User, "still there?").await);
    assert!(matches!(err, CoreError::SessionClosed(_)));
    let err = assert_err!(sessions.close_session(session_id, SessionOutcome::Archived).await);
    assert!(matches!(err, CoreError::SessionClosed(_)));

    assert_eq!(sessions.get_session_history(session_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_paused_session_accepts_messages() {
    let fx = Fixture::new().await;
    let sessions = fx.runtime.sessions();
    let session_id = sessions.open_session(fx.instance_id, None).await.unwrap();

    let paused = sessions.pause_session(session_id).await.unwrap();
    assert_eq!(paused.status, SessionStatus::Paused);
    assert_ok!(sessions.append_text(session_id, MessageRole::User, "back soon").await);

    let resumed = sessions.resume_session(session_id).await.unwrap();
    assert_eq!(resumed.status, SessionStatus::Active);
}

#[tokio::test]
async fn test_context_feeds_evaluation_context() {
    let fx = Fixture::new().await;
    let sessions = fx.runtime.sessions();
    let mut initial = Map::new();
    initial.insert("customer_tier".into(), json!("gold"));
    let session_id = sessions.open_session(fx.instance_id, Some(initial)).await.unwrap();

    let mut patch = Map::new();
    patch.insert("topic".into(), json!("refund"));
    sessions.update_context(session_id, patch).await.unwrap();
    sessions.append_text(session_id, MessageRole::User, "refund please").await.unwrap();

    let (session, instance, context) = sessions.evaluation_context(session_id).await.unwrap();
    assert_eq!(session.id, session_id);
    assert_eq!(instance.id, fx.instance_id);
    assert_eq!(context["session"]["turn_count"], json!(1));
    assert_eq!(context["session"]["context"]["customer_tier"], json!("gold"));
    assert_eq!(context["session"]["context"]["topic"], json!("refund"));
    assert_eq!(context["instance"]["status"], json!("active"));
    assert_eq!(context["mode"]["name"], json!("support"));
    assert_eq!(context["mode"]["capabilities"], json!(["ticket_triage"]));
}

#[tokio::test]
async fn test_unknown_session_is_not_found() {
    let fx = Fixture::new().await;
    let err = assert_err!(
        fx.runtime
            .sessions()
            .append_text(synapse_core::SessionId::new_v4(), MessageRole::User, "hello")
            .await
    );
    assert!(matches!(err, CoreError::NotFound { .. }));
}
