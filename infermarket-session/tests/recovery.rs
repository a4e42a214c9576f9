//! Integration tests for host session loss and recovery.

use futures::StreamExt;
use infermarket_session::{PromptOptions, ReplyFragment, SessionError, SessionStatus};
use infermarket_test_fixtures::{Harness, HostFault};

#[tokio::test]
async fn test_single_recovery_is_transparent() {
    let h = Harness::new();
    let session = h.start().await.unwrap();
    let original = session.id();

    h.host.inject(HostFault::ForgetSession);
    let reply = h
        .engine
        .send_prompt(&session, "are you there", PromptOptions::default())
        .await
        .unwrap();
    assert_eq!(reply.text, "Hello, world");

    assert_eq!(session.status(), SessionStatus::Active);
    assert_ne!(session.id(), original);
    assert_eq!(session.original_id(), original);
    assert_eq!(h.ledger.deposits(), 2);
    assert_eq!(h.host.handshakes(), 2);
    assert_eq!(h.discovery.lookups(), 2);

    // Same prompt, fresh binding, fresh indexes.
    let requests = h.host.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].session_id, original);
    assert_eq!(requests[1].session_id, session.id());
    assert_eq!(requests[1].prompt(), "are you there");
    assert_eq!(requests[1].nonce_index, 0);

    assert!(h.engine.session(&session.id()).await.is_some());
    assert!(h.engine.session(&original).await.is_none());

    session.wait_idle().await;
    let info = h.engine.session_info(&session);
    assert_eq!(info.recoveries, 1);
    assert_eq!(info.session_id, session.id());
    assert_eq!(info.original_session_id, original);
}

#[tokio::test]
async fn test_second_loss_is_fatal() {
    let h = Harness::new();
    let session = h.start().await.unwrap();

    h.host.inject(HostFault::ForgetSession);
    h.host.inject(HostFault::ForgetSession);
    let err = h
        .engine
        .send_prompt(&session, "hello?", PromptOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err.into_root(), SessionError::SessionNotFound { .. }));
    assert_eq!(session.status(), SessionStatus::Failed);
    assert_eq!(h.ledger.deposits(), 2);

    let err = h
        .engine
        .send_prompt(&session, "anyone?", PromptOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::SessionNotActive {
            status: SessionStatus::Failed,
            ..
        }
    ));
}

#[tokio::test]
async fn test_recovery_budget_is_per_operation() {
    let h = Harness::new();
    let session = h.start().await.unwrap();

    for round in 1..=2u32 {
        h.host.inject(HostFault::ForgetSession);
        h.engine
            .send_prompt(&session, "again", PromptOptions::default())
            .await
            .unwrap();
        session.wait_idle().await;
        assert_eq!(h.engine.session_info(&session).recoveries, round);
    }
    assert_eq!(session.status(), SessionStatus::Active);
}

#[tokio::test]
async fn test_loss_mid_reply_is_not_replayed() {
    let h = Harness::new();
    let session = h.start().await.unwrap();
    let original = session.id();

    h.host.inject(HostFault::ForgetMidReply);
    let mut stream = h
        .engine
        .send_prompt_streaming(&session, "tell me", PromptOptions::default())
        .await
        .unwrap();

    match stream.next().await {
        Some(Ok(ReplyFragment::Text { content, .. })) => assert_eq!(content, "Hello"),
        other => panic!("expected first fragment, got {:?}", other),
    }
    match stream.next().await {
        Some(Err(err)) => match err.into_root() {
            SessionError::SessionNotFound { session_id, reason } => {
                assert_eq!(session_id, original);
                assert!(reason.contains("retry"));
            }
            other => panic!("expected SessionNotFound, got {:?}", other),
        },
        other => panic!("expected an error, got {:?}", other),
    }
    assert!(stream.next().await.is_none());

    // The session itself recovered and keeps working.
    assert_eq!(session.status(), SessionStatus::Active);
    assert_ne!(session.id(), original);
    assert_eq!(h.host.requests().len(), 1);

    let reply = h
        .engine
        .send_prompt(&session, "tell me", PromptOptions::default())
        .await
        .unwrap();
    assert_eq!(reply.text, "Hello, world");

    session.wait_idle().await;
    // One token from the cut reply plus three from the retry.
    assert_eq!(h.engine.session_info(&session).tokens_used_total, 4);
}

#[tokio::test]
async fn test_recovery_failure_fails_session() {
    let h = Harness::new();
    let session = h.start().await.unwrap();

    h.host.inject(HostFault::ForgetSession);
    h.host.inject(HostFault::Unreachable);
    let err = h
        .engine
        .send_prompt(&session, "hello", PromptOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err.into_root(), SessionError::HostUnreachable(_)));
    assert_eq!(session.status(), SessionStatus::Failed);
}

#[tokio::test]
async fn test_host_hangup_fails_session() {
    let h = Harness::new();
    let session = h.start().await.unwrap();

    h.host.inject(HostFault::Hangup);
    let err = h
        .engine
        .send_prompt(&session, "hello", PromptOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err.into_root(), SessionError::Transport(_)));
    assert_eq!(session.status(), SessionStatus::Failed);
}
