//! Integration tests for session start, completion and expiry.

use std::time::Duration;

use futures::StreamExt;
use infermarket_session::{EngineConfig, PromptOptions, SessionError, SessionStatus};
use infermarket_test_fixtures::{economics, fast_config, Harness, HostFault, LedgerFault};

// === Start ===

#[tokio::test]
async fn test_start_send_and_settle() {
    let h = Harness::new();
    h.host.set_text_reply(&[("a", 60), ("b", 90)]);

    let session = h.start().await.unwrap();
    assert_eq!(session.status(), SessionStatus::Active);
    assert_eq!(session.id(), session.original_id());

    let reply = h
        .engine
        .send_prompt(&session, "Tell me a story", PromptOptions::default())
        .await
        .unwrap();
    assert_eq!(reply.text, "ab");
    assert_eq!(reply.tokens, 150);
    assert_eq!(reply.finish_reason.as_deref(), Some("stop"));

    session.wait_idle().await;
    let info = h.engine.session_info(&session);
    assert_eq!(info.tokens_used_total, 150);
    assert_eq!(info.settled_tokens, 150);
    assert_eq!(info.last_checkpoint_number, 1);
    assert_eq!(info.send_index, 1);
    assert_eq!(info.recv_index, 3);

    let receipt = h.engine.end_session(&session).await.unwrap();
    assert!(!receipt.zero_cost);
    assert_eq!(receipt.total_tokens, 150);
    assert_eq!(receipt.settled_tokens, 150);
    assert_eq!(receipt.settled_amount, 1_500);
    assert_eq!(session.status(), SessionStatus::Completed);

    let escrow = h.ledger.escrow(&session.id()).unwrap();
    assert!(escrow.completed);
    assert_eq!(escrow.settled_tokens(), 150);
}

#[tokio::test]
async fn test_invalid_economics_rejected_before_deposit() {
    let h = Harness::new();

    let mut zero_price = economics();
    zero_price.price_per_token = 0;
    let err = h.start_with(zero_price).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SessionError>(),
        Some(SessionError::ValidationFailed(_))
    ));

    let mut thin_deposit = economics();
    thin_deposit.deposit_amount = 999;
    let err = h.start_with(thin_deposit).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SessionError>(),
        Some(SessionError::ValidationFailed(_))
    ));

    assert_eq!(h.ledger.deposits(), 0);
}

#[tokio::test]
async fn test_insufficient_funds() {
    let h = Harness::new();
    h.ledger.inject(LedgerFault::InsufficientFunds);

    let err = h.start().await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SessionError>(),
        Some(SessionError::InsufficientFunds(_))
    ));
    assert_eq!(h.host.connections(), 0);
}

#[tokio::test]
async fn test_no_host_for_model() {
    let h = Harness::new();
    h.discovery.withdraw();

    let err = h.start().await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SessionError>(),
        Some(SessionError::HostUnreachable(_))
    ));
    assert_eq!(h.ledger.deposits(), 0);
}

#[tokio::test]
async fn test_unreachable_host_releases_deposit() {
    let h = Harness::new();
    h.host.inject(HostFault::Unreachable);

    let err = h.start().await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SessionError>(),
        Some(SessionError::HostUnreachable(_))
    ));

    let deposited = h.ledger.sessions();
    assert_eq!(deposited.len(), 1);
    assert!(h.ledger.escrow(&deposited[0]).unwrap().completed);
}

// === Handshake ===

#[tokio::test]
async fn test_signed_handshake() {
    let h = Harness::signed();
    let session = h.start().await.unwrap();
    let reply = h
        .engine
        .send_prompt(&session, "ping", PromptOptions::default())
        .await
        .unwrap();
    assert_eq!(reply.text, "Hello, world");
}

#[tokio::test]
async fn test_bad_host_signature_fails_handshake() {
    let h = Harness::signed();
    h.host.inject(HostFault::BadSignature);

    let err = h.start().await.unwrap_err();
    match err.downcast_ref::<SessionError>() {
        Some(SessionError::HandshakeFailed(reason)) => assert!(reason.contains("signature")),
        other => panic!("expected HandshakeFailed, got {:?}", other),
    }

    let deposited = h.ledger.sessions();
    assert!(h.ledger.escrow(&deposited[0]).unwrap().completed);
    assert!(h.engine.sessions().await.is_empty());
}

#[tokio::test]
async fn test_host_refuses_handshake() {
    let h = Harness::new();
    h.host.inject(HostFault::RejectHandshake);

    let err = h.start().await.unwrap_err();
    match err.downcast_ref::<SessionError>() {
        Some(SessionError::HandshakeFailed(reason)) => assert!(reason.contains("unauthorized")),
        other => panic!("expected HandshakeFailed, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_silent_host_times_out_handshake() {
    let h = Harness::new();
    h.host.inject(HostFault::SilentHandshake);

    let err = h.start().await.unwrap_err();
    match err.downcast_ref::<SessionError>() {
        Some(SessionError::HandshakeFailed(reason)) => assert!(reason.contains("5000ms")),
        other => panic!("expected HandshakeFailed, got {:?}", other),
    }
}

// === Completion ===

#[tokio::test]
async fn test_zero_cost_end() {
    let h = Harness::new();
    let session = h.start().await.unwrap();
    h.engine
        .send_prompt(&session, "hi", PromptOptions::default())
        .await
        .unwrap();

    let err = h.engine.end_session(&session).await.unwrap_err();
    match &err {
        SessionError::InsufficientTokensForSettlement {
            tokens_used,
            minimum,
            receipt,
        } => {
            assert_eq!(*tokens_used, 3);
            assert_eq!(*minimum, 100);
            assert!(receipt.zero_cost);
            assert_eq!(receipt.settled_tokens, 0);
            assert_eq!(receipt.settled_amount, 0);
        }
        other => panic!("expected InsufficientTokensForSettlement, got {:?}", other),
    }
    assert!(err.zero_cost_receipt().is_some());

    assert_eq!(session.status(), SessionStatus::Completed);
    let escrow = h.ledger.escrow(&session.id()).unwrap();
    assert!(escrow.completed);
    assert!(escrow.checkpoints.is_empty());
}

#[tokio::test]
async fn test_prompts_refused_after_end() {
    let h = Harness::new();
    let session = h.start().await.unwrap();
    let _ = h.engine.end_session(&session).await;

    let err = h
        .engine
        .send_prompt(&session, "too late", PromptOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::SessionNotActive {
            status: SessionStatus::Completed,
            ..
        }
    ));

    let err = h.engine.end_session(&session).await.unwrap_err();
    assert!(matches!(err, SessionError::SessionNotActive { .. }));
}

#[tokio::test]
async fn test_end_waits_for_queued_work() {
    let h = Harness::new();
    h.host.set_text_reply(&[("x", 70)]);
    let session = h.start().await.unwrap();

    let first = h.engine.enqueue_prompt(&session, "one", PromptOptions::default()).unwrap();
    let second = h.engine.enqueue_prompt(&session, "two", PromptOptions::default()).unwrap();
    let (a, b) = tokio::join!(first.dispatch(), second.dispatch());
    let (a, b) = (a.unwrap(), b.unwrap());

    let receipt = h.engine.end_session(&session).await.unwrap();
    assert_eq!(receipt.total_tokens, 140);
    assert_eq!(receipt.settled_tokens, 140);
    assert_eq!(a.collect_reply().await.unwrap().text, "x");
    assert_eq!(b.collect_reply().await.unwrap().text, "x");
}

#[tokio::test]
async fn test_final_settlement_retries_transient_failure() {
    let h = Harness::new();
    h.host.set_text_reply(&[("x", 150)]);
    let session = h.start().await.unwrap();
    h.engine
        .send_prompt(&session, "go", PromptOptions::default())
        .await
        .unwrap();
    h.host.set_text_reply(&[("y", 30)]);
    h.engine
        .send_prompt(&session, "again", PromptOptions::default())
        .await
        .unwrap();

    h.ledger.inject(LedgerFault::CompleteUnavailable);
    let receipt = h.engine.end_session(&session).await.unwrap();
    assert_eq!(receipt.final_checkpoint_number, 2);
    assert_eq!(receipt.settled_tokens, 180);

    let escrow = h.ledger.escrow(&session.id()).unwrap();
    let numbers: Vec<u64> = escrow.checkpoints.iter().map(|p| p.checkpoint_number).collect();
    assert_eq!(numbers, vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_unread_stream_does_not_block_end_session() {
    let h = Harness::new();
    let long: Vec<(&str, u32)> = vec![("t", 1); 200];
    h.host.set_text_reply(&long);
    let session = h.start().await.unwrap();

    let hasty = PromptOptions {
        timeout: Some(Duration::from_secs(1)),
        ..PromptOptions::default()
    };
    // Held but never polled: the reply overflows the stream buffer.
    let stream = h
        .engine
        .send_prompt_streaming(&session, "talk a lot", hasty)
        .await
        .unwrap();

    let receipt = tokio::time::timeout(Duration::from_secs(3_600), h.engine.end_session(&session))
        .await
        .expect("end_session finished")
        .unwrap();
    assert_eq!(receipt.total_tokens, 200);
    assert_eq!(receipt.settled_tokens, 200);

    // The caller still gets what was buffered, then learns the reply was cut.
    let items: Vec<_> = stream.collect().await;
    let delivered = items.iter().filter(|item| item.is_ok()).count();
    assert_eq!(delivered, fast_config().reply_buffer);
    assert!(items.last().unwrap().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_end_session_gives_up_on_stuck_work() {
    let config = EngineConfig {
        request_timeout_ms: 1_000_000,
        drain_timeout_ms: 5_000,
        ..fast_config()
    };
    let h = Harness::with_config(config);
    h.host.set_text_reply(&[("x", 150)]);
    let session = h.start().await.unwrap();

    h.host.inject(HostFault::Delay(Duration::from_secs(600)));
    let stream = h
        .engine
        .send_prompt_streaming(&session, "slow", PromptOptions::default())
        .await
        .unwrap();

    let err = h.engine.end_session(&session).await.unwrap_err();
    assert!(matches!(err.into_root(), SessionError::Timeout { after_ms: 5_000, .. }));
    assert_eq!(session.status(), SessionStatus::Completing);

    // The slow reply still completes, after which settlement can be retried.
    let reply = stream.collect_reply().await.unwrap();
    assert_eq!(reply.tokens, 150);
    let receipt = h.engine.end_session(&session).await.unwrap();
    assert_eq!(receipt.settled_tokens, 150);
    assert_eq!(session.status(), SessionStatus::Completed);
}

// === Expiry ===

#[tokio::test(start_paused = true)]
async fn test_deadline_forces_completing() {
    let h = Harness::new();
    let mut short = economics();
    short.duration_seconds = 60;
    let session = h.start_with(short).await.unwrap();
    let mut status = session.watch_status();

    tokio::time::sleep(Duration::from_secs(61)).await;
    status.changed().await.unwrap();
    assert_eq!(*status.borrow(), SessionStatus::Completing);
    assert!(session.deadline_passed());

    let err = h
        .engine
        .send_prompt(&session, "still there?", PromptOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::SessionNotActive {
            status: SessionStatus::Completing,
            ..
        }
    ));

    let err = h.engine.expire_session(session.id()).await.unwrap_err();
    assert!(err.zero_cost_receipt().is_some());
    assert_eq!(session.status(), SessionStatus::Expired);
}

#[tokio::test(start_paused = true)]
async fn test_expire_before_deadline_is_refused() {
    let h = Harness::new();
    let session = h.start().await.unwrap();

    let err = h.engine.expire_session(session.id()).await.unwrap_err();
    assert!(matches!(err, SessionError::ValidationFailed(_)));
    assert_eq!(session.status(), SessionStatus::Active);
}

#[tokio::test]
async fn test_expire_unknown_session() {
    let h = Harness::new();
    let id = infermarket_session::SessionId::from_bytes([9; 32]);
    let err = h.engine.expire_session(id).await.unwrap_err();
    assert!(matches!(err, SessionError::UnknownSession(unknown) if unknown == id));
}

#[tokio::test]
async fn test_registry_lists_and_prunes() {
    let h = Harness::new();
    let a = h.start().await.unwrap();
    let b = h.start().await.unwrap();
    assert_eq!(h.engine.sessions().await.len(), 2);
    assert!(h.engine.session(&a.id()).await.is_some());

    let _ = h.engine.end_session(&a).await;
    assert_eq!(h.engine.prune_finished().await, 1);

    let remaining = h.engine.sessions().await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].session_id, b.id());
}
