//! Integration tests for checkpoint settlement against the in-memory escrow.

use infermarket_session::{
    PaymentCollaborator, PromptOptions, SessionEconomics, SessionError, SessionHandle, SessionStatus,
};
use infermarket_test_fixtures::{economics, Harness, HostFault, LedgerFault};
use proptest::prelude::*;

async fn send(h: &Harness, session: &SessionHandle, prompt: &str) {
    h.engine
        .send_prompt(session, prompt, PromptOptions::default())
        .await
        .unwrap();
    session.wait_idle().await;
}

#[tokio::test]
async fn test_checkpoints_cover_every_token() {
    let h = Harness::new();
    h.host.set_text_reply(&[("x", 20), ("y", 25)]);
    let session = h.start().await.unwrap();

    for n in 0..7 {
        send(&h, &session, &format!("prompt {}", n)).await;
    }
    let info = h.engine.session_info(&session);
    assert_eq!(info.tokens_used_total, 315);
    assert_eq!(info.last_checkpoint_number, 2);
    assert_eq!(info.tokens_used_since_checkpoint, 45);

    let receipt = h.engine.end_session(&session).await.unwrap();
    assert_eq!(receipt.total_tokens, 315);
    assert_eq!(receipt.settled_tokens, 315);
    assert_eq!(receipt.final_checkpoint_number, 3);
    assert_eq!(receipt.settled_amount, 3_150);

    let escrow = h.ledger.escrow(&session.id()).unwrap();
    let numbers: Vec<u64> = escrow.checkpoints.iter().map(|p| p.checkpoint_number).collect();
    let tokens: Vec<u64> = escrow
        .checkpoints
        .iter()
        .map(|p| p.tokens_generated_this_checkpoint)
        .collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert_eq!(tokens, vec![135, 135, 45]);
    assert!(escrow.checkpoints.iter().all(|p| p.payer_public_key == h.payer.public_bytes()));
}

#[tokio::test]
async fn test_ambiguous_checkpoint_is_not_double_counted() {
    let h = Harness::new();
    h.host.set_text_reply(&[("x", 120)]);
    let session = h.start().await.unwrap();

    h.ledger.inject(LedgerFault::AmbiguousAfterLanding);
    send(&h, &session, "one").await;

    let escrow = h.ledger.escrow(&session.id()).unwrap();
    assert_eq!(escrow.checkpoints.len(), 1);
    assert_eq!(h.ledger.submissions(), 1);
    assert!(h.ledger.landed_queries() >= 1);

    let info = h.engine.session_info(&session);
    assert_eq!(info.last_checkpoint_number, 1);
    assert_eq!(info.settled_tokens, 120);
    assert_eq!(info.tokens_used_since_checkpoint, 0);
}

#[tokio::test]
async fn test_lost_checkpoint_is_resubmitted() {
    let h = Harness::new();
    h.host.set_text_reply(&[("x", 120)]);
    let session = h.start().await.unwrap();

    h.ledger.inject(LedgerFault::AmbiguousBeforeLanding);
    send(&h, &session, "one").await;

    let escrow = h.ledger.escrow(&session.id()).unwrap();
    assert_eq!(escrow.checkpoints.len(), 1);
    assert_eq!(escrow.checkpoints[0].checkpoint_number, 1);
    assert_eq!(h.ledger.submissions(), 2);
}

#[tokio::test]
async fn test_rejected_checkpoint_keeps_tokens_unsettled() {
    let h = Harness::new();
    h.host.set_text_reply(&[("x", 120)]);
    let session = h.start().await.unwrap();

    h.ledger.inject(LedgerFault::RejectCheckpoint);
    send(&h, &session, "one").await;

    let info = h.engine.session_info(&session);
    assert_eq!(info.last_checkpoint_number, 0);
    assert_eq!(info.tokens_used_since_checkpoint, 120);

    // The next operation retries with the same number and the residual.
    send(&h, &session, "two").await;
    let escrow = h.ledger.escrow(&session.id()).unwrap();
    assert_eq!(escrow.checkpoints.len(), 1);
    assert_eq!(escrow.checkpoints[0].checkpoint_number, 1);
    assert_eq!(escrow.checkpoints[0].tokens_generated_this_checkpoint, 240);
}

#[tokio::test]
async fn test_recovery_carries_unsettled_tokens() {
    let h = Harness::new();
    h.host.set_text_reply(&[("x", 60)]);
    let session = h.start().await.unwrap();
    let original = session.id();

    send(&h, &session, "one").await;
    h.host.inject(HostFault::ForgetSession);
    send(&h, &session, "two").await;

    assert_ne!(session.id(), original);
    assert!(h.ledger.escrow(&original).unwrap().checkpoints.is_empty());

    let escrow = h.ledger.escrow(&session.id()).unwrap();
    assert_eq!(escrow.checkpoints.len(), 1);
    assert_eq!(escrow.checkpoints[0].checkpoint_number, 1);
    assert_eq!(escrow.checkpoints[0].tokens_generated_this_checkpoint, 120);

    let receipt = h.engine.end_session(&session).await.unwrap();
    assert_eq!(receipt.session_id, session.id());
    assert_eq!(receipt.settled_tokens, 120);
}

#[tokio::test]
async fn test_final_settlement_rejected_fails_session() {
    let h = Harness::new();
    h.host.set_text_reply(&[("x", 150)]);
    let session = h.start().await.unwrap();
    send(&h, &session, "one").await;
    h.host.set_text_reply(&[("y", 10)]);
    send(&h, &session, "two").await;

    // Close the escrow behind the engine's back so the final proof is refused.
    h.ledger.complete(session.id(), None).await.unwrap();

    let err = h.engine.end_session(&session).await.unwrap_err();
    match err.into_root() {
        SessionError::SettlementFailed {
            checkpoint_number,
            ambiguous,
            ..
        } => {
            assert_eq!(checkpoint_number, 2);
            assert!(!ambiguous);
        }
        other => panic!("expected SettlementFailed, got {:?}", other),
    }
    assert_eq!(session.status(), SessionStatus::Failed);
}

#[tokio::test]
async fn test_interval_below_billable_minimum_still_bills() {
    let h = Harness::new();
    h.host.set_text_reply(&[("x", 20)]);
    let session = h
        .start_with(SessionEconomics {
            proof_interval_tokens: 10,
            ..economics()
        })
        .await
        .unwrap();

    send(&h, &session, "one").await;
    assert_eq!(h.ledger.settled_tokens(), 20);

    // Twenty tokens is under the minimum of 100, but one checkpoint is already paid.
    let receipt = h.engine.end_session(&session).await.unwrap();
    assert!(!receipt.zero_cost);
    assert_eq!(receipt.settled_tokens, 20);
    assert_eq!(receipt.settled_amount, 200);
    assert_eq!(session.status(), SessionStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_settled_tokens_conserved_across_recovery() {
    let h = Harness::new();
    h.host.set_text_reply(&[("x", 120)]);
    let session = h.start().await.unwrap();
    let original = session.id();

    // Checkpoint 1 lands but every attempt to confirm it fails.
    h.ledger.inject(LedgerFault::AmbiguousAfterLanding);
    h.ledger.inject(LedgerFault::LandedQueryUnavailable);
    h.ledger.inject(LedgerFault::LandedQueryUnavailable);
    send(&h, &session, "one").await;
    assert_eq!(h.engine.session_info(&session).settled_tokens, 0);

    h.host.inject(HostFault::ForgetSession);
    send(&h, &session, "two").await;
    assert_ne!(session.id(), original);

    let receipt = h.engine.end_session(&session).await.unwrap();
    assert_eq!(receipt.total_tokens, 240);
    assert_eq!(receipt.settled_tokens, 240);
    assert_eq!(h.ledger.escrow(&original).unwrap().settled_tokens(), 120);
    assert_eq!(h.ledger.escrow(&session.id()).unwrap().settled_tokens(), 120);
    assert_eq!(h.ledger.settled_tokens(), 240);
}

#[tokio::test(start_paused = true)]
async fn test_unresolved_checkpoint_blocks_recovery() {
    let h = Harness::new();
    h.host.set_text_reply(&[("x", 120)]);
    let session = h.start().await.unwrap();

    h.ledger.inject(LedgerFault::AmbiguousAfterLanding);
    for _ in 0..3 {
        h.ledger.inject(LedgerFault::LandedQueryUnavailable);
    }
    send(&h, &session, "one").await;

    h.host.inject(HostFault::ForgetSession);
    let err = h
        .engine
        .send_prompt(&session, "two", PromptOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err.into_root(),
        SessionError::SettlementFailed { ambiguous: true, .. }
    ));
    assert_eq!(session.status(), SessionStatus::Failed);

    // No second escrow, and the landed checkpoint was paid exactly once.
    assert_eq!(h.ledger.deposits(), 1);
    assert_eq!(h.ledger.settled_tokens(), 120);
    assert_eq!(h.engine.session_info(&session).tokens_used_total, 120);
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_settled_tokens_equal_consumed(
        chunks in prop::collection::vec(1u32..80, 1..4),
        prompts in 1usize..6,
    ) {
        let (total, settled, on_ledger) = runtime().block_on(async {
            let h = Harness::new();
            let reply: Vec<(&str, u32)> = chunks.iter().map(|t| ("t", *t)).collect();
            h.host.set_text_reply(&reply);
            let session = h.start().await.unwrap();
            for n in 0..prompts {
                send(&h, &session, &format!("p{}", n)).await;
            }
            let total = h.engine.session_info(&session).tokens_used_total;
            let settled = match h.engine.end_session(&session).await {
                Ok(receipt) => receipt.settled_tokens,
                Err(err) => err.zero_cost_receipt().map(|r| r.settled_tokens).unwrap_or(u64::MAX),
            };
            (total, settled, h.ledger.settled_tokens())
        });

        let expected: u64 = chunks.iter().map(|t| u64::from(*t)).sum::<u64>() * prompts as u64;
        prop_assert_eq!(total, expected);
        if total >= 100 {
            prop_assert_eq!(settled, total);
            prop_assert_eq!(on_ledger, total);
        } else {
            prop_assert_eq!(settled, 0);
            prop_assert_eq!(on_ledger, 0);
        }
    }
}
