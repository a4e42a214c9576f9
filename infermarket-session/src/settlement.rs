//! Incremental settlement of consumed tokens.
//!
//! # Flow
//!
//! ```text
//!   record_tokens(n) ──► since_checkpoint >= interval ?
//!                              │ yes
//!                              ▼
//!                 begin_checkpoint (number = last + 1,
//!                  covers every unsettled token)
//!                              │
//!                              ▼
//!        submit ──► Ok / AlreadySubmitted ──► confirm (advance last)
//!          │
//!          ├──► Rejected ──► abort, SettlementFailed
//!          │
//!          └──► Ambiguous ──► checkpoint_landed? ──► yes: confirm
//!                                   │ no
//!                                   └──► resubmit (bounded)
//! ```
//!
//! A checkpoint number is never submitted twice without first asking the
//! collaborator whether the earlier attempt landed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::crypto::IdentityKey;
use crate::error::SessionError;
use crate::payment::{
    CheckpointConfirmation, CheckpointProof, CompletionConfirmation, PaymentCollaborator, PaymentError,
};
use crate::types::{SessionEconomics, SessionId};

// ═══════════════════════════════════════════════════════════════════════════════
// TOKEN LEDGER
// ═══════════════════════════════════════════════════════════════════════════════

/// A checkpoint that has been numbered but not yet confirmed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingCheckpoint {
    pub session_id: SessionId,
    pub checkpoint_number: u64,
    pub tokens: u64,
    /// Tokens settled on this binding once this checkpoint lands.
    pub cumulative_tokens: u64,
}

/// Token counters for one logical session. The only writer of its fields.
#[derive(Debug, Clone)]
pub struct TokenLedger {
    session_id: SessionId,
    proof_interval_tokens: u64,
    total: u64,
    since_checkpoint: u64,
    settled: u64,
    binding_settled: u64,
    last_checkpoint_number: u64,
    pending: Option<u64>,
}

impl TokenLedger {
    pub fn new(session_id: SessionId, proof_interval_tokens: u64) -> Self {
        Self {
            session_id,
            proof_interval_tokens,
            total: 0,
            since_checkpoint: 0,
            settled: 0,
            binding_settled: 0,
            last_checkpoint_number: 0,
            pending: None,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Lifetime tokens across every binding.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn since_checkpoint(&self) -> u64 {
        self.since_checkpoint
    }

    /// Lifetime tokens covered by confirmed proofs.
    pub fn settled(&self) -> u64 {
        self.settled
    }

    pub fn last_checkpoint_number(&self) -> u64 {
        self.last_checkpoint_number
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn record_tokens(&mut self, tokens: u64) {
        self.total = self.total.saturating_add(tokens);
        self.since_checkpoint = self.since_checkpoint.saturating_add(tokens);
    }

    pub fn checkpoint_due(&self) -> bool {
        self.pending.is_none() && self.since_checkpoint >= self.proof_interval_tokens
    }

    /// Number the next checkpoint over every unsettled token.
    pub fn begin_checkpoint(&mut self) -> Option<PendingCheckpoint> {
        if self.pending.is_some() || self.since_checkpoint == 0 {
            return None;
        }
        let checkpoint_number = self.last_checkpoint_number + 1;
        self.pending = Some(checkpoint_number);
        Some(PendingCheckpoint {
            session_id: self.session_id,
            checkpoint_number,
            tokens: self.since_checkpoint,
            cumulative_tokens: self.binding_settled + self.since_checkpoint,
        })
    }

    pub fn confirm(&mut self, pending: &PendingCheckpoint) {
        if self.pending != Some(pending.checkpoint_number) || pending.session_id != self.session_id {
            tracing::warn!(
                checkpoint = pending.checkpoint_number,
                "ignoring confirmation for a checkpoint that is not pending"
            );
            return;
        }
        self.pending = None;
        self.last_checkpoint_number = pending.checkpoint_number;
        self.since_checkpoint -= pending.tokens.min(self.since_checkpoint);
        self.settled += pending.tokens;
        self.binding_settled += pending.tokens;
    }

    /// Give the number back. Tokens stay unsettled.
    pub fn abort(&mut self, pending: &PendingCheckpoint) {
        if self.pending == Some(pending.checkpoint_number) {
            self.pending = None;
        }
    }

    /// Move to a new session binding. Unsettled tokens carry forward and
    /// checkpoint numbering restarts.
    pub fn rebind(&mut self, session_id: SessionId) {
        self.session_id = session_id;
        self.last_checkpoint_number = 0;
        self.binding_settled = 0;
        self.pending = None;
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RECEIPTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Outcome of final settlement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementReceipt {
    pub session_id: SessionId,
    pub final_checkpoint_number: u64,
    pub total_tokens: u64,
    pub settled_tokens: u64,
    /// Pre-split amount in base units (`settled_tokens * price_per_token`).
    pub settled_amount: u128,
    pub zero_cost: bool,
    pub confirmation: String,
    pub completed_at: DateTime<Utc>,
}

/// A proof the collaborator accepted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckpointRecord {
    pub session_id: SessionId,
    pub checkpoint_number: u64,
    pub tokens: u64,
    pub transaction_id: String,
    /// Settled through `complete` rather than `submit_checkpoint`.
    pub is_final: bool,
}

// ═══════════════════════════════════════════════════════════════════════════════
// SETTLEMENT DRIVER
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Debug)]
pub struct SettlementPolicy {
    pub proof_interval_tokens: u64,
    pub price_per_token: u128,
    pub min_billable_tokens: u64,
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl SettlementPolicy {
    pub fn new(economics: &SessionEconomics, config: &EngineConfig) -> Self {
        Self {
            proof_interval_tokens: economics.proof_interval_tokens,
            price_per_token: economics.price_per_token,
            min_billable_tokens: config.min_billable_tokens,
            max_attempts: config.settlement_max_attempts.max(1),
            backoff: config.settlement_backoff(),
        }
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(1u32 << attempt.saturating_sub(1).min(6))
    }
}

/// Drives checkpoint and final settlement for one logical session.
pub struct CheckpointSettlement {
    ledger: TokenLedger,
    payment: Arc<dyn PaymentCollaborator>,
    payer: IdentityKey,
    policy: SettlementPolicy,
    /// Submitted with an unknown outcome; must be resolved before reuse.
    unresolved: Option<PendingCheckpoint>,
    history: Vec<CheckpointRecord>,
}

impl CheckpointSettlement {
    pub fn new(
        session_id: SessionId,
        payment: Arc<dyn PaymentCollaborator>,
        payer: IdentityKey,
        policy: SettlementPolicy,
    ) -> Self {
        Self {
            ledger: TokenLedger::new(session_id, policy.proof_interval_tokens),
            payment,
            payer,
            policy,
            unresolved: None,
            history: Vec::new(),
        }
    }

    pub fn ledger(&self) -> &TokenLedger {
        &self.ledger
    }

    pub fn history(&self) -> &[CheckpointRecord] {
        &self.history
    }

    pub fn record_tokens(&mut self, tokens: u64) {
        self.ledger.record_tokens(tokens);
    }

    /// Submit a checkpoint if the interval has been crossed.
    pub async fn checkpoint_if_due(&mut self) -> Result<Option<CheckpointConfirmation>, SessionError> {
        if let Some(confirmation) = self.resolve_unresolved().await? {
            return Ok(Some(confirmation));
        }
        if !self.ledger.checkpoint_due() {
            return Ok(None);
        }
        let Some(pending) = self.ledger.begin_checkpoint() else {
            return Ok(None);
        };
        tracing::info!(
            session = %pending.session_id.short(),
            checkpoint = pending.checkpoint_number,
            tokens = pending.tokens,
            "checkpoint due"
        );
        self.submit(pending).await.map(Some)
    }

    /// Final settlement. A receipt with `zero_cost` means nothing was billed.
    pub async fn finalize(&mut self) -> Result<SettlementReceipt, SessionError> {
        self.resolve_unresolved().await?;

        let session_id = self.ledger.session_id();
        let total = self.ledger.total();

        // Once any checkpoint has been paid the session is billable regardless of size.
        if total < self.policy.min_billable_tokens && self.ledger.settled() == 0 {
            tracing::info!(
                session = %session_id.short(),
                total_tokens = total,
                minimum = self.policy.min_billable_tokens,
                "below billable minimum, closing at zero cost"
            );
            let confirmation = self.complete(session_id, None, 0).await?;
            return Ok(self.receipt(confirmation.transaction_id, true));
        }

        let final_proof = self.ledger.begin_checkpoint().map(|pending| {
            let proof = self.sign(&pending);
            (pending, proof)
        });

        let checkpoint_number = final_proof
            .as_ref()
            .map(|(pending, _)| pending.checkpoint_number)
            .unwrap_or(self.ledger.last_checkpoint_number());

        let result = self
            .complete(
                session_id,
                final_proof.as_ref().map(|(_, proof)| proof),
                checkpoint_number,
            )
            .await;

        match result {
            Ok(confirmation) => {
                if let Some((pending, _)) = &final_proof {
                    self.ledger.confirm(pending);
                    self.history.push(CheckpointRecord {
                        session_id,
                        checkpoint_number: pending.checkpoint_number,
                        tokens: pending.tokens,
                        transaction_id: confirmation.transaction_id.clone(),
                        is_final: true,
                    });
                }
                tracing::info!(
                    session = %session_id.short(),
                    total_tokens = total,
                    settled_tokens = self.ledger.settled(),
                    tx = %confirmation.transaction_id,
                    "session settled"
                );
                Ok(self.receipt(confirmation.transaction_id, false))
            }
            Err(err) => {
                if let Some((pending, _)) = &final_proof {
                    self.ledger.abort(pending);
                }
                Err(err)
            }
        }
    }

    /// Settle the fate of an ambiguous checkpoint on the current binding.
    ///
    /// Must succeed before [`rebind`](Self::rebind): carrying tokens forward
    /// while an earlier submission might have landed would bill them twice.
    pub async fn resolve_before_rebind(&mut self) -> Result<(), SessionError> {
        let Some(pending) = self.unresolved.take() else {
            return Ok(());
        };
        match self
            .payment
            .checkpoint_landed(pending.session_id, pending.checkpoint_number)
            .await
        {
            Ok(true) => {
                self.confirm(&pending, "landed".into());
                Ok(())
            }
            Ok(false) => {
                self.ledger.abort(&pending);
                Ok(())
            }
            Err(err) => {
                tracing::warn!(
                    checkpoint = pending.checkpoint_number,
                    error = %err,
                    "could not resolve checkpoint before rebinding"
                );
                self.unresolved = Some(pending);
                Err(SessionError::SettlementFailed {
                    checkpoint_number: pending.checkpoint_number,
                    reason: format!("landed query failed before rebinding: {}", err),
                    ambiguous: true,
                })
            }
        }
    }

    /// Switch to a new binding after recovery. Unsettled tokens carry forward.
    pub fn rebind(&mut self, session_id: SessionId) -> Result<(), SessionError> {
        if let Some(pending) = &self.unresolved {
            return Err(SessionError::SettlementFailed {
                checkpoint_number: pending.checkpoint_number,
                reason: "checkpoint outcome unresolved on the previous binding".into(),
                ambiguous: true,
            });
        }
        tracing::info!(
            from = %self.ledger.session_id().short(),
            to = %session_id.short(),
            carried_tokens = self.ledger.since_checkpoint(),
            "settlement rebound to new session"
        );
        self.ledger.rebind(session_id);
        Ok(())
    }

    async fn resolve_unresolved(&mut self) -> Result<Option<CheckpointConfirmation>, SessionError> {
        let Some(pending) = self.unresolved.take() else {
            return Ok(None);
        };
        match self
            .payment
            .checkpoint_landed(pending.session_id, pending.checkpoint_number)
            .await
        {
            Ok(true) => {
                tracing::info!(checkpoint = pending.checkpoint_number, "earlier checkpoint landed");
                Ok(Some(self.confirm(&pending, "landed".into())))
            }
            Ok(false) => self.submit(pending).await.map(Some),
            Err(err) => {
                self.unresolved = Some(pending);
                Err(SessionError::SettlementFailed {
                    checkpoint_number: pending.checkpoint_number,
                    reason: format!("landed query failed: {}", err),
                    ambiguous: true,
                })
            }
        }
    }

    async fn submit(&mut self, pending: PendingCheckpoint) -> Result<CheckpointConfirmation, SessionError> {
        let proof = self.sign(&pending);
        let mut needs_landed_check = false;
        let mut last_error = String::new();

        for attempt in 1..=self.policy.max_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.policy.backoff_for(attempt - 1)).await;
            }

            if needs_landed_check {
                match self
                    .payment
                    .checkpoint_landed(pending.session_id, pending.checkpoint_number)
                    .await
                {
                    Ok(true) => return Ok(self.confirm(&pending, "landed".into())),
                    Ok(false) => needs_landed_check = false,
                    Err(err) => {
                        last_error = format!("landed query failed: {}", err);
                        continue;
                    }
                }
            }

            match self.payment.submit_checkpoint(&proof).await {
                Ok(confirmation) => {
                    return Ok(self.confirm(&pending, confirmation.transaction_id));
                }
                Err(PaymentError::AlreadySubmitted { .. }) => {
                    tracing::debug!(checkpoint = pending.checkpoint_number, "checkpoint already on ledger");
                    return Ok(self.confirm(&pending, "already-submitted".into()));
                }
                Err(err @ (PaymentError::Rejected(_) | PaymentError::InsufficientFunds(_))) => {
                    tracing::error!(
                        checkpoint = pending.checkpoint_number,
                        error = %err,
                        "checkpoint rejected"
                    );
                    self.ledger.abort(&pending);
                    return Err(SessionError::SettlementFailed {
                        checkpoint_number: pending.checkpoint_number,
                        reason: err.to_string(),
                        ambiguous: false,
                    });
                }
                Err(err @ PaymentError::Ambiguous(_)) => {
                    tracing::warn!(
                        checkpoint = pending.checkpoint_number,
                        attempt,
                        error = %err,
                        "checkpoint outcome unknown"
                    );
                    needs_landed_check = true;
                    last_error = err.to_string();
                }
                Err(err @ PaymentError::Unavailable(_)) => {
                    tracing::warn!(
                        checkpoint = pending.checkpoint_number,
                        attempt,
                        error = %err,
                        "payment backend unavailable"
                    );
                    last_error = err.to_string();
                }
            }
        }

        if needs_landed_check {
            self.unresolved = Some(pending);
        } else {
            self.ledger.abort(&pending);
        }
        Err(SessionError::SettlementFailed {
            checkpoint_number: pending.checkpoint_number,
            reason: format!("gave up after {} attempts: {}", self.policy.max_attempts, last_error),
            ambiguous: self.unresolved.is_some(),
        })
    }

    async fn complete(
        &mut self,
        session_id: SessionId,
        final_proof: Option<&CheckpointProof>,
        checkpoint_number: u64,
    ) -> Result<CompletionConfirmation, SessionError> {
        let mut last_error = String::new();
        let mut needs_landed_check = false;
        for attempt in 1..=self.policy.max_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.policy.backoff_for(attempt - 1)).await;
            }

            // The final proof travels with `complete`; if it landed, so did the completion.
            if needs_landed_check && final_proof.is_some() {
                match self.payment.checkpoint_landed(session_id, checkpoint_number).await {
                    Ok(true) => {
                        tracing::info!(checkpoint = checkpoint_number, "final checkpoint already landed");
                        return Ok(CompletionConfirmation {
                            transaction_id: "landed".into(),
                        });
                    }
                    Ok(false) => needs_landed_check = false,
                    Err(err) => {
                        last_error = format!("landed query failed: {}", err);
                        continue;
                    }
                }
            }

            match self.payment.complete(session_id, final_proof).await {
                Ok(confirmation) => return Ok(confirmation),
                Err(PaymentError::AlreadySubmitted { .. }) => {
                    return Ok(CompletionConfirmation {
                        transaction_id: "already-completed".into(),
                    })
                }
                Err(err) if err.is_transient() => {
                    tracing::warn!(attempt, error = %err, "completion attempt failed");
                    needs_landed_check = true;
                    last_error = err.to_string();
                }
                Err(err) => {
                    return Err(SessionError::SettlementFailed {
                        checkpoint_number,
                        reason: err.to_string(),
                        ambiguous: false,
                    })
                }
            }
        }
        Err(SessionError::SettlementFailed {
            checkpoint_number,
            reason: format!("completion gave up: {}", last_error),
            ambiguous: true,
        })
    }

    fn sign(&self, pending: &PendingCheckpoint) -> CheckpointProof {
        CheckpointProof::signed(
            pending.session_id,
            pending.checkpoint_number,
            pending.tokens,
            pending.cumulative_tokens,
            &self.payer,
        )
    }

    fn confirm(&mut self, pending: &PendingCheckpoint, transaction_id: String) -> CheckpointConfirmation {
        self.ledger.confirm(pending);
        self.history.push(CheckpointRecord {
            session_id: pending.session_id,
            checkpoint_number: pending.checkpoint_number,
            tokens: pending.tokens,
            transaction_id: transaction_id.clone(),
            is_final: false,
        });
        tracing::info!(
            session = %pending.session_id.short(),
            checkpoint = pending.checkpoint_number,
            tokens = pending.tokens,
            tx = %transaction_id,
            "checkpoint confirmed"
        );
        CheckpointConfirmation {
            checkpoint_number: pending.checkpoint_number,
            transaction_id,
        }
    }

    fn receipt(&self, confirmation: String, zero_cost: bool) -> SettlementReceipt {
        let settled_tokens = self.ledger.settled();
        SettlementReceipt {
            session_id: self.ledger.session_id(),
            final_checkpoint_number: self.ledger.last_checkpoint_number(),
            total_tokens: self.ledger.total(),
            settled_tokens,
            settled_amount: u128::from(settled_tokens) * self.policy.price_per_token,
            zero_cost,
            confirmation,
            completed_at: Utc::now(),
        }
    }
}
