//! Payment collaborator interface and checkpoint proofs.
//!
//! The engine never talks to a chain directly. Deposits, checkpoint
//! submissions and final completion go through a [`PaymentCollaborator`],
//! which owns contract plumbing, gas and confirmation tracking.
//!
//! ```text
//! ┌──────────────┐  deposit ───────────────►  ┌──────────────────────┐
//! │              │  submit_checkpoint(n) ───► │                      │
//! │   Session    │  checkpoint_landed(n) ───► │ PaymentCollaborator  │
//! │   engine     │  complete(final?) ───────► │  (escrow contract)   │
//! │              │ ◄──── confirmations ────── │                      │
//! └──────────────┘                            └──────────────────────┘
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{self, IdentityKey};
use crate::envelope::{hex_bytes, hex_key};
use crate::types::{SessionEconomics, SessionId};

/// Host share of settled amounts, in basis points. Applied downstream.
pub const HOST_SHARE_BPS: u128 = 9_000;
/// Treasury share of settled amounts, in basis points. Applied downstream.
pub const TREASURY_SHARE_BPS: u128 = 1_000;

const PROOF_DOMAIN: &[u8] = b"infermarket/v1/checkpoint";

// ═══════════════════════════════════════════════════════════════════════════════
// ERRORS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PaymentError {
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("checkpoint {checkpoint_number} already submitted")]
    AlreadySubmitted { checkpoint_number: u64 },

    /// The request may or may not have taken effect (timeout, dropped receipt).
    #[error("outcome unknown: {0}")]
    Ambiguous(String),

    #[error("payment backend unavailable: {0}")]
    Unavailable(String),
}

impl PaymentError {
    /// Whether a retry could change the outcome.
    pub fn is_transient(&self) -> bool {
        matches!(self, PaymentError::Ambiguous(_) | PaymentError::Unavailable(_))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PROOFS & CONFIRMATIONS
// ═══════════════════════════════════════════════════════════════════════════════

/// A signed claim that `tokens_generated_this_checkpoint` tokens were consumed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointProof {
    pub session_id: SessionId,
    pub checkpoint_number: u64,
    pub tokens_generated_this_checkpoint: u64,
    pub cumulative_tokens: u64,
    /// Ed25519 signature over [`digest`](Self::digest).
    #[serde(with = "hex_bytes")]
    pub proof_bytes: Vec<u8>,
    #[serde(with = "hex_key")]
    pub payer_public_key: [u8; 32],
    pub submitted_at: DateTime<Utc>,
}

impl CheckpointProof {
    pub fn signed(
        session_id: SessionId,
        checkpoint_number: u64,
        tokens_generated_this_checkpoint: u64,
        cumulative_tokens: u64,
        payer: &IdentityKey,
    ) -> Self {
        let digest = proof_digest(
            &session_id,
            checkpoint_number,
            tokens_generated_this_checkpoint,
            cumulative_tokens,
        );
        Self {
            session_id,
            checkpoint_number,
            tokens_generated_this_checkpoint,
            cumulative_tokens,
            proof_bytes: payer.sign(&digest).to_vec(),
            payer_public_key: payer.public_bytes(),
            submitted_at: Utc::now(),
        }
    }

    /// Canonical BLAKE3 digest. Excludes `submitted_at` so resubmissions match.
    pub fn digest(&self) -> [u8; 32] {
        proof_digest(
            &self.session_id,
            self.checkpoint_number,
            self.tokens_generated_this_checkpoint,
            self.cumulative_tokens,
        )
    }

    pub fn verify(&self) -> bool {
        crypto::verify_signature(&self.payer_public_key, &self.digest(), &self.proof_bytes).is_ok()
    }
}

fn proof_digest(
    session_id: &SessionId,
    checkpoint_number: u64,
    tokens: u64,
    cumulative: u64,
) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(PROOF_DOMAIN);
    hasher.update(session_id.as_bytes());
    hasher.update(&checkpoint_number.to_le_bytes());
    hasher.update(&tokens.to_le_bytes());
    hasher.update(&cumulative.to_le_bytes());
    *hasher.finalize().as_bytes()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointConfirmation {
    pub checkpoint_number: u64,
    pub transaction_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionConfirmation {
    pub transaction_id: String,
}

/// Host and treasury portions of `amount`. The treasury takes the rounding remainder.
pub fn split_amount(amount: u128) -> (u128, u128) {
    let host = amount / 10_000 * HOST_SHARE_BPS + (amount % 10_000) * HOST_SHARE_BPS / 10_000;
    (host, amount - host)
}

// ═══════════════════════════════════════════════════════════════════════════════
// COLLABORATOR TRAIT
// ═══════════════════════════════════════════════════════════════════════════════

/// Escrow and settlement backend.
#[async_trait]
pub trait PaymentCollaborator: Send + Sync {
    /// Escrow a deposit and return the new session id.
    async fn deposit(&self, economics: &SessionEconomics) -> Result<SessionId, PaymentError>;

    async fn submit_checkpoint(
        &self,
        proof: &CheckpointProof,
    ) -> Result<CheckpointConfirmation, PaymentError>;

    /// Whether checkpoint `checkpoint_number` is recorded for `session_id`.
    async fn checkpoint_landed(
        &self,
        session_id: SessionId,
        checkpoint_number: u64,
    ) -> Result<bool, PaymentError>;

    /// Close the escrow, settling `final_proof` if any. `None` settles nothing further.
    async fn complete(
        &self,
        session_id: SessionId,
        final_proof: Option<&CheckpointProof>,
    ) -> Result<CompletionConfirmation, PaymentError>;
}
