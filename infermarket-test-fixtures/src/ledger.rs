//! In-memory escrow standing in for the payment contract.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use infermarket_session::{
    CheckpointConfirmation, CheckpointProof, CompletionConfirmation, PaymentCollaborator, PaymentError,
    SessionEconomics, SessionId,
};

/// One-shot ledger misbehaviour.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LedgerFault {
    /// Next deposit fails for lack of funds.
    InsufficientFunds,
    /// Next checkpoint is recorded but the caller sees a timeout.
    AmbiguousAfterLanding,
    /// Next checkpoint is lost and the caller sees a timeout.
    AmbiguousBeforeLanding,
    /// Next checkpoint is refused outright.
    RejectCheckpoint,
    /// Next `complete` call fails transiently.
    CompleteUnavailable,
    /// Next `checkpoint_landed` query fails. Inject once per failing query.
    LandedQueryUnavailable,
}

#[derive(Clone, Debug)]
pub struct Escrow {
    pub economics: SessionEconomics,
    pub checkpoints: Vec<CheckpointProof>,
    pub completed: bool,
}

impl Escrow {
    pub fn settled_tokens(&self) -> u64 {
        self.checkpoints.iter().map(|p| p.tokens_generated_this_checkpoint).sum()
    }
}

#[derive(Default)]
struct LedgerState {
    escrows: HashMap<SessionId, Escrow>,
    order: Vec<SessionId>,
    faults: Vec<LedgerFault>,
    submissions: usize,
    landed_queries: usize,
    next_tx: u64,
}

impl LedgerState {
    fn take_fault(&mut self, fault: &LedgerFault) -> bool {
        match self.faults.iter().position(|f| f == fault) {
            Some(position) => {
                self.faults.remove(position);
                true
            }
            None => false,
        }
    }

    fn tx(&mut self) -> String {
        self.next_tx += 1;
        format!("tx-{:04}", self.next_tx)
    }

    /// Check and record a proof for a live escrow.
    fn record(&mut self, proof: &CheckpointProof) -> Result<(), PaymentError> {
        if !proof.verify() {
            return Err(PaymentError::Rejected("proof signature does not verify".into()));
        }
        let escrow = self
            .escrows
            .get_mut(&proof.session_id)
            .ok_or_else(|| PaymentError::Rejected(format!("unknown session {}", proof.session_id)))?;
        if escrow.completed {
            return Err(PaymentError::Rejected("session already completed".into()));
        }
        if escrow
            .checkpoints
            .iter()
            .any(|p| p.checkpoint_number == proof.checkpoint_number)
        {
            return Err(PaymentError::AlreadySubmitted {
                checkpoint_number: proof.checkpoint_number,
            });
        }
        let expected = escrow.checkpoints.len() as u64 + 1;
        if proof.checkpoint_number != expected {
            return Err(PaymentError::Rejected(format!(
                "checkpoint {} out of order, expected {}",
                proof.checkpoint_number, expected
            )));
        }
        escrow.checkpoints.push(proof.clone());
        Ok(())
    }
}

/// Escrow backend that enforces sequential checkpoints and counts every call.
#[derive(Default)]
pub struct MockLedger {
    state: Mutex<LedgerState>,
}

impl MockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject(&self, fault: LedgerFault) {
        self.state.lock().unwrap().faults.push(fault);
    }

    pub fn deposits(&self) -> usize {
        self.state.lock().unwrap().order.len()
    }

    /// Session ids in deposit order.
    pub fn sessions(&self) -> Vec<SessionId> {
        self.state.lock().unwrap().order.clone()
    }

    pub fn escrow(&self, session_id: &SessionId) -> Option<Escrow> {
        self.state.lock().unwrap().escrows.get(session_id).cloned()
    }

    /// Tokens settled across every escrow.
    pub fn settled_tokens(&self) -> u64 {
        self.state
            .lock()
            .unwrap()
            .escrows
            .values()
            .map(Escrow::settled_tokens)
            .sum()
    }

    pub fn submissions(&self) -> usize {
        self.state.lock().unwrap().submissions
    }

    pub fn landed_queries(&self) -> usize {
        self.state.lock().unwrap().landed_queries
    }
}

#[async_trait]
impl PaymentCollaborator for MockLedger {
    async fn deposit(&self, economics: &SessionEconomics) -> Result<SessionId, PaymentError> {
        let mut state = self.state.lock().unwrap();
        if state.take_fault(&LedgerFault::InsufficientFunds) {
            return Err(PaymentError::InsufficientFunds(format!(
                "balance below {}",
                economics.deposit_amount
            )));
        }
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"mock-escrow");
        hasher.update(&(state.order.len() as u64).to_le_bytes());
        let session_id = SessionId::from_bytes(*hasher.finalize().as_bytes());

        state.escrows.insert(
            session_id,
            Escrow {
                economics: economics.clone(),
                checkpoints: Vec::new(),
                completed: false,
            },
        );
        state.order.push(session_id);
        Ok(session_id)
    }

    async fn submit_checkpoint(&self, proof: &CheckpointProof) -> Result<CheckpointConfirmation, PaymentError> {
        let mut state = self.state.lock().unwrap();
        state.submissions += 1;
        if state.take_fault(&LedgerFault::RejectCheckpoint) {
            return Err(PaymentError::Rejected("checkpoint refused".into()));
        }
        if state.take_fault(&LedgerFault::AmbiguousBeforeLanding) {
            return Err(PaymentError::Ambiguous("submission timed out".into()));
        }
        state.record(proof)?;
        if state.take_fault(&LedgerFault::AmbiguousAfterLanding) {
            return Err(PaymentError::Ambiguous("receipt lost".into()));
        }
        Ok(CheckpointConfirmation {
            checkpoint_number: proof.checkpoint_number,
            transaction_id: state.tx(),
        })
    }

    async fn checkpoint_landed(&self, session_id: SessionId, checkpoint_number: u64) -> Result<bool, PaymentError> {
        let mut state = self.state.lock().unwrap();
        state.landed_queries += 1;
        if state.take_fault(&LedgerFault::LandedQueryUnavailable) {
            return Err(PaymentError::Unavailable("indexer unavailable".into()));
        }
        Ok(state.escrows.get(&session_id).is_some_and(|escrow| {
            escrow
                .checkpoints
                .iter()
                .any(|p| p.checkpoint_number == checkpoint_number)
        }))
    }

    async fn complete(
        &self,
        session_id: SessionId,
        final_proof: Option<&CheckpointProof>,
    ) -> Result<CompletionConfirmation, PaymentError> {
        let mut state = self.state.lock().unwrap();
        if state.take_fault(&LedgerFault::CompleteUnavailable) {
            return Err(PaymentError::Unavailable("rpc unavailable".into()));
        }
        if let Some(proof) = final_proof {
            if proof.session_id != session_id {
                return Err(PaymentError::Rejected("final proof for another session".into()));
            }
            state.record(proof)?;
        }
        let escrow = state
            .escrows
            .get_mut(&session_id)
            .ok_or_else(|| PaymentError::Rejected(format!("unknown session {}", session_id)))?;
        if escrow.completed {
            return Err(PaymentError::Rejected("session already completed".into()));
        }
        escrow.completed = true;
        Ok(CompletionConfirmation {
            transaction_id: state.tx(),
        })
    }
}
