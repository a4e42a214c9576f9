//! Client Session Engine for a Decentralized Inference Marketplace
//!
//! A client rents streamed inference from a compute host for the length of an
//! escrowed deposit. This crate owns the client side of that lease:
//!
//! - Session lifecycle: deposit, handshake, recovery, settlement, expiry
//! - Authenticated encryption of every prompt and reply (X25519 + XChaCha20-Poly1305)
//! - Strict FIFO ordering of operations per session
//! - Per-operation rate limits
//! - Incremental checkpoint settlement of consumed tokens
//! - Intent routing of chat prompts to image generation
//!
//! # Session Model
//!
//! ```text
//!            deposit + handshake
//!   Created ────────────────────► Active ◄──────► Recovering
//!                                   │                 │
//!                     end_session / │ lease elapsed   │
//!                                   ▼                 │
//!                               Completing ◄──────────┘
//!                                   │
//!                     ┌─────────────┴─────────────┐
//!                     ▼                           ▼
//!                 Completed                    Expired        (any ──► Failed)
//! ```
//!
//! Payments, host discovery and the wire transport are collaborators behind
//! traits: [`PaymentCollaborator`], [`Discovery`] and [`Connector`].

pub mod channel;
pub mod config;
pub mod crypto;
pub mod discovery;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod intent;
pub mod payment;
pub mod queue;
pub mod rate_limiter;
pub mod reply;
pub mod session;
pub mod settlement;
pub mod transport;
pub mod types;

pub use channel::EncryptedChannel;
pub use config::{EngineConfig, RateLimitRule};
pub use crypto::{IdentityKey, KeyAgreement, Role, SessionKey};
pub use discovery::{Discovery, DiscoveryError, HostInfo};
pub use engine::{QueuedPrompt, SessionEngine, StructuredResultCallback};
pub use envelope::{EncryptedEnvelope, EnvelopeType, ErrorBody, Frame, HostErrorCode, RequestBody, ResponseBody};
pub use error::{ErrorKind, SessionError};
pub use intent::{ImageParameters, ImageSize, IntentResult, IntentRouter};
pub use payment::{
    CheckpointConfirmation, CheckpointProof, CompletionConfirmation, PaymentCollaborator, PaymentError,
};
pub use queue::Ticket;
pub use rate_limiter::{RateLimiter, RateLimiterRegistry};
pub use reply::ReplyStream;
pub use session::{SessionHandle, SessionSnapshot};
pub use settlement::{CheckpointRecord, SettlementReceipt, TokenLedger};
pub use transport::{Connector, Transport, TransportError};
pub use types::{
    HostEndpoint, ImageResult, MessageId, ModelId, OperationKind, PromptOptions, Reply, ReplyFragment,
    SessionEconomics, SessionId, SessionStatus, StructuredResult,
};
