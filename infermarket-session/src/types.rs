//! Core identifiers and value types shared by every engine component.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::SessionError;
use crate::intent::{ImageParameters, ImageSize};

// ═══════════════════════════════════════════════════════════════════════════════
// IDENTIFIERS
// ═══════════════════════════════════════════════════════════════════════════════

/// Opaque 256-bit session identifier assigned by the marketplace contract.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId([u8; 32]);

impl SessionId {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short hex prefix, used in log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId(0x{}..)", self.short())
    }
}

impl FromStr for SessionId {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(raw)
            .map_err(|e| SessionError::ValidationFailed(format!("session id is not hex: {}", e)))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            SessionError::ValidationFailed(format!("session id must be 32 bytes, got {}", v.len()))
        })?;
        Ok(Self(bytes))
    }
}

impl Serialize for SessionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Correlates a request with the envelopes of its reply.
pub type MessageId = uuid::Uuid;

/// Model identifier as published by hosts.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(String);

impl ModelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Network address of a compute host (e.g. `wss://host.example:8443/v1/ws`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostEndpoint(String);

impl HostEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LEASE ECONOMICS
// ═══════════════════════════════════════════════════════════════════════════════

/// Economic terms of a lease, fixed at creation. Amounts are integer base units.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEconomics {
    /// Escrowed deposit.
    pub deposit_amount: u128,
    /// Price charged per generated token.
    pub price_per_token: u128,
    /// Lease length.
    pub duration_seconds: u64,
    /// Tokens between two periodic checkpoints.
    pub proof_interval_tokens: u64,
}

impl SessionEconomics {
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.price_per_token == 0 {
            return Err(SessionError::ValidationFailed(
                "price_per_token must be positive".into(),
            ));
        }
        if self.proof_interval_tokens == 0 {
            return Err(SessionError::ValidationFailed(
                "proof_interval_tokens must be positive".into(),
            ));
        }
        if self.duration_seconds == 0 {
            return Err(SessionError::ValidationFailed(
                "duration_seconds must be positive".into(),
            ));
        }
        if self.deposit_amount < self.price_per_token * u128::from(self.proof_interval_tokens) {
            return Err(SessionError::ValidationFailed(format!(
                "deposit {} does not cover one proof interval ({} tokens at {})",
                self.deposit_amount, self.proof_interval_tokens, self.price_per_token
            )));
        }
        Ok(())
    }

    /// Tokens the deposit pays for.
    pub fn max_tokens(&self) -> u128 {
        self.deposit_amount / self.price_per_token
    }

    /// Pre-split amount owed for `tokens`.
    pub fn cost_of(&self, tokens: u64) -> u128 {
        u128::from(tokens) * self.price_per_token
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SESSION STATUS
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle state of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Active,
    Recovering,
    Completing,
    Completed,
    Expired,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Created => "created",
            SessionStatus::Active => "active",
            SessionStatus::Recovering => "recovering",
            SessionStatus::Completing => "completing",
            SessionStatus::Completed => "completed",
            SessionStatus::Expired => "expired",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Expired | SessionStatus::Failed
        )
    }

    /// Whether new caller operations may be admitted.
    pub fn accepts_prompts(&self) -> bool {
        matches!(self, SessionStatus::Active | SessionStatus::Recovering)
    }

    /// The lifecycle transition table.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (_, Failed) => !self.is_terminal(),
            (Created, Active) => true,
            (Active, Active) => true,
            (Active, Recovering) => true,
            (Recovering, Active) => true,
            (Created | Active | Recovering, Completing) => true,
            (Completing, Completing) => true,
            (Completing, Completed | Expired) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// OPERATIONS
// ═══════════════════════════════════════════════════════════════════════════════

/// Logical operation kinds carried over the encrypted channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Streamed text inference.
    TextStream,
    /// Structured image generation.
    ImageGeneration,
}

impl OperationKind {
    pub const ALL: [OperationKind; 2] = [OperationKind::TextStream, OperationKind::ImageGeneration];

    /// Fixed associated-data string binding ciphertexts to this operation.
    pub fn context(&self) -> &'static str {
        match self {
            OperationKind::TextStream => "infermarket/v1/text-stream",
            OperationKind::ImageGeneration => "infermarket/v1/image-generation",
        }
    }

    pub fn from_context(context: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.context() == context)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::TextStream => "text_stream",
            OperationKind::ImageGeneration => "image_generation",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-call options for `send_prompt`.
#[derive(Clone, Debug)]
pub struct PromptOptions {
    /// Maximum tokens to generate.
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Deadline for queue admission and for each reply fragment.
    pub timeout: Option<std::time::Duration>,
    /// Allow the intent router to reroute to structured operations.
    pub intent_routing: bool,
}

impl Default for PromptOptions {
    fn default() -> Self {
        Self {
            max_tokens: None,
            temperature: None,
            timeout: None,
            intent_routing: true,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// REPLIES
// ═══════════════════════════════════════════════════════════════════════════════

/// Decrypted image-generation output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageResult {
    /// Base64-encoded PNG.
    pub image_base64: String,
    pub size: ImageSize,
    pub steps: u32,
    /// Billable units charged by the host for this image.
    pub tokens: u32,
}

/// One decrypted piece of a streamed reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplyFragment {
    Text { content: String, tokens: u32 },
    Image(ImageResult),
    /// Explicit end-of-stream marker; always the last item of a successful reply.
    End { finish_reason: String },
}

/// A fully collected reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub message_id: MessageId,
    pub kind: OperationKind,
    pub text: String,
    pub image: Option<ImageResult>,
    pub tokens: u64,
    pub finish_reason: Option<String>,
}

impl Reply {
    pub(crate) fn empty(message_id: MessageId, kind: OperationKind) -> Self {
        Self {
            message_id,
            kind,
            text: String::new(),
            image: None,
            tokens: 0,
            finish_reason: None,
        }
    }
}

/// Payload handed to the structured-result callback.
#[derive(Clone, Debug)]
pub struct StructuredResult {
    pub session_id: SessionId,
    pub message_id: MessageId,
    pub operation: OperationKind,
    pub clean_prompt: String,
    pub parameters: ImageParameters,
    pub image: ImageResult,
}
