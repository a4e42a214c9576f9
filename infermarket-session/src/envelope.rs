//! Wire format: JSON frames carrying hex-encoded encrypted envelopes.
//!
//! Every frame is a JSON object with a `"type"` discriminator. Inside an
//! `encrypted_message` frame, the ciphertext decrypts to a [`RequestBody`],
//! [`ResponseBody`] or [`ErrorBody`] depending on the envelope type.

use serde::{Deserialize, Serialize};

use crate::crypto::Direction;
use crate::intent::ImageSize;
use crate::types::{ImageResult, MessageId, ModelId, OperationKind, SessionId};

// ═══════════════════════════════════════════════════════════════════════════════
// ENVELOPES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    Request,
    Response,
    /// Host-side error raised inside an established session.
    Error,
}

impl EnvelopeType {
    pub fn tag(&self) -> u8 {
        match self {
            EnvelopeType::Request => 0x10,
            EnvelopeType::Response => 0x11,
            EnvelopeType::Error => 0x12,
        }
    }
}

/// A single encrypted wire message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub envelope_type: EnvelopeType,
    pub session_id: SessionId,
    pub message_id: MessageId,
    pub nonce_index: u64,
    #[serde(with = "hex_bytes")]
    pub ciphertext: Vec<u8>,
    /// Operation context string, e.g. `infermarket/v1/text-stream`.
    pub associated_data: String,
}

impl EncryptedEnvelope {
    /// AEAD associated data: the context string plus every header field.
    pub fn binding(&self, direction: Direction) -> Vec<u8> {
        binding_aad(
            &self.associated_data,
            &self.session_id,
            &self.message_id,
            self.envelope_type,
            self.nonce_index,
            direction,
        )
    }
}

pub fn binding_aad(
    associated_data: &str,
    session_id: &SessionId,
    message_id: &MessageId,
    envelope_type: EnvelopeType,
    nonce_index: u64,
    direction: Direction,
) -> Vec<u8> {
    let mut aad = Vec::with_capacity(associated_data.len() + 59);
    aad.extend_from_slice(associated_data.as_bytes());
    aad.push(0x00);
    aad.extend_from_slice(session_id.as_bytes());
    aad.extend_from_slice(message_id.as_bytes());
    aad.push(envelope_type.tag());
    aad.extend_from_slice(&nonce_index.to_le_bytes());
    aad.push(direction.tag());
    aad
}

// ═══════════════════════════════════════════════════════════════════════════════
// FRAMES
// ═══════════════════════════════════════════════════════════════════════════════

/// Error codes a host may report, in plaintext frames or encrypted error bodies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostErrorCode {
    SessionNotFound,
    SessionInactive,
    InvalidRequest,
    RateLimited,
    Unauthorized,
    Internal,
    #[serde(other)]
    Unknown,
}

impl HostErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostErrorCode::SessionNotFound => "session_not_found",
            HostErrorCode::SessionInactive => "session_inactive",
            HostErrorCode::InvalidRequest => "invalid_request",
            HostErrorCode::RateLimited => "rate_limited",
            HostErrorCode::Unauthorized => "unauthorized",
            HostErrorCode::Internal => "internal",
            HostErrorCode::Unknown => "unknown",
        }
    }

    /// The host no longer knows this session; recovery applies.
    pub fn is_session_lost(&self) -> bool {
        matches!(self, HostErrorCode::SessionNotFound | HostErrorCode::SessionInactive)
    }
}

impl std::fmt::Display for HostErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level wire frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    SessionInit {
        session_id: SessionId,
        model: ModelId,
        #[serde(with = "hex_key")]
        client_public_key: [u8; 32],
    },
    SessionInitAck {
        session_id: SessionId,
        #[serde(with = "hex_key")]
        host_public_key: [u8; 32],
        /// Host identity signature over the handshake transcript.
        #[serde(default, with = "hex_opt", skip_serializing_if = "Option::is_none")]
        signature: Option<Vec<u8>>,
    },
    EncryptedMessage(EncryptedEnvelope),
    /// Plaintext error, for failures before a key exists or outside any session.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
        code: HostErrorCode,
        message: String,
    },
    SessionClose {
        session_id: SessionId,
    },
}

impl Frame {
    pub fn type_name(&self) -> &'static str {
        match self {
            Frame::SessionInit { .. } => "session_init",
            Frame::SessionInitAck { .. } => "session_init_ack",
            Frame::EncryptedMessage(_) => "encrypted_message",
            Frame::Error { .. } => "error",
            Frame::SessionClose { .. } => "session_close",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PLAINTEXT BODIES
// ═══════════════════════════════════════════════════════════════════════════════

/// Decrypted content of a `request` envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestBody {
    Inference {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_tokens: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        temperature: Option<f32>,
    },
    ImageGeneration {
        prompt: String,
        size: ImageSize,
        steps: u32,
    },
}

impl RequestBody {
    pub fn operation(&self) -> OperationKind {
        match self {
            RequestBody::Inference { .. } => OperationKind::TextStream,
            RequestBody::ImageGeneration { .. } => OperationKind::ImageGeneration,
        }
    }
}

/// Decrypted content of a `response` envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseBody {
    TokenChunk { content: String, tokens: u32 },
    ImageResult(ImageResult),
    StreamEnd { finish_reason: String },
}

/// Decrypted content of an `error` envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: HostErrorCode,
    pub message: String,
}

// ═══════════════════════════════════════════════════════════════════════════════
// HEX SERDE HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

pub(crate) mod hex_key {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|v: Vec<u8>| serde::de::Error::invalid_length(v.len(), &"32 bytes"))
    }
}

mod hex_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => hex::decode(s).map(Some).map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
