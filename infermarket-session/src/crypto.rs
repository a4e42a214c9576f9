//! Cryptographic primitives for the session channel and settlement proofs.
//!
//! - Key agreement: X25519 with a fresh client secret per handshake.
//! - Key derivation: `BLAKE3::derive_key` over the shared secret and the
//!   handshake transcript (session id, both public keys).
//! - AEAD: XChaCha20-Poly1305. The 24-byte nonce is the direction tag, zero
//!   padding, then the little-endian message index.
//! - Signatures: Ed25519 for host handshake attestations and payer proofs.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::SessionError;
use crate::types::SessionId;

/// Domain-separation context for session key derivation.
pub const SESSION_KEY_CONTEXT: &str = "infermarket 2024-06 session channel key v1";

/// Prefix of the transcript a host signs during the handshake.
pub const HANDSHAKE_DOMAIN: &[u8] = b"infermarket/v1/handshake";

pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;

// ═══════════════════════════════════════════════════════════════════════════════
// DIRECTIONS
// ═══════════════════════════════════════════════════════════════════════════════

/// Flow direction of an envelope. Each direction has its own nonce space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    ClientToHost,
    HostToClient,
}

impl Direction {
    pub fn tag(&self) -> u8 {
        match self {
            Direction::ClientToHost => 0x01,
            Direction::HostToClient => 0x02,
        }
    }
}

/// Which end of the channel this process plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Client,
    Host,
}

impl Role {
    pub fn outbound(&self) -> Direction {
        match self {
            Role::Client => Direction::ClientToHost,
            Role::Host => Direction::HostToClient,
        }
    }

    pub fn inbound(&self) -> Direction {
        match self {
            Role::Client => Direction::HostToClient,
            Role::Host => Direction::ClientToHost,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SESSION KEY
// ═══════════════════════════════════════════════════════════════════════════════

/// Symmetric channel key. Wiped on drop, never serialized.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Key fingerprint for logs. Reveals nothing about the key.
    pub fn fingerprint(&self) -> String {
        let digest = blake3::hash(&self.0);
        hex::encode(&digest.as_bytes()[..4])
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(&self.0))
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionKey({})", self.fingerprint())
    }
}

/// Nonce for `index` in `direction`.
pub fn nonce_for(direction: Direction, index: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[0] = direction.tag();
    nonce[NONCE_LEN - 8..].copy_from_slice(&index.to_le_bytes());
    nonce
}

/// Encrypt and authenticate `plaintext` bound to `aad`.
pub fn seal(
    key: &SessionKey,
    direction: Direction,
    index: u64,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, SessionError> {
    let nonce = nonce_for(direction, index);
    key.cipher()
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| SessionError::Internal("AEAD encryption failed".into()))
}

/// Verify and decrypt. Any mismatch in key, nonce, AAD or ciphertext fails closed.
pub fn open(
    key: &SessionKey,
    direction: Direction,
    index: u64,
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, SessionError> {
    if ciphertext.len() < TAG_LEN {
        return Err(SessionError::DecryptionFailed(format!(
            "ciphertext shorter than tag ({} bytes)",
            ciphertext.len()
        )));
    }
    let nonce = nonce_for(direction, index);
    key.cipher()
        .decrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| SessionError::DecryptionFailed("authentication tag mismatch".into()))
}

// ═══════════════════════════════════════════════════════════════════════════════
// KEY AGREEMENT
// ═══════════════════════════════════════════════════════════════════════════════

/// One side of an X25519 exchange. The secret is consumed by [`complete`](Self::complete).
pub struct KeyAgreement {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl Default for KeyAgreement {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyAgreement {
    pub fn new() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// Finish the exchange against the peer's public key and derive the channel key.
    pub fn complete(
        self,
        peer_public: &[u8; 32],
        session_id: &SessionId,
        role: Role,
    ) -> Result<SessionKey, SessionError> {
        let own = self.public_bytes();
        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer_public));
        if !shared.was_contributory() {
            return Err(SessionError::HandshakeFailed(
                "peer sent a low-order public key".into(),
            ));
        }

        let (client_pub, host_pub) = match role {
            Role::Client => (own, *peer_public),
            Role::Host => (*peer_public, own),
        };

        let mut material = Vec::with_capacity(32 * 4);
        material.extend_from_slice(shared.as_bytes());
        material.extend_from_slice(session_id.as_bytes());
        material.extend_from_slice(&client_pub);
        material.extend_from_slice(&host_pub);

        let key = SessionKey(blake3::derive_key(SESSION_KEY_CONTEXT, &material));
        material.zeroize();
        Ok(key)
    }
}

/// Bytes a host signs to attest its ephemeral key for `session_id`.
pub fn handshake_transcript(
    session_id: &SessionId,
    client_public: &[u8; 32],
    host_public: &[u8; 32],
) -> Vec<u8> {
    let mut transcript = Vec::with_capacity(HANDSHAKE_DOMAIN.len() + 96);
    transcript.extend_from_slice(HANDSHAKE_DOMAIN);
    transcript.extend_from_slice(session_id.as_bytes());
    transcript.extend_from_slice(client_public);
    transcript.extend_from_slice(host_public);
    transcript
}

/// Check the host's Ed25519 signature over the handshake transcript.
pub fn verify_host_signature(
    host_identity: &[u8; 32],
    transcript: &[u8],
    signature: &[u8],
) -> Result<(), SessionError> {
    verify_signature(host_identity, transcript, signature)
        .map_err(|reason| SessionError::HandshakeFailed(format!("host signature: {}", reason)))
}

/// Strict Ed25519 verification. Returns a short reason on failure.
pub fn verify_signature(public_key: &[u8; 32], message: &[u8], signature: &[u8]) -> Result<(), String> {
    let key = VerifyingKey::from_bytes(public_key).map_err(|e| format!("bad public key: {}", e))?;
    let signature =
        Signature::from_slice(signature).map_err(|e| format!("malformed signature: {}", e))?;
    key.verify_strict(message, &signature)
        .map_err(|_| "signature does not verify".to_string())
}

// ═══════════════════════════════════════════════════════════════════════════════
// SIGNING KEYS
// ═══════════════════════════════════════════════════════════════════════════════

/// Ed25519 key used to sign checkpoint proofs (payer) or handshakes (host).
#[derive(Clone)]
pub struct IdentityKey {
    signing: SigningKey,
}

impl IdentityKey {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_bytes(secret: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(secret),
        }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }
}

impl std::fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IdentityKey(0x{}..)", hex::encode(&self.public_bytes()[..4]))
    }
}
