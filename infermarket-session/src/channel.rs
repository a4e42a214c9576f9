//! Ordered, authenticated channel state for one session binding.
//!
//! The channel is the only writer of the per-direction indexes. Outbound
//! envelopes take the next `send_index`. Inbound envelopes must carry exactly
//! the expected `recv_index`:
//!
//! | inbound case                | result             | `recv_index` |
//! |-----------------------------|--------------------|--------------|
//! | index != expected           | `ReplayDetected`   | unchanged    |
//! | index ok, bad tag / context | `DecryptionFailed` | advanced     |
//! | index ok, authentic         | decoded body       | advanced     |

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{trace, warn};

use crate::crypto::{self, Role, SessionKey};
use crate::envelope::{binding_aad, EncryptedEnvelope, EnvelopeType};
use crate::error::SessionError;
use crate::types::{MessageId, OperationKind, SessionId};

pub struct EncryptedChannel {
    session_id: SessionId,
    key: Option<SessionKey>,
    role: Role,
    send_index: u64,
    recv_index: u64,
}

impl EncryptedChannel {
    /// A fresh channel. Both indexes start at zero.
    pub fn new(session_id: SessionId, key: SessionKey, role: Role) -> Self {
        Self {
            session_id,
            key: Some(key),
            role,
            send_index: 0,
            recv_index: 0,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn send_index(&self) -> u64 {
        self.send_index
    }

    pub fn recv_index(&self) -> u64 {
        self.recv_index
    }

    pub fn is_retired(&self) -> bool {
        self.key.is_none()
    }

    pub fn key_fingerprint(&self) -> Option<String> {
        self.key.as_ref().map(SessionKey::fingerprint)
    }

    /// Serialize `body`, encrypt it under the next outbound index and wrap it.
    pub fn seal<T: Serialize>(
        &mut self,
        envelope_type: EnvelopeType,
        message_id: MessageId,
        kind: OperationKind,
        body: &T,
    ) -> Result<EncryptedEnvelope, SessionError> {
        let key = self.live_key()?;
        let plaintext = serde_json::to_vec(body)?;
        let index = self.send_index;
        let next = index
            .checked_add(1)
            .ok_or_else(|| SessionError::Internal("send index exhausted".into()))?;

        let aad = binding_aad(
            kind.context(),
            &self.session_id,
            &message_id,
            envelope_type,
            index,
            self.role.outbound(),
        );
        let ciphertext = crypto::seal(key, self.role.outbound(), index, &aad, &plaintext)?;
        self.send_index = next;

        trace!(
            session = %self.session_id.short(),
            %message_id,
            nonce_index = index,
            "sealed envelope"
        );

        Ok(EncryptedEnvelope {
            envelope_type,
            session_id: self.session_id,
            message_id,
            nonce_index: index,
            ciphertext,
            associated_data: kind.context().to_string(),
        })
    }

    /// Authenticate and decode the next inbound envelope as operation `kind`.
    pub fn open<T: DeserializeOwned>(
        &mut self,
        envelope: &EncryptedEnvelope,
        kind: OperationKind,
    ) -> Result<T, SessionError> {
        self.expect_index(envelope)?;
        let opened = self.decrypt(envelope, kind);
        // The slot is consumed whether or not the frame authenticated.
        self.recv_index += 1;
        let plaintext = opened?;
        serde_json::from_slice(&plaintext).map_err(|e| {
            SessionError::Serialization(format!("authentic envelope with bad body: {}", e))
        })
    }

    /// Consume the next inbound slot without decrypting.
    pub fn skip(&mut self, envelope: &EncryptedEnvelope) -> Result<(), SessionError> {
        self.expect_index(envelope)?;
        self.recv_index += 1;
        trace!(
            session = %self.session_id.short(),
            message_id = %envelope.message_id,
            nonce_index = envelope.nonce_index,
            "skipped envelope"
        );
        Ok(())
    }

    /// Drop the key. The channel refuses all further work.
    pub fn retire(&mut self) {
        if self.key.take().is_some() {
            trace!(session = %self.session_id.short(), "channel key retired");
        }
    }

    fn live_key(&self) -> Result<&SessionKey, SessionError> {
        self.key
            .as_ref()
            .ok_or_else(|| SessionError::Internal("channel key already retired".into()))
    }

    fn expect_index(&self, envelope: &EncryptedEnvelope) -> Result<(), SessionError> {
        self.live_key()?;
        if envelope.nonce_index != self.recv_index {
            warn!(
                session = %self.session_id.short(),
                expected = self.recv_index,
                received = envelope.nonce_index,
                "out-of-order envelope rejected"
            );
            return Err(SessionError::ReplayDetected {
                expected: self.recv_index,
                received: envelope.nonce_index,
            });
        }
        Ok(())
    }

    fn decrypt(&self, envelope: &EncryptedEnvelope, kind: OperationKind) -> Result<Vec<u8>, SessionError> {
        let key = self.live_key()?;
        if envelope.session_id != self.session_id {
            return Err(SessionError::DecryptionFailed(
                "envelope addressed to another session".into(),
            ));
        }
        if envelope.associated_data != kind.context() {
            return Err(SessionError::DecryptionFailed(format!(
                "context mismatch: expected {}, got {}",
                kind.context(),
                envelope.associated_data
            )));
        }
        // Bind against the expected context and our own session id, never the
        // values claimed by the frame.
        let aad = binding_aad(
            kind.context(),
            &self.session_id,
            &envelope.message_id,
            envelope.envelope_type,
            envelope.nonce_index,
            self.role.inbound(),
        );
        crypto::open(key, self.role.inbound(), envelope.nonce_index, &aad, &envelope.ciphertext)
    }
}

impl std::fmt::Debug for EncryptedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedChannel")
            .field("session_id", &self.session_id)
            .field("role", &self.role)
            .field("send_index", &self.send_index)
            .field("recv_index", &self.recv_index)
            .field("retired", &self.is_retired())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::ResponseBody;
    use proptest::prelude::*;

    fn pair() -> (EncryptedChannel, EncryptedChannel) {
        let id = SessionId::from_bytes([4; 32]);
        let key = [9u8; 32];
        (
            EncryptedChannel::new(id, SessionKey::from_bytes(key), Role::Client),
            EncryptedChannel::new(id, SessionKey::from_bytes(key), Role::Host),
        )
    }

    fn chunk(content: &str) -> ResponseBody {
        ResponseBody::TokenChunk {
            content: content.into(),
            tokens: 1,
        }
    }

    #[test]
    fn test_host_reply_opens_in_order() {
        let (mut client, mut host) = pair();
        let id = uuid::Uuid::new_v4();
        let first = host
            .seal(EnvelopeType::Response, id, OperationKind::TextStream, &chunk("a"))
            .unwrap();
        let second = host
            .seal(EnvelopeType::Response, id, OperationKind::TextStream, &chunk("b"))
            .unwrap();
        assert_eq!((first.nonce_index, second.nonce_index), (0, 1));

        let body: ResponseBody = client.open(&first, OperationKind::TextStream).unwrap();
        assert_eq!(body, chunk("a"));
        let body: ResponseBody = client.open(&second, OperationKind::TextStream).unwrap();
        assert_eq!(body, chunk("b"));
        assert_eq!(client.recv_index(), 2);
    }

    #[test]
    fn test_replay_rejected_without_advancing() {
        let (mut client, mut host) = pair();
        let id = uuid::Uuid::new_v4();
        let env = host
            .seal(EnvelopeType::Response, id, OperationKind::TextStream, &chunk("a"))
            .unwrap();
        let _: ResponseBody = client.open(&env, OperationKind::TextStream).unwrap();

        let err = client.open::<ResponseBody>(&env, OperationKind::TextStream).unwrap_err();
        assert!(matches!(err, SessionError::ReplayDetected { expected: 1, received: 0 }));
        assert_eq!(client.recv_index(), 1);
    }

    #[test]
    fn test_corrupt_frame_consumes_slot_and_next_frame_still_opens() {
        let (mut client, mut host) = pair();
        let id = uuid::Uuid::new_v4();
        let mut bad = host
            .seal(EnvelopeType::Response, id, OperationKind::TextStream, &chunk("a"))
            .unwrap();
        let good = host
            .seal(EnvelopeType::Response, id, OperationKind::TextStream, &chunk("b"))
            .unwrap();
        bad.ciphertext[0] ^= 0xff;

        let err = client.open::<ResponseBody>(&bad, OperationKind::TextStream).unwrap_err();
        assert!(matches!(err, SessionError::DecryptionFailed(_)));
        assert_eq!(client.recv_index(), 1);

        let body: ResponseBody = client.open(&good, OperationKind::TextStream).unwrap();
        assert_eq!(body, chunk("b"));
    }

    #[test]
    fn test_wrong_context_fails_closed() {
        let (mut client, mut host) = pair();
        let env = host
            .seal(
                EnvelopeType::Response,
                uuid::Uuid::new_v4(),
                OperationKind::ImageGeneration,
                &chunk("a"),
            )
            .unwrap();
        let err = client.open::<ResponseBody>(&env, OperationKind::TextStream).unwrap_err();
        assert!(matches!(err, SessionError::DecryptionFailed(_)));

        // Relabelling the context does not help: the binding is authenticated.
        let mut relabelled = host
            .seal(
                EnvelopeType::Response,
                uuid::Uuid::new_v4(),
                OperationKind::ImageGeneration,
                &chunk("b"),
            )
            .unwrap();
        relabelled.associated_data = OperationKind::TextStream.context().into();
        assert!(client.open::<ResponseBody>(&relabelled, OperationKind::TextStream).is_err());
    }

    #[test]
    fn test_header_tampering_fails_closed() {
        let (mut client, mut host) = pair();
        let mut env = host
            .seal(EnvelopeType::Response, uuid::Uuid::new_v4(), OperationKind::TextStream, &chunk("a"))
            .unwrap();
        env.envelope_type = EnvelopeType::Error;
        assert!(matches!(
            client.open::<ResponseBody>(&env, OperationKind::TextStream),
            Err(SessionError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_skip_and_retire() {
        let (mut client, mut host) = pair();
        let env = host
            .seal(EnvelopeType::Response, uuid::Uuid::new_v4(), OperationKind::TextStream, &chunk("a"))
            .unwrap();
        client.skip(&env).unwrap();
        assert_eq!(client.recv_index(), 1);

        client.retire();
        assert!(client.is_retired());
        assert!(client
            .seal(EnvelopeType::Request, uuid::Uuid::new_v4(), OperationKind::TextStream, &chunk("x"))
            .is_err());
    }

    proptest! {
        #[test]
        fn prop_send_index_strictly_increases(count in 1usize..64) {
            let (mut client, _) = pair();
            let mut seen = Vec::with_capacity(count);
            for _ in 0..count {
                let env = client
                    .seal(EnvelopeType::Request, uuid::Uuid::new_v4(), OperationKind::TextStream, &chunk("p"))
                    .unwrap();
                seen.push(env.nonce_index);
            }
            prop_assert!(seen.windows(2).all(|w| w[1] == w[0] + 1));
            prop_assert_eq!(client.send_index(), count as u64);
        }

        #[test]
        fn prop_recv_index_only_advances_on_expected_slot(offsets in proptest::collection::vec(0u64..3, 1..32)) {
            let (mut client, mut host) = pair();
            let id = uuid::Uuid::new_v4();
            for offset in offsets {
                let before = client.recv_index();
                let mut env = host
                    .seal(EnvelopeType::Response, id, OperationKind::TextStream, &chunk("t"))
                    .unwrap();
                // Re-target the frame at an arbitrary slot.
                env.nonce_index = before + offset;
                let result = client.open::<ResponseBody>(&env, OperationKind::TextStream);
                if offset == 0 {
                    prop_assert_eq!(client.recv_index(), before + 1);
                } else {
                    let is_replay = matches!(result, Err(SessionError::ReplayDetected { .. }));
                    prop_assert!(is_replay);
                    prop_assert_eq!(client.recv_index(), before);
                }
            }
        }
    }
}
