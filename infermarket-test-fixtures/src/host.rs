//! In-process compute host speaking the real wire protocol over channels.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use infermarket_session::crypto::handshake_transcript;
use infermarket_session::{
    Connector, EncryptedChannel, EncryptedEnvelope, EnvelopeType, Frame, HostEndpoint, HostErrorCode,
    HostInfo, IdentityKey, ImageResult, KeyAgreement, MessageId, ModelId, OperationKind, RequestBody,
    ResponseBody, Role, SessionId, Transport, TransportError,
};
use tokio::sync::mpsc;

/// 1x1 transparent PNG.
pub const PLACEHOLDER_PNG: &str =
    "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAQAAAC1HAwCAAAAC0lEQVR42mNkYAAAAAYAAjCB0C8AAAAASUVORK5CYII=";

/// One-shot misbehaviour, consumed the first time it applies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostFault {
    /// Next connect fails.
    Unreachable,
    /// Next handshake is answered with a plaintext `unauthorized` error.
    RejectHandshake,
    /// Next handshake is never answered.
    SilentHandshake,
    /// Next ack is signed over a transcript with the keys swapped.
    BadSignature,
    /// Next request is answered with `session_not_found` and the connection dropped.
    ForgetSession,
    /// Next reply is cut after its first fragment with `session_not_found`.
    ForgetMidReply,
    /// First fragment of the next reply has a flipped ciphertext bit.
    CorruptChunk,
    /// First fragment of the next reply is sent twice.
    ReplayChunk,
    /// First fragment of the next reply is sealed under the other operation's context.
    WrongContext,
    /// Next reply starts after a pause.
    Delay(Duration),
    /// Next request drops the connection without a reply.
    Hangup,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HostRequest {
    pub session_id: SessionId,
    pub message_id: MessageId,
    pub nonce_index: u64,
    pub body: RequestBody,
}

impl HostRequest {
    pub fn prompt(&self) -> &str {
        match &self.body {
            RequestBody::Inference { prompt, .. } | RequestBody::ImageGeneration { prompt, .. } => prompt,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum HostEvent {
    Connected,
    Handshake { session_id: SessionId },
    Request(HostRequest),
    Forgot { session_id: SessionId },
    Closed { session_id: SessionId },
}

struct HostState {
    endpoint: HostEndpoint,
    models: Vec<ModelId>,
    identity: Option<IdentityKey>,
    text_reply: Mutex<Vec<(String, u32)>>,
    image_tokens: Mutex<u32>,
    faults: Mutex<Vec<HostFault>>,
    events: Mutex<Vec<HostEvent>>,
    connections: AtomicUsize,
}

impl HostState {
    fn take_fault(&self, want: impl Fn(&HostFault) -> bool) -> Option<HostFault> {
        let mut faults = self.faults.lock().unwrap();
        let position = faults.iter().position(want)?;
        Some(faults.remove(position))
    }

    fn has_fault(&self, fault: &HostFault) -> bool {
        self.take_fault(|f| f == fault).is_some()
    }

    fn log(&self, event: HostEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// A host that serves one model. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MockHost {
    state: Arc<HostState>,
}

impl MockHost {
    pub fn new(model: &str) -> Self {
        Self::build(model, None)
    }

    /// A host that signs its handshakes with a long-term identity.
    pub fn signed(model: &str) -> Self {
        Self::build(model, Some(IdentityKey::generate()))
    }

    fn build(model: &str, identity: Option<IdentityKey>) -> Self {
        Self {
            state: Arc::new(HostState {
                endpoint: HostEndpoint::new("mock://host-1/v1/ws"),
                models: vec![ModelId::new(model)],
                identity,
                text_reply: Mutex::new(vec![
                    ("Hello".to_string(), 1),
                    (", ".to_string(), 1),
                    ("world".to_string(), 1),
                ]),
                image_tokens: Mutex::new(50),
                faults: Mutex::new(Vec::new()),
                events: Mutex::new(Vec::new()),
                connections: AtomicUsize::new(0),
            }),
        }
    }

    /// What discovery should report for this host.
    pub fn info(&self) -> HostInfo {
        HostInfo {
            endpoint: self.state.endpoint.clone(),
            host_public_key: self.state.identity.as_ref().map(IdentityKey::public_bytes),
            models: self.state.models.clone(),
            min_price_per_token: 1,
        }
    }

    /// Fragments of every text reply, as `(content, tokens)`.
    pub fn set_text_reply(&self, chunks: &[(&str, u32)]) {
        *self.state.text_reply.lock().unwrap() =
            chunks.iter().map(|(content, tokens)| (content.to_string(), *tokens)).collect();
    }

    pub fn set_image_tokens(&self, tokens: u32) {
        *self.state.image_tokens.lock().unwrap() = tokens;
    }

    pub fn inject(&self, fault: HostFault) {
        self.state.faults.lock().unwrap().push(fault);
    }

    pub fn events(&self) -> Vec<HostEvent> {
        self.state.events.lock().unwrap().clone()
    }

    pub fn requests(&self) -> Vec<HostRequest> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                HostEvent::Request(request) => Some(request),
                _ => None,
            })
            .collect()
    }

    pub fn handshakes(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, HostEvent::Handshake { .. }))
            .count()
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockHost {
    async fn connect(&self, endpoint: &HostEndpoint) -> Result<Box<dyn Transport>, TransportError> {
        if *endpoint != self.state.endpoint || self.state.has_fault(&HostFault::Unreachable) {
            return Err(TransportError::Connect {
                endpoint: endpoint.to_string(),
                reason: "connection refused".into(),
            });
        }
        self.state.connections.fetch_add(1, Ordering::SeqCst);
        self.state.log(HostEvent::Connected);

        let (to_host, host_inbox) = mpsc::channel(64);
        let (host_outbox, from_host) = mpsc::channel(64);
        tokio::spawn(serve(Arc::clone(&self.state), host_inbox, host_outbox));

        Ok(Box::new(ChannelTransport {
            outbound: Some(to_host),
            inbound: from_host,
        }))
    }
}

/// Client end of an in-process connection. Frames travel as JSON text.
struct ChannelTransport {
    outbound: Option<mpsc::Sender<String>>,
    inbound: mpsc::Receiver<String>,
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or_else(|| TransportError::Closed("transport closed locally".into()))?;
        let text = frame.to_json().map_err(|e| TransportError::Malformed(e.to_string()))?;
        outbound
            .send(text)
            .await
            .map_err(|_| TransportError::Send("host went away".into()))
    }

    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        match self.inbound.recv().await {
            Some(text) => Frame::from_json(&text)
                .map(Some)
                .map_err(|e| TransportError::Malformed(e.to_string())),
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.outbound.take();
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HOST SIDE
// ═══════════════════════════════════════════════════════════════════════════════

async fn send(outbox: &mpsc::Sender<String>, frame: Frame) -> bool {
    match frame.to_json() {
        Ok(text) => outbox.send(text).await.is_ok(),
        Err(_) => false,
    }
}

fn plaintext_error(session_id: SessionId, message_id: Option<MessageId>, code: HostErrorCode, message: &str) -> Frame {
    Frame::Error {
        session_id: Some(session_id),
        message_id,
        code,
        message: message.to_string(),
    }
}

async fn serve(state: Arc<HostState>, mut inbox: mpsc::Receiver<String>, outbox: mpsc::Sender<String>) {
    let Some((mut channel, session_id)) = accept(&state, &mut inbox, &outbox).await else {
        return;
    };

    while let Some(text) = inbox.recv().await {
        match Frame::from_json(&text) {
            Ok(Frame::EncryptedMessage(envelope)) => {
                if !respond(&state, &mut channel, &envelope, &outbox).await {
                    break;
                }
            }
            Ok(Frame::SessionClose { .. }) => {
                state.log(HostEvent::Closed { session_id });
                break;
            }
            Ok(_) | Err(_) => {}
        }
    }
}

async fn accept(
    state: &HostState,
    inbox: &mut mpsc::Receiver<String>,
    outbox: &mpsc::Sender<String>,
) -> Option<(EncryptedChannel, SessionId)> {
    while let Some(text) = inbox.recv().await {
        let Ok(Frame::SessionInit {
            session_id,
            model,
            client_public_key,
        }) = Frame::from_json(&text)
        else {
            continue;
        };

        if !state.models.contains(&model) {
            send(outbox, plaintext_error(session_id, None, HostErrorCode::InvalidRequest, "model not served")).await;
            return None;
        }
        if state.has_fault(&HostFault::RejectHandshake) {
            send(outbox, plaintext_error(session_id, None, HostErrorCode::Unauthorized, "deposit not found")).await;
            return None;
        }
        if state.has_fault(&HostFault::SilentHandshake) {
            while inbox.recv().await.is_some() {}
            return None;
        }

        let agreement = KeyAgreement::new();
        let host_public_key = agreement.public_bytes();
        let signature = state.identity.as_ref().map(|identity| {
            let transcript = if state.has_fault(&HostFault::BadSignature) {
                handshake_transcript(&session_id, &host_public_key, &client_public_key)
            } else {
                handshake_transcript(&session_id, &client_public_key, &host_public_key)
            };
            identity.sign(&transcript).to_vec()
        });
        let key = agreement.complete(&client_public_key, &session_id, Role::Host).ok()?;

        let ack = Frame::SessionInitAck {
            session_id,
            host_public_key,
            signature,
        };
        if !send(outbox, ack).await {
            return None;
        }
        state.log(HostEvent::Handshake { session_id });
        return Some((EncryptedChannel::new(session_id, key, Role::Host), session_id));
    }
    None
}

/// Serve one request. Returns false when the connection should drop.
async fn respond(
    state: &HostState,
    channel: &mut EncryptedChannel,
    envelope: &EncryptedEnvelope,
    outbox: &mpsc::Sender<String>,
) -> bool {
    let session_id = channel.session_id();
    let message_id = envelope.message_id;

    let Some(kind) = OperationKind::from_context(&envelope.associated_data) else {
        return send(outbox, plaintext_error(session_id, Some(message_id), HostErrorCode::InvalidRequest, "unknown operation")).await;
    };
    let request: RequestBody = match channel.open(envelope, kind) {
        Ok(request) => request,
        Err(err) => {
            return send(outbox, plaintext_error(session_id, Some(message_id), HostErrorCode::InvalidRequest, &err.to_string())).await;
        }
    };
    state.log(HostEvent::Request(HostRequest {
        session_id,
        message_id,
        nonce_index: envelope.nonce_index,
        body: request.clone(),
    }));

    if state.has_fault(&HostFault::Hangup) {
        return false;
    }
    if state.has_fault(&HostFault::ForgetSession) {
        state.log(HostEvent::Forgot { session_id });
        send(outbox, plaintext_error(session_id, Some(message_id), HostErrorCode::SessionNotFound, "session not found")).await;
        return false;
    }
    if let Some(HostFault::Delay(pause)) = state.take_fault(|f| matches!(f, HostFault::Delay(_))) {
        tokio::time::sleep(pause).await;
    }

    let bodies = reply_bodies(state, request);

    let corrupt = state.has_fault(&HostFault::CorruptChunk);
    let replay = state.has_fault(&HostFault::ReplayChunk);
    let wrong_context = state.has_fault(&HostFault::WrongContext);
    let forget_mid = state.has_fault(&HostFault::ForgetMidReply);

    for (position, body) in bodies.iter().enumerate() {
        let first = position == 0;
        let seal_kind = match (first && wrong_context, kind) {
            (true, OperationKind::TextStream) => OperationKind::ImageGeneration,
            (true, OperationKind::ImageGeneration) => OperationKind::TextStream,
            (false, kind) => kind,
        };
        let Ok(mut sealed) = channel.seal(EnvelopeType::Response, message_id, seal_kind, body) else {
            return false;
        };
        if first && corrupt {
            sealed.ciphertext[0] ^= 0x01;
        }
        if !send(outbox, Frame::EncryptedMessage(sealed.clone())).await {
            return false;
        }
        if first && replay && !send(outbox, Frame::EncryptedMessage(sealed)).await {
            return false;
        }
        if first && forget_mid {
            state.log(HostEvent::Forgot { session_id });
            send(outbox, plaintext_error(session_id, Some(message_id), HostErrorCode::SessionNotFound, "session evicted")).await;
            return false;
        }
    }
    true
}

fn reply_bodies(state: &HostState, request: RequestBody) -> Vec<ResponseBody> {
    let mut bodies: Vec<ResponseBody> = match request {
        RequestBody::Inference { .. } => state
            .text_reply
            .lock()
            .unwrap()
            .iter()
            .map(|(content, tokens)| ResponseBody::TokenChunk {
                content: content.clone(),
                tokens: *tokens,
            })
            .collect(),
        RequestBody::ImageGeneration { size, steps, .. } => vec![ResponseBody::ImageResult(ImageResult {
            image_base64: PLACEHOLDER_PNG.to_string(),
            size,
            steps,
            tokens: *state.image_tokens.lock().unwrap(),
        })],
    };
    bodies.push(ResponseBody::StreamEnd {
        finish_reason: "stop".into(),
    });
    bodies
}
