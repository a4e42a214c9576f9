//! Session engine: the public entry point.
//!
//! ```text
//!  caller ──► enqueue_prompt ──► IntentRouter ──► RateLimiter ──► RequestQueue
//!                                                                      │ permit
//!                                                                      ▼
//!  ReplyStream ◄── mpsc ◄── dispatch task ──► EncryptedChannel ──► Transport ──► host
//!                                 │
//!                                 ├── recovery (rediscover, redeposit, rehandshake)
//!                                 └── CheckpointSettlement ──► PaymentCollaborator
//! ```
//!
//! One dispatch task runs per operation. It holds the session's queue permit
//! and core lock for the whole exchange, so nonce indexes advance in admission
//! order and no two operations interleave on the wire.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channel::EncryptedChannel;
use crate::config::EngineConfig;
use crate::crypto::{handshake_transcript, verify_host_signature, IdentityKey, KeyAgreement, Role};
use crate::discovery::{Discovery, HostInfo};
use crate::envelope::{EnvelopeType, ErrorBody, Frame, RequestBody, ResponseBody};
use crate::error::SessionError;
use crate::intent::{IntentResult, IntentRouter};
use crate::payment::{PaymentCollaborator, PaymentError};
use crate::queue::{Admission, QueuePermit, Ticket};
use crate::rate_limiter::RateLimiterRegistry;
use crate::reply::{FragmentSender, ReplyStream};
use crate::session::{enforce_deadline, SessionCore, SessionHandle, SessionSnapshot};
use crate::settlement::{CheckpointSettlement, SettlementPolicy, SettlementReceipt};
use crate::transport::{Connector, Transport, TransportError};
use crate::types::{
    ImageResult, MessageId, ModelId, OperationKind, PromptOptions, Reply, ReplyFragment,
    SessionEconomics, SessionId, SessionStatus, StructuredResult,
};

/// Callback invoked with every completed structured (image) result.
pub type StructuredResultCallback = Arc<dyn Fn(StructuredResult) + Send + Sync>;

/// Leases longer than this are treated as unbounded.
const MAX_LEASE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

// ═══════════════════════════════════════════════════════════════════════════════
// ENGINE
// ═══════════════════════════════════════════════════════════════════════════════

/// Client-side session engine. Cheap to clone.
#[derive(Clone)]
pub struct SessionEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    payment: Arc<dyn PaymentCollaborator>,
    connector: Arc<dyn Connector>,
    discovery: Arc<dyn Discovery>,
    payer: IdentityKey,
    router: IntentRouter,
    limiter: RateLimiterRegistry,
    registry: tokio::sync::RwLock<HashMap<SessionId, SessionHandle>>,
    on_structured: RwLock<Option<StructuredResultCallback>>,
}

impl SessionEngine {
    pub fn new(
        config: EngineConfig,
        payment: Arc<dyn PaymentCollaborator>,
        connector: Arc<dyn Connector>,
        discovery: Arc<dyn Discovery>,
        payer: IdentityKey,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let limiter = RateLimiterRegistry::from_rules(&config.rate_limits);
        info!(
            payer = %hex::encode(&payer.public_bytes()[..8]),
            rate_limits = config.rate_limits.len(),
            "session engine ready"
        );
        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                payment,
                connector,
                discovery,
                payer,
                router: IntentRouter::new(),
                limiter,
                registry: tokio::sync::RwLock::new(HashMap::new()),
                on_structured: RwLock::new(None),
            }),
        })
    }

    /// Replace the default intent router.
    pub fn with_router(mut self, router: IntentRouter) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.router = router;
        } else {
            warn!("engine already shared, keeping the existing intent router");
        }
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Register the structured-result callback, replacing any previous one.
    pub fn on_structured_result<F>(&self, callback: F)
    where
        F: Fn(StructuredResult) + Send + Sync + 'static,
    {
        *self
            .inner
            .on_structured
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ───────────────────────────────────────────────────────────────────────────

    /// Escrow a deposit, handshake with a host and return an active session.
    pub async fn start_session(
        &self,
        model: ModelId,
        economics: SessionEconomics,
    ) -> Result<SessionHandle, SessionError> {
        economics.validate()?;
        let inner = &self.inner;

        let host = inner.resolve_host(&model, &economics).await?;
        let session_id = inner.deposit(&economics).await?;
        info!(
            session = %session_id.short(),
            model = %model,
            host = %host.endpoint,
            deposit = economics.deposit_amount,
            "deposit escrowed"
        );

        let (transport, channel) = match inner.handshake(&host, session_id, &model).await {
            Ok(pair) => pair,
            Err(err) => {
                inner.release_deposit(session_id).await;
                return Err(err);
            }
        };

        let settlement = CheckpointSettlement::new(
            session_id,
            Arc::clone(&inner.payment),
            inner.payer.clone(),
            SettlementPolicy::new(&economics, &inner.config),
        );
        let core = SessionCore {
            binding: session_id,
            host,
            channel,
            transport,
            settlement,
            recoveries: 0,
        };

        let deadline = lease_deadline(economics.duration_seconds);
        let handle = SessionHandle::new(model, economics, core, deadline);
        handle.set_status(SessionStatus::Active);
        handle.set_deadline_task(tokio::spawn(enforce_deadline(handle.downgrade(), deadline)));
        inner.registry.write().await.insert(session_id, handle.clone());

        Ok(handle)
    }

    /// Settle and close a session.
    ///
    /// Below the billable minimum the session still completes, but the call
    /// returns [`SessionError::InsufficientTokensForSettlement`] carrying the
    /// zero-cost receipt.
    pub async fn end_session(&self, session: &SessionHandle) -> Result<SettlementReceipt, SessionError> {
        self.inner.finish(session, SessionStatus::Completed).await
    }

    /// Settle a session whose lease has elapsed and mark it `Expired`.
    pub async fn expire_session(&self, session_id: SessionId) -> Result<SettlementReceipt, SessionError> {
        let session = self
            .session(&session_id)
            .await
            .ok_or(SessionError::UnknownSession(session_id))?;
        if !session.deadline_passed() {
            return Err(SessionError::ValidationFailed(format!(
                "lease for {} has not elapsed",
                session_id
            )));
        }
        self.inner.finish(&session, SessionStatus::Expired).await
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Prompts
    // ───────────────────────────────────────────────────────────────────────────

    /// Route, rate-limit and queue a prompt. Nothing is sent until
    /// [`QueuedPrompt::dispatch`] is awaited.
    pub fn enqueue_prompt(
        &self,
        session: &SessionHandle,
        prompt: &str,
        options: PromptOptions,
    ) -> Result<QueuedPrompt, SessionError> {
        ensure_accepting(session)?;
        if prompt.trim().is_empty() {
            return Err(SessionError::ValidationFailed("prompt is empty".into()));
        }
        validate_options(&options)?;

        let request = self.inner.prepare(prompt, &options)?;
        let admission = session.entry.queue.enqueue();
        debug!(
            session = %session.id().short(),
            ticket = %admission.ticket(),
            kind = %request.kind,
            queue_depth = session.entry.queue.depth(),
            "prompt queued"
        );

        Ok(QueuedPrompt {
            inner: Arc::clone(&self.inner),
            session: session.clone(),
            admission,
            request,
            timeout: options.timeout.unwrap_or_else(|| self.inner.config.request_timeout()),
        })
    }

    /// Queue a prompt and stream its reply once it reaches the front.
    pub async fn send_prompt_streaming(
        &self,
        session: &SessionHandle,
        prompt: &str,
        options: PromptOptions,
    ) -> Result<ReplyStream, SessionError> {
        self.enqueue_prompt(session, prompt, options)?.dispatch().await
    }

    /// Queue a prompt and collect its full reply.
    pub async fn send_prompt(
        &self,
        session: &SessionHandle,
        prompt: &str,
        options: PromptOptions,
    ) -> Result<Reply, SessionError> {
        self.send_prompt_streaming(session, prompt, options)
            .await?
            .collect_reply()
            .await
    }

    /// Withdraw a queued operation. In-flight operations cannot be cancelled.
    pub fn cancel(&self, session: &SessionHandle, ticket: Ticket) -> bool {
        let cancelled = session.entry.queue.cancel(ticket);
        if cancelled {
            debug!(session = %session.id().short(), %ticket, "queued prompt cancelled");
        }
        cancelled
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Introspection
    // ───────────────────────────────────────────────────────────────────────────

    pub fn session_info(&self, session: &SessionHandle) -> SessionSnapshot {
        session.snapshot()
    }

    /// Look up a session by its current binding.
    pub async fn session(&self, session_id: &SessionId) -> Option<SessionHandle> {
        self.inner.registry.read().await.get(session_id).cloned()
    }

    pub async fn sessions(&self) -> Vec<SessionSnapshot> {
        self.inner
            .registry
            .read()
            .await
            .values()
            .map(SessionHandle::snapshot)
            .collect()
    }

    /// Drop terminal sessions from the registry. Returns how many were removed.
    pub async fn prune_finished(&self) -> usize {
        let mut registry = self.inner.registry.write().await;
        let before = registry.len();
        registry.retain(|_, handle| !handle.status().is_terminal());
        before - registry.len()
    }
}

fn lease_deadline(duration_seconds: u64) -> Instant {
    let now = Instant::now();
    let lease = Duration::from_secs(duration_seconds).min(MAX_LEASE);
    now.checked_add(lease).unwrap_or(now + MAX_LEASE)
}

fn ensure_accepting(session: &SessionHandle) -> Result<(), SessionError> {
    if session.deadline_passed() && !session.status().is_terminal() {
        session.set_status(SessionStatus::Completing);
    }
    let status = session.status();
    if status.accepts_prompts() {
        Ok(())
    } else {
        Err(SessionError::SessionNotActive {
            session_id: session.id(),
            status,
        })
    }
}

fn validate_options(options: &PromptOptions) -> Result<(), SessionError> {
    if options.max_tokens == Some(0) {
        return Err(SessionError::ValidationFailed("max_tokens must be positive".into()));
    }
    if let Some(temperature) = options.temperature {
        if !temperature.is_finite() || temperature < 0.0 {
            return Err(SessionError::ValidationFailed(format!(
                "temperature {} is out of range",
                temperature
            )));
        }
    }
    if options.timeout == Some(Duration::ZERO) {
        return Err(SessionError::ValidationFailed("timeout must be positive".into()));
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// QUEUED PROMPTS
// ═══════════════════════════════════════════════════════════════════════════════

/// A routed request body plus the intent that produced it.
struct PreparedRequest {
    kind: OperationKind,
    body: RequestBody,
    intent: Option<IntentResult>,
}

/// A prompt admitted to a session's queue.
///
/// Dropping it before dispatch withdraws it from the queue.
pub struct QueuedPrompt {
    inner: Arc<EngineInner>,
    session: SessionHandle,
    admission: Admission,
    request: PreparedRequest,
    timeout: Duration,
}

impl QueuedPrompt {
    pub fn ticket(&self) -> Ticket {
        self.admission.ticket()
    }

    /// Operation the prompt was routed to.
    pub fn kind(&self) -> OperationKind {
        self.request.kind
    }

    /// Wait for this prompt's turn, send it, and return its reply stream.
    pub async fn dispatch(self) -> Result<ReplyStream, SessionError> {
        let QueuedPrompt {
            inner,
            session,
            admission,
            request,
            timeout,
        } = self;
        let ticket = admission.ticket();

        let permit = match tokio::time::timeout(timeout, admission.ready()).await {
            Ok(permit) => permit?,
            Err(_) => {
                debug!(session = %session.id().short(), %ticket, "gave up waiting for queue admission");
                return Err(SessionError::timeout("queue admission", timeout));
            }
        };

        ensure_accepting(&session)?;

        let (tx, rx) = mpsc::channel(inner.config.reply_buffer);
        let message_id = Uuid::new_v4();
        let kind = request.kind;
        debug!(session = %session.id().short(), %ticket, %message_id, %kind, "dispatching");
        let sink = ReplySink::new(tx, timeout);
        tokio::spawn(run_operation(inner, session, permit, request, message_id, sink));

        Ok(ReplyStream::new(message_id, kind, rx, timeout))
    }
}

impl std::fmt::Debug for QueuedPrompt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedPrompt")
            .field("ticket", &self.admission.ticket())
            .field("kind", &self.request.kind)
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DISPATCH
// ═══════════════════════════════════════════════════════════════════════════════

/// Why an exchange attempt did not produce a reply.
enum AttemptError {
    /// The host no longer knows the session.
    SessionLost(String),
    /// Fatal for the operation; not yet reported to the caller.
    Failed(SessionError),
    /// Already reported to the caller.
    Reported,
}

/// Forwards fragments to the caller while it is still listening.
///
/// A caller that holds its stream but stops reading is treated as gone once
/// `patience` passes without buffer space; the rest of the reply is drained.
struct ReplySink {
    tx: FragmentSender,
    patience: Duration,
    open: bool,
    delivered: bool,
}

impl ReplySink {
    fn new(tx: FragmentSender, patience: Duration) -> Self {
        Self {
            tx,
            patience,
            open: true,
            delivered: false,
        }
    }

    async fn forward(&mut self, fragment: ReplyFragment) {
        self.delivered = true;
        if self.open {
            self.deliver(Ok(fragment)).await;
        }
    }

    async fn fail(&mut self, err: SessionError) {
        if self.open {
            self.deliver(Err(err)).await;
            self.open = false;
        }
    }

    async fn deliver(&mut self, item: Result<ReplyFragment, SessionError>) {
        match tokio::time::timeout(self.patience, self.tx.send(item)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                debug!("reply stream dropped, draining remainder");
                self.open = false;
            }
            Err(_) => {
                warn!(
                    patience_ms = self.patience.as_millis() as u64,
                    "caller stopped reading its reply, draining remainder"
                );
                self.open = false;
            }
        }
    }
}

async fn run_operation(
    inner: Arc<EngineInner>,
    session: SessionHandle,
    permit: QueuePermit,
    request: PreparedRequest,
    message_id: MessageId,
    mut sink: ReplySink,
) {
    let mut core = session.entry.core.lock().await;

    let outcome = inner
        .exchange_with_recovery(&session, &mut core, &request, message_id, &mut sink)
        .await;

    let structured = match outcome {
        Ok(image) => match (&request.intent, image) {
            (Some(intent), Some(image)) => Some(StructuredResult {
                session_id: core.binding,
                message_id,
                operation: request.kind,
                clean_prompt: intent.clean_prompt.clone(),
                parameters: intent.extracted_parameters,
                image,
            }),
            _ => None,
        },
        Err(AttemptError::Reported) => None,
        Err(AttemptError::SessionLost(reason)) => {
            sink.fail(SessionError::SessionNotFound {
                session_id: core.binding,
                reason,
            })
            .await;
            None
        }
        Err(AttemptError::Failed(err)) => {
            sink.fail(err.context("send_prompt", core.binding)).await;
            None
        }
    };

    if !session.status().is_terminal() {
        if let Err(err) = core.settlement.checkpoint_if_due().await {
            warn!(
                session = %core.binding.short(),
                error = %err,
                "periodic checkpoint failed, tokens stay unsettled"
            );
        }
    }
    session.refresh(&core);

    // Delivered before the session is released so `wait_idle` observes it.
    if let Some(result) = structured {
        inner.notify_structured(result);
    }
    drop(core);
    drop(permit);
}

impl EngineInner {
    fn prepare(&self, prompt: &str, options: &PromptOptions) -> Result<PreparedRequest, SessionError> {
        let intent = if options.intent_routing {
            Some(self.router.route(prompt)).filter(|routed| routed.is_structured_intent)
        } else {
            None
        };

        let request = match intent {
            Some(intent) => PreparedRequest {
                kind: OperationKind::ImageGeneration,
                body: RequestBody::ImageGeneration {
                    prompt: intent.clean_prompt.clone(),
                    size: intent.extracted_parameters.size_or_default(),
                    steps: intent.extracted_parameters.steps_or_default(),
                },
                intent: Some(intent),
            },
            None => PreparedRequest {
                kind: OperationKind::TextStream,
                body: RequestBody::Inference {
                    prompt: prompt.to_string(),
                    max_tokens: options.max_tokens,
                    temperature: options.temperature,
                },
                intent: None,
            },
        };

        self.limiter.try_acquire(request.kind)?;
        Ok(request)
    }

    fn notify_structured(&self, result: StructuredResult) {
        let callback = self
            .on_structured
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match callback {
            Some(callback) => callback(result),
            None => debug!(message_id = %result.message_id, "structured result with no callback registered"),
        }
    }

    /// Run one operation, recovering from a single host session loss.
    async fn exchange_with_recovery(
        &self,
        session: &SessionHandle,
        core: &mut SessionCore,
        request: &PreparedRequest,
        message_id: MessageId,
        sink: &mut ReplySink,
    ) -> Result<Option<ImageResult>, AttemptError> {
        let mut recovered = false;
        loop {
            let reason = match self.exchange(session, core, request, message_id, sink).await {
                Err(AttemptError::SessionLost(reason)) => reason,
                other => return other,
            };

            if recovered {
                error!(session = %core.binding.short(), %reason, "session lost again after recovery");
                self.fail_session(session, core).await;
                return Err(AttemptError::Failed(SessionError::SessionNotFound {
                    session_id: core.binding,
                    reason,
                }));
            }

            let lost = core.binding;
            self.recover(session, core, &reason)
                .await
                .map_err(AttemptError::Failed)?;

            if sink.delivered {
                // Part of the reply already reached the caller; resending would duplicate it.
                return Err(AttemptError::Failed(SessionError::SessionNotFound {
                    session_id: lost,
                    reason: format!("{}; session recovered, retry the prompt", reason),
                }));
            }
            recovered = true;
        }
    }

    /// Send one request and relay its reply.
    async fn exchange(
        &self,
        session: &SessionHandle,
        core: &mut SessionCore,
        request: &PreparedRequest,
        message_id: MessageId,
        sink: &mut ReplySink,
    ) -> Result<Option<ImageResult>, AttemptError> {
        let kind = request.kind;
        let envelope = core
            .channel
            .seal(EnvelopeType::Request, message_id, kind, &request.body)
            .map_err(AttemptError::Failed)?;
        let nonce_index = envelope.nonce_index;

        if let Err(err) = core.transport.send(Frame::EncryptedMessage(envelope)).await {
            self.fail_session(session, core).await;
            return Err(AttemptError::Failed(err.into()));
        }
        debug!(session = %core.binding.short(), %message_id, nonce_index, %kind, "request sent");

        let idle = self.config.request_timeout();
        // Set once an error has been reported; the rest of the reply is drained silently.
        let mut failed = false;
        let mut image = None;

        loop {
            let frame = match tokio::time::timeout(idle, core.transport.recv()).await {
                Err(_) => {
                    warn!(session = %core.binding.short(), %message_id, "host went quiet mid-reply");
                    return Err(reported_or(
                        failed,
                        SessionError::timeout(format!("reply to {}", message_id), idle),
                    ));
                }
                Ok(Err(err)) => {
                    self.fail_session(session, core).await;
                    return Err(reported_or(failed, err.into()));
                }
                Ok(Ok(None)) => {
                    self.fail_session(session, core).await;
                    return Err(reported_or(
                        failed,
                        TransportError::Closed("host hung up mid-reply".into()).into(),
                    ));
                }
                Ok(Ok(Some(frame))) => frame,
            };

            match frame {
                Frame::EncryptedMessage(envelope) if envelope.message_id != message_id => {
                    // Tail of an abandoned earlier reply.
                    if let Err(err) = core.channel.skip(&envelope) {
                        debug!(error = %err, "dropping stray envelope");
                    }
                }
                Frame::EncryptedMessage(envelope) => match envelope.envelope_type {
                    EnvelopeType::Response => match core.channel.open::<ResponseBody>(&envelope, kind) {
                        Ok(ResponseBody::TokenChunk { content, tokens }) => {
                            core.settlement.record_tokens(u64::from(tokens));
                            if !failed {
                                sink.forward(ReplyFragment::Text { content, tokens }).await;
                            }
                        }
                        Ok(ResponseBody::ImageResult(result)) => {
                            core.settlement.record_tokens(u64::from(result.tokens));
                            if !failed {
                                image = Some(result.clone());
                                sink.forward(ReplyFragment::Image(result)).await;
                            }
                        }
                        Ok(ResponseBody::StreamEnd { finish_reason }) => {
                            if failed {
                                return Err(AttemptError::Reported);
                            }
                            sink.forward(ReplyFragment::End { finish_reason }).await;
                            return Ok(image);
                        }
                        Err(err @ SessionError::ReplayDetected { .. }) => {
                            warn!(session = %core.binding.short(), error = %err, "dropping replayed envelope");
                        }
                        Err(err) => {
                            warn!(
                                session = %core.binding.short(),
                                %message_id,
                                error = %err,
                                "reply envelope rejected, draining the rest of the reply"
                            );
                            if !failed {
                                sink.fail(err.context("send_prompt", core.binding)).await;
                                failed = true;
                            }
                        }
                    },
                    EnvelopeType::Error => match core.channel.open::<ErrorBody>(&envelope, kind) {
                        Ok(body) if body.code.is_session_lost() => {
                            return Err(AttemptError::SessionLost(body.message));
                        }
                        Ok(body) => {
                            return Err(reported_or(
                                failed,
                                SessionError::HostError {
                                    code: body.code.to_string(),
                                    message: body.message,
                                },
                            ));
                        }
                        Err(err @ SessionError::ReplayDetected { .. }) => {
                            warn!(session = %core.binding.short(), error = %err, "dropping replayed envelope");
                        }
                        Err(err) => return Err(reported_or(failed, err)),
                    },
                    EnvelopeType::Request => {
                        warn!(session = %core.binding.short(), "host sent a request envelope, ignoring");
                        if let Err(err) = core.channel.skip(&envelope) {
                            debug!(error = %err, "dropping stray envelope");
                        }
                    }
                },
                Frame::Error {
                    message_id: Some(about),
                    ..
                } if about != message_id => {
                    debug!(%about, "ignoring error for an abandoned reply");
                }
                Frame::Error { code, message, .. } => {
                    if code.is_session_lost() {
                        return Err(AttemptError::SessionLost(message));
                    }
                    return Err(reported_or(
                        failed,
                        SessionError::HostError {
                            code: code.to_string(),
                            message,
                        },
                    ));
                }
                Frame::SessionClose { .. } => {
                    return Err(AttemptError::SessionLost("host closed the session".into()));
                }
                other => debug!(frame = other.type_name(), "ignoring unexpected frame"),
            }
        }
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Recovery
    // ───────────────────────────────────────────────────────────────────────────

    async fn recover(
        &self,
        session: &SessionHandle,
        core: &mut SessionCore,
        reason: &str,
    ) -> Result<(), SessionError> {
        let lost = core.binding;
        session.set_status(SessionStatus::Recovering);
        warn!(session = %lost.short(), %reason, "host lost the session, recovering");

        match self.rebind(session, core).await {
            Ok(()) => {
                session.set_status(SessionStatus::Active);
                Ok(())
            }
            Err(err) => {
                error!(session = %lost.short(), error = %err, "recovery failed");
                self.fail_session(session, core).await;
                Err(err)
            }
        }
    }

    /// Open a fresh binding for the same logical session and switch to it.
    async fn rebind(&self, session: &SessionHandle, core: &mut SessionCore) -> Result<(), SessionError> {
        let model = session.model();
        let economics = session.economics();

        // An ambiguous checkpoint on the lost binding must be settled one way
        // or the other before its tokens can move to a new escrow.
        core.settlement.resolve_before_rebind().await?;

        let host = self.resolve_host(model, economics).await?;
        let new_id = self.deposit(economics).await?;
        let (mut transport, channel) = match self.handshake(&host, new_id, model).await {
            Ok(pair) => pair,
            Err(err) => {
                self.release_deposit(new_id).await;
                return Err(err);
            }
        };
        if let Err(err) = core.settlement.rebind(new_id) {
            let _ = transport.close().await;
            self.release_deposit(new_id).await;
            return Err(err);
        }

        let old_id = core.binding;
        let _ = core.transport.close().await;
        core.channel.retire();
        core.transport = transport;
        core.channel = channel;
        core.host = host;
        core.binding = new_id;
        core.recoveries += 1;

        {
            let mut registry = self.registry.write().await;
            registry.remove(&old_id);
            registry.insert(new_id, session.clone());
        }
        session.refresh(core);

        info!(
            from = %old_id.short(),
            to = %new_id.short(),
            host = %core.host.endpoint,
            recoveries = core.recoveries,
            "session recovered"
        );
        Ok(())
    }

    async fn fail_session(&self, session: &SessionHandle, core: &mut SessionCore) {
        session.set_status(SessionStatus::Failed);
        core.channel.retire();
        let _ = core.transport.close().await;
        session.refresh(core);
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Completion
    // ───────────────────────────────────────────────────────────────────────────

    async fn finish(
        &self,
        session: &SessionHandle,
        outcome: SessionStatus,
    ) -> Result<SettlementReceipt, SessionError> {
        let not_active = |session: &SessionHandle| SessionError::SessionNotActive {
            session_id: session.id(),
            status: session.status(),
        };

        let status = session.status();
        if status.is_terminal() || status == SessionStatus::Created {
            return Err(not_active(session));
        }
        session.set_status(SessionStatus::Completing);

        let grace = self.config.settlement_grace();
        if !grace.is_zero() {
            debug!(session = %session.id().short(), grace_ms = grace.as_millis() as u64, "settlement grace period");
            tokio::time::sleep(grace).await;
        }

        // Wait for everything already admitted, then refuse the rest.
        let drain = self.config.drain_timeout();
        let _permit = match tokio::time::timeout(drain, session.entry.queue.enqueue().ready()).await {
            Ok(permit) => permit.map_err(|_| not_active(session))?,
            Err(_) => {
                warn!(session = %session.id().short(), "in-flight work did not finish, settlement postponed");
                return Err(SessionError::timeout("end_session waiting for in-flight work", drain));
            }
        };
        session.entry.queue.close();
        if session.status().is_terminal() {
            return Err(not_active(session));
        }

        let mut core = session.entry.core.lock().await;
        let result = core.settlement.finalize().await;

        let binding = core.binding;
        if let Err(err) = core.transport.send(Frame::SessionClose { session_id: binding }).await {
            debug!(session = %binding.short(), error = %err, "could not send session_close");
        }
        let _ = core.transport.close().await;
        core.channel.retire();
        session.refresh(&core);
        drop(core);

        match result {
            Ok(receipt) => {
                session.set_status(outcome);
                if receipt.zero_cost {
                    Err(SessionError::InsufficientTokensForSettlement {
                        tokens_used: receipt.total_tokens,
                        minimum: self.config.min_billable_tokens,
                        receipt: Box::new(receipt),
                    })
                } else {
                    Ok(receipt)
                }
            }
            Err(err) => {
                error!(session = %binding.short(), error = %err, "final settlement failed");
                session.set_status(SessionStatus::Failed);
                Err(err.context("end_session", binding))
            }
        }
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Collaborators
    // ───────────────────────────────────────────────────────────────────────────

    async fn resolve_host(
        &self,
        model: &ModelId,
        economics: &SessionEconomics,
    ) -> Result<HostInfo, SessionError> {
        let host = self
            .discovery
            .resolve(model)
            .await
            .map_err(|e| SessionError::HostUnreachable(e.to_string()))?;
        if !host.serves(model) {
            return Err(SessionError::HostUnreachable(format!(
                "{} does not serve {}",
                host.endpoint, model
            )));
        }
        if !host.accepts_price(economics.price_per_token) {
            return Err(SessionError::ValidationFailed(format!(
                "price {} is below host minimum {}",
                economics.price_per_token, host.min_price_per_token
            )));
        }
        Ok(host)
    }

    async fn deposit(&self, economics: &SessionEconomics) -> Result<SessionId, SessionError> {
        self.payment.deposit(economics).await.map_err(|err| match err {
            PaymentError::InsufficientFunds(reason) => SessionError::InsufficientFunds(reason),
            PaymentError::Rejected(reason) => {
                SessionError::ValidationFailed(format!("deposit rejected: {}", reason))
            }
            other => SessionError::SettlementFailed {
                checkpoint_number: 0,
                ambiguous: other.is_transient(),
                reason: format!("deposit: {}", other),
            },
        })
    }

    async fn release_deposit(&self, session_id: SessionId) {
        match self.payment.complete(session_id, None).await {
            Ok(confirmation) => info!(
                session = %session_id.short(),
                tx = %confirmation.transaction_id,
                "deposit released after failed binding"
            ),
            Err(err) => warn!(
                session = %session_id.short(),
                error = %err,
                "could not release deposit after failed binding"
            ),
        }
    }

    async fn handshake(
        &self,
        host: &HostInfo,
        session_id: SessionId,
        model: &ModelId,
    ) -> Result<(Box<dyn Transport>, EncryptedChannel), SessionError> {
        let limit = self.config.handshake_timeout();
        match tokio::time::timeout(limit, self.handshake_inner(host, session_id, model)).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::HandshakeFailed(format!(
                "no session_init_ack within {}ms",
                limit.as_millis()
            ))),
        }
    }

    async fn handshake_inner(
        &self,
        host: &HostInfo,
        session_id: SessionId,
        model: &ModelId,
    ) -> Result<(Box<dyn Transport>, EncryptedChannel), SessionError> {
        let mut transport = self
            .connector
            .connect(&host.endpoint)
            .await
            .map_err(|e| SessionError::HostUnreachable(e.to_string()))?;

        let agreement = KeyAgreement::new();
        let client_public_key = agreement.public_bytes();
        transport
            .send(Frame::SessionInit {
                session_id,
                model: model.clone(),
                client_public_key,
            })
            .await
            .map_err(|e| SessionError::HostUnreachable(e.to_string()))?;

        loop {
            let frame = transport
                .recv()
                .await
                .map_err(|e| SessionError::HandshakeFailed(e.to_string()))?
                .ok_or_else(|| SessionError::HandshakeFailed("host hung up during handshake".into()))?;

            match frame {
                Frame::SessionInitAck {
                    session_id: acked,
                    host_public_key,
                    signature,
                } if acked == session_id => {
                    if let Some(identity) = &host.host_public_key {
                        let signature = signature.ok_or_else(|| {
                            SessionError::HandshakeFailed("host did not sign the handshake".into())
                        })?;
                        let transcript = handshake_transcript(&session_id, &client_public_key, &host_public_key);
                        verify_host_signature(identity, &transcript, &signature)?;
                    }
                    let key = agreement.complete(&host_public_key, &session_id, Role::Client)?;
                    let channel = EncryptedChannel::new(session_id, key, Role::Client);
                    debug!(
                        session = %session_id.short(),
                        key = channel.key_fingerprint().as_deref().unwrap_or("-"),
                        "handshake complete"
                    );
                    return Ok((transport, channel));
                }
                Frame::Error { code, message, .. } => {
                    return Err(SessionError::HandshakeFailed(format!(
                        "host refused: {}: {}",
                        code, message
                    )));
                }
                other => debug!(frame = other.type_name(), "ignoring frame during handshake"),
            }
        }
    }
}

fn reported_or(failed: bool, err: SessionError) -> AttemptError {
    if failed {
        AttemptError::Reported
    } else {
        AttemptError::Failed(err)
    }
}
