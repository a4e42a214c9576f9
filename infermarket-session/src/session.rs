//! Per-session state shared between the engine, dispatch tasks and callers.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::EncryptedChannel;
use crate::discovery::HostInfo;
use crate::queue::RequestQueue;
use crate::settlement::CheckpointSettlement;
use crate::transport::Transport;
use crate::types::{HostEndpoint, ModelId, SessionEconomics, SessionId, SessionStatus};

// ═══════════════════════════════════════════════════════════════════════════════
// MUTABLE CORE
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything that must only be touched by the queue-permit holder.
pub(crate) struct SessionCore {
    pub binding: SessionId,
    pub host: HostInfo,
    pub channel: EncryptedChannel,
    pub transport: Box<dyn Transport>,
    pub settlement: CheckpointSettlement,
    pub recoveries: u32,
}

/// Counters mirrored out of the core after every operation, readable without
/// waiting for an in-flight operation.
#[derive(Clone, Debug)]
struct Counters {
    binding: SessionId,
    endpoint: HostEndpoint,
    tokens_used_total: u64,
    tokens_since_checkpoint: u64,
    settled_tokens: u64,
    last_checkpoint_number: u64,
    send_index: u64,
    recv_index: u64,
    recoveries: u32,
}

impl Counters {
    fn of(core: &SessionCore) -> Self {
        let ledger = core.settlement.ledger();
        Self {
            binding: core.binding,
            endpoint: core.host.endpoint.clone(),
            tokens_used_total: ledger.total(),
            tokens_since_checkpoint: ledger.since_checkpoint(),
            settled_tokens: ledger.settled(),
            last_checkpoint_number: ledger.last_checkpoint_number(),
            send_index: core.channel.send_index(),
            recv_index: core.channel.recv_index(),
            recoveries: core.recoveries,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SNAPSHOT
// ═══════════════════════════════════════════════════════════════════════════════

/// Point-in-time view of a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    /// Current binding. Changes after recovery.
    pub session_id: SessionId,
    /// Binding the session started with.
    pub original_session_id: SessionId,
    pub model: ModelId,
    pub host_endpoint: HostEndpoint,
    pub status: SessionStatus,
    pub economics: SessionEconomics,
    pub tokens_used_total: u64,
    pub tokens_used_since_checkpoint: u64,
    pub settled_tokens: u64,
    pub last_checkpoint_number: u64,
    pub send_index: u64,
    pub recv_index: u64,
    pub queue_depth: usize,
    pub recoveries: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// ENTRY & HANDLE
// ═══════════════════════════════════════════════════════════════════════════════

pub(crate) struct SessionEntry {
    pub original_id: SessionId,
    pub model: ModelId,
    pub economics: SessionEconomics,
    pub queue: RequestQueue,
    pub core: tokio::sync::Mutex<SessionCore>,
    pub deadline: tokio::time::Instant,
    status: watch::Sender<SessionStatus>,
    counters: Mutex<Counters>,
    deadline_task: Mutex<Option<JoinHandle<()>>>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// Cheap, cloneable reference to a live session.
#[derive(Clone)]
pub struct SessionHandle {
    pub(crate) entry: Arc<SessionEntry>,
}

impl SessionHandle {
    pub(crate) fn new(
        model: ModelId,
        economics: SessionEconomics,
        core: SessionCore,
        deadline: tokio::time::Instant,
    ) -> Self {
        let created_at = Utc::now();
        let lease_secs = i64::try_from(economics.duration_seconds)
            .unwrap_or(i64::MAX)
            .min(i64::MAX / 1_000);
        let expires_at = created_at
            .checked_add_signed(chrono::Duration::seconds(lease_secs))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let (status, _) = watch::channel(SessionStatus::Created);

        Self {
            entry: Arc::new(SessionEntry {
                original_id: core.binding,
                model,
                economics,
                queue: RequestQueue::new(),
                counters: Mutex::new(Counters::of(&core)),
                core: tokio::sync::Mutex::new(core),
                deadline,
                status,
                deadline_task: Mutex::new(None),
                created_at,
                expires_at,
            }),
        }
    }

    /// Current session binding.
    pub fn id(&self) -> SessionId {
        self.counters().binding
    }

    pub fn original_id(&self) -> SessionId {
        self.entry.original_id
    }

    pub fn model(&self) -> &ModelId {
        &self.entry.model
    }

    pub fn economics(&self) -> &SessionEconomics {
        &self.entry.economics
    }

    pub fn status(&self) -> SessionStatus {
        *self.entry.status.borrow()
    }

    /// Subscribe to status changes.
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.entry.status.subscribe()
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.entry.expires_at
    }

    pub fn deadline_passed(&self) -> bool {
        tokio::time::Instant::now() >= self.entry.deadline
    }

    /// Wait until no operation holds the session. Snapshots taken afterwards
    /// include everything the last operation did.
    pub async fn wait_idle(&self) {
        drop(self.entry.core.lock().await);
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let counters = self.counters();
        SessionSnapshot {
            session_id: counters.binding,
            original_session_id: self.entry.original_id,
            model: self.entry.model.clone(),
            host_endpoint: counters.endpoint,
            status: self.status(),
            economics: self.entry.economics.clone(),
            tokens_used_total: counters.tokens_used_total,
            tokens_used_since_checkpoint: counters.tokens_since_checkpoint,
            settled_tokens: counters.settled_tokens,
            last_checkpoint_number: counters.last_checkpoint_number,
            send_index: counters.send_index,
            recv_index: counters.recv_index,
            queue_depth: self.entry.queue.depth(),
            recoveries: counters.recoveries,
            created_at: self.entry.created_at,
            expires_at: self.entry.expires_at,
        }
    }

    /// Apply a lifecycle transition. Returns false when the table forbids it.
    pub(crate) fn set_status(&self, next: SessionStatus) -> bool {
        let session = self.id();
        let mut from = None;
        let changed = self.entry.status.send_if_modified(|current| {
            if *current == next || !current.can_transition_to(next) {
                return false;
            }
            from = Some(*current);
            *current = next;
            true
        });
        match from {
            Some(from) => info!(session = %session.short(), %from, to = %next, "session status changed"),
            None if self.status() != next => {
                debug!(session = %session.short(), current = %self.status(), requested = %next, "status transition refused")
            }
            None => {}
        }
        if next.is_terminal() && changed {
            self.entry.queue.close();
            self.abort_deadline();
        }
        changed
    }

    /// Copy counters out of the core for lock-free snapshots.
    pub(crate) fn refresh(&self, core: &SessionCore) {
        *self.entry.counters.lock().unwrap_or_else(PoisonError::into_inner) = Counters::of(core);
    }

    pub(crate) fn set_deadline_task(&self, task: JoinHandle<()>) {
        let mut slot = self.entry.deadline_task.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
    }

    fn abort_deadline(&self) {
        let task = self
            .entry
            .deadline_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }

    pub(crate) fn downgrade(&self) -> std::sync::Weak<SessionEntry> {
        Arc::downgrade(&self.entry)
    }

    pub(crate) fn from_entry(entry: Arc<SessionEntry>) -> Self {
        Self { entry }
    }

    fn counters(&self) -> Counters {
        self.entry.counters.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id())
            .field("status", &self.status())
            .finish()
    }
}

/// Body of the per-session deadline task.
pub(crate) async fn enforce_deadline(entry: std::sync::Weak<SessionEntry>, deadline: tokio::time::Instant) {
    tokio::time::sleep_until(deadline).await;
    let Some(entry) = entry.upgrade() else {
        return;
    };
    let handle = SessionHandle::from_entry(entry);
    if handle.status().is_terminal() {
        return;
    }
    warn!(session = %handle.id().short(), "session lease elapsed, forcing completion");
    handle.set_status(SessionStatus::Completing);
}
