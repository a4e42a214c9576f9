//! Shared fixtures for session engine tests: an in-process host, an
//! in-memory escrow ledger and a ready-wired engine harness.

pub mod discovery;
pub mod host;
pub mod ledger;

use std::sync::Arc;

use anyhow::{Context, Result};
use infermarket_session::{
    EngineConfig, IdentityKey, ModelId, SessionEconomics, SessionEngine, SessionHandle,
};
use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

pub use discovery::StaticDiscovery;
pub use host::{HostEvent, HostFault, HostRequest, MockHost, PLACEHOLDER_PNG};
pub use ledger::{Escrow, LedgerFault, MockLedger};

pub const MODEL: &str = "llama-3-8b";

static TRACING: OnceCell<()> = OnceCell::new();

/// Install a test-writer subscriber once per process. Honours `RUST_LOG`.
pub fn init_tracing() {
    TRACING.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
            .with_test_writer()
            .try_init();
    });
}

/// Engine settings tuned for tests: no grace period, short backoff.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        request_timeout_ms: 30_000,
        handshake_timeout_ms: 5_000,
        settlement_grace_ms: 0,
        settlement_backoff_ms: 10,
        ..EngineConfig::default()
    }
}

/// 10 base units per token, checkpoint every 100 tokens, one hour lease.
pub fn economics() -> SessionEconomics {
    SessionEconomics {
        deposit_amount: 1_000_000,
        price_per_token: 10,
        duration_seconds: 3_600,
        proof_interval_tokens: 100,
    }
}

/// An engine wired to a mock host, ledger and discovery.
pub struct Harness {
    pub engine: SessionEngine,
    pub host: MockHost,
    pub ledger: Arc<MockLedger>,
    pub discovery: Arc<StaticDiscovery>,
    pub payer: IdentityKey,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(MockHost::new(MODEL), fast_config())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::build(MockHost::new(MODEL), config)
    }

    /// Harness whose host signs handshakes and is pinned in discovery.
    pub fn signed() -> Self {
        Self::build(MockHost::signed(MODEL), fast_config())
    }

    fn build(host: MockHost, config: EngineConfig) -> Self {
        init_tracing();
        let ledger = Arc::new(MockLedger::new());
        let discovery = Arc::new(StaticDiscovery::new(host.info()));
        let payer = IdentityKey::generate();
        let engine = SessionEngine::new(
            config,
            ledger.clone(),
            Arc::new(host.clone()),
            discovery.clone(),
            payer.clone(),
        )
        .expect("test config is valid");
        Self {
            engine,
            host,
            ledger,
            discovery,
            payer,
        }
    }

    /// Start a session with [`economics`].
    pub async fn start(&self) -> Result<SessionHandle> {
        self.start_with(economics()).await
    }

    pub async fn start_with(&self, economics: SessionEconomics) -> Result<SessionHandle> {
        self.engine
            .start_session(ModelId::new(MODEL), economics)
            .await
            .context("start_session")
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
