//! Engine configuration.
//!
//! Values come from serde (with per-field defaults) or from `INFERMARKET_*`
//! environment variables via [`EngineConfig::from_env`].

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::types::OperationKind;

/// Sliding-window admission rule for one operation kind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub kind: OperationKind,
    pub max_requests: usize,
    pub window_ms: u64,
}

impl RateLimitRule {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Configuration for a [`SessionEngine`](crate::engine::SessionEngine).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default per-operation deadline: queue admission plus the wait for each reply fragment.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Deadline for connect plus key agreement.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Pause before final settlement so the host can flush its own accounting.
    #[serde(default = "default_settlement_grace_ms")]
    pub settlement_grace_ms: u64,

    /// Submission attempts per checkpoint before giving up.
    #[serde(default = "default_settlement_max_attempts")]
    pub settlement_max_attempts: u32,

    /// Base backoff between checkpoint attempts (doubles each retry).
    #[serde(default = "default_settlement_backoff_ms")]
    pub settlement_backoff_ms: u64,

    /// Lifetime tokens below which a session closes at zero cost.
    #[serde(default = "default_min_billable_tokens")]
    pub min_billable_tokens: u64,

    /// Per-kind admission limits. Kinds without a rule are unlimited.
    #[serde(default = "default_rate_limits")]
    pub rate_limits: Vec<RateLimitRule>,

    /// Fragments buffered between the dispatch task and a `ReplyStream`.
    #[serde(default = "default_reply_buffer")]
    pub reply_buffer: usize,

    /// How long `end_session` waits for in-flight work before giving up.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    120_000
}
fn default_handshake_timeout_ms() -> u64 {
    10_000
}
fn default_settlement_grace_ms() -> u64 {
    3_000
}
fn default_settlement_max_attempts() -> u32 {
    3
}
fn default_settlement_backoff_ms() -> u64 {
    500
}
fn default_min_billable_tokens() -> u64 {
    100
}
fn default_rate_limits() -> Vec<RateLimitRule> {
    vec![RateLimitRule {
        kind: OperationKind::ImageGeneration,
        max_requests: 5,
        window_ms: 60_000,
    }]
}
fn default_reply_buffer() -> usize {
    64
}
fn default_drain_timeout_ms() -> u64 {
    300_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            settlement_grace_ms: default_settlement_grace_ms(),
            settlement_max_attempts: default_settlement_max_attempts(),
            settlement_backoff_ms: default_settlement_backoff_ms(),
            min_billable_tokens: default_min_billable_tokens(),
            rate_limits: default_rate_limits(),
            reply_buffer: default_reply_buffer(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl EngineConfig {
    /// Load from the environment, reading a `.env` file first when present.
    ///
    /// Unset variables fall back to defaults. Set but unparsable variables are errors.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut config = Self::default();
        if let Some(v) = env_parse("INFERMARKET_REQUEST_TIMEOUT_MS")? {
            config.request_timeout_ms = v;
        }
        if let Some(v) = env_parse("INFERMARKET_HANDSHAKE_TIMEOUT_MS")? {
            config.handshake_timeout_ms = v;
        }
        if let Some(v) = env_parse("INFERMARKET_SETTLEMENT_GRACE_MS")? {
            config.settlement_grace_ms = v;
        }
        if let Some(v) = env_parse("INFERMARKET_SETTLEMENT_MAX_ATTEMPTS")? {
            config.settlement_max_attempts = v;
        }
        if let Some(v) = env_parse("INFERMARKET_SETTLEMENT_BACKOFF_MS")? {
            config.settlement_backoff_ms = v;
        }
        if let Some(v) = env_parse("INFERMARKET_MIN_BILLABLE_TOKENS")? {
            config.min_billable_tokens = v;
        }
        if let Some(v) = env_parse("INFERMARKET_REPLY_BUFFER")? {
            config.reply_buffer = v;
        }
        if let Some(v) = env_parse("INFERMARKET_DRAIN_TIMEOUT_MS")? {
            config.drain_timeout_ms = v;
        }

        // INFERMARKET_IMAGE_RATE_LIMIT=5/60000 (requests/window_ms), "off" to disable.
        if let Ok(raw) = env::var("INFERMARKET_IMAGE_RATE_LIMIT") {
            config
                .rate_limits
                .retain(|rule| rule.kind != OperationKind::ImageGeneration);
            if raw.trim() != "off" {
                config.rate_limits.push(
                    parse_rule(OperationKind::ImageGeneration, &raw)
                        .context("INFERMARKET_IMAGE_RATE_LIMIT must look like <max>/<window_ms>")?,
                );
            }
        }
        if let Ok(raw) = env::var("INFERMARKET_TEXT_RATE_LIMIT") {
            config
                .rate_limits
                .retain(|rule| rule.kind != OperationKind::TextStream);
            if raw.trim() != "off" {
                config.rate_limits.push(
                    parse_rule(OperationKind::TextStream, &raw)
                        .context("INFERMARKET_TEXT_RATE_LIMIT must look like <max>/<window_ms>")?,
                );
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.request_timeout_ms == 0 {
            return Err(SessionError::InvalidConfig(
                "request_timeout_ms must be positive".into(),
            ));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(SessionError::InvalidConfig(
                "handshake_timeout_ms must be positive".into(),
            ));
        }
        if self.settlement_max_attempts == 0 {
            return Err(SessionError::InvalidConfig(
                "settlement_max_attempts must be at least 1".into(),
            ));
        }
        if self.drain_timeout_ms == 0 {
            return Err(SessionError::InvalidConfig(
                "drain_timeout_ms must be positive".into(),
            ));
        }
        if self.reply_buffer == 0 {
            return Err(SessionError::InvalidConfig(
                "reply_buffer must be positive".into(),
            ));
        }
        for rule in &self.rate_limits {
            if rule.max_requests == 0 || rule.window_ms == 0 {
                return Err(SessionError::InvalidConfig(format!(
                    "rate limit for {} needs positive max_requests and window_ms",
                    rule.kind
                )));
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn settlement_grace(&self) -> Duration {
        Duration::from_millis(self.settlement_grace_ms)
    }

    pub fn settlement_backoff(&self) -> Duration {
        Duration::from_millis(self.settlement_backoff_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => {
            let value = raw
                .trim()
                .parse::<T>()
                .with_context(|| format!("{} has invalid value {:?}", name, raw))?;
            Ok(Some(value))
        }
        Err(_) => Ok(None),
    }
}

fn parse_rule(kind: OperationKind, raw: &str) -> Result<RateLimitRule> {
    let (max, window) = raw
        .trim()
        .split_once('/')
        .context("missing '/' separator")?;
    Ok(RateLimitRule {
        kind,
        max_requests: max.trim().parse().context("bad max_requests")?,
        window_ms: window.trim().parse().context("bad window_ms")?,
    })
}
