//! Host discovery interface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{HostEndpoint, ModelId};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("no host serves model {0}")]
    NoHost(ModelId),

    #[error("discovery unavailable: {0}")]
    Unavailable(String),
}

/// What discovery knows about a host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub endpoint: HostEndpoint,
    /// Long-term Ed25519 identity. When present the handshake must be signed by it.
    #[serde(default)]
    pub host_public_key: Option<[u8; 32]>,
    pub models: Vec<ModelId>,
    /// Lowest `price_per_token` the host accepts.
    #[serde(default)]
    pub min_price_per_token: u128,
}

impl HostInfo {
    pub fn serves(&self, model: &ModelId) -> bool {
        self.models.iter().any(|m| m == model)
    }

    pub fn accepts_price(&self, price_per_token: u128) -> bool {
        price_per_token >= self.min_price_per_token
    }
}

/// Resolves a model to a host. Called on session start and on recovery.
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn resolve(&self, model: &ModelId) -> Result<HostInfo, DiscoveryError>;
}
