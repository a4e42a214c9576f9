//! Discovery that always answers with a fixed host.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use infermarket_session::{Discovery, DiscoveryError, HostInfo, ModelId};

pub struct StaticDiscovery {
    host: Mutex<Option<HostInfo>>,
    lookups: AtomicUsize,
}

impl StaticDiscovery {
    pub fn new(host: HostInfo) -> Self {
        Self {
            host: Mutex::new(Some(host)),
            lookups: AtomicUsize::new(0),
        }
    }

    /// Take the host out of rotation; later lookups fail.
    pub fn withdraw(&self) {
        self.host.lock().unwrap().take();
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn resolve(&self, model: &ModelId) -> Result<HostInfo, DiscoveryError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.host
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| DiscoveryError::NoHost(model.clone()))
    }
}
