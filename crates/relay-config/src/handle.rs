//! Atomically swappable configuration snapshots.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::info;

use crate::model::GatewayConfig;

/// Shared handle to the current configuration snapshot.
///
/// Readers call [`ConfigHandle::current`] once at the start of a request and
/// keep that `Arc` for the request's lifetime, so a concurrent reload never
/// changes policy mid-request. Publishing stores a whole new snapshot; there
/// is no in-place mutation.
#[derive(Debug)]
pub struct ConfigHandle {
    inner: ArcSwap<GatewayConfig>,
    version: AtomicU64,
}

impl ConfigHandle {
    /// Wraps the initial configuration as version 1.
    #[must_use]
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            inner: ArcSwap::from_pointee(config),
            version: AtomicU64::new(1),
        }
    }

    /// Returns the current snapshot.
    #[must_use]
    pub fn current(&self) -> Arc<GatewayConfig> {
        self.inner.load_full()
    }

    /// Publishes a new snapshot, returning its version number.
    pub fn publish(&self, config: GatewayConfig) -> u64 {
        self.inner.store(Arc::new(config));
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        info!(version, "configuration snapshot published");
        version
    }

    /// Monotonic version of the current snapshot, starting at 1.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }
}
