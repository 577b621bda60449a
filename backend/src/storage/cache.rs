//! Cache invalidation implementations.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::trace;

use super::traits::CacheInvalidator;

/// Identifies the ledger whose cached reads are stale
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerChanged {
    pub family_id: String,
    pub child_id: String,
}

/// Publishes invalidations on a broadcast channel.
///
/// Readers subscribe and drop whatever they cached for the child. Having no
/// subscribers is normal and not an error.
#[derive(Debug, Clone)]
pub struct BroadcastCacheInvalidator {
    sender: broadcast::Sender<LedgerChanged>,
}

impl BroadcastCacheInvalidator {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerChanged> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl CacheInvalidator for BroadcastCacheInvalidator {
    async fn invalidate(&self, family_id: &str, child_id: &str) -> Result<()> {
        let event = LedgerChanged {
            family_id: family_id.to_string(),
            child_id: child_id.to_string(),
        };
        match self.sender.send(event) {
            Ok(receivers) => trace!(family_id, child_id, receivers, "Published ledger invalidation"),
            Err(_) => trace!(family_id, child_id, "No cache subscribers for invalidation"),
        }
        Ok(())
    }
}

/// For deployments without a read cache
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCacheInvalidator;

#[async_trait]
impl CacheInvalidator for NoopCacheInvalidator {
    async fn invalidate(&self, _family_id: &str, _child_id: &str) -> Result<()> {
        Ok(())
    }
}
