//! Per-asset reader/writer locks between chunk writes and finish.
//!
//! Chunk writes for one asset share the lock; finishing takes it
//! exclusively, so once an asset is marked uploaded no chunk that passed
//! the status check is still landing on disk.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

#[derive(Clone, Default)]
pub struct AssetLocks {
    inner: Arc<Mutex<HashMap<String, Arc<RwLock<()>>>>>,
}

impl AssetLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared guard held for the duration of one chunk write.
    pub async fn chunk_write(&self, asset_id: &str) -> OwnedRwLockReadGuard<()> {
        self.lock_for(asset_id).read_owned().await
    }

    /// Exclusive guard held while an asset is closed for uploads.
    pub async fn finish(&self, asset_id: &str) -> OwnedRwLockWriteGuard<()> {
        self.lock_for(asset_id).write_owned().await
    }

    /// Number of assets with a live lock.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        prune(&mut map);
        map.len()
    }

    fn lock_for(&self, asset_id: &str) -> Arc<RwLock<()>> {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        // entries only the map still references are idle
        prune(&mut map);
        map.entry(asset_id.to_string()).or_default().clone()
    }
}

fn prune(map: &mut HashMap<String, Arc<RwLock<()>>>) {
    map.retain(|_, lock| Arc::strong_count(lock) > 1);
}
