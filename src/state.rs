//! Shared state handed to every HTTP handler.

use crate::services::{
    asset_locks::AssetLocks, asset_repository::AssetRepository, chunk_store::ChunkStore,
    pin_worker::FinishQueue, remote::RemoteStore, usage::UsageService,
};
use sqlx::SqlitePool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<SqlitePool>,
    pub assets: AssetRepository,
    pub chunks: ChunkStore,
    pub usage: UsageService,
    pub remote: RemoteStore,
    pub finish: FinishQueue,
    pub locks: AssetLocks,
}

impl AppState {
    pub fn new(
        db: Arc<SqlitePool>,
        chunks: ChunkStore,
        remote: RemoteStore,
        finish: FinishQueue,
    ) -> Self {
        Self {
            assets: AssetRepository::new(db.clone()),
            usage: UsageService::new(db.clone()),
            db,
            chunks,
            remote,
            finish,
            locks: AssetLocks::new(),
        }
    }
}
