//! src/services/asset_repository.rs
//!
//! AssetRepository: the persistence seam between the upload pipeline and the
//! object table. Every status change is a single conditional UPDATE keyed on
//! the expected current status.

use crate::{
    errors::{GatewayError, GatewayResult},
    models::asset::{Asset, AssetStatus},
};
use chrono::Utc;
use sqlx::SqlitePool;
use std::{sync::Arc, time::Duration};
use uuid::Uuid;

const ASSET_COLUMNS: &str = "id, asset_id, bucket_id, parent_id, user_id, name, size, cid, \
     status, attempt_count, last_attempt_at, created_at, updated_at";

/// Parameters for creating an asset slot.
#[derive(Clone, Debug)]
pub struct NewAsset {
    pub bucket_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub user_id: i64,
}

/// Filter applied when a sweep looks for work.
#[derive(Clone, Debug, Default)]
pub struct PendingFilter {
    /// Skip assets whose last attempt is more recent than this.
    pub retry_backoff: Duration,
    /// Skip assets that already used this many attempts. 0 = no cap.
    pub max_attempts: u32,
}

#[derive(Clone)]
pub struct AssetRepository {
    pub db: Arc<SqlitePool>,
}

impl AssetRepository {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Create an asset slot in `Wait` with a freshly generated asset id.
    pub async fn create(&self, new: NewAsset) -> GatewayResult<Asset> {
        let now = Utc::now();
        let sql = format!(
            "INSERT INTO objects (id, asset_id, bucket_id, parent_id, user_id, name, size, cid,
                                  status, attempt_count, last_attempt_at, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, '', 0, '', ?, 0, NULL, ?, ?)
             RETURNING {ASSET_COLUMNS}"
        );
        let asset = sqlx::query_as::<_, Asset>(&sql)
            .bind(Uuid::new_v4())
            .bind(Uuid::new_v4().simple().to_string())
            .bind(new.bucket_id)
            .bind(new.parent_id)
            .bind(new.user_id)
            .bind(AssetStatus::Wait)
            .bind(now)
            .bind(now)
            .fetch_one(&*self.db)
            .await?;
        Ok(asset)
    }

    /// Fetch an asset by its public id.
    pub async fn get(&self, asset_id: &str) -> GatewayResult<Asset> {
        let sql = format!("SELECT {ASSET_COLUMNS} FROM objects WHERE asset_id = ?");
        sqlx::query_as::<_, Asset>(&sql)
            .bind(asset_id)
            .fetch_one(&*self.db)
            .await
            .map_err(|err| not_found_or(err, asset_id))
    }

    /// Most recently pinned asset carrying `cid`.
    pub async fn find_by_cid(&self, cid: &str) -> GatewayResult<Asset> {
        let sql = format!(
            "SELECT {ASSET_COLUMNS} FROM objects WHERE cid = ? AND cid != ''
             ORDER BY updated_at DESC LIMIT 1"
        );
        sqlx::query_as::<_, Asset>(&sql)
            .bind(cid)
            .fetch_one(&*self.db)
            .await
            .map_err(|err| match err {
                sqlx::Error::RowNotFound => GatewayError::NotFound(format!("content `{}`", cid)),
                other => GatewayError::Sqlx(other),
            })
    }

    /// Account for a chunk write.
    ///
    /// Moves `Wait → Uploading`, adds `size_delta` to `size` and sets `name`
    /// when it is still empty. Fails with `Conflict` once the asset no longer
    /// accepts chunks.
    pub async fn record_chunk(
        &self,
        asset_id: &str,
        size_delta: i64,
        name: &str,
    ) -> GatewayResult<Asset> {
        let sql = format!(
            "UPDATE objects SET
                 status = ?,
                 size = size + ?,
                 name = CASE WHEN name = '' THEN ? ELSE name END,
                 updated_at = ?
             WHERE asset_id = ? AND status IN (?, ?)
             RETURNING {ASSET_COLUMNS}"
        );
        let updated = sqlx::query_as::<_, Asset>(&sql)
            .bind(AssetStatus::Uploading)
            .bind(size_delta)
            .bind(name)
            .bind(Utc::now())
            .bind(asset_id)
            .bind(AssetStatus::Wait)
            .bind(AssetStatus::Uploading)
            .fetch_optional(&*self.db)
            .await?;

        match updated {
            Some(asset) => Ok(asset),
            None => Err(self.closed_asset_error(asset_id).await),
        }
    }

    /// Move `Wait | Uploading → Uploaded`. Assets already past that point are
    /// returned unchanged.
    pub async fn mark_uploaded(&self, asset_id: &str) -> GatewayResult<Asset> {
        let sql = format!(
            "UPDATE objects SET status = ?, updated_at = ?
             WHERE asset_id = ? AND status IN (?, ?)
             RETURNING {ASSET_COLUMNS}"
        );
        let updated = sqlx::query_as::<_, Asset>(&sql)
            .bind(AssetStatus::Uploaded)
            .bind(Utc::now())
            .bind(asset_id)
            .bind(AssetStatus::Wait)
            .bind(AssetStatus::Uploading)
            .fetch_optional(&*self.db)
            .await?;

        match updated {
            Some(asset) => Ok(asset),
            None => self.get(asset_id).await,
        }
    }

    /// Assets a sweep should try to pin, oldest first.
    pub async fn list_pending(&self, filter: &PendingFilter) -> GatewayResult<Vec<Asset>> {
        let backoff = chrono::Duration::from_std(filter.retry_backoff)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = Utc::now() - backoff;
        let max_attempts = if filter.max_attempts == 0 {
            i64::MAX
        } else {
            i64::from(filter.max_attempts)
        };

        let sql = format!(
            "SELECT {ASSET_COLUMNS} FROM objects
             WHERE status = ? AND asset_id != '' AND cid = '' AND size > 0
               AND (last_attempt_at IS NULL OR julianday(last_attempt_at) <= julianday(?))
               AND attempt_count < ?
             ORDER BY created_at ASC"
        );
        let assets = sqlx::query_as::<_, Asset>(&sql)
            .bind(AssetStatus::Uploaded)
            .bind(cutoff)
            .bind(max_attempts)
            .fetch_all(&*self.db)
            .await?;
        Ok(assets)
    }

    /// Number of `Uploaded` assets that hit the attempt cap.
    pub async fn count_exhausted(&self, max_attempts: u32) -> GatewayResult<i64> {
        if max_attempts == 0 {
            return Ok(0);
        }
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM objects
             WHERE status = ? AND cid = '' AND attempt_count >= ?",
        )
        .bind(AssetStatus::Uploaded)
        .bind(i64::from(max_attempts))
        .fetch_one(&*self.db)
        .await?;
        Ok(count)
    }

    /// Claim an asset for pinning (`Uploaded → Pin`).
    ///
    /// Returns `None` when another pipeline got there first.
    pub async fn claim(&self, asset_id: &str) -> GatewayResult<Option<Asset>> {
        let now = Utc::now();
        let sql = format!(
            "UPDATE objects SET
                 status = ?,
                 attempt_count = attempt_count + 1,
                 last_attempt_at = ?,
                 updated_at = ?
             WHERE asset_id = ? AND status = ? AND cid = ''
             RETURNING {ASSET_COLUMNS}"
        );
        let claimed = sqlx::query_as::<_, Asset>(&sql)
            .bind(AssetStatus::Pin)
            .bind(now)
            .bind(now)
            .bind(asset_id)
            .bind(AssetStatus::Uploaded)
            .fetch_optional(&*self.db)
            .await?;
        Ok(claimed)
    }

    /// Record the content identifier and move `Pin → Pined` in one update.
    pub async fn complete_pin(&self, asset_id: &str, cid: &str) -> GatewayResult<Asset> {
        let sql = format!(
            "UPDATE objects SET status = ?, cid = ?, updated_at = ?
             WHERE asset_id = ? AND status = ?
             RETURNING {ASSET_COLUMNS}"
        );
        sqlx::query_as::<_, Asset>(&sql)
            .bind(AssetStatus::Pined)
            .bind(cid)
            .bind(Utc::now())
            .bind(asset_id)
            .bind(AssetStatus::Pin)
            .fetch_optional(&*self.db)
            .await?
            .ok_or_else(|| GatewayError::Conflict(format!("asset `{}` is not being pinned", asset_id)))
    }

    /// Give a failed claim back (`Pin → Uploaded`) so the next sweep retries.
    pub async fn release(&self, asset_id: &str) -> GatewayResult<()> {
        sqlx::query("UPDATE objects SET status = ?, updated_at = ? WHERE asset_id = ? AND status = ?")
            .bind(AssetStatus::Uploaded)
            .bind(Utc::now())
            .bind(asset_id)
            .bind(AssetStatus::Pin)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// Release every claim left behind by a previous process.
    pub async fn release_stale_claims(&self) -> GatewayResult<u64> {
        let result = sqlx::query("UPDATE objects SET status = ?, updated_at = ? WHERE status = ?")
            .bind(AssetStatus::Uploaded)
            .bind(Utc::now())
            .bind(AssetStatus::Pin)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected())
    }

    async fn closed_asset_error(&self, asset_id: &str) -> GatewayError {
        match self.get(asset_id).await {
            Ok(asset) => GatewayError::Conflict(format!(
                "asset `{}` no longer accepts chunks (status {:?})",
                asset_id, asset.status
            )),
            Err(err) => err,
        }
    }
}

fn not_found_or(err: sqlx::Error, asset_id: &str) -> GatewayError {
    match err {
        sqlx::Error::RowNotFound => GatewayError::NotFound(format!("asset `{}`", asset_id)),
        other => GatewayError::Sqlx(other),
    }
}

/// Timestamp helper for tests that need to age an attempt.
#[cfg(test)]
pub async fn set_last_attempt(repo: &AssetRepository, asset_id: &str, at: chrono::DateTime<Utc>) {
    sqlx::query("UPDATE objects SET last_attempt_at = ? WHERE asset_id = ?")
        .bind(at)
        .bind(asset_id)
        .execute(&*repo.db)
        .await
        .unwrap();
}
