//! Per-user daily storage/traffic counters.

use crate::{
    errors::{GatewayError, GatewayResult},
    models::usage::{DailyUsage, UsageKind},
};
use chrono::{NaiveDate, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;

#[derive(Clone)]
pub struct UsageService {
    pub db: Arc<SqlitePool>,
}

impl UsageService {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Add `delta` bytes to the `(user_id, day)` counter of `kind`, creating
    /// the row on first use.
    ///
    /// The read-modify-write happens inside one upsert statement within a
    /// transaction, so concurrent callers for the same key never lose an
    /// increment.
    pub async fn record_usage(
        &self,
        kind: UsageKind,
        user_id: i64,
        day: NaiveDate,
        delta: i64,
    ) -> GatewayResult<DailyUsage> {
        if delta < 0 {
            return Err(GatewayError::InvalidInput(format!(
                "usage delta must not be negative, got {}",
                delta
            )));
        }

        let sql = format!(
            "INSERT INTO {table} (user_id, day, bytes, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(user_id, day) DO UPDATE SET
                 bytes = {table}.bytes + excluded.bytes,
                 updated_at = excluded.updated_at
             RETURNING user_id, day, bytes, updated_at",
            table = kind.table()
        );

        let mut tx = self.db.begin().await.map_err(GatewayError::Transaction)?;
        let row = sqlx::query_as::<_, DailyUsage>(&sql)
            .bind(user_id)
            .bind(day)
            .bind(delta)
            .bind(Utc::now())
            .fetch_one(&mut *tx)
            .await
            .map_err(GatewayError::Transaction)?;
        tx.commit().await.map_err(GatewayError::Transaction)?;

        Ok(row)
    }

    /// Current counter value, 0 when nothing was recorded yet.
    pub async fn usage_for(&self, kind: UsageKind, user_id: i64, day: NaiveDate) -> GatewayResult<i64> {
        let sql = format!(
            "SELECT bytes FROM {} WHERE user_id = ? AND day = ?",
            kind.table()
        );
        let bytes = sqlx::query_scalar::<_, i64>(&sql)
            .bind(user_id)
            .bind(day)
            .fetch_optional(&*self.db)
            .await?;
        Ok(bytes.unwrap_or(0))
    }
}

/// Today's date in UTC, the day key used by every caller.
pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}
