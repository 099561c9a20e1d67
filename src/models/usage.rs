//! Per-user, per-day usage counters.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Which counter a usage delta is added to.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UsageKind {
    Storage,
    Traffic,
}

impl UsageKind {
    /// Backing table for this counter.
    pub fn table(self) -> &'static str {
        match self {
            UsageKind::Storage => "used_storage",
            UsageKind::Traffic => "used_traffic",
        }
    }
}

/// One `(user_id, day)` counter row.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct DailyUsage {
    pub user_id: i64,
    pub day: NaiveDate,
    /// Bytes accumulated for that day.
    pub bytes: i64,
    pub updated_at: DateTime<Utc>,
}
