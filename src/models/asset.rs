//! Represents a staged upload (an object record that has not been pinned yet).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle of an asset.
///
/// Moves forward: `Wait → Uploading → Uploaded → Pin → Pined`.
/// `Pin` is an internal claim held by one worker pipeline; a failed
/// pipeline releases it back to `Uploaded`, so it is never shown to clients
/// (see [`Asset::public`]). `FailPined` is written only by the CRUD layer,
/// never by the pin worker.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum AssetStatus {
    Wait,
    Uploading,
    Uploaded,
    Pin,
    Pined,
    FailPined,
}

impl AssetStatus {
    /// Whether chunks may still be written for an asset in this state.
    pub fn accepts_chunks(self) -> bool {
        matches!(self, AssetStatus::Wait | AssetStatus::Uploading)
    }
}

/// A single object record as seen by the upload pipeline.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Asset {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Opaque token handed to the client; names the staging directory.
    pub asset_id: String,

    /// Bucket the object belongs to.
    pub bucket_id: Uuid,

    /// Parent folder in the object tree, if any.
    pub parent_id: Option<Uuid>,

    /// Owner, used for usage accounting.
    pub user_id: i64,

    /// First segment of the first uploaded relative path.
    pub name: String,

    /// Bytes written so far.
    pub size: i64,

    /// Content identifier from the remote store, empty until pinned.
    pub cid: String,

    pub status: AssetStatus,

    /// Number of pin pipelines started for this asset.
    pub attempt_count: i64,

    pub last_attempt_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Asset {
    /// Client-facing view: an in-flight pin claim reads as `Uploaded`, so the
    /// status a client observes never moves backwards.
    pub fn public(mut self) -> Self {
        if self.status == AssetStatus::Pin {
            self.status = AssetStatus::Uploaded;
        }
        self
    }
}
