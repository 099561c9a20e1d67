//! Data models for the upload gateway.
//!
//! `Asset` and `DailyUsage` map to database tables via `sqlx::FromRow` and
//! serialize as JSON via `serde`; `ManifestEntry` only ever lives in the
//! staging area.

pub mod asset;
pub mod manifest;
pub mod progress;
pub mod usage;
