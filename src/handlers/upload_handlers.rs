//! HTTP handlers for asset slots and resumable chunk uploads.
//!
//! Chunks are staged on disk by `ChunkStore`; reassembly and pinning are
//! deferred to the pin worker, which `POST /finish/{asset_id}` wakes up.

use crate::{
    errors::{AppError, GatewayError},
    models::{asset::Asset, progress::UploadProgress},
    services::{
        asset_repository::NewAsset,
        chunk_store::{ChunkUpload, display_name},
        pin_worker::FinishSignal,
    },
    state::AppState,
};
use axum::{
    Json,
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

/// Multipart field carrying the chunk bytes.
const FILE_FIELD: &str = "file";

/// Query parameters sent by resumable.js-style clients with every chunk.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumableQuery {
    pub resumable_identifier: String,
    pub resumable_chunk_number: u32,
    pub resumable_total_chunks: u32,
    pub resumable_chunk_size: u64,
    pub resumable_relative_path: String,
    pub resumable_total_size: u64,
    pub resumable_filename: Option<String>,
}

/// Query parameters of a chunk probe.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeQuery {
    pub resumable_identifier: String,
    pub resumable_chunk_number: u32,
}

/// Request body for `POST /assets`.
#[derive(Debug, Deserialize)]
pub struct CreateAssetReq {
    pub bucket_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub user_id: i64,
}

#[derive(Debug, Serialize)]
pub struct ChunkResponse {
    pub asset: Asset,
    pub chunk_number: u32,
    /// Every chunk of this chunk's file is on disk.
    pub file_complete: bool,
}

/// `POST /assets` — open an asset slot in `wait`.
pub async fn create_asset(
    State(state): State<AppState>,
    Json(req): Json<CreateAssetReq>,
) -> Result<impl IntoResponse, AppError> {
    let asset = state
        .assets
        .create(NewAsset {
            bucket_id: req.bucket_id,
            parent_id: req.parent_id,
            user_id: req.user_id,
        })
        .await?;
    info!(asset_id = %asset.asset_id, user_id = asset.user_id, "asset slot created");
    Ok((StatusCode::CREATED, Json(asset)))
}

/// `GET /assets/{asset_id}`
pub async fn get_asset(
    State(state): State<AppState>,
    Path(asset_id): Path<String>,
) -> Result<Json<Asset>, AppError> {
    Ok(Json(state.assets.get(&asset_id).await?.public()))
}

/// `PUT /upload/{asset_id}` — stage one chunk.
pub async fn put_chunk(
    State(state): State<AppState>,
    Path(asset_id): Path<String>,
    Query(q): Query<ResumableQuery>,
    multipart: Multipart,
) -> Result<Json<ChunkResponse>, AppError> {
    let _guard = state.locks.chunk_write(&asset_id).await;
    let asset = state.assets.get(&asset_id).await?;
    if !asset.status.accepts_chunks() {
        return Err(GatewayError::Conflict(format!(
            "asset `{}` no longer accepts chunks (status {:?})",
            asset_id, asset.status
        ))
        .into());
    }

    let data = read_file_field(multipart).await?;
    let chunk = ChunkUpload {
        identifier: q.resumable_identifier,
        chunk_number: q.resumable_chunk_number,
        total_chunks: q.resumable_total_chunks,
        chunk_size: q.resumable_chunk_size,
        total_size: q.resumable_total_size,
        relative_path: q.resumable_relative_path,
    };

    let write = state.chunks.put_chunk(&asset_id, &chunk, data).await?;
    let asset = state
        .assets
        .record_chunk(&asset_id, write.size_delta(), display_name(&chunk.relative_path))
        .await?;
    let received = state
        .chunks
        .received_chunks(&asset_id, &chunk.identifier)
        .await?;
    let progress = UploadProgress::new(received, chunk.total_chunks);

    debug!(
        asset_id = %asset_id,
        identifier = %chunk.identifier,
        chunk = chunk.chunk_number,
        received = progress.received,
        total = progress.total,
        total_size = chunk.total_size,
        filename = ?q.resumable_filename,
        "chunk staged"
    );

    Ok(Json(ChunkResponse {
        asset: asset.public(),
        chunk_number: chunk.chunk_number,
        file_complete: progress.is_complete(),
    }))
}

/// `GET /upload/{asset_id}` — 201 when the probed chunk is already staged.
pub async fn probe_chunk(
    State(state): State<AppState>,
    Path(asset_id): Path<String>,
    Query(q): Query<ProbeQuery>,
) -> Result<impl IntoResponse, AppError> {
    let exists = state
        .chunks
        .chunk_exists(
            &asset_id,
            &q.resumable_identifier,
            q.resumable_chunk_number,
        )
        .await?;
    if !exists {
        return Err(AppError::not_found(format!(
            "chunk {} of `{}` not uploaded",
            q.resumable_chunk_number, q.resumable_identifier
        )));
    }
    Ok((
        StatusCode::CREATED,
        Json(json!({ "chunk_number": q.resumable_chunk_number })),
    ))
}

/// `POST /finish/{asset_id}` — close the upload and wake the pin worker.
pub async fn finish_upload(
    State(state): State<AppState>,
    Path(asset_id): Path<String>,
) -> Result<Json<Asset>, AppError> {
    let asset = {
        let _guard = state.locks.finish(&asset_id).await;
        state.assets.mark_uploaded(&asset_id).await?
    };
    let queued = state
        .finish
        .notify(FinishSignal::Asset(asset.asset_id.clone()));
    info!(asset_id = %asset.asset_id, size = asset.size, queued, "upload finished");
    Ok(Json(asset.public()))
}

async fn read_file_field(mut multipart: Multipart) -> Result<Bytes, AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(format!("invalid multipart body: {}", err)))?
    {
        if field.name() == Some(FILE_FIELD) {
            return field
                .bytes()
                .await
                .map_err(|err| AppError::bad_request(format!("reading chunk body: {}", err)));
        }
    }
    Err(AppError::bad_request(format!(
        "missing multipart field `{}`",
        FILE_FIELD
    )))
}
