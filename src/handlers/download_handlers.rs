//! Download proxy for pinned content.
//! Streams the remote body through without buffering and charges the
//! declared length to the asset owner's daily traffic.

use crate::{
    errors::AppError,
    models::usage::UsageKind,
    services::{
        remote::{DECOMPRESSED_LENGTH_HEADER, declared_length},
        usage,
    },
    state::AppState,
};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderName, header},
    response::Response,
};
use tracing::{debug, warn};

/// Upstream headers passed through to the client.
const FORWARDED_HEADERS: [HeaderName; 4] = [
    header::CONTENT_TYPE,
    header::CONTENT_LENGTH,
    header::ETAG,
    header::LAST_MODIFIED,
];

/// `GET /download/{cid}` — the collection's index document.
pub async fn download_root(
    State(state): State<AppState>,
    Path(cid): Path<String>,
) -> Result<Response, AppError> {
    proxy(&state, &cid, "").await
}

/// `GET /download/{cid}/{*path}`
pub async fn download_path(
    State(state): State<AppState>,
    Path((cid, path)): Path<(String, String)>,
) -> Result<Response, AppError> {
    proxy(&state, &cid, &path).await
}

async fn proxy(state: &AppState, cid: &str, path: &str) -> Result<Response, AppError> {
    let owner = state.assets.find_by_cid(cid).await?;
    let upstream = state.remote.fetch(cid, path).await?;
    let length = declared_length(&upstream);

    if let Err(err) = state
        .usage
        .record_usage(
            UsageKind::Traffic,
            owner.user_id,
            usage::today(),
            i64::try_from(length).unwrap_or(i64::MAX),
        )
        .await
    {
        warn!(cid, user_id = owner.user_id, error = %err, "traffic usage not recorded");
    }
    debug!(cid, path, length, "proxying download");

    let status = upstream.status();
    let mut forwarded = Vec::new();
    for name in FORWARDED_HEADERS {
        if let Some(value) = upstream.headers().get(&name) {
            forwarded.push((name, value.clone()));
        }
    }
    if let Some(value) = upstream.headers().get(DECOMPRESSED_LENGTH_HEADER) {
        forwarded.push((
            HeaderName::from_static(DECOMPRESSED_LENGTH_HEADER),
            value.clone(),
        ));
    }

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    response.headers_mut().extend(forwarded);
    Ok(response)
}
