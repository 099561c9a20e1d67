//! src/services/remote.rs
//!
//! RemoteStore: HTTP client for the Swarm-style node that archives are
//! pinned to (`POST /bzz`) and content is proxied from (`GET /bzz/{cid}/…`).

use crate::{
    config::RemoteConfig,
    errors::{GatewayError, GatewayResult},
    services::archiver::{ARCHIVE_CONTENT_TYPE, Archive},
};
use reqwest::{Body, Client, StatusCode, header};
use serde::Deserialize;
use std::time::Duration;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::debug;

pub const DEFERRED_UPLOAD_HEADER: &str = "swarm-deferred-upload";
pub const BATCH_ID_HEADER: &str = "swarm-postage-batch-id";
pub const COLLECTION_HEADER: &str = "swarm-collection";
pub const INDEX_DOCUMENT_HEADER: &str = "swarm-index-document";
pub const ERROR_DOCUMENT_HEADER: &str = "swarm-error-document";
pub const ENCRYPT_HEADER: &str = "swarm-encrypt";
pub const DECOMPRESSED_LENGTH_HEADER: &str = "decompressed-content-length";

#[derive(Debug, Deserialize)]
struct UploadResponse {
    reference: String,
}

#[derive(Clone, Debug)]
pub struct RemoteStore {
    http: Client,
    base_url: String,
    upload_timeout: Duration,
}

impl RemoteStore {
    /// Connecting and every read are bounded by `config.timeout`; an upload
    /// is additionally bounded by it end to end. Proxied downloads may run
    /// longer as long as bytes keep flowing.
    pub fn new(config: &RemoteConfig) -> GatewayResult<Self> {
        let http = Client::builder()
            .connect_timeout(config.timeout)
            .read_timeout(config.timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            upload_timeout: config.timeout,
        })
    }

    /// Stream `archive` to the remote store as one deferred collection upload
    /// and return the content identifier it assigns.
    ///
    /// Anything other than `201 Created` is a `RemoteUpload` error carrying
    /// the status and body. No retries here; the next sweep retries.
    pub async fn upload(&self, archive: &Archive, batch_token: &str) -> GatewayResult<String> {
        let file = File::open(&archive.path).await?;
        let body = Body::wrap_stream(ReaderStream::new(file));

        let response = self
            .http
            .post(format!("{}/bzz", self.base_url))
            .timeout(self.upload_timeout)
            .header(DEFERRED_UPLOAD_HEADER, "true")
            .header(BATCH_ID_HEADER, batch_token)
            .header(COLLECTION_HEADER, "true")
            .header(header::CONTENT_TYPE, ARCHIVE_CONTENT_TYPE)
            .header(header::CONTENT_LENGTH, archive.size)
            .header(INDEX_DOCUMENT_HEADER, &archive.index_document)
            .header(ERROR_DOCUMENT_HEADER, "")
            .header(ENCRYPT_HEADER, "false")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::CREATED {
            let detail = response.text().await.unwrap_or_default();
            return Err(GatewayError::RemoteUpload(format!("{}: {}", status, detail)));
        }

        let parsed: UploadResponse = response.json().await?;
        if parsed.reference.is_empty() {
            return Err(GatewayError::RemoteUpload(
                "remote store returned an empty reference".into(),
            ));
        }
        debug!(reference = %parsed.reference, size = archive.size, "archive uploaded");
        Ok(parsed.reference)
    }

    /// Fetch `path` inside the collection `cid`.
    pub async fn fetch(&self, cid: &str, path: &str) -> GatewayResult<reqwest::Response> {
        let url = format!(
            "{}/bzz/{}/{}",
            self.base_url,
            cid,
            path.trim_start_matches('/')
        );
        let response = self.http.get(url).send().await?;
        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::NOT_FOUND => Err(GatewayError::NotFound(format!(
                "content `{}/{}`",
                cid, path
            ))),
            status => {
                let detail = response.text().await.unwrap_or_default();
                Err(GatewayError::RemoteFetch(format!("{}: {}", status, detail)))
            }
        }
    }
}

/// Length the remote store declares for a response body: the decompressed
/// length header when present, then `content-length`, then 0.
pub fn declared_length(response: &reqwest::Response) -> u64 {
    response
        .headers()
        .get(DECOMPRESSED_LENGTH_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .or_else(|| response.content_length())
        .unwrap_or(0)
}
