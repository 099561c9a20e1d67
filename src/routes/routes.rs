//! Defines routes for the upload gateway.
//!
//! ## Structure
//! - **Asset slots**
//!   - `POST /assets` — open a slot
//!   - `GET  /assets/{asset_id}` — current record
//!
//! - **Resumable uploads**
//!   - `PUT  /upload/{asset_id}` — stage one chunk (multipart field `file`)
//!   - `GET  /upload/{asset_id}` — probe whether a chunk is staged
//!   - `POST /finish/{asset_id}` — close the upload, queue it for pinning
//!
//! - **Downloads**
//!   - `GET /download/{cid}` and `GET /download/{cid}/{*path}` — remote proxy

use crate::{
    handlers::{
        download_handlers::{download_path, download_root},
        health_handlers::{healthz, readyz},
        upload_handlers::{create_asset, finish_upload, get_asset, probe_chunk, put_chunk},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post, put},
};

/// Largest multipart body accepted for a single chunk.
pub const MAX_CHUNK_BODY: usize = 64 * 1024 * 1024;

/// Build the router; shared `AppState` is attached by the caller.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/assets", post(create_asset))
        .route("/assets/{asset_id}", get(get_asset))
        .route(
            "/upload/{asset_id}",
            put(put_chunk)
                .get(probe_chunk)
                .layer(DefaultBodyLimit::max(MAX_CHUNK_BODY)),
        )
        .route("/finish/{asset_id}", post(finish_upload))
        .route("/download/{cid}", get(download_root))
        .route("/download/{cid}/{*path}", get(download_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{PinConfig, RemoteConfig},
        db::test_pool,
        models::{
            asset::{Asset, AssetStatus},
            usage::UsageKind,
        },
        services::{
            chunk_store::ChunkStore,
            pin_worker::{FinishQueue, FinishSignal, PinWorker},
            remote::RemoteStore,
            usage,
        },
    };
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode, header},
        response::Response,
    };
    use httpmock::Method::{GET, POST};
    use httpmock::MockServer;
    use serde_json::{Value, json};
    use std::{path::Path, sync::Arc, time::Duration};
    use tokio::sync::mpsc;
    use tower::ServiceExt;
    use uuid::Uuid;

    const BOUNDARY: &str = "gateway-test-boundary";

    struct TestApp {
        app: Router,
        state: AppState,
        signals: mpsc::Receiver<FinishSignal>,
    }

    async fn test_app(dir: &Path, server: &MockServer) -> TestApp {
        let db = Arc::new(test_pool(dir).await);
        let chunks = ChunkStore::new(dir.join("staging"));
        tokio::fs::create_dir_all(&chunks.base_path).await.unwrap();
        let remote = RemoteStore::new(&RemoteConfig {
            base_url: server.base_url(),
            batch_token: "batch-1".into(),
            timeout: Duration::from_secs(5),
        })
        .unwrap();
        let (finish, signals) = FinishQueue::channel(16);
        let state = AppState::new(db, chunks, remote, finish);
        TestApp {
            app: routes().with_state(state.clone()),
            state,
            signals,
        }
    }

    fn worker(state: &AppState) -> PinWorker {
        PinWorker::new(
            state.assets.clone(),
            state.chunks.clone(),
            state.remote.clone(),
            state.usage.clone(),
            "batch-1",
            PinConfig {
                retry_backoff: Duration::ZERO,
                ..PinConfig::default()
            },
        )
    }

    async fn send(app: &Router, request: Request<Body>) -> Response {
        app.clone().oneshot(request).await.unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn create(app: &Router) -> Asset {
        let body = json!({ "bucket_id": Uuid::new_v4(), "user_id": 42 });
        let response = send(
            app,
            Request::post("/assets")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        serde_json::from_value(json_body(response).await).unwrap()
    }

    fn chunk_request(asset_id: &str, number: u32, data: &[u8]) -> Request<Body> {
        let uri = format!(
            "/upload/{}?resumableIdentifier=250-filebin&resumableChunkNumber={}\
             &resumableTotalChunks=3&resumableChunkSize=100&resumableTotalSize=250\
             &resumableRelativePath=folder%2Ffile.bin&resumableFilename=file.bin",
            asset_id, number
        );
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"blob\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::put(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn probe_request(asset_id: &str, number: u32) -> Request<Body> {
        let uri = format!(
            "/upload/{}?resumableIdentifier=250-filebin&resumableChunkNumber={}",
            asset_id, number
        );
        Request::get(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_upload_finish_and_pin_end_to_end() {
        let server = MockServer::start_async().await;
        let upload = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/bzz")
                    .header("swarm-postage-batch-id", "batch-1")
                    .header("swarm-index-document", "folder/file.bin");
                then.status(201).json_body(json!({ "reference": "c0ffee" }));
            })
            .await;
        let dir = tempfile::tempdir().unwrap();
        let mut t = test_app(dir.path(), &server).await;
        let asset = create(&t.app).await;
        assert_eq!(asset.status, AssetStatus::Wait);

        let response = send(&t.app, probe_request(&asset.asset_id, 1)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // Out of order on purpose.
        for (number, len) in [(3u32, 50usize), (1, 100), (2, 100)] {
            let data = vec![number as u8; len];
            let response = send(&t.app, chunk_request(&asset.asset_id, number, &data)).await;
            assert_eq!(response.status(), StatusCode::OK);
            let body = json_body(response).await;
            assert_eq!(body["chunk_number"], number);
            assert_eq!(body["asset"]["status"], "uploading");
            assert_eq!(body["file_complete"], number == 2);
        }

        let response = send(&t.app, probe_request(&asset.asset_id, 1)).await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = send(
            &t.app,
            Request::post(format!("/finish/{}", asset.asset_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "uploaded");
        assert_eq!(body["size"], 250);
        assert_eq!(
            t.signals.try_recv().unwrap(),
            FinishSignal::Asset(asset.asset_id.clone())
        );

        let report = worker(&t.state).sweep().await.unwrap();
        assert_eq!(report.pinned, 1);
        upload.assert_async().await;

        let response = send(
            &t.app,
            Request::get(format!("/assets/{}", asset.asset_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        let pinned: Asset = serde_json::from_value(json_body(response).await).unwrap();
        assert_eq!(pinned.status, AssetStatus::Pined);
        assert_eq!(pinned.size, 250);
        assert_eq!(pinned.cid, "c0ffee");
        assert_eq!(pinned.name, "folder");
        assert!(!t.state.chunks.manifest_path(&asset.asset_id).exists());
        assert!(!t.state.chunks.chunks_dir(&asset.asset_id).exists());
    }

    #[tokio::test]
    async fn test_chunk_after_finish_is_conflict() {
        let server = MockServer::start_async().await;
        let dir = tempfile::tempdir().unwrap();
        let t = test_app(dir.path(), &server).await;
        let asset = create(&t.app).await;

        let response = send(&t.app, chunk_request(&asset.asset_id, 1, &[1u8; 100])).await;
        assert_eq!(response.status(), StatusCode::OK);
        send(
            &t.app,
            Request::post(format!("/finish/{}", asset.asset_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await;

        let response = send(&t.app, chunk_request(&asset.asset_id, 2, &[2u8; 100])).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let asset = t.state.assets.get(&asset.asset_id).await.unwrap();
        assert_eq!(asset.status, AssetStatus::Uploaded);
        assert_eq!(asset.size, 100);
    }

    #[tokio::test]
    async fn test_finish_waits_for_in_flight_chunk_write() {
        let server = MockServer::start_async().await;
        let dir = tempfile::tempdir().unwrap();
        let t = test_app(dir.path(), &server).await;
        let asset = create(&t.app).await;

        let in_flight = t.state.locks.chunk_write(&asset.asset_id).await;
        let app = t.app.clone();
        let uri = format!("/finish/{}", asset.asset_id);
        let finish = tokio::spawn(async move {
            app.oneshot(Request::post(uri).body(Body::empty()).unwrap())
                .await
                .unwrap()
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!finish.is_finished());
        let still_open = t.state.assets.get(&asset.asset_id).await.unwrap();
        assert_eq!(still_open.status, AssetStatus::Wait);

        drop(in_flight);
        let response = finish.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "uploaded");
    }

    #[tokio::test]
    async fn test_pin_claim_is_reported_as_uploaded() {
        let server = MockServer::start_async().await;
        let dir = tempfile::tempdir().unwrap();
        let t = test_app(dir.path(), &server).await;
        let asset = create(&t.app).await;
        for (number, len) in [(1u32, 100usize), (2, 100), (3, 50)] {
            send(&t.app, chunk_request(&asset.asset_id, number, &vec![1u8; len])).await;
        }
        t.state.assets.mark_uploaded(&asset.asset_id).await.unwrap();
        t.state.assets.claim(&asset.asset_id).await.unwrap().unwrap();

        let response = send(
            &t.app,
            Request::get(format!("/assets/{}", asset.asset_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(json_body(response).await["status"], "uploaded");

        let response = send(
            &t.app,
            Request::post(format!("/finish/{}", asset.asset_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(json_body(response).await["status"], "uploaded");
    }

    #[tokio::test]
    async fn test_chunk_with_inconsistent_layout_is_rejected() {
        let server = MockServer::start_async().await;
        let dir = tempfile::tempdir().unwrap();
        let t = test_app(dir.path(), &server).await;
        let asset = create(&t.app).await;

        // chunk 3 must carry the 50 byte remainder
        let response = send(&t.app, chunk_request(&asset.asset_id, 3, &[3u8; 100])).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let asset = t.state.assets.get(&asset.asset_id).await.unwrap();
        assert_eq!(asset.status, AssetStatus::Wait);
        assert_eq!(asset.size, 0);
    }

    #[tokio::test]
    async fn test_unknown_asset_is_not_found() {
        let server = MockServer::start_async().await;
        let dir = tempfile::tempdir().unwrap();
        let t = test_app(dir.path(), &server).await;

        let response = send(&t.app, chunk_request("missing", 1, b"x")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = json_body(response).await;
        assert_eq!(body["status"], 404);

        let response = send(
            &t.app,
            Request::post("/finish/missing").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_download_proxies_and_records_traffic() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/bzz");
                then.status(201).json_body(json!({ "reference": "c0ffee" }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/bzz/c0ffee/folder/file.bin");
                then.status(200)
                    .header("content-type", "application/octet-stream")
                    .header("decompressed-content-length", "250")
                    .body(vec![7u8; 250]);
            })
            .await;
        let dir = tempfile::tempdir().unwrap();
        let t = test_app(dir.path(), &server).await;
        let asset = create(&t.app).await;
        for (number, len) in [(1u32, 100usize), (2, 100), (3, 50)] {
            send(&t.app, chunk_request(&asset.asset_id, number, &vec![7u8; len])).await;
        }
        t.state.assets.mark_uploaded(&asset.asset_id).await.unwrap();
        worker(&t.state).sweep().await.unwrap();

        let response = send(
            &t.app,
            Request::get("/download/c0ffee/folder/file.bin")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/octet-stream"
        );
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes.len(), 250);

        let traffic = t
            .state
            .usage
            .usage_for(UsageKind::Traffic, 42, usage::today())
            .await
            .unwrap();
        assert_eq!(traffic, 250);

        let response = send(
            &t.app,
            Request::get("/download/unknown").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_endpoints() {
        let server = MockServer::start_async().await;
        let dir = tempfile::tempdir().unwrap();
        let t = test_app(dir.path(), &server).await;

        let response = send(&t.app, Request::get("/healthz").body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(&t.app, Request::get("/readyz").body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["checks"]["sqlite"]["ok"], true);
        assert_eq!(body["checks"]["staging"]["ok"], true);
    }
}
