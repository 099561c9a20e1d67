//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks SQLite and the staging directory

use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::{collections::HashMap, path::Path};
use tokio::fs;
use uuid::Uuid;

/// `GET /healthz`
///
/// Cheap liveness probe, never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Runs `SELECT 1` against SQLite and a write/read/delete round trip in the
/// staging directory. HTTP 200 when both pass, 503 otherwise.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let sqlite = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&*state.db)
        .await
    {
        Ok(1) => CheckStatus::ok(),
        Ok(v) => CheckStatus::failed(format!("unexpected result: {}", v)),
        Err(e) => CheckStatus::failed(format!("error: {}", e)),
    };
    let staging = check_staging(&state.chunks.base_path).await;

    let overall_ok = sqlite.ok && staging.ok;
    let checks = HashMap::from([("sqlite", sqlite), ("staging", staging)]);
    let body = ReadyResponse {
        status: if overall_ok { "ok" } else { "error" }.into(),
        checks,
    };
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

async fn check_staging(base: &Path) -> CheckStatus {
    let probe = base.join(format!(".readyz-{}", Uuid::new_v4()));
    let result = match fs::write(&probe, b"readyz").await {
        Ok(()) => match fs::read(&probe).await {
            Ok(bytes) if bytes == b"readyz" => CheckStatus::ok(),
            Ok(_) => CheckStatus::failed("file content mismatch"),
            Err(e) => CheckStatus::failed(format!("could not read probe file: {}", e)),
        },
        Err(e) => return CheckStatus::failed(format!("could not write probe file: {}", e)),
    };
    // best-effort cleanup
    let _ = fs::remove_file(&probe).await;
    result
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self { ok: true, error: None }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
        }
    }
}
