//! Health and readiness handlers.
//!
//! - GET /healthz  -> liveness ("ok")
//! - GET /readyz   -> readiness: session database plus a chunk-directory disk check

use crate::services::upload_service::UploadService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::{collections::HashMap, path::Path};
use tokio::fs;
use uuid::Uuid;

/// `GET /healthz`
///
/// Liveness check. Always 200, never touches disk or the database.
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
/// Runs `SELECT 1` against the session store, then writes, reads back and
/// deletes a scratch file in the chunk directory. 503 if either check fails.
pub async fn readyz(State(service): State<UploadService>) -> impl IntoResponse {
    let sqlite_check = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&*service.db)
        .await
    {
        Ok(v) if v == 1 => (true, None::<String>),
        Ok(v) => (false, Some(format!("unexpected result: {}", v))),
        Err(e) => (false, Some(format!("error: {}", e))),
    };

    let tmp_path = service
        .chunks
        .root()
        .join(format!(".readyz-{}", Uuid::new_v4()));
    let disk_check = match fs::create_dir_all(service.chunks.root()).await {
        Err(e) => Err(format!("could not create chunk dir: {}", e)),
        Ok(()) => check_disk(&tmp_path).await,
    };
    let disk_check = match disk_check {
        Ok(warning) => (true, warning),
        Err(e) => (false, Some(e)),
    };

    let sqlite_ok = sqlite_check.0;
    let disk_ok = disk_check.0;
    let overall_ok = sqlite_ok && disk_ok;

    let mut checks = HashMap::new();
    checks.insert(
        "sqlite",
        CheckStatus {
            ok: sqlite_ok,
            error: sqlite_check.1,
        },
    );
    checks.insert(
        "disk",
        CheckStatus {
            ok: disk_ok,
            error: disk_check.1,
        },
    );

    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        checks,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
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

/// Write, read back and remove `path`. `Ok(Some(..))` means the round trip
/// worked but the scratch file could not be removed.
async fn check_disk(path: &Path) -> Result<Option<String>, String> {
    fs::write(path, b"readyz")
        .await
        .map_err(|e| format!("could not write tmp file: {}", e))?;

    let read_back = fs::read(path).await;
    let removed = fs::remove_file(path).await;
    match read_back {
        Ok(bytes) if bytes == b"readyz" => Ok(removed
            .err()
            .map(|e| format!("could not remove tmp file: {}", e))),
        Ok(_) => Err("file content mismatch".to_string()),
        Err(e) => Err(format!("could not read tmp file: {}", e)),
    }
}
