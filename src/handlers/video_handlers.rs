//! Listing and byte-range playback of transcoded renditions.
//!
//! Renditions live flat in the transcoded directory and are named
//! `<base>_<label>.mp4`, where the label is three or four digits and a `p`.

use crate::{errors::AppError, services::upload_service::UploadService};
use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use regex::Regex;
use serde::Serialize;
use std::{collections::BTreeMap, io::ErrorKind, io::SeekFrom, sync::LazyLock};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncSeekExt},
};
use tokio_util::io::ReaderStream;

static RENDITION_NAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^(.+)_(\d{3,4}p)\.mp4$").ok());

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct Rendition {
    pub resolution: String,
    pub file: String,
}

#[derive(Debug, Serialize)]
pub struct VideoEntry {
    pub name: String,
    pub renditions: Vec<Rendition>,
}

/// Split `movie-ab12_720p.mp4` into `("movie-ab12", "720p")`.
pub fn parse_rendition_name(file_name: &str) -> Option<(&str, &str)> {
    let caps = RENDITION_NAME.as_ref()?.captures(file_name)?;
    Some((caps.get(1)?.as_str(), caps.get(2)?.as_str()))
}

/// `GET /videos`
///
/// Groups every rendition on disk by base name. Files that do not look like
/// renditions are skipped. A missing directory yields an empty list.
pub async fn list_videos(
    State(service): State<UploadService>,
) -> Result<Json<Vec<VideoEntry>>, AppError> {
    let mut grouped: BTreeMap<String, Vec<Rendition>> = BTreeMap::new();

    let mut entries = match fs::read_dir(&service.transcoded_dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Json(Vec::new())),
        Err(err) => return Err(AppError::internal(format!("Error reading videos: {}", err))),
    };

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| AppError::internal(format!("Error reading videos: {}", e)))?
    {
        let file_name = entry.file_name().to_string_lossy().to_string();
        let Some((base, label)) = parse_rendition_name(&file_name) else {
            continue;
        };
        grouped
            .entry(base.to_string())
            .or_default()
            .push(Rendition {
                resolution: label.to_string(),
                file: file_name.clone(),
            });
    }

    let videos = grouped
        .into_iter()
        .map(|(name, mut renditions)| {
            renditions.sort_by_key(|r| {
                r.resolution
                    .trim_end_matches('p')
                    .parse::<u32>()
                    .unwrap_or(u32::MAX)
            });
            VideoEntry { name, renditions }
        })
        .collect();

    Ok(Json(videos))
}

/// Outcome of interpreting a `Range` header against a file length.
#[derive(Debug, PartialEq, Eq)]
pub enum ByteRange {
    /// Serve the whole file.
    Full,
    /// Serve `start..=end`.
    Partial { start: u64, end: u64 },
    Unsatisfiable,
}

/// Parse a single-range `bytes=` header. Multi-range requests and other units
/// fall back to the full body.
pub fn parse_range(header: Option<&str>, len: u64) -> ByteRange {
    let Some(ranges) = header.and_then(|h| h.trim().strip_prefix("bytes=")) else {
        return ByteRange::Full;
    };
    if ranges.contains(',') {
        return ByteRange::Full;
    }
    let Some((start, end)) = ranges.split_once('-') else {
        return ByteRange::Unsatisfiable;
    };
    let (start, end) = (start.trim(), end.trim());

    let (start, end) = if start.is_empty() {
        // suffix form: last N bytes
        let Ok(suffix) = end.parse::<u64>() else {
            return ByteRange::Unsatisfiable;
        };
        if suffix == 0 || len == 0 {
            return ByteRange::Unsatisfiable;
        }
        (len.saturating_sub(suffix), len - 1)
    } else {
        let Ok(start) = start.parse::<u64>() else {
            return ByteRange::Unsatisfiable;
        };
        let end = if end.is_empty() {
            len.saturating_sub(1)
        } else {
            match end.parse::<u64>() {
                Ok(end) => end.min(len.saturating_sub(1)),
                Err(_) => return ByteRange::Unsatisfiable,
            }
        };
        (start, end)
    };

    if start >= len || start > end {
        return ByteRange::Unsatisfiable;
    }
    ByteRange::Partial { start, end }
}

/// `GET /videos/{file}`
///
/// Streams a rendition, honouring a single `Range: bytes=` request.
pub async fn stream_video(
    State(service): State<UploadService>,
    Path(file): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    if file.is_empty() || file.contains(['/', '\\']) || file.starts_with('.') {
        return Err(AppError::bad_request("Invalid video file name"));
    }

    let path = service.transcoded_dir.join(&file);
    let mut handle = match File::open(&path).await {
        Ok(handle) => handle,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(AppError::not_found(format!("Video `{}` not found", file)));
        }
        Err(err) => return Err(AppError::internal(format!("Error opening video: {}", err))),
    };
    let len = handle
        .metadata()
        .await
        .map_err(|e| AppError::internal(format!("Error reading video metadata: {}", e)))?
        .len();

    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok());

    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("video/mp4"));
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    match parse_range(range, len) {
        ByteRange::Full => {
            response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
            let body = Body::from_stream(ReaderStream::new(handle));
            Ok((StatusCode::OK, response_headers, body).into_response())
        }
        ByteRange::Partial { start, end } => {
            handle
                .seek(SeekFrom::Start(start))
                .await
                .map_err(|e| AppError::internal(format!("Error seeking video: {}", e)))?;
            let chunk_len = end - start + 1;
            response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(chunk_len));
            let content_range = format!("bytes {}-{}/{}", start, end, len);
            response_headers.insert(
                header::CONTENT_RANGE,
                HeaderValue::from_str(&content_range)
                    .map_err(|e| AppError::internal(e.to_string()))?,
            );
            let body = Body::from_stream(ReaderStream::new(handle.take(chunk_len)));
            Ok((StatusCode::PARTIAL_CONTENT, response_headers, body).into_response())
        }
        ByteRange::Unsatisfiable => {
            let content_range = format!("bytes */{}", len);
            response_headers.insert(
                header::CONTENT_RANGE,
                HeaderValue::from_str(&content_range)
                    .map_err(|e| AppError::internal(e.to_string()))?,
            );
            Ok((StatusCode::RANGE_NOT_SATISFIABLE, response_headers).into_response())
        }
    }
}
