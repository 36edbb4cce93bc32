//! Range-aware streaming of stored media.
//!
//! Players seek by asking for byte ranges, so every response advertises
//! `Accept-Ranges: bytes` and a `Range` request gets a 206 whose body is a
//! seeked, length-limited reader over the file. Nothing is buffered in
//! memory.

use std::{io::SeekFrom, path::Path};

use axum::{
    body::Body,
    http::{HeaderMap, StatusCode, header},
    response::Response,
};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::error::{AppError, AppResult};

/// Outcome of interpreting a `Range` header against a file size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// Inclusive byte bounds, already clamped to the file.
    Satisfiable { start: u64, end: u64 },
    /// The range starts at or past the end of the file.
    Unsatisfiable,
}

impl ByteRange {
    fn new(start: u64, end: u64, size: u64) -> Self {
        if start >= size {
            Self::Unsatisfiable
        } else {
            Self::Satisfiable {
                start,
                end: end.min(size - 1),
            }
        }
    }
}

/// Content type by extension. Unknown extensions are served as opaque bytes.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        _ => "application/octet-stream",
    }
}

/// Parses `bytes=<start>-<end>`, `bytes=<start>-` or `bytes=-<suffix>`.
///
/// Only the first range of a multi-range header is considered. `None` means
/// the header should be ignored and the whole file served.
pub fn parse_range_header(value: &str, size: u64) -> Option<ByteRange> {
    let (unit, ranges) = value.trim().split_once('=')?;
    if !unit.trim().eq_ignore_ascii_case("bytes") {
        return None;
    }
    let range = ranges.split(',').next()?.trim();
    let (start_str, end_str) = range.split_once('-')?;
    let (start_str, end_str) = (start_str.trim(), end_str.trim());

    if start_str.is_empty() {
        // Suffix range: "-N" means the last N bytes.
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 {
            return None;
        }
        if size == 0 {
            return Some(ByteRange::Unsatisfiable);
        }
        return Some(ByteRange::new(size.saturating_sub(suffix_len), size - 1, size));
    }

    let start: u64 = start_str.parse().ok()?;
    if end_str.is_empty() {
        return Some(ByteRange::new(start, u64::MAX, size));
    }
    let end: u64 = end_str.parse().ok()?;
    if end < start {
        return None;
    }
    Some(ByteRange::new(start, end, size))
}

/// Streams `path`, honouring the request's `Range` header.
///
/// Missing or unreadable files are reported as a plain 404; the underlying
/// I/O error is only logged.
pub async fn serve_file(path: &Path, headers: &HeaderMap) -> AppResult<Response> {
    let mut file = File::open(path).await.map_err(|err| {
        debug!(path = %path.display(), error = %err, "media open failed");
        AppError::not_found("file not found")
    })?;
    let metadata = file.metadata().await.map_err(|err| {
        debug!(path = %path.display(), error = %err, "media stat failed");
        AppError::not_found("file not found")
    })?;
    if !metadata.is_file() {
        return Err(AppError::not_found("file not found"));
    }
    let size = metadata.len();
    let content_type = content_type_for(path);

    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| parse_range_header(value, size));

    let response = match range {
        None => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type)
            .header(header::CONTENT_LENGTH, size)
            .header(header::ACCEPT_RANGES, "bytes")
            .body(Body::from_stream(ReaderStream::new(file))),
        Some(ByteRange::Unsatisfiable) => Response::builder()
            .status(StatusCode::RANGE_NOT_SATISFIABLE)
            .header(header::CONTENT_RANGE, format!("bytes */{size}"))
            .header(header::ACCEPT_RANGES, "bytes")
            .body(Body::empty()),
        Some(ByteRange::Satisfiable { start, end }) => {
            let length = end - start + 1;
            file.seek(SeekFrom::Start(start)).await.map_err(|err| {
                debug!(path = %path.display(), error = %err, "media seek failed");
                AppError::not_found("file not found")
            })?;
            Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_TYPE, content_type)
                .header(header::CONTENT_LENGTH, length)
                .header(header::CONTENT_RANGE, format!("bytes {start}-{end}/{size}"))
                .header(header::ACCEPT_RANGES, "bytes")
                .body(Body::from_stream(ReaderStream::new(file.take(length))))
        }
    };

    response.map_err(|err| AppError::internal(format!("building media response: {err}")))
}
