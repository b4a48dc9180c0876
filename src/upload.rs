//! Upload engine: serves a file (natively or transcoded) to a requesting
//! TiVo, deciding between a compatible range response and an incompatible
//! chunked-with-synthetic-header response. Ported from `send_file()` in the
//! original's video plugin.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path as AxumPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use tokio::io::AsyncSeekExt;
use tokio_util::io::ReaderStream;
use tracing::{Level, event};

use crate::config::Config;
use crate::errors::UploadError;
use crate::header::{tivo_header, HeaderAttrs, StreamFormat};
use crate::metadata::{MetadataProbe, SubprocessProbe};
use crate::status::{StatusRegistry, TransferDirection, TransferStatus};

#[derive(Clone)]
pub(crate) struct UploadState {
    pub(crate) config: Arc<Config>,
    pub(crate) status: StatusRegistry,
}

/// Whether the requested file can be served byte-for-byte (native .TiVo
/// container, matching capability) or must be wrapped with a synthetic
/// header because the TiVo doesn't natively support the source format.
fn needs_conversion(tsn: &str, extension: &str) -> bool {
    let ts_capable = crate::config::is_ts_capable(tsn);
    match extension {
        "ts" => !ts_capable,
        "tivo" | "mpg" | "mpeg" => false,
        _ => true,
    }
}

fn extract_tsn(headers: &HeaderMap) -> Option<String> {
    headers
        .get("TiVo_TCD_ID")
        .or_else(|| headers.get("tsn"))
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn parse_range(headers: &HeaderMap) -> Option<(u64, Option<u64>)> {
    let raw = headers.get(axum::http::header::RANGE)?.to_str().ok()?;
    let spec = raw.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end: Option<u64> = if end.is_empty() {
        None
    } else {
        end.parse().ok()
    };
    Some((start, end))
}

/// Checks the live status table for a not-yet-completed transfer already
/// parked at `requested_offset` under `status_key`, and records the current
/// request's offset either way so the next call can make the same check. On
/// a repeat, the status entry's `error` is set to the literal string the
/// original raised here ("Repeat offset call", §4.4), so the control API's
/// status listing surfaces the same diagnostic scenario 6 expects.
async fn check_repeat_offset(status: &StatusRegistry, status_key: &str, requested_offset: u64) -> bool {
    let prior = status.get(status_key).await;
    let repeat = requested_offset > 0
        && prior
            .as_ref()
            .is_some_and(|s| !s.done && s.sent_bytes == requested_offset);

    match prior {
        Some(_) => {
            status
                .update(status_key, |s| {
                    s.sent_bytes = requested_offset;
                    if repeat {
                        s.error = Some("Repeat offset call".to_string());
                    }
                })
                .await;
        }
        None => {
            status
                .insert(
                    status_key.to_string(),
                    TransferStatus {
                        sent_bytes: requested_offset,
                        ..TransferStatus::new(TransferDirection::Upload, status_key.to_string(), String::new())
                    },
                )
                .await;
        }
    }
    repeat
}

pub(crate) async fn serve_file(
    State(state): State<UploadState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    AxumPath((share, rel_path)): AxumPath<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let tsn = extract_tsn(&headers);
    if !crate::protocol::is_authorized(&state.config, &peer.ip().to_string(), tsn.as_deref()) {
        return (StatusCode::FORBIDDEN, "forbidden").into_response();
    }
    match serve_file_inner(&state, &share, &rel_path, &headers).await {
        Ok(resp) => resp,
        Err(UploadError::NotFound) => (StatusCode::NOT_FOUND, "not found").into_response(),
        Err(UploadError::Forbidden) => (StatusCode::FORBIDDEN, "forbidden").into_response(),
        Err(UploadError::RepeatOffset) => {
            (StatusCode::SERVICE_UNAVAILABLE, "repeat offset").into_response()
        }
        Err(UploadError::Io(err)) => {
            event!(Level::ERROR, "upload io error: {err}");
            (StatusCode::INTERNAL_SERVER_ERROR, "io error").into_response()
        }
    }
}

async fn serve_file_inner(
    state: &UploadState,
    share: &str,
    rel_path: &str,
    headers: &HeaderMap,
) -> Result<Response, UploadError> {
    let share_cfg = state
        .config
        .shares
        .iter()
        .find(|s| s.name == share)
        .ok_or(UploadError::NotFound)?;

    let full_path = resolve_within(&share_cfg.path, rel_path)?;
    if !full_path.is_file() {
        return Err(UploadError::NotFound);
    }

    let tsn = extract_tsn(headers).unwrap_or_default();
    let metadata = tokio::fs::metadata(&full_path).await?;
    let total_len = metadata.len();

    let extension = full_path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    let status_key = format!("{tsn}:{share}/{rel_path}");

    if needs_conversion(&tsn, &extension) {
        serve_incompatible(state, &full_path, &tsn, &extension, &status_key, total_len).await
    } else {
        serve_compatible(&state.status, &full_path, headers, total_len, &status_key).await
    }
}

/// Range-aware passthrough of a file the TiVo can already play, matching the
/// original's `compatible` branch: a single 206 with `Content-Range`.
async fn serve_compatible(
    status: &StatusRegistry,
    full_path: &Path,
    headers: &HeaderMap,
    total_len: u64,
    status_key: &str,
) -> Result<Response, UploadError> {
    let range = parse_range(headers);
    let start = range.map(|(s, _)| s).unwrap_or(0);

    if check_repeat_offset(status, status_key, start).await {
        event!(Level::WARN, "repeat offset {start} for {status_key}, refusing");
        return Err(UploadError::RepeatOffset);
    }

    if start > 0 {
        event!(Level::DEBUG, "range request for {status_key} at offset {start}");
    }

    let mut file = tokio::fs::File::open(full_path).await?;
    file.seek(std::io::SeekFrom::Start(start)).await?;
    let remaining = total_len.saturating_sub(start);
    let stream = ReaderStream::new(file);
    let body = Body::from_stream(stream);

    let status = if start > 0 {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };

    let mut response = Response::builder()
        .status(status)
        .header("Content-Length", remaining.to_string())
        .header("Content-Type", "video/x-tivo-mpeg");
    if start > 0 {
        response = response.header(
            "Content-Range",
            format!("bytes {start}-{}/{total_len}", total_len.saturating_sub(1)),
        );
    }
    Ok(response.body(body).unwrap_or_else(|_| Response::default()))
}

/// Incompatible-format branch: prepend the synthetic header chunk and stream
/// the body chunked, since total output length is no longer known up front.
/// Files already in a transport-stream container only need the header
/// relabeling; anything else is handed to the external transcoder first.
async fn serve_incompatible(
    state: &UploadState,
    full_path: &Path,
    tsn: &str,
    extension: &str,
    status_key: &str,
    total_len: u64,
) -> Result<Response, UploadError> {
    let format = if crate::config::is_ts_capable(tsn) {
        StreamFormat::Ts
    } else {
        StreamFormat::Ps
    };
    let mut attrs = HeaderAttrs {
        title: full_path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string),
        ..Default::default()
    };
    enrich_with_probe(state, full_path, &mut attrs).await;
    let header_bytes = tivo_header(&attrs, format);

    state
        .status
        .insert(
            status_key.to_string(),
            TransferStatus {
                total_bytes: Some(total_len),
                ..TransferStatus::new(TransferDirection::Upload, full_path.display().to_string(), tsn.to_string())
            },
        )
        .await;

    let header_chunk = Ok::<_, std::io::Error>(bytes::Bytes::from(header_bytes));

    if extension == "ts" {
        let file = tokio::fs::File::open(full_path).await?;
        let body_stream = ReaderStream::new(file);
        let combined = futures_util::stream::once(async move { header_chunk }).chain(body_stream);
        return Ok(Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "video/x-tivo-mpeg")
            .header("Transfer-Encoding", "chunked")
            .body(Body::from_stream(combined))
            .unwrap_or_else(|_| Response::default()));
    }

    let target_format = match format {
        StreamFormat::Ts => crate::transcoder::TargetFormat::MpegTs,
        StreamFormat::Ps => crate::transcoder::TargetFormat::MpegPs,
    };
    let request = crate::transcoder::TranscodeRequest {
        input: full_path.to_path_buf(),
        target_format,
        seek_seconds: None,
    };
    let transcode = crate::transcoder::spawn(&state.config.server.transcode_binary, &request)
        .map_err(|err| UploadError::Io(std::io::Error::other(err)))?;
    let body_stream = ReaderStream::new(transcode);
    let combined = futures_util::stream::once(async move { header_chunk }).chain(body_stream);

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "video/x-tivo-mpeg")
        .header("Transfer-Encoding", "chunked")
        .body(Body::from_stream(combined))
        .unwrap_or_else(|_| Response::default()))
}

/// Fills in `attrs.description`/`duration_ms` from the external metadata
/// probe when one is configured, leaving the filename-derived title in
/// place. The probe itself is an opaque collaborator (§1 Non-goals); a
/// probe failure just means the header ships with fewer attributes, not an
/// error for the caller.
async fn enrich_with_probe(state: &UploadState, full_path: &Path, attrs: &mut HeaderAttrs) {
    let Some(binary) = &state.config.server.metadata_probe_binary else {
        return;
    };
    let probe = SubprocessProbe {
        binary: binary.clone(),
    };
    match probe.probe(full_path).await {
        Ok(meta) => {
            attrs.description = meta.attrs.get("description").cloned();
            attrs.duration_ms = meta.duration_ms;
            if let Some(title) = meta.title() {
                attrs.title = Some(title.to_string());
            }
        }
        Err(err) => {
            event!(Level::DEBUG, "metadata probe failed for {full_path:?}: {err}");
        }
    }
}

fn resolve_within(root: &Path, rel: &str) -> Result<PathBuf, UploadError> {
    let candidate = root.join(rel);
    if rel.split('/').any(|part| part == "..") {
        return Err(UploadError::Forbidden);
    }
    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_conversion_native_formats_pass_through() {
        assert!(!needs_conversion("746000000001234", "tivo"));
        assert!(!needs_conversion("746000000001234", "mpg"));
    }

    #[test]
    fn test_needs_conversion_ts_requires_capability() {
        assert!(!needs_conversion("746000000001234", "ts"));
        assert!(needs_conversion("540000000001234", "ts"));
    }

    #[test]
    fn test_resolve_within_rejects_parent_escape() {
        let root = Path::new("/shares/movies");
        assert!(resolve_within(root, "../../etc/passwd").is_err());
        assert!(resolve_within(root, "Show.mpg").is_ok());
    }

    #[tokio::test]
    async fn test_check_repeat_offset_detects_second_call_at_same_offset() {
        let status = StatusRegistry::new();
        assert!(!check_repeat_offset(&status, "job", 4096).await);
        assert!(check_repeat_offset(&status, "job", 4096).await);

        let Some(entry) = status.get("job").await else {
            panic!("expected status entry to be present");
        };
        assert_eq!(entry.error.as_deref(), Some("Repeat offset call"));
    }

    #[tokio::test]
    async fn test_check_repeat_offset_ignores_zero_and_other_keys() {
        let status = StatusRegistry::new();
        assert!(!check_repeat_offset(&status, "job", 4096).await);
        assert!(!check_repeat_offset(&status, "job", 0).await);
        assert!(!check_repeat_offset(&status, "other", 4096).await);

        let Some(entry) = status.get("job").await else {
            panic!("expected status entry to be present");
        };
        assert_eq!(entry.error, None);
    }
}
