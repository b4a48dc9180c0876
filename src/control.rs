//! Admin/control JSON surface: transfer status and remote Now Playing List
//! browsing. Distinct from `protocol.rs`'s TiVo-facing XML dialect -- these
//! routes serve the local operator, not a TiVo, mirroring the original's
//! split between `httpserver.py` (TiVo XML) and `togo.py`'s `NPL`/
//! `GetShowsList` JSON projection (§4.9).

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::registry::TivoRegistry;
use crate::status::{StatusRegistry, TransferStatusView};
use crate::togo::client::ToGoClient;
use crate::togo::npl::NplCache;
use crate::togo::queue::ToGoEngine;

#[derive(Clone)]
pub(crate) struct ControlState {
    pub(crate) config: Arc<Config>,
    pub(crate) tivos: TivoRegistry,
    pub(crate) status: StatusRegistry,
    pub(crate) togo: ToGoEngine,
    pub(crate) npl: NplCache,
}

#[derive(Serialize)]
struct StatusResponse {
    uploads: Vec<TransferStatusView>,
    downloads: Vec<DownloadStatusView>,
}

#[derive(Serialize)]
struct DownloadStatusView {
    url: String,
    tivo_ip: String,
    running: bool,
    queued: bool,
    finished: bool,
    size_bytes: u64,
    rate_bytes_per_sec: f64,
    retry: u8,
    ts_error_count: u32,
    error: Option<String>,
}

/// `GetTransferStatus`/`GetActiveTransferCount` equivalent for the local
/// admin surface: every known upload and download, not scoped to one TiVo.
pub(crate) async fn get_status(State(state): State<ControlState>) -> Response {
    let uploads = state
        .status
        .all()
        .await
        .iter()
        .map(TransferStatusView::from)
        .collect();
    let downloads = state
        .togo
        .all_jobs()
        .await
        .into_iter()
        .map(|j| DownloadStatusView {
            url: j.url,
            tivo_ip: j.tivo_ip,
            running: j.running,
            queued: j.queued,
            finished: j.finished,
            size_bytes: j.size_bytes,
            rate_bytes_per_sec: j.rate_bytes_per_sec,
            retry: j.retry,
            ts_error_count: j.ts_error_count,
            error: j.error,
        })
        .collect();
    Json(StatusResponse { uploads, downloads }).into_response()
}

#[derive(Deserialize)]
pub(crate) struct NplQuery {
    tivo: String,
}

/// `Command=NPL` equivalent: proxies a `QueryContainer` against the TiVo at
/// `tivo` (its IP) and returns the JSON projection described in §4.9.
pub(crate) async fn get_npl(State(state): State<ControlState>, Query(q): Query<NplQuery>) -> Response {
    let Some(record) = state.tivos.find_by_address(&q.tivo).await else {
        return (StatusCode::NOT_FOUND, "unknown tivo").into_response();
    };
    let Some(mak) = state.config.tivo_mak_for(&record.tsn) else {
        return (
            StatusCode::BAD_REQUEST,
            "no tivo_mak configured for this tivo",
        )
            .into_response();
    };
    let client = match ToGoClient::new(mak) {
        Ok(c) => c,
        Err(err) => return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    };
    let base_url = format!("https://{}:{}", record.address, record.port);

    // Unlike a ToGo pull, this is a synchronous admin request: don't let a
    // permanently-busy TiVo hang it forever, cancel the underlying 503 retry
    // loop after a bounded wait instead.
    let cancel = tokio_util::sync::CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_secs(20)).await;
        canceller.cancel();
    });

    match state
        .npl
        .get_or_fetch(&record.tsn, &base_url, &client, &cancel)
        .await
    {
        Ok(shows) => {
            cancel.cancel();
            Json(shows).into_response()
        }
        Err(err) => {
            cancel.cancel();
            (StatusCode::BAD_GATEWAY, err.to_string()).into_response()
        }
    }
}
