//! TiVoConnect protocol dispatch: the `Command=` query handlers a TiVo sends
//! over `GET /TiVoConnect`, ported from `handle_query()` in the original's
//! `httpserver.py`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Component, Path};

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::config::Config;
use crate::registry::{TivoRecord, TivoRegistry};
use crate::sleep_inhibit::SleepInhibitor;
use crate::status::StatusRegistry;
use crate::togo::engine::run_worker;
use crate::togo::jobs::DownloadJob;
use crate::togo::queue::ToGoEngine;
use crate::xml::{escape, XmlBuilder};

/// Pulls the requesting TiVo's TSN from the `TiVo_TCD_ID` header, falling
/// back to the lowercase `tsn` header, and finally the `TSN` query
/// parameter some clients send instead -- matching the original's
/// `handler.headers.getheader('tsn', ...)` lookups scattered across plugins.
pub(crate) fn extract_tsn(headers: &HeaderMap, query_tsn: Option<&str>) -> Option<String> {
    headers
        .get("TiVo_TCD_ID")
        .or_else(|| headers.get("tsn"))
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| query_tsn.map(str::to_string))
}

const MAX_ITEM_COUNT: i64 = 50;

/// Accepts every caller when no allow-list is configured; otherwise accepts
/// an IP matching any configured prefix, or a TSN with its own `_tivo_<id>`
/// override section, per §4.3.
pub(crate) fn is_authorized(config: &Config, caller_ip: &str, tsn: Option<&str>) -> bool {
    if config.server.allowed_ips.is_empty() {
        return true;
    }
    if config
        .server
        .allowed_ips
        .iter()
        .any(|prefix| caller_ip.starts_with(prefix.as_str()))
    {
        return true;
    }
    tsn.is_some_and(|tsn| config.tsn_overrides.contains_key(tsn))
}

#[derive(Clone)]
pub(crate) struct ProtocolState {
    pub(crate) config: std::sync::Arc<Config>,
    pub(crate) tivos: TivoRegistry,
    pub(crate) status: StatusRegistry,
    pub(crate) togo: ToGoEngine,
    pub(crate) inhibitor: std::sync::Arc<dyn SleepInhibitor>,
    /// Share name -> zeroconf-adjusted display name (§4.2), empty when no
    /// collision occurred or zeroconf is disabled.
    pub(crate) share_renames: std::sync::Arc<HashMap<String, String>>,
}

#[derive(Deserialize, Debug, Default)]
pub(crate) struct QueryParams {
    #[serde(rename = "Command")]
    pub(crate) command: Option<String>,
    #[serde(rename = "Container")]
    pub(crate) container: Option<String>,
    #[serde(rename = "ItemCount")]
    pub(crate) item_count: Option<i64>,
    #[serde(rename = "AnchorItem")]
    pub(crate) anchor_item: Option<String>,
    #[serde(rename = "AnchorOffset")]
    pub(crate) anchor_offset: Option<i64>,
    #[serde(rename = "SortOrder")]
    pub(crate) sort_order: Option<String>,
    #[serde(rename = "Recurse")]
    pub(crate) recurse: Option<String>,
    #[serde(rename = "TSN")]
    pub(crate) tsn: Option<String>,
    #[serde(rename = "Url")]
    pub(crate) url: Option<String>,
    #[serde(rename = "TiVo")]
    pub(crate) tivo: Option<String>,
    pub(crate) decode: Option<String>,
    pub(crate) save: Option<String>,
    pub(crate) ts_format: Option<String>,
}

/// A present-but-valueless query flag (`&decode` with no `=value`) still
/// means "true" the way the original's CGI flag parsing treated bare params.
fn flag_present(raw: Option<&str>) -> bool {
    raw.is_some_and(|v| !matches!(v.to_lowercase().as_str(), "0" | "false" | "no"))
}

/// Top-level `/TiVoConnect` dispatch. Unknown commands return 400, matching
/// the original's behavior of rejecting anything outside its known command
/// set rather than silently no-op'ing.
pub(crate) async fn handle_tivo_connect(
    State(state): State<ProtocolState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(params): Query<QueryParams>,
    headers: HeaderMap,
) -> Response {
    let tsn = extract_tsn(&headers, params.tsn.as_deref());

    // Lazily remember any TiVo we haven't seen talk to us before, per §4.3:
    // unknown TSNs get registered with the caller's address on first contact.
    if let Some(tsn) = &tsn {
        if state.tivos.get(tsn).await.is_none() {
            state
                .tivos
                .remember(TivoRecord::new(tsn.clone(), peer.ip().to_string()))
                .await;
        }
    }

    if !is_authorized(&state.config, &peer.ip().to_string(), tsn.as_deref()) {
        return (StatusCode::FORBIDDEN, "forbidden").into_response();
    }

    match params.command.as_deref() {
        Some("QueryContainer") => query_container(&state, &params, tsn.as_deref()),
        Some("QueryItem") => query_item(&state, &params),
        Some("QueryFormats") => query_formats(tsn.as_deref()),
        Some("QueryServer") => query_server(),
        Some("GetActiveTransferCount" | "GetTransferStatus") => {
            (StatusCode::OK, "<TiVoContainer></TiVoContainer>").into_response()
        }
        Some("FlushServer" | "ResetServer") => (StatusCode::OK, "OK").into_response(),
        Some("ToGo") => enqueue_togo(&state, &params).await,
        Some("UnqueueAll") => {
            state.togo.unqueue_all().await;
            (StatusCode::OK, axum::Json(serde_json::json!({"unqueued": true}))).into_response()
        }
        _ => (StatusCode::BAD_REQUEST, "unknown command").into_response(),
    }
}

/// `Command=ToGo`: queues a pull for `Url` against the TiVo at `TiVo` (its
/// IP), spawning a worker if none is already running for that address, per
/// §4.5's enqueue API.
async fn enqueue_togo(state: &ProtocolState, params: &QueryParams) -> Response {
    let Some(tivo_ip) = params.tivo.clone() else {
        return (StatusCode::BAD_REQUEST, "missing TiVo").into_response();
    };
    let Some(url) = params.url.clone() else {
        return (StatusCode::BAD_REQUEST, "missing Url").into_response();
    };

    let job = DownloadJob::new(
        url,
        tivo_ip.clone(),
        flag_present(params.decode.as_deref()),
        flag_present(params.save.as_deref()),
        flag_present(params.ts_format.as_deref()),
        state.config.server.togo_ts_max_retries,
        state.config.server.togo_ts_error_mode,
    );

    let needs_worker = state.togo.enqueue(job).await;
    if needs_worker {
        let engine = state.togo.clone();
        let config = state.config.clone();
        let tivos = state.tivos.clone();
        let inhibitor = state.inhibitor.clone();
        tokio::spawn(run_worker(tivo_ip, engine, config, tivos, inhibitor));
    }

    (StatusCode::OK, axum::Json(serde_json::json!({"queued": true}))).into_response()
}

fn root_container(state: &ProtocolState, tsn: Option<&str>) -> Response {
    let candidates = match tsn {
        Some(tsn) => state.config.shares_for_tsn(tsn),
        None => state.config.shares.iter().collect(),
    };
    // Root enumeration only lists media shares, per §4.9; settings/togo/
    // desktop shares are reachable directly but don't appear here.
    let shares: Vec<_> = candidates.into_iter().filter(|s| s.kind.is_media()).collect();

    let mut builder = XmlBuilder::new();
    builder.open("TiVoContainer");
    builder.open("Details");
    builder.push_tag("Title", Some("pyrustivo"));
    builder.push_tag("ContentType", Some("x-container/folder"));
    builder.push_tag("TotalItems", Some(&shares.len().to_string()));
    builder.close("Details");

    for share in shares {
        let display_name = state
            .share_renames
            .get(&share.name)
            .map(String::as_str)
            .unwrap_or(&share.name);
        builder.open("Item");
        builder.open("Details");
        builder.push_tag("Title", Some(display_name));
        builder.push_tag("ContentType", Some(share.kind.content_type()));
        builder.close("Details");
        builder.open("Links");
        builder.open("Content");
        builder.push_tag("Url", Some(&format!("/{}", share.name)));
        builder.close("Content");
        builder.close("Links");
        builder.close("Item");
    }
    builder.close("TiVoContainer");

    (
        StatusCode::OK,
        [("Content-Type", "text/xml")],
        builder.finish(),
    )
        .into_response()
}

fn query_container(state: &ProtocolState, params: &QueryParams, tsn: Option<&str>) -> Response {
    let Some(container) = params.container.as_deref() else {
        return root_container(state, tsn);
    };

    if container.is_empty() || container == "/" {
        return root_container(state, tsn);
    }

    let name = container.trim_start_matches('/');
    let Some(share) = state.config.shares.iter().find(|s| s.name == name) else {
        return (StatusCode::NOT_FOUND, "no such container").into_response();
    };

    let entries = match list_share_dir(&share.path) {
        Ok(entries) => entries,
        Err(err) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
        }
    };

    let requested = params.item_count.unwrap_or(MAX_ITEM_COUNT).clamp(0, MAX_ITEM_COUNT);
    let offset = params.anchor_offset.unwrap_or(0).max(0) as usize;
    let page: Vec<_> = entries
        .into_iter()
        .skip(offset)
        .take(requested.max(0) as usize)
        .collect();

    let mut builder = XmlBuilder::new();
    builder.open("TiVoContainer");
    builder.open("Details");
    builder.push_tag("Title", Some(&share.name));
    builder.push_tag("ContentType", Some(share.kind.content_type()));
    builder.close("Details");
    for entry in page {
        builder.open("Item");
        builder.open("Details");
        builder.push_tag("Title", Some(&entry));
        builder.close("Details");
        builder.open("Links");
        builder.open("Content");
        builder.push_tag(
            "Url",
            Some(&format!("/{}/{}", share.name, url_encode_path(&entry))),
        );
        builder.close("Content");
        builder.close("Links");
        builder.close("Item");
    }
    builder.close("TiVoContainer");

    (
        StatusCode::OK,
        [("Content-Type", "text/xml")],
        builder.finish(),
    )
        .into_response()
}

fn query_item(state: &ProtocolState, params: &QueryParams) -> Response {
    let Some(container) = params.container.as_deref() else {
        return (StatusCode::BAD_REQUEST, "missing Container").into_response();
    };

    // The original rejected any path containing `..` outright to keep
    // requests scoped under the declared share root.
    if path_escapes_root(container) {
        return (StatusCode::FORBIDDEN, "forbidden path").into_response();
    }

    let mut parts = container.trim_start_matches('/').splitn(2, '/');
    let Some(share_name) = parts.next() else {
        return (StatusCode::NOT_FOUND, "no such item").into_response();
    };
    let Some(share) = state.config.shares.iter().find(|s| s.name == share_name) else {
        return (StatusCode::NOT_FOUND, "no such item").into_response();
    };
    let rel = parts.next().unwrap_or("");
    let full = share.path.join(rel);
    if !full.exists() {
        return (StatusCode::NOT_FOUND, "no such item").into_response();
    }

    let mut builder = XmlBuilder::new();
    builder.open("TiVoItem");
    builder.open("Details");
    builder.push_tag("Title", Some(&escape(rel)));
    builder.close("Details");
    builder.close("TiVoItem");

    (
        StatusCode::OK,
        [("Content-Type", "text/xml")],
        builder.finish(),
    )
        .into_response()
}

/// Always advertises `video/x-tivo-mpeg`; adds `video/x-tivo-mpeg-ts` when
/// the requesting TSN is transport-stream capable, per §4.3.
fn query_formats_xml(tsn: Option<&str>) -> String {
    let mut builder = XmlBuilder::new();
    builder.open("TiVoFormats");
    builder.open("Format");
    builder.push_tag("ContentType", Some("video/x-tivo-mpeg"));
    builder.close("Format");
    if tsn.is_some_and(crate::config::is_ts_capable) {
        builder.open("Format");
        builder.push_tag("ContentType", Some("video/x-tivo-mpeg-ts"));
        builder.close("Format");
    }
    builder.close("TiVoFormats");
    builder.finish()
}

fn query_formats(tsn: Option<&str>) -> Response {
    (
        StatusCode::OK,
        [("Content-Type", "text/xml")],
        query_formats_xml(tsn),
    )
        .into_response()
}

fn query_server() -> Response {
    let mut builder = XmlBuilder::new();
    builder.open("TiVoServer");
    builder.push_tag("ContentType", Some("x-tivo-server/pyrustivo"));
    builder.close("TiVoServer");
    (
        StatusCode::OK,
        [("Content-Type", "text/xml")],
        builder.finish(),
    )
        .into_response()
}

fn list_share_dir(root: &Path) -> std::io::Result<Vec<String>> {
    let mut entries = Vec::new();
    let mut dir = std::fs::read_dir(root)?;
    while let Some(Ok(entry)) = dir.next() {
        if let Some(name) = entry.file_name().to_str() {
            entries.push(name.to_string());
        }
    }
    entries.sort();
    Ok(entries)
}

fn path_escapes_root(raw: &str) -> bool {
    Path::new(raw)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
}

fn url_encode_path(raw: &str) -> String {
    raw.replace(' ', "%20")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_escapes_root() {
        assert!(path_escapes_root("/Movies/../../etc/passwd"));
        assert!(!path_escapes_root("/Movies/show.mpg"));
    }

    #[test]
    fn test_url_encode_path_spaces() {
        assert_eq!(url_encode_path("My Show.mpg"), "My%20Show.mpg");
    }

    #[test]
    fn test_query_formats_ts_capability() {
        let ts_capable = query_formats_xml(Some("746000000001234"));
        assert!(ts_capable.contains("video/x-tivo-mpeg-ts"));
        assert!(ts_capable.contains("video/x-tivo-mpeg<"));

        let not_capable = query_formats_xml(Some("540000000001234"));
        assert!(!not_capable.contains("video/x-tivo-mpeg-ts"));
        assert!(not_capable.contains("video/x-tivo-mpeg<"));
    }

    fn base_config() -> Config {
        Config {
            server: crate::config::ServerConfig::default(),
            shares: Vec::new(),
            tsn_overrides: std::collections::HashMap::new(),
        }
    }

    #[test]
    fn test_is_authorized_empty_allow_list_accepts_all() {
        let config = base_config();
        assert!(is_authorized(&config, "10.0.0.5", None));
    }

    #[test]
    fn test_is_authorized_by_ip_prefix() {
        let mut config = base_config();
        config.server.allowed_ips = vec!["192.168.".to_string()];
        assert!(is_authorized(&config, "192.168.1.20", None));
        assert!(!is_authorized(&config, "10.0.0.5", None));
    }

    #[test]
    fn test_is_authorized_by_tsn_override() {
        let mut config = base_config();
        config.server.allowed_ips = vec!["192.168.".to_string()];
        config
            .tsn_overrides
            .insert("746000000001234".to_string(), crate::config::TsnOverride::default());
        assert!(is_authorized(&config, "10.0.0.5", Some("746000000001234")));
        assert!(!is_authorized(&config, "10.0.0.5", Some("999")));
    }
}
