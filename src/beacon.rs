//! UDP discovery beacon and the length-prefixed TCP direct-connect exchange,
//! ported from the original's `Beacon` class in `beacon.py`.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tracing::{Level, event};
use uuid::Uuid;

use crate::config::{Config, ShareKind};

const BEACON_INTERVAL: Duration = Duration::from_secs(60);
const DISCOVERY_PORT: u16 = 2190;

const PLATFORM_MAIN: &str = "pyTivo";
const PLATFORM_VIDEO: &str = "pc/pyTivo";

/// `pyTivo` if any configured share is music or photos, else `pc/pyTivo` --
/// mirrors `Beacon.__init__`'s platform selection in the original.
pub(crate) fn platform_for(shares: &[crate::config::Share]) -> &'static str {
    if shares
        .iter()
        .any(|s| matches!(s.kind, ShareKind::Music | ShareKind::Photos))
    {
        PLATFORM_MAIN
    } else {
        PLATFORM_VIDEO
    }
}

/// Builds the `tivoconnect=1\n...` body the original's `format_beacon()`
/// assembled, advertising this server as a video share source. `services`
/// is the semicolon-joined `"TiVoMediaServer:<port>/http"` list; pass `None`
/// for the direct-connect fallback of `services=TiVoMediaServer:0/http`.
pub(crate) fn format_beacon(
    guid: &str,
    hostname: &str,
    platform: &str,
    method: &str,
    services: Option<&str>,
) -> String {
    let mut body = String::new();
    body.push_str("tivoconnect=1\n");
    body.push_str(&format!("method={method}\n"));
    body.push_str(&format!("identity={{{guid}}}\n"));
    body.push_str(&format!("machine={hostname}\n"));
    body.push_str(&format!("platform={platform}\n"));
    match services {
        Some(list) => body.push_str(&format!("services={list}\n")),
        None => body.push_str("services=TiVoMediaServer:0/http\n"),
    }
    body
}

fn new_guid() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Periodically broadcasts a UDP beacon to every address in
/// `server.beacon_addresses`. Runs until cancelled via `shutdown`.
pub(crate) async fn run_udp_beacon(
    config: std::sync::Arc<Config>,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    socket.set_broadcast(true)?;
    let guid = new_guid();
    let hostname = hostname_or_fallback();
    let platform = platform_for(&config.shares);
    let services = format!("TiVoMediaServer:{}/http", config.server.port);
    let body = format_beacon(&guid, &hostname, platform, "broadcast", Some(&services));

    let mut interval = tokio::time::interval(BEACON_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                for addr in &config.server.beacon_addresses {
                    if let Err(err) = socket.send_to(body.as_bytes(), (addr.as_str(), DISCOVERY_PORT)).await {
                        event!(Level::WARN, "beacon send to {addr} failed: {err}");
                    }
                }
            }
            _ = shutdown.recv() => {
                event!(Level::INFO, "udp beacon task shutting down");
                return Ok(());
            }
        }
    }
}

/// Shells out to `hostname`, the way the original relied on
/// `socket.gethostname()`, since the standard library doesn't expose the
/// syscall directly.
pub(crate) fn hostname_or_fallback() -> String {
    std::process::Command::new("hostname")
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "pyrustivo".to_string())
}

/// Length-prefixed packet read/write used by the TCP direct-connect beacon
/// exchange: a 4-byte big-endian length header followed by the payload.
pub(crate) async fn send_packet(
    stream: &mut tokio::net::TcpStream,
    payload: &[u8],
) -> std::io::Result<()> {
    let len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(payload).await
}

pub(crate) async fn recv_packet(stream: &mut tokio::net::TcpStream) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0_u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0_u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Listens on the discovery port for TiVos that connect directly instead of
/// waiting for a broadcast, replying with the same beacon body.
pub(crate) async fn run_tcp_beacon_listener(
    config: std::sync::Arc<Config>,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", DISCOVERY_PORT)).await?;
    let guid = new_guid();
    let hostname = hostname_or_fallback();
    let platform = platform_for(&config.shares);
    // Direct-connect replies advertise a fixed services list per the
    // original rather than the real port, mirroring `listen()`'s
    // `format_beacon('connected', services=False)`.
    let body = format_beacon(&guid, &hostname, platform, "connected", None);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (mut stream, peer) = accepted?;
                // Accept (and discard) the peer's own beacon before replying.
                let _ = recv_packet(&mut stream).await;
                let body = body.clone();
                tokio::spawn(async move {
                    if let Err(err) = send_packet(&mut stream, body.as_bytes()).await {
                        event!(Level::WARN, "beacon reply to {peer} failed: {err}");
                    }
                });
            }
            _ = shutdown.recv() => {
                event!(Level::INFO, "tcp beacon listener shutting down");
                return Ok(());
            }
        }
    }
}

/// Opens a direct-connect exchange to `addr:2190` and returns the peer's
/// `machine=` name, falling back to `addr` itself if the exchange fails or
/// the field is absent -- the original's `get_name()`.
pub(crate) async fn get_name(addr: &str) -> String {
    match get_name_inner(addr).await {
        Ok(name) => name,
        Err(err) => {
            event!(Level::DEBUG, "beacon get_name({addr}) failed: {err}");
            addr.to_string()
        }
    }
}

async fn get_name_inner(addr: &str) -> anyhow::Result<String> {
    let mut stream = tokio::net::TcpStream::connect((addr, DISCOVERY_PORT)).await?;
    let guid = new_guid();
    let hostname = hostname_or_fallback();
    let ours = format_beacon(&guid, &hostname, PLATFORM_VIDEO, "connected", None);
    send_packet(&mut stream, ours.as_bytes()).await?;
    let reply = recv_packet(&mut stream).await?;
    let reply = String::from_utf8_lossy(&reply);
    reply
        .lines()
        .find_map(|line| line.strip_prefix("machine="))
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("no machine= field in beacon reply"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_beacon_matches_spec_scenario() {
        let body = format_beacon(
            "1234",
            "host",
            PLATFORM_VIDEO,
            "broadcast",
            Some("TiVoMediaServer:9032/http"),
        );
        assert_eq!(
            body,
            "tivoconnect=1\nmethod=broadcast\nidentity={1234}\nmachine=host\nplatform=pc/pyTivo\nservices=TiVoMediaServer:9032/http\n"
        );
    }

    #[test]
    fn test_platform_for_selects_main_when_music_or_photos_present() {
        use crate::config::{Share, ShareKind};
        let plain = vec![Share {
            name: "Movies".to_string(),
            kind: ShareKind::Video,
            path: std::path::PathBuf::new(),
            force_alpha: false,
            allow_recurse: None,
        }];
        assert_eq!(platform_for(&plain), PLATFORM_VIDEO);

        let mut with_music = plain.clone();
        with_music.push(Share {
            name: "Music".to_string(),
            kind: ShareKind::Music,
            path: std::path::PathBuf::new(),
            force_alpha: false,
            allow_recurse: None,
        });
        assert_eq!(platform_for(&with_music), PLATFORM_MAIN);
    }

    #[test]
    fn test_direct_connect_fallback_services() {
        let body = format_beacon("abc", "host", PLATFORM_VIDEO, "connected", None);
        assert!(body.contains("services=TiVoMediaServer:0/http\n"));
    }
}
