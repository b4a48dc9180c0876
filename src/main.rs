use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::{event, Level};
use tracing_subscriber::prelude::*;

mod beacon;
mod config;
mod control;
mod errors;
mod header;
mod metadata;
mod protocol;
mod registry;
mod sleep_inhibit;
mod status;
mod togo;
mod transcoder;
mod upload;
mod xml;
mod zeroconf;

use config::Config;
use control::ControlState;
use protocol::ProtocolState;
use registry::TivoRegistry;
use status::StatusRegistry;
use togo::npl::NplCache;
use togo::queue::ToGoEngine;
use upload::UploadState;

#[derive(Debug, Parser)]
#[command(about, author, version, next_line_help = true)]
struct Args {
    #[arg(long, env = "PYRUSTIVO_CONFIG", default_value = "./pytivo.conf")]
    /// Path to the INI-style configuration file (§6).
    config: std::path::PathBuf,

    #[arg(long, env)]
    /// Overrides the configured listen IP.
    listen_ip: Option<String>,

    #[arg(long, env)]
    /// Overrides the configured listen port.
    listen_port: Option<u16>,
}

async fn shutdown_upon_signal(send_shutdown: tokio::sync::broadcast::Sender<()>) {
    let _ = tokio::signal::ctrl_c().await;
    event!(Level::INFO, "Received signal to shut down gracefully");
    drop(send_shutdown);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let format_layer = tracing_subscriber::fmt::layer()
        .with_file(true)
        .with_line_number(true)
        .compact();
    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info"))?;
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(format_layer)
        .init();
    event!(Level::DEBUG, "Launching...");

    let mut config = Config::load(&args.config)?;
    if let Some(ip) = args.listen_ip {
        config.server.listen_ip = ip;
    }
    if let Some(port) = args.listen_port {
        config.server.port = port;
    }
    let config = Arc::new(config);

    let tivos = TivoRegistry::new();
    let status = StatusRegistry::new();
    let togo = ToGoEngine::new();
    let npl = NplCache::new();
    let inhibitor: Arc<dyn sleep_inhibit::SleepInhibitor> = Arc::from(sleep_inhibit::platform_inhibitor());

    let (send_shutdown, _) = tokio::sync::broadcast::channel::<()>(1);

    let udp_beacon_shutdown = send_shutdown.subscribe();
    let udp_beacon_handle = tokio::task::spawn(beacon::run_udp_beacon(config.clone(), udp_beacon_shutdown));

    let tcp_beacon_handle = if config.server.beacon_listen {
        let tcp_beacon_shutdown = send_shutdown.subscribe();
        Some(tokio::task::spawn(beacon::run_tcp_beacon_listener(
            config.clone(),
            tcp_beacon_shutdown,
        )))
    } else {
        None
    };

    let zeroconf_advertiser = if config.zeroconf_enabled() {
        let cfg = config.clone();
        let listen_ip = config.server.listen_ip.clone();
        match tokio::task::spawn_blocking(move || {
            let hostname = beacon::hostname_or_fallback();
            zeroconf::ZeroconfAdvertiser::start(&cfg, &hostname, &listen_ip)
        })
        .await
        {
            Ok(Ok(advertiser)) => Some(advertiser),
            Ok(Err(err)) => {
                event!(Level::WARN, "zeroconf registration failed: {err}, continuing without it");
                None
            }
            Err(err) => {
                event!(Level::WARN, "zeroconf registration task panicked: {err}");
                None
            }
        }
    } else {
        event!(Level::INFO, "zeroconf disabled by configuration");
        None
    };
    let share_renames = Arc::new(
        zeroconf_advertiser
            .as_ref()
            .map(|a| a.renames().clone())
            .unwrap_or_default(),
    );

    let scan_tivos = tivos.clone();
    let scan_shutdown = send_shutdown.subscribe();
    let scan_handle = tokio::task::spawn(run_periodic_scan(scan_tivos, scan_shutdown));

    let sweep_status = status.clone();
    let sweep_shutdown = send_shutdown.subscribe();
    let sweep_handle = tokio::task::spawn(run_periodic_sweep(sweep_status, sweep_shutdown));

    let protocol_state = ProtocolState {
        config: config.clone(),
        tivos: tivos.clone(),
        status: status.clone(),
        togo: togo.clone(),
        inhibitor: inhibitor.clone(),
        share_renames,
    };
    let upload_state = UploadState {
        config: config.clone(),
        status: status.clone(),
    };
    let control_state = ControlState {
        config: config.clone(),
        tivos: tivos.clone(),
        status: status.clone(),
        togo: togo.clone(),
        npl,
    };

    let tivo_router = axum::Router::new()
        .route(
            "/TiVoConnect",
            axum::routing::get(protocol::handle_tivo_connect).post(protocol::handle_tivo_connect),
        )
        .with_state(protocol_state);

    let upload_router = axum::Router::new()
        .route("/{share}/{*rel_path}", axum::routing::get(upload::serve_file))
        .with_state(upload_state);

    let control_router = axum::Router::new()
        .route("/Status", axum::routing::get(control::get_status))
        .route("/NPL", axum::routing::get(control::get_npl))
        .with_state(control_state);

    let router = tivo_router
        .merge(upload_router)
        .merge(control_router)
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(format!(
        "{}:{}",
        config.server.listen_ip, config.server.port
    ))
    .await?;
    event!(
        Level::INFO,
        "Listening for HTTP requests on {}:{}...",
        config.server.listen_ip,
        config.server.port
    );

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_upon_signal(send_shutdown))
    .await?;

    let _ = udp_beacon_handle.await;
    if let Some(handle) = tcp_beacon_handle {
        let _ = handle.await;
    }
    let _ = scan_handle.await;
    let _ = sweep_handle.await;
    if let Some(advertiser) = zeroconf_advertiser {
        if let Err(err) = advertiser.shutdown() {
            event!(Level::WARN, "zeroconf shutdown failed: {err}");
        }
    }

    Ok(())
}

/// Re-scans for TiVos every 5 minutes for the lifetime of the process,
/// beyond the one-shot startup scan described in §4.2, so TiVos joining the
/// network later are still discovered without a restart.
async fn run_periodic_scan(tivos: TivoRegistry, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(5 * 60));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match zeroconf::scan_for_tivos(&tivos).await {
                    Ok(found) => event!(Level::DEBUG, "zeroconf scan found {found} tivo(s)"),
                    Err(err) => event!(Level::WARN, "zeroconf scan failed: {err}"),
                }
            }
            _ = shutdown.recv() => return,
        }
    }
}

/// Sweeps stale upload status entries every hour (the 24h TTL itself lives
/// in `StatusRegistry::sweep_stale`, per §4.6).
async fn run_periodic_sweep(status: StatusRegistry, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(60 * 60));
    loop {
        tokio::select! {
            _ = interval.tick() => status.sweep_stale().await,
            _ = shutdown.recv() => return,
        }
    }
}
