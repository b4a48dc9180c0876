//! Zeroconf advertisement and discovery, ported from `ZCBroadcast` in the
//! original's `beacon.py`. Registers one `_pytivo._tcp` desktop service plus
//! one `_tivo-videos._tcc` service per configured video share, and browses
//! for TiVos announcing `_tivo-videos._tcp` to populate the TiVo registry.

use std::collections::HashMap;
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tracing::{Level, event};
use uuid::Uuid;

use crate::config::{Config, ShareKind};
use crate::registry::{TivoRecord, TivoRegistry};

const DESKTOP_SERVICE_TYPE: &str = "_pytivo._tcp.local.";
const VIDEO_SERVICE_TYPE: &str = "_tivo-videos._tcp.local.";
const SCAN_TIMEOUT: Duration = Duration::from_secs(30);
/// How long to pre-browse our own service type before registering, so a
/// name collision with another pyTivo-alike already on the network can be
/// detected and renamed rather than silently clobbered by mdns-sd.
const PRESCAN_TIMEOUT: Duration = Duration::from_secs(2);

pub(crate) struct ZeroconfAdvertiser {
    daemon: ServiceDaemon,
    registered: Vec<String>,
    /// Original share name -> renamed instance name, when a collision with
    /// an already-advertised name forced an `" [N]"` suffix. Exposed so the
    /// HTTP layer's root container listing can show the adjusted name (§4.2).
    renames: HashMap<String, String>,
}

impl ZeroconfAdvertiser {
    pub(crate) fn start(config: &Config, hostname: &str, ip: &str) -> anyhow::Result<ZeroconfAdvertiser> {
        let daemon = ServiceDaemon::new()?;
        let mut registered = Vec::new();
        let mut renames = HashMap::new();

        let existing = prescan_instance_names(&daemon, VIDEO_SERVICE_TYPE);

        let platform = if config
            .shares
            .iter()
            .any(|s| matches!(s.kind, ShareKind::Music | ShareKind::Photos))
        {
            "pyTivo"
        } else {
            "pc/pyTivo"
        };

        let mut desktop_props = HashMap::new();
        desktop_props.insert("path".to_string(), "/Desktop".to_string());
        desktop_props.insert("platform".to_string(), "pyTivo".to_string());
        desktop_props.insert("protocol".to_string(), "http".to_string());
        let desktop = ServiceInfo::new(
            DESKTOP_SERVICE_TYPE,
            "pyTivo Desktop",
            hostname,
            ip,
            config.server.port,
            desktop_props,
        )?;
        daemon.register(desktop)?;
        registered.push(format!("pyTivo Desktop.{DESKTOP_SERVICE_TYPE}"));

        let mut taken: std::collections::HashSet<String> = existing.into_iter().collect();
        for share in &config.shares {
            if share.kind != ShareKind::Video {
                continue;
            }
            let instance = unique_instance_name(&taken, &share.name);
            taken.insert(instance.clone());
            if instance != share.name {
                renames.insert(share.name.clone(), instance.clone());
            }

            let mut props = HashMap::new();
            props.insert(
                "path".to_string(),
                format!("/TiVoConnect?Command=QueryContainer&Container={}", share.name),
            );
            props.insert("platform".to_string(), platform.to_string());
            props.insert("protocol".to_string(), "http".to_string());
            props.insert("tsn".to_string(), format!("{{{}}}", Uuid::new_v4()));

            let info = ServiceInfo::new(
                VIDEO_SERVICE_TYPE,
                &instance,
                hostname,
                ip,
                config.server.port,
                props,
            )?;
            daemon.register(info)?;
            registered.push(format!("{instance}.{VIDEO_SERVICE_TYPE}"));
        }

        event!(Level::INFO, "zeroconf advertising {} services", registered.len());
        Ok(ZeroconfAdvertiser {
            daemon,
            registered,
            renames,
        })
    }

    /// Original share name -> adjusted display name, for shares renamed on
    /// collision. Empty when no renames occurred.
    pub(crate) fn renames(&self) -> &HashMap<String, String> {
        &self.renames
    }

    pub(crate) fn shutdown(self) -> anyhow::Result<()> {
        for fullname in &self.registered {
            if let Err(err) = self.daemon.unregister(fullname) {
                event!(Level::WARN, "failed to unregister {fullname}: {err}");
            }
        }
        self.daemon.shutdown()?;
        Ok(())
    }
}

/// Browses `service_type` briefly to collect instance names already on the
/// network, so newly registered names can avoid colliding with them.
fn prescan_instance_names(daemon: &ServiceDaemon, service_type: &str) -> Vec<String> {
    let Ok(receiver) = daemon.browse(service_type) else {
        return Vec::new();
    };
    let mut found = Vec::new();
    let deadline = std::time::Instant::now() + PRESCAN_TIMEOUT;
    while std::time::Instant::now() < deadline {
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        match receiver.recv_timeout(remaining) {
            Ok(ServiceEvent::ServiceResolved(info)) => {
                found.push(instance_name_of(&info, service_type));
            }
            Ok(_) => continue,
            Err(_) => break,
        }
    }
    let _ = daemon.stop_browse(service_type);
    found
}

fn instance_name_of(info: &ServiceInfo, service_type: &str) -> String {
    info.get_fullname()
        .strip_suffix(&format!(".{service_type}"))
        .unwrap_or_else(|| info.get_fullname())
        .to_string()
}

/// Appends an incrementing `" [N]"` suffix until `base` no longer collides
/// with a name in `taken`, per §4.2.
fn unique_instance_name(taken: &std::collections::HashSet<String>, base: &str) -> String {
    if !taken.contains(base) {
        return base.to_string();
    }
    let mut n = 2;
    loop {
        let candidate = format!("{base} [{n}]");
        if !taken.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Browses for TiVos advertising `_tivo-videos._tcp.local.` for up to 30
/// seconds, resolving each result's TXT record for its `tsn` and inserting it
/// into `tivos` so pulls can be queued without manual IP configuration (§4.2).
pub(crate) async fn scan_for_tivos(tivos: &TivoRegistry) -> anyhow::Result<usize> {
    let daemon = ServiceDaemon::new()?;
    let receiver = daemon.browse(VIDEO_SERVICE_TYPE)?;
    let mut found = 0;
    let deadline = tokio::time::Instant::now() + SCAN_TIMEOUT;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, async { receiver.recv_async().await }).await {
            Ok(Ok(ServiceEvent::ServiceResolved(info))) => {
                let Some(tsn) = info.get_properties().get_property_val_str("tsn") else {
                    continue;
                };
                let address = info
                    .get_addresses()
                    .iter()
                    .next()
                    .map(std::net::IpAddr::to_string)
                    .unwrap_or_default();
                let mut record = TivoRecord::new(tsn.to_string(), address);
                record.port = info.get_port();
                record.name = Some(info.get_hostname().trim_end_matches('.').to_string());
                tivos.remember(record).await;
                found += 1;
            }
            Ok(Ok(_)) => continue,
            Ok(Err(_)) | Err(_) => break,
        }
    }

    daemon.stop_browse(VIDEO_SERVICE_TYPE)?;
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_instance_name_no_collision() {
        let taken = std::collections::HashSet::new();
        assert_eq!(unique_instance_name(&taken, "Movies"), "Movies");
    }

    #[test]
    fn test_unique_instance_name_appends_suffix_on_collision() {
        let mut taken = std::collections::HashSet::new();
        taken.insert("Movies".to_string());
        assert_eq!(unique_instance_name(&taken, "Movies"), "Movies [2]");
        taken.insert("Movies [2]".to_string());
        assert_eq!(unique_instance_name(&taken, "Movies"), "Movies [3]");
    }
}
