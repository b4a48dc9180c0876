use std::collections::HashMap;
use std::path::PathBuf;

use tracing::{Level, event};

/// How aggressively a completed transfer is re-attempted after a transport
/// stream sync loss. Mirrors the original's `togo_ts_error_mode` Server option.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub(crate) enum TsErrorMode {
    #[default]
    Ignore,
    Best,
    Reject,
}

impl TsErrorMode {
    fn parse(raw: &str) -> TsErrorMode {
        match raw.trim().to_lowercase().as_str() {
            "best" => TsErrorMode::Best,
            "reject" => TsErrorMode::Reject,
            _ => TsErrorMode::Ignore,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub(crate) enum ZeroconfMode {
    #[default]
    Auto,
    On,
    Off,
}

impl ZeroconfMode {
    fn parse(raw: &str) -> ZeroconfMode {
        match raw.trim().to_lowercase().as_str() {
            "false" | "no" | "off" => ZeroconfMode::Off,
            "true" | "yes" | "on" => ZeroconfMode::On,
            _ => ZeroconfMode::Auto,
        }
    }
}

/// Kind of share, selecting which handler a request against it is routed to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ShareKind {
    Video,
    Music,
    Photos,
    Settings,
    ToGo,
    Desktop,
}

impl ShareKind {
    fn parse(raw: &str) -> Option<ShareKind> {
        match raw.trim().to_lowercase().as_str() {
            "video" => Some(ShareKind::Video),
            "music" => Some(ShareKind::Music),
            "photos" => Some(ShareKind::Photos),
            "settings" => Some(ShareKind::Settings),
            "togo" => Some(ShareKind::ToGo),
            "desktop" => Some(ShareKind::Desktop),
            _ => None,
        }
    }

    /// The `x-container/...` content type a TiVo uses to recognize this kind
    /// of share in the root container listing.
    pub(crate) fn content_type(&self) -> &'static str {
        match self {
            ShareKind::Video => "x-container/tivo-videos",
            ShareKind::Music => "x-container/tivo-music",
            ShareKind::Photos => "x-container/tivo-photos",
            ShareKind::Settings => "x-container/settings",
            ShareKind::ToGo => "x-container/togo",
            ShareKind::Desktop => "x-container/desktop",
        }
    }

    pub(crate) fn is_media(&self) -> bool {
        matches!(self, ShareKind::Video | ShareKind::Music | ShareKind::Photos)
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Share {
    pub(crate) name: String,
    pub(crate) kind: ShareKind,
    pub(crate) path: PathBuf,
    pub(crate) force_alpha: bool,
    pub(crate) allow_recurse: Option<bool>,
}

fn parse_bool(raw: &str, default: bool) -> bool {
    match raw.trim().to_lowercase().as_str() {
        "1" | "yes" | "true" | "on" => true,
        "0" | "no" | "false" | "off" => false,
        _ => default,
    }
}

/// Options read from the `Server` INI section, plus CLI/env overrides for the
/// subset the original ever exposed as flags (listen address/port).
#[derive(Clone, Debug)]
pub(crate) struct ServerConfig {
    pub(crate) listen_ip: String,
    pub(crate) port: u16,
    pub(crate) tivo_mak: Option<String>,
    pub(crate) togo_path: Option<PathBuf>,
    pub(crate) togo_tsn: Option<String>,
    pub(crate) togo_ts_error_mode: TsErrorMode,
    pub(crate) togo_ts_max_retries: u8,
    pub(crate) togo_save_txt: bool,
    pub(crate) togo_decode: bool,
    pub(crate) togo_sortable_names: bool,
    pub(crate) zeroconf: ZeroconfMode,
    pub(crate) beacon_addresses: Vec<String>,
    pub(crate) beacon_listen: bool,
    pub(crate) allowed_ips: Vec<String>,
    pub(crate) transcode_binary: PathBuf,
    pub(crate) decrypt_binary: PathBuf,
    pub(crate) metadata_probe_binary: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_ip: "0.0.0.0".to_string(),
            port: 9032,
            tivo_mak: None,
            togo_path: None,
            togo_tsn: None,
            togo_ts_error_mode: TsErrorMode::Ignore,
            togo_ts_max_retries: 3,
            togo_save_txt: true,
            togo_decode: false,
            togo_sortable_names: false,
            zeroconf: ZeroconfMode::Auto,
            beacon_addresses: vec!["255.255.255.255".to_string()],
            beacon_listen: false,
            allowed_ips: Vec::new(),
            transcode_binary: PathBuf::from("ffmpeg"),
            decrypt_binary: PathBuf::from("tivolibre"),
            metadata_probe_binary: None,
        }
    }
}

/// The per-TSN override section `_tivo_<id>`. An empty `shares` list means no
/// ACL is configured for this TiVo.
#[derive(Clone, Debug, Default)]
pub(crate) struct TsnOverride {
    pub(crate) tivo_mak: Option<String>,
    pub(crate) shares: Vec<String>,
    pub(crate) properties: HashMap<String, String>,
}

#[derive(Clone, Debug)]
pub(crate) struct Config {
    pub(crate) server: ServerConfig,
    pub(crate) shares: Vec<Share>,
    pub(crate) tsn_overrides: HashMap<String, TsnOverride>,
}

impl Config {
    /// Load configuration from an INI file at `path`. Mirrors the original's
    /// behavior of warning and falling back to built-in defaults when the file
    /// doesn't exist, rather than treating a missing file as an error.
    pub(crate) fn load(path: &std::path::Path) -> anyhow::Result<Config> {
        let ini = if path.is_file() {
            ini::Ini::load_from_file(path)
                .map_err(|e| anyhow::anyhow!("Failed to parse config file {path:?}: {e}"))?
        } else {
            event!(
                Level::WARN,
                "Config file {path:?} does not exist, assuming default values"
            );
            ini::Ini::new()
        };

        let mut server = ServerConfig::default();
        if let Some(section) = ini.section(Some("Server")) {
            if let Some(ip) = section.get("listen_ip") {
                server.listen_ip = ip.to_string();
            }
            if let Some(port) = section.get("port").and_then(|p| p.parse::<u16>().ok()) {
                server.port = port;
            }
            server.tivo_mak = section.get("tivo_mak").map(str::to_string);
            server.togo_path = section.get("togo_path").map(PathBuf::from);
            server.togo_tsn = section.get("togo_tsn").map(str::to_string);
            if let Some(mode) = section.get("togo_ts_error_mode") {
                server.togo_ts_error_mode = TsErrorMode::parse(mode);
            }
            if let Some(n) = section
                .get("togo_ts_max_retries")
                .and_then(|v| v.parse::<u8>().ok())
            {
                server.togo_ts_max_retries = n;
            }
            if let Some(v) = section.get("togo_save_txt") {
                server.togo_save_txt = parse_bool(v, server.togo_save_txt);
            }
            if let Some(v) = section.get("togo_decode") {
                server.togo_decode = parse_bool(v, server.togo_decode);
            }
            if let Some(v) = section.get("togo_sortable_names") {
                server.togo_sortable_names = parse_bool(v, server.togo_sortable_names);
            }
            if let Some(v) = section.get("zeroconf") {
                server.zeroconf = ZeroconfMode::parse(v);
            }
            if let Some(v) = section.get("beacon") {
                let ips: Vec<String> = v
                    .split_whitespace()
                    .filter(|ip| *ip != "listen")
                    .map(str::to_string)
                    .collect();
                if !ips.is_empty() {
                    server.beacon_addresses = ips;
                }
                server.beacon_listen = v.split_whitespace().any(|w| w == "listen");
            }
            if let Some(v) = section.get("allowedips") {
                server.allowed_ips = v.split_whitespace().map(str::to_string).collect();
            }
            if let Some(v) = section.get("ffmpeg_path") {
                server.transcode_binary = PathBuf::from(v);
            }
            if let Some(v) = section.get("tivolibre_path") {
                server.decrypt_binary = PathBuf::from(v);
            }
            // Metadata extraction from the source file (title/duration/etc.)
            // is deliberately out of scope as a concrete implementation; this
            // just names the opaque external probe the upload engine may
            // consume, same as ffmpeg/tivolibre above. Unset by default.
            server.metadata_probe_binary = section.get("metadata_probe_path").map(PathBuf::from);
        }

        let mut shares = Vec::new();
        let mut tsn_overrides = HashMap::new();

        for (section_name, props) in ini.iter() {
            let Some(section_name) = section_name else {
                continue;
            };
            if section_name == "Server" {
                continue;
            }
            if let Some(tsn) = section_name.strip_prefix("_tivo_") {
                if matches!(tsn, "SD" | "HD" | "4K") {
                    continue;
                }
                let mut ov = TsnOverride::default();
                for (key, value) in props.iter() {
                    match key {
                        "tivo_mak" => ov.tivo_mak = Some(value.to_string()),
                        "shares" => {
                            ov.shares = value.split(',').map(|s| s.trim().to_string()).collect();
                        }
                        _ => {
                            ov.properties.insert(key.to_string(), value.to_string());
                        }
                    }
                }
                tsn_overrides.insert(tsn.to_string(), ov);
                continue;
            }

            let Some(kind_raw) = props.get("type") else {
                continue;
            };
            let Some(kind) = ShareKind::parse(kind_raw) else {
                event!(
                    Level::WARN,
                    "Unknown share type '{kind_raw}' for section '{section_name}', skipping"
                );
                continue;
            };
            let path = props.get("path").map(PathBuf::from).unwrap_or_default();
            let force_alpha = props
                .get("force_alpha")
                .is_some_and(|v| parse_bool(v, false));
            let allow_recurse = props.get("allow_recurse").map(|v| match v.to_lowercase().as_str() {
                "1" | "yes" | "true" | "on" => true,
                _ => false,
            });

            shares.push(Share {
                name: section_name.to_string(),
                kind,
                path,
                force_alpha,
                allow_recurse,
            });
        }

        shares.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(Config {
            server,
            shares,
            tsn_overrides,
        })
    }

    pub(crate) fn tivo_mak_for(&self, tsn: &str) -> Option<String> {
        self.tsn_overrides
            .get(tsn)
            .and_then(|ov| ov.tivo_mak.clone())
            .or_else(|| self.server.tivo_mak.clone())
    }

    /// Shares visible to a given TSN: all configured shares, unless that TSN's
    /// override section names an explicit ACL via `shares=`.
    pub(crate) fn shares_for_tsn(&self, tsn: &str) -> Vec<&Share> {
        if let Some(ov) = self.tsn_overrides.get(tsn) {
            if !ov.shares.is_empty() {
                return self
                    .shares
                    .iter()
                    .filter(|s| ov.shares.contains(&s.name))
                    .collect();
            }
        }
        self.shares.iter().collect()
    }

    /// Zeroconf is disabled outright if any TSN-specific section restricts
    /// visibility via a `shares=` ACL -- the security model in that case
    /// requires explicit per-client configuration instead of broadcast
    /// discovery.
    pub(crate) fn zeroconf_enabled(&self) -> bool {
        match self.server.zeroconf {
            ZeroconfMode::Off => false,
            ZeroconfMode::On => true,
            ZeroconfMode::Auto => !self
                .tsn_overrides
                .values()
                .any(|ov| !ov.shares.is_empty()),
        }
    }
}

/// TSNs of TiVos that support transport stream delivery: either the TSN
/// starts with a digit `>= '7'`, or it is one of the `663` models.
pub(crate) fn is_ts_capable(tsn: &str) -> bool {
    tsn.starts_with("663")
        || tsn
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_digit() && c >= '7')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ts_capable() {
        assert!(is_ts_capable("746000000001234"));
        assert!(is_ts_capable("663000000001234"));
        assert!(!is_ts_capable("540000000001234"));
        assert!(!is_ts_capable(""));
    }

    #[test]
    fn test_ts_error_mode_parse() {
        assert_eq!(TsErrorMode::parse("best"), TsErrorMode::Best);
        assert_eq!(TsErrorMode::parse("REJECT"), TsErrorMode::Reject);
        assert_eq!(TsErrorMode::parse("ignore"), TsErrorMode::Ignore);
        assert_eq!(TsErrorMode::parse("bogus"), TsErrorMode::Ignore);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let Ok(cfg) = Config::load(std::path::Path::new("/nonexistent/pytivo.conf")) else {
            panic!("loading from a missing path should fall back to defaults");
        };
        assert_eq!(cfg.server.port, 9032);
        assert!(cfg.shares.is_empty());
    }

    #[test]
    fn test_zeroconf_disabled_by_shares_acl() {
        let mut cfg = Config {
            server: ServerConfig::default(),
            shares: Vec::new(),
            tsn_overrides: HashMap::new(),
        };
        assert!(cfg.zeroconf_enabled());
        cfg.tsn_overrides.insert(
            "123".to_string(),
            TsnOverride {
                shares: vec!["Movies".to_string()],
                ..Default::default()
            },
        );
        assert!(!cfg.zeroconf_enabled());
    }
}
