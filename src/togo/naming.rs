//! Output filename policy for pulled recordings, ported from
//! `get_out_file()` in the original's `togo.py` and extended per the title-
//! based sortable/human naming this system adds on top of the original's
//! URL-derived fallback.

use chrono::{DateTime, Utc};

/// Characters TiVo show titles can contain that are unsafe (or just ugly) in
/// a filesystem path, mapped the same way the original's `BADCHAR` table did.
fn replacement_for(c: char) -> Option<&'static str> {
    match c {
        '\\' => Some("-"),
        '/' => Some("-"),
        ':' => Some(" -"),
        ';' => Some(","),
        '*' => Some("."),
        '?' => Some("."),
        '!' => Some("."),
        '"' => Some("'"),
        '<' => Some("("),
        '>' => Some(")"),
        '|' => Some(" "),
        _ => None,
    }
}

fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match replacement_for(c) {
            Some(rep) => out.push_str(rep),
            None => out.push(c),
        }
    }
    out
}

/// Metadata available for a pulled recording, used to build a descriptive
/// filename when present.
#[derive(Clone, Debug, Default)]
pub(crate) struct FilenameAttrs {
    pub(crate) title: Option<String>,
    pub(crate) episode_title: Option<String>,
    pub(crate) record_date: Option<DateTime<Utc>>,
    pub(crate) callsign: Option<String>,
}

/// The four container/codec combinations the naming policy distinguishes,
/// selecting both the true file extension and (for raw deliveries) a
/// parenthetical format marker inserted before it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ContainerKind {
    DecodedTs,
    DecodedPs,
    RawTs,
    RawPs,
}

impl ContainerKind {
    pub(crate) fn from_flags(decode: bool, ts: bool) -> ContainerKind {
        match (decode, ts) {
            (true, true) => ContainerKind::DecodedTs,
            (true, false) => ContainerKind::DecodedPs,
            (false, true) => ContainerKind::RawTs,
            (false, false) => ContainerKind::RawPs,
        }
    }

    fn extension(self) -> &'static str {
        match self {
            ContainerKind::DecodedTs => "ts",
            ContainerKind::DecodedPs => "mpg",
            ContainerKind::RawTs | ContainerKind::RawPs => "tivo",
        }
    }

    fn format_marker(self) -> Option<&'static str> {
        match self {
            ContainerKind::RawTs => Some("(TS)"),
            ContainerKind::RawPs => Some("(PS)"),
            ContainerKind::DecodedTs | ContainerKind::DecodedPs => None,
        }
    }
}

/// Builds the descriptive base name (no extension) for a recording with
/// known metadata: the sortable form leads with the air date so directory
/// listings sort chronologically, the human form reads naturally.
fn titled_base_name(attrs: &FilenameAttrs, title: &str, sortable_names: bool) -> String {
    let title = sanitize(title);
    let episode = attrs.episode_title.as_deref().map(sanitize);

    if sortable_names {
        let mut name = title;
        if let Some(date) = attrs.record_date {
            name.push_str(&format!(" - {}", date.format("%Y-%m-%d")));
        }
        if let Some(ep) = &episode {
            name.push_str(&format!(" - ''{ep}''"));
        }
        if let Some(callsign) = &attrs.callsign {
            name.push_str(&format!(" ({})", sanitize(callsign)));
        }
        name
    } else {
        let mut name = title;
        if let Some(ep) = &episode {
            name.push_str(&format!(" - ''{ep}''"));
        }
        if let Some(date) = attrs.record_date {
            let mut recorded = format!(" (Recorded {}", date.format("%b %d, %Y"));
            if let Some(callsign) = &attrs.callsign {
                recorded.push_str(&format!(", {}", sanitize(callsign)));
            }
            recorded.push(')');
            name.push_str(&recorded);
        }
        name
    }
}

/// Falls back to the URL's last path component (with its `id=` query value
/// appended) when no title metadata is available, matching the original's
/// `get_out_file()` when `basic_meta` has no usable title.
fn url_fallback_base_name(url: &str) -> String {
    let (path_and_query, _fragment) = url.split_once('#').unwrap_or((url, ""));
    let (path, query) = path_and_query.split_once('?').unwrap_or((path_and_query, ""));
    let last = path.rsplit('/').next().unwrap_or(path);
    let mut name = last.to_string();
    if let Some(id) = query
        .split('&')
        .find_map(|kv| kv.strip_prefix("id="))
        .filter(|id| !id.is_empty())
    {
        name.push_str(&format!(" - {id}"));
    }
    name
}

/// Builds the final on-disk filename: base name from metadata (or the URL
/// fallback), a container-dependent suffix, a "(N)" disambiguator appended
/// before the extension while `exists` reports a collision, and finally the
/// forbidden-character substitution table applied to the whole thing.
pub(crate) fn build_filename<F>(
    attrs: &FilenameAttrs,
    url: &str,
    sortable_names: bool,
    container: ContainerKind,
    mut exists: F,
) -> String
where
    F: FnMut(&str) -> bool,
{
    let mut base = match &attrs.title {
        Some(title) if !title.is_empty() => titled_base_name(attrs, title, sortable_names),
        _ => url_fallback_base_name(url),
    };
    if let Some(marker) = container.format_marker() {
        base.push_str(&format!(" {marker}"));
    }

    let extension = container.extension();
    let mut candidate = format!("{base}.{extension}");
    let mut count = 2;
    while exists(&candidate) {
        candidate = format!("{base} ({count}).{extension}");
        count += 1;
    }

    sanitize(&candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_sanitize_replaces_bad_chars() {
        assert_eq!(sanitize("Who? Me: \"Yes\"/\\No"), "Who. Me - 'Yes'--No");
    }

    #[test]
    fn test_spec_scenario_sortable_with_collision() {
        let attrs = FilenameAttrs {
            title: Some("Show".to_string()),
            episode_title: Some("Pilot".to_string()),
            record_date: Some(Utc.with_ymd_and_hms(2023, 4, 1, 20, 0, 0).unwrap()),
            callsign: Some("KXYZ".to_string()),
        };
        let mut seen = 0;
        let name = build_filename(&attrs, "http://tivo/x", true, ContainerKind::DecodedTs, |_| {
            seen += 1;
            seen == 1
        });
        assert_eq!(name, "Show - 2023-04-01 - ''Pilot'' (KXYZ) (2).ts");
    }

    #[test]
    fn test_human_form() {
        let attrs = FilenameAttrs {
            title: Some("Nova".to_string()),
            episode_title: None,
            record_date: Some(Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap()),
            callsign: Some("WGBH".to_string()),
        };
        let name = build_filename(&attrs, "http://tivo/x", false, ContainerKind::DecodedPs, |_| false);
        assert_eq!(name, "Nova (Recorded Jan 15, 2024, WGBH).mpg");
    }

    #[test]
    fn test_raw_container_markers() {
        let attrs = FilenameAttrs {
            title: Some("Nova".to_string()),
            ..Default::default()
        };
        assert_eq!(
            build_filename(&attrs, "http://tivo/x", false, ContainerKind::RawTs, |_| false),
            "Nova (TS).tivo"
        );
        assert_eq!(
            build_filename(&attrs, "http://tivo/x", false, ContainerKind::RawPs, |_| false),
            "Nova (PS).tivo"
        );
    }

    #[test]
    fn test_url_fallback_with_id() {
        let name = url_fallback_base_name("http://tivo/NowPlaying/show.mpg?id=42");
        assert_eq!(name, "show.mpg - 42");
    }

    #[test]
    fn test_url_fallback_without_title() {
        let attrs = FilenameAttrs::default();
        let name = build_filename(
            &attrs,
            "http://tivo/NowPlaying/show?id=7",
            false,
            ContainerKind::DecodedTs,
            |_| false,
        );
        assert_eq!(name, "show - 7.ts");
    }
}
