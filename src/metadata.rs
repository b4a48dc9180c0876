//! Metadata extraction for files served out of a share. The original shelled
//! out to ffmpeg/mediainfo-style tools and cached the flattened attribute
//! dict per file; we keep that shape as a trait so the concrete probe (an
//! external subprocess) can be swapped in tests.

use std::collections::HashMap;
use std::path::Path;

#[derive(Clone, Debug, Default)]
pub(crate) struct VideoMetadata {
    pub(crate) attrs: HashMap<String, String>,
    pub(crate) duration_ms: Option<u64>,
    pub(crate) size_bytes: Option<u64>,
}

impl VideoMetadata {
    pub(crate) fn title(&self) -> Option<&str> {
        self.attrs.get("title").map(String::as_str)
    }
}

pub(crate) trait MetadataProbe: Send + Sync {
    fn probe(
        &self,
        path: &Path,
    ) -> impl std::future::Future<Output = anyhow::Result<VideoMetadata>> + Send;
}

/// Probe implementation that shells out to an external analyzer binary and
/// parses key=value lines from stdout, mirroring how the original invoked
/// `ffmpeg -i` and scraped its stderr.
pub(crate) struct SubprocessProbe {
    pub(crate) binary: std::path::PathBuf,
}

impl MetadataProbe for SubprocessProbe {
    async fn probe(&self, path: &Path) -> anyhow::Result<VideoMetadata> {
        let output = tokio::process::Command::new(&self.binary)
            .arg(path)
            .output()
            .await?;
        if !output.status.success() {
            anyhow::bail!("metadata probe exited with {}", output.status);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut attrs = HashMap::new();
        for line in stdout.lines() {
            if let Some((key, value)) = line.split_once('=') {
                attrs.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
        let duration_ms = attrs.get("duration_ms").and_then(|v| v.parse().ok());
        let size_bytes = tokio::fs::metadata(path).await.ok().map(|m| m.len());
        Ok(VideoMetadata {
            attrs,
            duration_ms,
            size_bytes,
        })
    }
}

/// Formats a byte count the way the original's `human_size()` did, e.g.
/// `"4.2 GB"`.
pub(crate) fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{value:.0} {}", UNITS[unit])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(2048), "2.0 KB");
        assert_eq!(human_size(4 * 1024 * 1024 * 1024), "4.0 GB");
    }
}
