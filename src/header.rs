//! Synthesis of the minimal `.TiVo` stream header that precedes a transcoded
//! or otherwise non-native video body, so the receiving TiVo accepts it as a
//! recognized container instead of rejecting the stream outright. Ported
//! byte-for-byte from the original's `tivo_header()`/`pad()` helpers in the
//! video plugin.

/// Rounds `length` up to the next multiple of `align`, the original's
/// `pad(length, align)`.
fn pad(length: usize, align: usize) -> usize {
    let extra = length % align;
    if extra == 0 { 0 } else { align - extra }
}

/// Attributes folded into the metadata (TvBus) chunk. Mirrors the flattened
/// `dict`-of-strings that `video.py`'s `VideoDetails` builds before encoding
/// the header.
#[derive(Clone, Debug, Default)]
pub(crate) struct HeaderAttrs {
    pub(crate) title: Option<String>,
    pub(crate) episode_title: Option<String>,
    pub(crate) description: Option<String>,
    pub(crate) duration_ms: Option<u64>,
    pub(crate) is_episode: bool,
}

impl HeaderAttrs {
    /// The TvBus `<TiVoContainer><Details>...` XML the original serialized
    /// from `VideoDetails` before chunking it into the header.
    pub(crate) fn details_xml(&self) -> String {
        let mut out = String::from("<TiVoContainer><Details>\n");
        if let Some(t) = &self.title {
            out.push_str(&format!("<title>{}</title>\n", crate::xml::escape(t)));
        }
        if let Some(e) = &self.episode_title {
            out.push_str(&format!("<episodeTitle>{}</episodeTitle>\n", crate::xml::escape(e)));
        }
        if let Some(d) = &self.description {
            out.push_str(&format!("<description>{}</description>\n", crate::xml::escape(d)));
        }
        if let Some(ms) = self.duration_ms {
            out.push_str(&format!("<duration>{ms}</duration>\n"));
        }
        out.push_str(&format!(
            "<isEpisode>{}</isEpisode>\n",
            if self.is_episode { "Yes" } else { "No" }
        ));
        out.push_str("</Details></TiVoContainer>");
        out
    }
}

/// Stream format the synthesized header advertises, selecting the `flags`
/// field value the original distinguished: `0x002D` for TS, `0x000D` for PS.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StreamFormat {
    Ps,
    Ts,
}

impl StreamFormat {
    fn flags(self) -> u16 {
        match self {
            StreamFormat::Ps => 0x000D,
            StreamFormat::Ts => 0x002D,
        }
    }
}

/// Builds the synthetic TiVo stream header: a 16-byte preamble (magic,
/// version, flags, reserved, `totalPaddedLen`, chunk count) followed by two
/// identical metadata chunks (chunk ids 1 and 2), zero-padded so the overall
/// header lands on a 1024-byte boundary -- matching the original's
/// `tivo_header()` byte-for-byte, including the duplicated chunk.
pub(crate) fn tivo_header(attrs: &HeaderAttrs, format: StreamFormat) -> Vec<u8> {
    let details = attrs.details_xml().into_bytes();
    let details_len = details.len();
    // chunk = details + NULs padding to 4-byte alignment, plus 4 trailing NULs.
    let chunk_trailer = pad(details_len, 4) + 4;
    let chunk_len = details_len + chunk_trailer;
    let blocklen = chunk_len * 2 + 40;
    let padding = pad(blocklen, 1024);
    let total_padded_len = (padding + blocklen) as u32;

    let mut out = Vec::with_capacity(16 + blocklen - 16 + padding);
    out.extend_from_slice(b"TiVo");
    out.extend_from_slice(&4u16.to_be_bytes()); // version
    out.extend_from_slice(&format.flags().to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes()); // reserved
    out.extend_from_slice(&total_padded_len.to_be_bytes());
    out.extend_from_slice(&2u16.to_be_bytes()); // chunk count

    for chunk_id in [1u16, 2u16] {
        push_chunk(&mut out, chunk_id, &details, chunk_trailer);
    }
    out.resize(out.len() + padding, 0);
    out
}

fn push_chunk(out: &mut Vec<u8>, chunk_id: u16, details: &[u8], trailer_len: usize) {
    let chunk_len = details.len() + trailer_len;
    let chunk_total: u32 = (chunk_len + 12).try_into().unwrap_or(u32::MAX);
    let details_len: u32 = details.len().try_into().unwrap_or(u32::MAX);
    out.extend_from_slice(&chunk_total.to_be_bytes());
    out.extend_from_slice(&details_len.to_be_bytes());
    out.extend_from_slice(&chunk_id.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(details);
    out.resize(out.len() + trailer_len, 0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad() {
        assert_eq!(pad(0, 4), 0);
        assert_eq!(pad(1, 4), 3);
        assert_eq!(pad(4, 4), 0);
        assert_eq!(pad(5, 4), 3);
    }

    #[test]
    fn test_header_length_matches_spec_scenario() {
        // A 100-byte details XML: chunk trailer = pad(100,4)+4 = 4, chunk
        // len = 104, blocklen = 2*104+40 = 248, padding to 1024 = 776,
        // total header bytes = 776 + 248 = 1024.
        let details = "x".repeat(100);
        assert_eq!(details.len(), 100);
        let chunk_trailer = pad(details.len(), 4) + 4;
        assert_eq!(chunk_trailer, 4);
        let chunk_len = details.len() + chunk_trailer;
        assert_eq!(chunk_len, 104);
        let blocklen = chunk_len * 2 + 40;
        assert_eq!(blocklen, 248);
        assert_eq!(pad(blocklen, 1024), 776);
    }

    #[test]
    fn test_tivo_header_total_len_divisible_by_1024_and_two_chunks() {
        let attrs = HeaderAttrs {
            title: Some("Example Show".to_string()),
            ..Default::default()
        };
        let header = tivo_header(&attrs, StreamFormat::Ts);
        assert_eq!(header.len() % 1024, 0);
        assert_eq!(&header[0..4], b"TiVo");
        let chunk_count = u16::from_be_bytes([header[14], header[15]]);
        assert_eq!(chunk_count, 2);
        let total_padded_len = u32::from_be_bytes([header[10], header[11], header[12], header[13]]);
        assert_eq!(total_padded_len as usize, header.len());
    }

    #[test]
    fn test_stream_format_flags() {
        assert_eq!(StreamFormat::Ps.flags(), 0x000D);
        assert_eq!(StreamFormat::Ts.flags(), 0x002D);
    }
}
