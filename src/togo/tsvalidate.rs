//! Transport stream sync validation for pulled `.ts` recordings. The
//! original didn't byte-validate downloads itself, but dropped connections
//! mid-pull routinely corrupted the MPEG-TS framing; this checks the fixed
//! 188-byte packet stride and `0x47` sync byte the ToGo error-mode config
//! (`togo_ts_error_mode`) governs retry behavior around.

const PACKET_SIZE: usize = 188;
const SYNC_BYTE: u8 = 0x47;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ValidationReport {
    pub(crate) packets_checked: usize,
    pub(crate) packets_out_of_sync: usize,
}

impl ValidationReport {
    pub(crate) fn is_clean(&self) -> bool {
        self.packets_out_of_sync == 0
    }

    pub(crate) fn sync_ratio(&self) -> f64 {
        if self.packets_checked == 0 {
            return 1.0;
        }
        let good = self.packets_checked - self.packets_out_of_sync;
        good as f64 / self.packets_checked as f64
    }
}

/// Walks `data` in 188-byte strides checking the sync byte at the start of
/// each packet. Any trailing partial packet (a download cut off mid-packet)
/// is ignored rather than counted as a failure.
pub(crate) fn validate(data: &[u8]) -> ValidationReport {
    let full_packets = data.len() / PACKET_SIZE;
    let mut out_of_sync = 0;
    for i in 0..full_packets {
        let offset = i * PACKET_SIZE;
        if data[offset] != SYNC_BYTE {
            out_of_sync += 1;
        }
    }
    ValidationReport {
        packets_checked: full_packets,
        packets_out_of_sync: out_of_sync,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clean_stream(packets: usize) -> Vec<u8> {
        let mut buf = vec![0_u8; packets * PACKET_SIZE];
        for i in 0..packets {
            buf[i * PACKET_SIZE] = SYNC_BYTE;
        }
        buf
    }

    #[test]
    fn test_validate_clean_stream() {
        let data = clean_stream(10);
        let report = validate(&data);
        assert_eq!(report.packets_checked, 10);
        assert!(report.is_clean());
        assert_eq!(report.sync_ratio(), 1.0);
    }

    #[test]
    fn test_validate_detects_desync() {
        let mut data = clean_stream(10);
        data[3 * PACKET_SIZE] = 0x00;
        let report = validate(&data);
        assert_eq!(report.packets_out_of_sync, 1);
        assert!(!report.is_clean());
    }

    #[test]
    fn test_validate_ignores_trailing_partial_packet() {
        let mut data = clean_stream(5);
        data.extend_from_slice(&[0_u8; 50]);
        let report = validate(&data);
        assert_eq!(report.packets_checked, 5);
    }
}
