//! `DownloadJob` state, keyed by source URL per §3: created when queued,
//! mutated through the worker lifecycle, and kept around after completion so
//! the status table can still report on it.

use std::path::PathBuf;

use chrono::{DateTime, Utc};

/// Descriptive metadata known about the recording at enqueue time (e.g. from
/// an NPL browse the admin UI did before submitting the pull), consumed by
/// the naming policy in `naming.rs`.
#[derive(Clone, Debug, Default)]
pub(crate) struct JobMetadata {
    pub(crate) title: Option<String>,
    pub(crate) episode_title: Option<String>,
    pub(crate) record_date: Option<DateTime<Utc>>,
    pub(crate) callsign: Option<String>,
}

#[derive(Clone, Debug)]
pub(crate) struct DownloadJob {
    pub(crate) url: String,
    pub(crate) tivo_ip: String,
    pub(crate) decode: bool,
    pub(crate) save_txt: bool,
    pub(crate) ts_format: bool,
    pub(crate) ts_max_retries: u8,
    pub(crate) ts_error_mode: crate::config::TsErrorMode,
    pub(crate) metadata: JobMetadata,

    pub(crate) running: bool,
    pub(crate) queued: bool,
    pub(crate) finished: bool,
    pub(crate) rate_bytes_per_sec: f64,
    pub(crate) size_bytes: u64,
    pub(crate) retry: u8,
    pub(crate) ts_error_count: u32,
    pub(crate) best_file: Option<PathBuf>,
    pub(crate) best_error_count: u32,
    pub(crate) error: Option<String>,
}

impl DownloadJob {
    pub(crate) fn new(
        url: String,
        tivo_ip: String,
        decode: bool,
        save_txt: bool,
        ts_format: bool,
        ts_max_retries: u8,
        ts_error_mode: crate::config::TsErrorMode,
    ) -> DownloadJob {
        DownloadJob {
            url,
            tivo_ip,
            decode,
            save_txt,
            ts_format,
            ts_max_retries,
            ts_error_mode,
            metadata: JobMetadata::default(),
            running: false,
            queued: true,
            finished: false,
            rate_bytes_per_sec: 0.0,
            size_bytes: 0,
            retry: 0,
            ts_error_count: 0,
            best_file: None,
            best_error_count: 0,
            error: None,
        }
    }

    /// Resets per-attempt counters and bumps the retry count for another
    /// pass at the same URL, or refuses once `ts_max_retries` is exhausted --
    /// preserving the invariant `retry <= ts_max_retries` from §3.
    pub(crate) fn begin_retry(&mut self) -> bool {
        if self.retry >= self.ts_max_retries {
            return false;
        }
        self.retry += 1;
        self.queued = true;
        self.running = false;
        self.finished = false;
        self.rate_bytes_per_sec = 0.0;
        self.size_bytes = 0;
        self.ts_error_count = 0;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> DownloadJob {
        DownloadJob::new(
            "https://tivo/1".to_string(),
            "192.168.1.50".to_string(),
            false,
            true,
            true,
            2,
            crate::config::TsErrorMode::Best,
        )
    }

    #[test]
    fn test_retry_increments_and_caps() {
        let mut j = job();
        assert!(j.begin_retry());
        assert_eq!(j.retry, 1);
        assert!(j.begin_retry());
        assert_eq!(j.retry, 2);
        assert!(!j.begin_retry());
        assert_eq!(j.retry, 2);
    }

    #[test]
    fn test_retry_resets_per_attempt_counters() {
        let mut j = job();
        j.size_bytes = 4096;
        j.ts_error_count = 3;
        j.running = true;
        assert!(j.begin_retry());
        assert_eq!(j.size_bytes, 0);
        assert_eq!(j.ts_error_count, 0);
        assert!(!j.running);
        assert!(j.queued);
    }
}
