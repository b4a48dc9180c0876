//! The ToGo worker: one `tokio` task per TiVo IP, pulling URLs off that
//! TiVo's queue strictly FIFO and running each to completion before picking
//! up the next. Ported from `get_tivo_file()`'s main loop and the per-TiVo
//! `threading.Thread` dispatch in the original's `togo.py`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{Level, event};

use super::client::ToGoClient;
use super::jobs::DownloadJob;
use super::naming::{self, ContainerKind, FilenameAttrs};
use super::queue::ToGoEngine;
use super::tsvalidate;
use crate::config::{Config, TsErrorMode};
use crate::errors::ToGoError;
use crate::registry::TivoRegistry;
use crate::sleep_inhibit::SleepInhibitor;

/// Block size the original read the TiVo's ToGo response in: a multiple of
/// the 188-byte MPEG-TS packet size so sync scanning never straddles a read
/// boundary.
const BLOCK_SIZE: usize = 524_144;
const HEADER_PREFIX_LEN: usize = 16;

/// Runs the per-TiVo worker loop: pop the head of the queue, run it to
/// completion (including any in-place retries), then advance. Exits once the
/// queue is empty. Holds a sleep-inhibition guard for its whole lifetime.
pub(crate) async fn run_worker(
    tivo_ip: String,
    engine: ToGoEngine,
    config: Arc<Config>,
    tivos: TivoRegistry,
    inhibitor: Arc<dyn SleepInhibitor>,
) {
    let _guard = inhibitor.acquire();
    event!(Level::INFO, "togo worker starting for {tivo_ip}");

    loop {
        let Some(url) = engine.peek_front(&tivo_ip).await else {
            break;
        };
        run_one(&url, &tivo_ip, &engine, &config, &tivos).await;
        let queues_empty = engine.pop_front(&tivo_ip).await;
        if queues_empty {
            break;
        }
    }

    event!(Level::INFO, "togo worker for {tivo_ip} drained, exiting");
}

async fn run_one(url: &str, tivo_ip: &str, engine: &ToGoEngine, config: &Config, tivos: &TivoRegistry) {
    engine
        .update(url, |j| {
            j.running = true;
            j.queued = false;
        })
        .await;

    let Some(job) = engine.get(url).await else {
        return;
    };

    let tivo = tivos.find_by_address(tivo_ip).await;
    let tsn = tivo.as_ref().map(|t| t.tsn.clone());
    let mak = tsn
        .as_deref()
        .and_then(|tsn| config.tivo_mak_for(tsn))
        .or_else(|| config.server.tivo_mak.clone());

    let Some(mak) = mak else {
        fail(engine, url, "no tivo_mak configured for this TiVo".to_string()).await;
        return;
    };

    let client = match ToGoClient::new(mak.clone()) {
        Ok(c) => c,
        Err(err) => {
            fail(engine, url, err.to_string()).await;
            return;
        }
    };

    let ts_capable = tsn.as_deref().is_some_and(crate::config::is_ts_capable);
    let want_ts = job.ts_format && ts_capable;
    let fetch_url = if want_ts {
        format!(
            "{url}{sep}Format=video%2Fx-tivo-mpeg-ts",
            sep = if url.contains('?') { '&' } else { '?' }
        )
    } else {
        url.to_string()
    };

    let cancel = engine.cancel_token(tivo_ip).await;

    let out_dir = config
        .server
        .togo_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));
    let container = ContainerKind::from_flags(job.decode, want_ts);
    let attrs = FilenameAttrs {
        title: job.metadata.title.clone(),
        episode_title: job.metadata.episode_title.clone(),
        record_date: job.metadata.record_date,
        callsign: job.metadata.callsign.clone(),
    };
    let filename = naming::build_filename(&attrs, url, config.server.togo_sortable_names, container, |cand| {
        out_dir.join(cand).exists()
    });
    let out_path = out_dir.join(&filename);

    match pull(&client, &fetch_url, &out_path, config, &job, want_ts, &mak, &cancel).await {
        Ok(report) => handle_outcome(engine, tivo_ip, url, &job, &out_path, report).await,
        Err(PullFailure::Cancelled) => {
            let _ = tokio::fs::remove_file(&out_path).await;
            engine
                .update(url, |j| {
                    j.running = false;
                    j.finished = true;
                    j.error = Some("cancelled".to_string());
                })
                .await;
        }
        Err(PullFailure::Error(msg)) => {
            let _ = tokio::fs::remove_file(&out_path).await;
            fail(engine, url, msg).await;
        }
    }
}

async fn fail(engine: &ToGoEngine, url: &str, message: String) {
    event!(Level::WARN, "togo job {url} failed: {message}");
    engine
        .update(url, |j| {
            j.running = false;
            j.finished = true;
            j.error = Some(message);
        })
        .await;
}

struct PullReport {
    bytes_written: u64,
    ts_error_count: u32,
}

enum PullFailure {
    Cancelled,
    Error(String),
}

/// Performs one attempt at pulling `fetch_url` into `out_path`: reads the
/// 16-byte TiVo header, decodes the declared header size, relays the
/// remainder of the header plus all following bytes into the sink (a file,
/// or the live-decryptor subprocess's stdin when `job.decode` is set),
/// validating TS sync on every 188-byte stride when `ts_format` is active.
async fn pull(
    client: &ToGoClient,
    fetch_url: &str,
    out_path: &Path,
    config: &Config,
    job: &DownloadJob,
    ts_format: bool,
    mak: &str,
    cancel: &CancellationToken,
) -> Result<PullReport, PullFailure> {
    let response = client.get(fetch_url, cancel).await.map_err(|err| {
        if matches!(err, ToGoError::Cancelled) {
            PullFailure::Cancelled
        } else {
            PullFailure::Error(err.to_string())
        }
    })?;

    let mut decryptor: Option<tokio::process::Child> = None;
    let mut sink: Box<dyn AsyncWrite + Unpin + Send> = if job.decode {
        let mut cmd = tokio::process::Command::new(&config.server.decrypt_binary);
        cmd.arg("-m")
            .arg(mak)
            .arg("-o")
            .arg(out_path)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        let mut child = cmd
            .spawn()
            .map_err(|err| PullFailure::Error(format!("decryptor spawn failed: {err}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PullFailure::Error("decryptor spawned without stdin".to_string()))?;
        decryptor = Some(child);
        Box::new(stdin)
    } else {
        let file = tokio::fs::File::create(out_path)
            .await
            .map_err(|err| PullFailure::Error(err.to_string()))?;
        Box::new(file)
    };

    let mut byte_stream = response.bytes_stream();
    let mut carry = bytes::BytesMut::new();
    let mut bytes_written: u64 = 0;
    let mut ts_error_count: u32 = 0;
    let mut last_sample = Instant::now();
    let mut header_consumed = false;
    let mut header_total_len: usize = HEADER_PREFIX_LEN;

    loop {
        if cancel.is_cancelled() {
            if let Some(mut child) = decryptor {
                let _ = child.kill().await;
            }
            return Err(PullFailure::Cancelled);
        }

        while !header_consumed && carry.len() < header_total_len {
            let Some(chunk) = byte_stream.next().await else {
                return Err(PullFailure::Error("connection closed before header".to_string()));
            };
            let chunk = chunk.map_err(|err| PullFailure::Error(err.to_string()))?;
            carry.extend_from_slice(&chunk);
            if carry.len() >= HEADER_PREFIX_LEN && header_total_len == HEADER_PREFIX_LEN {
                header_total_len = u32::from_be_bytes([carry[10], carry[11], carry[12], carry[13]]) as usize;
                header_total_len = header_total_len.max(HEADER_PREFIX_LEN);
            }
        }
        if !header_consumed {
            let header = carry.split_to(header_total_len);
            sink.write_all(&header)
                .await
                .map_err(|err| PullFailure::Error(err.to_string()))?;
            bytes_written += header.len() as u64;
            header_consumed = true;
        }

        while carry.len() < BLOCK_SIZE {
            let Some(chunk) = byte_stream.next().await else {
                break;
            };
            let chunk = chunk.map_err(|err| PullFailure::Error(err.to_string()))?;
            carry.extend_from_slice(&chunk);
        }

        if carry.is_empty() {
            break;
        }

        let take = carry.len().min(BLOCK_SIZE);
        let block = carry.split_to(take);

        if ts_format {
            let report = tsvalidate::validate(&block);
            ts_error_count += report.packets_out_of_sync as u32;
            if matches!(job.ts_error_mode, TsErrorMode::Reject) && report.packets_out_of_sync > 0 {
                if let Some(mut child) = decryptor {
                    let _ = child.kill().await;
                }
                return Err(PullFailure::Error("Transport stream error detected".to_string()));
            }
        }

        sink.write_all(&block)
            .await
            .map_err(|err| PullFailure::Error(err.to_string()))?;
        bytes_written += take as u64;

        if last_sample.elapsed() >= Duration::from_secs(1) {
            last_sample = Instant::now();
        }

        if take < BLOCK_SIZE {
            break;
        }
    }

    sink.flush().await.map_err(|err| PullFailure::Error(err.to_string()))?;
    drop(sink);
    if let Some(mut child) = decryptor {
        let _ = child.wait().await;
    }

    Ok(PullReport {
        bytes_written,
        ts_error_count,
    })
}

/// Applies the TS error policy (§4.5) to a completed attempt: decides
/// whether to keep the output, retry, or give up, and updates job/status
/// bookkeeping accordingly.
async fn handle_outcome(
    engine: &ToGoEngine,
    tivo_ip: &str,
    url: &str,
    job: &DownloadJob,
    out_path: &Path,
    report: PullReport,
) {
    let ts_active = job.ts_format;
    if !ts_active || job.ts_error_mode == TsErrorMode::Ignore || report.ts_error_count == 0 {
        finish_success(engine, url, out_path, job, report).await;
        return;
    }

    match job.ts_error_mode {
        TsErrorMode::Reject => {
            let _ = tokio::fs::remove_file(out_path).await;
            fail(engine, url, "Transport stream error detected".to_string()).await;
        }
        TsErrorMode::Best => {
            handle_best_of_n(engine, tivo_ip, url, job, out_path, report).await;
        }
        TsErrorMode::Ignore => unreachable!(),
    }
}

/// Best-of-N policy (§4.5): a completed attempt that beats the prior best
/// (or is the first attempt) is kept and, while retries remain, the worker
/// tries again to beat it. An attempt with `ts_error_count >= best_error_count`
/// is discarded and the run gives up on the spot -- it never gets to consume
/// a remaining retry, per scenario 5 ("attempt 2 ... worse than best, aborts
/// ... and the retry output is deleted").
async fn handle_best_of_n(
    engine: &ToGoEngine,
    tivo_ip: &str,
    url: &str,
    job: &DownloadJob,
    out_path: &Path,
    report: PullReport,
) {
    let is_first_attempt = job.best_file.is_none();
    let beats_prior_best = is_first_attempt || report.ts_error_count < job.best_error_count;

    if !beats_prior_best {
        let _ = tokio::fs::remove_file(out_path).await;
        fail(engine, url, "Transport stream error detected".to_string()).await;
        return;
    }

    if let Some(prior) = &job.best_file {
        let _ = tokio::fs::remove_file(prior).await;
        let _ = tokio::fs::remove_file(prior.with_extension("txt")).await;
    }
    let renamed = rename_with_diagnostic(out_path, report.ts_error_count, job.retry).await;
    engine
        .update(url, |j| {
            j.best_file = Some(renamed.clone());
            j.best_error_count = report.ts_error_count;
            j.size_bytes = report.bytes_written;
            j.ts_error_count = report.ts_error_count;
        })
        .await;

    let mut should_retry = false;
    engine
        .update(url, |j| {
            should_retry = j.begin_retry();
        })
        .await;

    if should_retry {
        engine.requeue_at_head(tivo_ip, url.to_string()).await;
        return;
    }

    maybe_write_sidecar(&renamed, job).await;
    finish_success_no_file_move(engine, url).await;
}

async fn rename_with_diagnostic(path: &Path, ts_error_count: u32, retry: u8) -> PathBuf {
    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
        return path.to_path_buf();
    };
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("ts");
    let renamed = path.with_file_name(format!("{stem} (^{ts_error_count}_{retry}).{ext}"));
    if tokio::fs::rename(path, &renamed).await.is_ok() {
        renamed
    } else {
        path.to_path_buf()
    }
}

async fn finish_success(engine: &ToGoEngine, url: &str, out_path: &Path, job: &DownloadJob, report: PullReport) {
    maybe_write_sidecar(out_path, job).await;
    engine
        .update(url, |j| {
            j.running = false;
            j.finished = true;
            j.size_bytes = report.bytes_written;
            j.ts_error_count = report.ts_error_count;
            j.error = None;
        })
        .await;
}

async fn finish_success_no_file_move(engine: &ToGoEngine, url: &str) {
    engine
        .update(url, |j| {
            j.running = false;
            j.finished = true;
            j.error = None;
        })
        .await;
}

/// Writes `<outfile>.txt` with whatever recording metadata was known at
/// enqueue time, gated on `job.save_txt` (`togo_save_txt`), per §4.5
/// "Completion". The original additionally fetched the TiVo's extended-
/// details URL for a second round of metadata before writing this file;
/// that network round trip is not reproduced here, so the sidecar only ever
/// reflects what the job already carried in `job.metadata`.
async fn maybe_write_sidecar(out_path: &Path, job: &DownloadJob) {
    if !job.save_txt {
        return;
    }
    let txt_path = out_path.with_extension("txt");
    let mut lines = Vec::new();
    if let Some(title) = &job.metadata.title {
        lines.push(format!("title: {title}"));
    }
    if let Some(episode) = &job.metadata.episode_title {
        lines.push(format!("episodeTitle: {episode}"));
    }
    if let Some(date) = job.metadata.record_date {
        lines.push(format!("recordDate: {}", date.to_rfc3339()));
    }
    if let Some(callsign) = &job.metadata.callsign {
        lines.push(format!("callsign: {callsign}"));
    }
    lines.push(format!("url: {}", job.url));

    if let Err(err) = tokio::fs::write(&txt_path, lines.join("\n") + "\n").await {
        event!(Level::WARN, "failed to write sidecar {txt_path:?}: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rename_pattern_shape() {
        let path = Path::new("/tmp/Show.ts");
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("ts");
        let renamed = format!("{stem} (^3_0).{ext}");
        assert_eq!(renamed, "Show (^3_0).ts");
    }
}
