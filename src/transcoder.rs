//! External transcoder process wiring. The original shelled out to ffmpeg
//! (and optionally tivolibre for decrypt) and streamed its stdout straight
//! back to the HTTP response body; we keep that as an opaque child-process
//! byte stream rather than binding a transcoding library in-process.

use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};
use tokio::process::Command;

#[derive(Clone, Debug)]
pub(crate) struct TranscodeRequest {
    pub(crate) input: std::path::PathBuf,
    pub(crate) target_format: TargetFormat,
    pub(crate) seek_seconds: Option<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TargetFormat {
    MpegPs,
    MpegTs,
}

/// Spawns the configured transcoder binary, keeping the child handle alive
/// alongside its piped stdout so neither is dropped (and the process reaped)
/// while the stream is still being read.
pub(crate) struct TranscodeStream {
    _child: tokio::process::Child,
    stdout: tokio::process::ChildStdout,
}

/// Delegates reads to the child's stdout while keeping the child handle
/// alive, so callers can hand `TranscodeStream` straight to `ReaderStream`
/// without the process being reaped mid-read.
impl AsyncRead for TranscodeStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.stdout).poll_read(cx, buf)
    }
}

pub(crate) fn spawn(binary: &Path, req: &TranscodeRequest) -> anyhow::Result<TranscodeStream> {
    let mut cmd = Command::new(binary);
    cmd.arg("-i").arg(&req.input);
    if let Some(seek) = req.seek_seconds {
        cmd.arg("-ss").arg(format!("{seek:.3}"));
    }
    match req.target_format {
        TargetFormat::MpegPs => cmd.args(["-f", "vob"]),
        TargetFormat::MpegTs => cmd.args(["-f", "mpegts"]),
    };
    cmd.arg("pipe:1");
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::null());
    let mut child = cmd.spawn()?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("transcoder spawned without piped stdout"))?;
    Ok(TranscodeStream {
        _child: child,
        stdout,
    })
}
