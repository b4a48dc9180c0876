use thiserror::Error;

/// Failures specific to pulling a recording off a TiVo via ToGo. Matches the
/// outcomes `get_tivo_file()` in the original distinguishes: a 503 the caller
/// should retry, a 401 that means the MAK is wrong, and sync loss in the
/// transport stream.
#[derive(Debug, Error)]
pub(crate) enum ToGoError {
    #[error("authentication with tivo failed, check media access key")]
    AuthFailed,
    #[error("cancelled")]
    Cancelled,
    #[error("transport stream sync lost: {0}")]
    TransportStream(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Failures serving a file upload to a TiVo, mapped to HTTP status codes at
/// the axum boundary in `upload.rs`.
#[derive(Debug, Error)]
pub(crate) enum UploadError {
    #[error("repeat offset call detected, refusing to resend")]
    RepeatOffset,
    #[error("requested file not found")]
    NotFound,
    #[error("path escapes share root")]
    Forbidden,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
