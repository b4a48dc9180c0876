//! ToGo pull engine: per-TiVo download queue, worker, HTTPS client, TS
//! validation, output naming, and remote Now Playing List browsing.

pub(crate) mod client;
pub(crate) mod engine;
pub(crate) mod jobs;
pub(crate) mod naming;
pub(crate) mod npl;
pub(crate) mod queue;
pub(crate) mod tsvalidate;
