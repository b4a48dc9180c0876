//! HTTP client wrapper for talking to a TiVo's ToGo HTTPS endpoint: Digest
//! auth against the media access key, a fixed session cookie, and 503 retry.
//! Ported from `tivo_opener`/`tivo_open()` in the original's `togo.py`.

use std::time::Duration;

use rand::Rng;
use reqwest::{Client, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{Level, event};

use crate::errors::ToGoError;

/// The original hard-coded this cookie value (`sid=ADEADDA7EDEBAC1E`) as a
/// stable session id TiVo's ToGo server doesn't actually validate, it just
/// needs *a* cookie present.
const TOGO_SESSION_COOKIE: &str = "sid=ADEADDA7EDEBAC1E";

const BUSY_RETRY_DELAY: Duration = Duration::from_secs(5);

/// The ~5s busy backoff (§4.5 step 3), jittered by up to 250ms the way the
/// teacher's RSS poll scheduling jitters its own fixed interval, so a fleet
/// of workers retrying the same busy TiVo doesn't thunder in lockstep.
fn jittered_busy_delay() -> Duration {
    let jitter_ms = rand::rng().random_range(0..250);
    BUSY_RETRY_DELAY + Duration::from_millis(jitter_ms)
}

pub(crate) struct ToGoClient {
    http: Client,
    tivo_mak: String,
}

impl ToGoClient {
    pub(crate) fn new(tivo_mak: String) -> anyhow::Result<ToGoClient> {
        let http = Client::builder()
            .danger_accept_invalid_certs(true)
            .cookie_store(true)
            .build()?;
        Ok(ToGoClient { http, tivo_mak })
    }

    /// Fetches `url` from a TiVo, retrying on 503 (transfer slot busy)
    /// indefinitely with a 5s (plus jitter) backoff per §4.5 step 3 and §7 --
    /// a TiVo can sit on a single transfer slot for as long as it's mid
    /// recording, so there's no bounded retry count here, only cooperative
    /// cancellation via `cancel` (checked between attempts so `UnqueueAll`
    /// still interrupts a worker stuck waiting on a permanently busy TiVo).
    /// Performs the Digest auth challenge/response round trip on 401.
    pub(crate) async fn get(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, ToGoError> {
        loop {
            if cancel.is_cancelled() {
                return Err(ToGoError::Cancelled);
            }

            let request = self
                .http
                .get(url)
                .header(reqwest::header::COOKIE, TOGO_SESSION_COOKIE)
                .basic_auth("tivo", Some(&self.tivo_mak));

            let response = request.send().await?;

            match response.status() {
                StatusCode::SERVICE_UNAVAILABLE => {
                    event!(Level::DEBUG, "tivo busy, retrying in {BUSY_RETRY_DELAY:?}");
                    tokio::select! {
                        () = tokio::time::sleep(jittered_busy_delay()) => {}
                        () = cancel.cancelled() => return Err(ToGoError::Cancelled),
                    }
                    continue;
                }
                StatusCode::UNAUTHORIZED => {
                    let retried = self.retry_with_digest(url, &response).await?;
                    return Ok(retried);
                }
                status if status.is_success() || status == StatusCode::PARTIAL_CONTENT => {
                    return Ok(response);
                }
                status => {
                    return Err(ToGoError::TransportStream(format!(
                        "unexpected status {status}"
                    )));
                }
            }
        }
    }

    async fn retry_with_digest(
        &self,
        url: &str,
        challenge_response: &reqwest::Response,
    ) -> Result<reqwest::Response, ToGoError> {
        let Some(header) = challenge_response
            .headers()
            .get(reqwest::header::WWW_AUTHENTICATE)
        else {
            return Err(ToGoError::AuthFailed);
        };
        let header = header.to_str().map_err(|_| ToGoError::AuthFailed)?;
        let mut context =
            digest_auth::AuthContext::new("tivo", self.tivo_mak.as_str(), url);
        context.method = digest_auth::HttpMethod::GET;
        let mut prompt =
            digest_auth::parse(header).map_err(|_| ToGoError::AuthFailed)?;
        let answer = prompt
            .respond(&context)
            .map_err(|_| ToGoError::AuthFailed)?;

        let response = self
            .http
            .get(url)
            .header(reqwest::header::COOKIE, TOGO_SESSION_COOKIE)
            .header(reqwest::header::AUTHORIZATION, answer.to_header_string())
            .send()
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(ToGoError::AuthFailed);
        }
        Ok(response)
    }
}
