//! Outbound HTTP with per-hop SSRF gating.
//!
//! reqwest's automatic redirect following would let a public host bounce a
//! fetch onto a private one: only the first hop would ever see the guard.
//! The shared client therefore never follows redirects; [`guarded_get`]
//! walks the chain manually and passes every hop through the private-host
//! gate before a connection is opened.

use std::time::Duration;

use reqwest::redirect::Policy;
use url::Url;

use crate::errors::FetchError;
use crate::ssrf::ensure_public_url;

const MAX_REDIRECTS: usize = 5;

/// The client used for every outbound fetch. Redirect handling lives in
/// [`guarded_get`], never inside reqwest.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(Policy::none())
        .build()
        .expect("client configuration is static")
}

/// GET `url`, following up to [`MAX_REDIRECTS`] redirects. Every hop is
/// checked against the private-host gate before it is requested.
pub async fn guarded_get(
    client: &reqwest::Client,
    url: Url,
    timeout: Duration,
    allow_private: bool,
) -> Result<reqwest::Response, FetchError> {
    fetch_with_gate(client, url, timeout, &|u| ensure_public_url(u, allow_private)).await
}

async fn fetch_with_gate(
    client: &reqwest::Client,
    mut url: Url,
    timeout: Duration,
    gate: &(dyn Fn(&Url) -> Result<(), FetchError> + Sync),
) -> Result<reqwest::Response, FetchError> {
    for _ in 0..=MAX_REDIRECTS {
        gate(&url)?;
        let response = client.get(url.clone()).timeout(timeout).send().await?;
        if !response.status().is_redirection() {
            return Ok(response);
        }
        let Some(location) = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
        else {
            // A redirect without a usable Location goes nowhere.
            return Err(FetchError::FetchFailed {
                status: response.status().as_u16(),
            });
        };
        url = url.join(location)?;
    }
    Err(FetchError::TooManyRedirects)
}
