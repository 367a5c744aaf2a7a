//! Network retrieval of MIDI files and instrument patches.
//!
//! Retrieval sits behind the [`ByteFetcher`] trait so the player can be
//! exercised with canned bytes in tests. The production implementation is a
//! blocking HTTP GET.
//!
//! No timeout or cancellation is configured: failures surface only through
//! the returned error. Callers wanting bounded retrieval should wrap the
//! trait.

use thiserror::Error;

/// Errors produced while retrieving bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The request could not be sent or the body could not be read.
    #[error("request for {url} failed: {reason}")]
    Request { url: String, reason: String },
    /// The server answered with a non-success status.
    #[error("request for {url} returned status {status}")]
    Status { url: String, status: u16 },
}

/// Capability interface for fetching a resource as raw bytes.
pub trait ByteFetcher: Send {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// Blocking HTTP fetcher used by default.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteFetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| FetchError::Request {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        response
            .bytes()
            .map(|b| b.to_vec())
            .map_err(|e| FetchError::Request {
                url: url.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Joins the patch base location and a patch identifier with exactly one
/// `/` separator.
pub fn patch_url(base: &str, name: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        name.trim_start_matches('/')
    )
}
