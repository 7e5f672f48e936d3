//! Retrieval of discovery and JWKS documents.

use async_trait::async_trait;
use reqwest::redirect::Policy;
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::error::{FetchFailure, KeyProviderError, Result};

/// Upper bound on the size of a fetched document.
pub const MAX_DOCUMENT_SIZE: usize = 1 << 20;

/// Default timeout for a single document request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_REDIRECTS: usize = 10;

#[derive(Debug, thiserror::Error)]
#[error("redirect from https to {0}")]
struct DowngradedRedirect(String);

/// Source of raw document bytes for a URL.
#[async_trait]
pub trait DocumentRetriever: Send + Sync {
    async fn get_document(&self, url: &str) -> std::result::Result<Vec<u8>, FetchFailure>;
}

/// Retrieves documents over HTTP(S) with reqwest.
///
/// A request made over https never ends on a non-https location: such a
/// redirect hop is refused, and the final response URL is checked again.
pub struct HttpDocumentRetriever {
    http_client: reqwest::Client,
}

impl HttpDocumentRetriever {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(redirect_policy())
            .build()
            .map_err(|e| {
                KeyProviderError::InvalidConfiguration(format!("failed to create HTTP client: {e}"))
            })?;

        Ok(Self { http_client })
    }

    /// Use a caller-built client. Its own redirect policy applies, but a
    /// response that ended up on a non-https location is still rejected.
    pub fn with_client(http_client: reqwest::Client) -> Self {
        Self { http_client }
    }
}

#[async_trait]
impl DocumentRetriever for HttpDocumentRetriever {
    async fn get_document(&self, url: &str) -> std::result::Result<Vec<u8>, FetchFailure> {
        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(send_failure)?;

        check_final_location(url, response.url())?;

        if !response.status().is_success() {
            return Err(FetchFailure::Status(response.status()));
        }

        if let Some(length) = response.content_length() {
            if length > MAX_DOCUMENT_SIZE as u64 {
                return Err(FetchFailure::PayloadTooLarge(length as usize));
            }
        }

        let payload = response.bytes().await?;
        if payload.len() > MAX_DOCUMENT_SIZE {
            return Err(FetchFailure::PayloadTooLarge(payload.len()));
        }

        Ok(payload.to_vec())
    }
}

/// Fetches documents through a retriever, enforcing HTTPS when required.
#[derive(Clone)]
pub struct DocumentFetcher {
    retriever: Arc<dyn DocumentRetriever>,
    require_https: bool,
}

impl DocumentFetcher {
    pub fn new(retriever: Arc<dyn DocumentRetriever>, require_https: bool) -> Self {
        Self {
            retriever,
            require_https,
        }
    }

    pub fn requires_https(&self) -> bool {
        self.require_https
    }

    /// GET `url`. No retries: one failure is one error.
    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        if self.require_https && !is_https(url) {
            return Err(KeyProviderError::InsecureTransportRejected {
                url: url.to_string(),
            });
        }

        debug!(url = %url, "Fetching document");

        let body = self
            .retriever
            .get_document(url)
            .await
            .map_err(|source| match source {
                FetchFailure::InsecureRedirect(location) => {
                    KeyProviderError::InsecureTransportRejected { url: location }
                }
                source => KeyProviderError::DocumentFetchFailed {
                    url: url.to_string(),
                    source,
                },
            })?;

        debug!(url = %url, bytes = body.len(), "Fetched document");
        Ok(body)
    }
}

pub(crate) fn is_https(url: &str) -> bool {
    url.get(..8)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("https://"))
}

/// Follow redirects, except from https to anything else.
fn redirect_policy() -> Policy {
    Policy::custom(|attempt| {
        if attempt.previous().len() > MAX_REDIRECTS {
            return attempt.error("too many redirects");
        }
        if is_downgrade(attempt.previous(), attempt.url()) {
            let location = attempt.url().to_string();
            return attempt.error(DowngradedRedirect(location));
        }
        attempt.follow()
    })
}

fn is_downgrade(previous: &[Url], next: &Url) -> bool {
    next.scheme() != "https" && previous.iter().any(|hop| hop.scheme() == "https")
}

fn check_final_location(requested: &str, location: &Url) -> std::result::Result<(), FetchFailure> {
    if is_https(requested) && location.scheme() != "https" {
        return Err(FetchFailure::InsecureRedirect(location.to_string()));
    }
    Ok(())
}

/// Surface a refused downgrade as such instead of a generic request error.
fn send_failure(err: reqwest::Error) -> FetchFailure {
    let mut cause = std::error::Error::source(&err);
    while let Some(inner) = cause {
        if let Some(DowngradedRedirect(location)) = inner.downcast_ref::<DowngradedRedirect>() {
            return FetchFailure::InsecureRedirect(location.clone());
        }
        cause = std::error::Error::source(inner);
    }
    FetchFailure::Request(err)
}
