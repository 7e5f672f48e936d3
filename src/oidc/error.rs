//! Errors raised while acquiring issuer signing keys.

use std::sync::Arc;

pub type Result<T, E = KeyProviderError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum KeyProviderError {
    #[error("invalid OIDC configuration: {0}")]
    InvalidConfiguration(String),

    #[error("refusing to fetch {url} over an insecure transport")]
    InsecureTransportRejected { url: String },

    #[error("failed to fetch document from {url}: {source}")]
    DocumentFetchFailed {
        url: String,
        #[source]
        source: FetchFailure,
    },

    #[error("failed to parse document from {url}: {reason}")]
    DocumentParseFailed { url: String, reason: String },

    /// Returned to callers of the key provider when neither a fresh nor a
    /// previously cached configuration could be produced.
    #[error("issuer signing keys are unavailable: {0}")]
    ConfigurationUnavailable(#[source] Arc<KeyProviderError>),
}

impl KeyProviderError {
    pub(crate) fn parse(url: &str, reason: impl Into<String>) -> Self {
        Self::DocumentParseFailed {
            url: url.to_string(),
            reason: reason.into(),
        }
    }
}

/// Underlying cause of a failed document fetch.
#[derive(Debug, thiserror::Error)]
pub enum FetchFailure {
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    #[error("endpoint returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("redirected to non-https location {0}")]
    InsecureRedirect(String),
    #[error("document too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("refresh task ended before completing: {0}")]
    Aborted(String),
}
