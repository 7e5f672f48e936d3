//! Bearer token verification against issuer signing keys.

use jsonwebtoken::{decode, decode_header, Algorithm, TokenData, Validation};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::error::KeyProviderError;
use super::key::SigningKey;
use super::provider::SigningKeyProvider;

/// Checks applied on top of the signature.
#[derive(Debug, Clone)]
pub struct VerifyOptions {
    /// Expected `iss`. Not checked when unset.
    pub issuer: Option<String>,
    /// Expected `aud`. Not checked when unset.
    pub audience: Option<String>,
    /// Clock skew tolerance in seconds for exp/nbf validation.
    pub leeway_secs: u64,
    /// Accepted header algorithms. All must be RSA based.
    pub algorithms: Vec<Algorithm>,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            issuer: None,
            audience: None,
            leeway_secs: 30,
            algorithms: vec![Algorithm::RS256],
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("malformed token: {0}")]
    Malformed(#[source] jsonwebtoken::errors::Error),
    #[error("token algorithm {0:?} is not accepted")]
    UnsupportedAlgorithm(Algorithm),
    /// The issuer's keys could not be obtained; the token cannot be judged.
    #[error("cannot verify token: {0}")]
    KeysUnavailable(#[source] KeyProviderError),
    #[error("no signing key matches kid {0:?}")]
    KeyNotFound(Option<String>),
    #[error("token validation failed: {0}")]
    Invalid(#[source] jsonwebtoken::errors::Error),
}

/// Verify `token` with the provider's current keys.
///
/// The key is chosen by the header `kid`; a token without one is tried
/// against every key. When nothing matches, a refresh is requested and the
/// lookup repeated once, which picks up keys rotated in since the last fetch.
pub async fn verify_token<C: DeserializeOwned>(
    provider: &SigningKeyProvider,
    token: &str,
    options: &VerifyOptions,
) -> Result<TokenData<C>, TokenError> {
    let header = decode_header(token).map_err(TokenError::Malformed)?;

    debug!(kid = ?header.kid, alg = ?header.alg, "Verifying token");

    if !options.algorithms.contains(&header.alg) || !is_rsa_algorithm(header.alg) {
        return Err(TokenError::UnsupportedAlgorithm(header.alg));
    }

    let kid = header.kid.as_deref();
    let mut candidates = matching_keys(provider, kid).await?;
    if candidates.is_empty() {
        debug!(kid = ?kid, "No matching signing key, requesting refresh");
        provider.request_refresh();
        candidates = matching_keys(provider, kid).await?;
    }

    let validation = build_validation(header.alg, options);

    let mut last_error = None;
    for key in &candidates {
        match decode::<C>(token, &key.decoding_key(), &validation) {
            Ok(data) => {
                debug!(kid = %key.key_id(), "Token verified");
                return Ok(data);
            }
            Err(e) => last_error = Some(e),
        }
    }

    match last_error {
        Some(e) => Err(TokenError::Invalid(e)),
        None => Err(TokenError::KeyNotFound(kid.map(String::from))),
    }
}

async fn matching_keys(
    provider: &SigningKeyProvider,
    kid: Option<&str>,
) -> Result<Vec<SigningKey>, TokenError> {
    let keys = provider
        .issuer_signing_keys()
        .await
        .map_err(TokenError::KeysUnavailable)?;

    Ok(match kid {
        Some(kid) => keys
            .into_iter()
            .filter(|key| key.key_id() == kid)
            .take(1)
            .collect(),
        None => keys,
    })
}

fn build_validation(alg: Algorithm, options: &VerifyOptions) -> Validation {
    let mut validation = Validation::new(alg);
    validation.algorithms = options.algorithms.clone();
    validation.leeway = options.leeway_secs;

    if let Some(ref issuer) = options.issuer {
        validation.set_issuer(&[issuer]);
    }

    if let Some(ref aud) = options.audience {
        validation.set_audience(&[aud]);
    } else {
        validation.validate_aud = false;
    }

    validation
}

fn is_rsa_algorithm(alg: Algorithm) -> bool {
    matches!(
        alg,
        Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512
    )
}
