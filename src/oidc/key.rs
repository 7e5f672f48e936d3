//! Signing key model and JWKS parsing.

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use jsonwebtoken::DecodingKey;
use serde::Deserialize;
use tracing::debug;

use super::error::{KeyProviderError, Result};

/// base64url that accepts both padded and unpadded input.
const BASE64_URL: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Rsa,
}

impl std::fmt::Display for KeyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyType::Rsa => write!(f, "RSA"),
        }
    }
}

/// A public key an issuer signs tokens with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningKey {
    key_id: String,
    modulus: Vec<u8>,
    exponent: Vec<u8>,
    key_type: KeyType,
}

impl SigningKey {
    pub fn rsa(key_id: impl Into<String>, modulus: Vec<u8>, exponent: Vec<u8>) -> Self {
        Self {
            key_id: key_id.into(),
            modulus,
            exponent,
            key_type: KeyType::Rsa,
        }
    }

    /// Key id used to match the `kid` of a token header. Empty when the
    /// issuer published the key without one.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Big-endian modulus bytes.
    pub fn modulus(&self) -> &[u8] {
        &self.modulus
    }

    /// Big-endian public exponent bytes.
    pub fn exponent(&self) -> &[u8] {
        &self.exponent
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    /// Modulus size in bits, ignoring leading zero bytes.
    pub fn modulus_bits(&self) -> usize {
        match self.modulus.iter().position(|b| *b != 0) {
            Some(first) => {
                (self.modulus.len() - first - 1) * 8 + (8 - self.modulus[first].leading_zeros() as usize)
            }
            None => 0,
        }
    }

    /// Convert into the key type `jsonwebtoken` verifies signatures with.
    pub fn decoding_key(&self) -> DecodingKey {
        match self.key_type {
            KeyType::Rsa => DecodingKey::from_rsa_raw_components(&self.modulus, &self.exponent),
        }
    }

    fn from_jwk(jwk: &Jwk) -> std::result::Result<Self, String> {
        let n = jwk.n.as_deref().ok_or("RSA key missing 'n'")?;
        let e = jwk.e.as_deref().ok_or("RSA key missing 'e'")?;

        let modulus = BASE64_URL
            .decode(n)
            .map_err(|err| format!("invalid modulus: {err}"))?;
        let exponent = BASE64_URL
            .decode(e)
            .map_err(|err| format!("invalid exponent: {err}"))?;

        Ok(Self::rsa(jwk.kid.clone().unwrap_or_default(), modulus, exponent))
    }
}

/// JWKS document as published by an issuer.
#[derive(Debug, Deserialize)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

/// Individual JSON Web Key. Only the RSA members are read.
#[derive(Debug, Deserialize)]
pub struct Jwk {
    /// Key type (RSA, EC)
    #[serde(default)]
    pub kty: Option<String>,
    /// Key ID
    #[serde(default)]
    pub kid: Option<String>,
    /// Key use (sig, enc)
    #[serde(default, rename = "use")]
    pub key_use: Option<String>,
    /// RSA modulus (base64url)
    #[serde(default)]
    pub n: Option<String>,
    /// RSA exponent (base64url)
    #[serde(default)]
    pub e: Option<String>,
}

impl Jwk {
    fn is_rsa_signing_key(&self) -> bool {
        self.kty.as_deref() == Some("RSA") && matches!(self.key_use.as_deref(), None | Some("sig"))
    }
}

/// How entries of a key set are turned into signing keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySetMode {
    /// Every entry is treated as an RSA key; `kty` and `use` are not checked
    /// and an entry without usable `n`/`e` fails the whole document.
    Lenient,
    /// Only RSA entries meant for signatures are kept; anything else, or an
    /// entry that cannot be decoded, is skipped.
    SigningOnly,
}

/// Parse a JWKS body fetched from `url`.
pub fn parse_key_set(body: &[u8], url: &str, mode: KeySetMode) -> Result<Vec<SigningKey>> {
    let jwks: Jwks = serde_json::from_slice(body)
        .map_err(|err| KeyProviderError::parse(url, format!("invalid JWKS: {err}")))?;

    let mut keys = Vec::with_capacity(jwks.keys.len());
    for (index, jwk) in jwks.keys.iter().enumerate() {
        match mode {
            KeySetMode::Lenient => {
                let key = SigningKey::from_jwk(jwk)
                    .map_err(|reason| KeyProviderError::parse(url, format!("key {index}: {reason}")))?;
                keys.push(key);
            }
            KeySetMode::SigningOnly => {
                if !jwk.is_rsa_signing_key() {
                    debug!(kid = ?jwk.kid, kty = ?jwk.kty, key_use = ?jwk.key_use, "Skipping non-signing JWK");
                    continue;
                }
                match SigningKey::from_jwk(jwk) {
                    Ok(key) => keys.push(key),
                    Err(reason) => {
                        debug!(kid = ?jwk.kid, reason = %reason, "Skipping undecodable JWK");
                    }
                }
            }
        }
    }

    Ok(keys)
}

/// The parts of an OIDC discovery document this crate reads.
#[derive(Debug, Deserialize)]
pub struct DiscoveryDocument {
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub jwks_uri: Option<String>,
}

impl DiscoveryDocument {
    pub fn parse(body: &[u8], url: &str) -> Result<Self> {
        let document: DiscoveryDocument = serde_json::from_slice(body).map_err(|err| {
            KeyProviderError::parse(url, format!("invalid discovery document: {err}"))
        })?;

        match document.jwks_uri.as_deref() {
            Some(uri) if !uri.trim().is_empty() => Ok(document),
            _ => Err(KeyProviderError::parse(url, "discovery document has no jwks_uri")),
        }
    }
}
