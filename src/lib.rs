//! Signing keys for OIDC bearer token verification.
//!
//! [`SigningKeyProvider`] fetches the public keys an OpenID Connect issuer
//! signs tokens with and caches them, refreshing on an interval or on
//! request. [`verify_token`] hands those keys to `jsonwebtoken`.

pub mod oidc;

pub use oidc::{
    verify_token, KeyProviderError, OidcSettings, SigningKey, SigningKeyProvider, TokenError,
    VerifyOptions,
};
