//! OIDC signing key acquisition.
//!
//! Fetches the signing keys of an OpenID Connect issuer, either through its
//! discovery document or from a raw JWKS endpoint, and keeps them cached with
//! single-flight refresh.

pub mod cache;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod key;
pub mod provider;
pub mod validator;

pub use cache::{CachedConfiguration, ConfigurationCache, RefreshInterval};
pub use config::{OidcSettings, OidcSettingsJson};
pub use error::{FetchFailure, KeyProviderError};
pub use fetcher::{DocumentFetcher, DocumentRetriever, HttpDocumentRetriever};
pub use key::{KeyType, SigningKey};
pub use provider::{DocumentKind, KeyConfiguration, SigningKeyProvider};
pub use validator::{verify_token, TokenError, VerifyOptions};
