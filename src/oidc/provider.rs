//! Issuer signing key provider.

use futures::FutureExt;
use std::sync::Arc;
use tracing::{debug, info};

use super::cache::{CachedConfiguration, ConfigurationCache, RefreshInterval};
use super::config::OidcSettings;
use super::error::{KeyProviderError, Result};
use super::fetcher::{is_https, DocumentFetcher, DocumentRetriever, HttpDocumentRetriever};
use super::key::{parse_key_set, DiscoveryDocument, KeySetMode, SigningKey};

/// Shape of the document found at the validation path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    /// OIDC discovery document; keys come from its `jwks_uri`.
    Discovery,
    /// JSON Web Key Set served directly.
    RawJwks,
}

impl DocumentKind {
    /// Paths containing "jwks" in any case are raw key sets.
    pub fn from_validation_path(path: &str) -> Self {
        if path.to_ascii_lowercase().contains("jwks") {
            DocumentKind::RawJwks
        } else {
            DocumentKind::Discovery
        }
    }
}

/// Keys of one successful refresh and where they came from.
#[derive(Debug)]
pub struct KeyConfiguration {
    pub keys: Vec<SigningKey>,
    /// URL built from the issuer URL and validation path.
    pub source_url: String,
    /// URL the key set itself was read from.
    pub jwks_uri: String,
    /// `issuer` from the discovery document.
    pub issuer: Option<String>,
}

/// Supplies the current signing keys of an OIDC issuer.
pub struct SigningKeyProvider {
    document_url: String,
    kind: DocumentKind,
    require_https: bool,
    cache: ConfigurationCache<KeyConfiguration>,
}

impl SigningKeyProvider {
    /// Create a provider fetching over HTTP.
    pub fn new(settings: &OidcSettings) -> Result<Self> {
        let retriever = HttpDocumentRetriever::new(settings.request_timeout())?;
        Self::with_retriever(settings, Arc::new(retriever))
    }

    /// Create a provider fetching through `retriever`. Nothing is fetched
    /// until keys are first asked for.
    pub fn with_retriever(
        settings: &OidcSettings,
        retriever: Arc<dyn DocumentRetriever>,
    ) -> Result<Self> {
        settings
            .validate()
            .map_err(KeyProviderError::InvalidConfiguration)?;

        let document_url = settings.document_url();
        let kind = DocumentKind::from_validation_path(&settings.validation_path);
        let require_https = is_https(&settings.issuer_url);
        let fetcher = DocumentFetcher::new(retriever, require_https);

        let cache = {
            let url = document_url.clone();
            ConfigurationCache::new(document_url.clone(), settings.refresh_interval(), move || {
                load_configuration(fetcher.clone(), url.clone(), kind).boxed()
            })
        };

        info!(
            url = %document_url,
            kind = ?kind,
            require_https,
            refresh_interval = ?settings.refresh_interval(),
            "Signing key provider configured"
        );

        Ok(Self {
            document_url,
            kind,
            require_https,
            cache,
        })
    }

    /// Current signing keys, in the order the issuer publishes them.
    ///
    /// Served from the cache while it is fresh. Fails with
    /// [`KeyProviderError::ConfigurationUnavailable`] when no keys could be
    /// obtained; never returns an empty set in place of an error.
    pub async fn issuer_signing_keys(&self) -> Result<Vec<SigningKey>> {
        let configuration = self.configuration().await?;
        Ok(configuration.value().keys.clone())
    }

    /// Current configuration with its refresh timestamps.
    pub async fn configuration(&self) -> Result<Arc<CachedConfiguration<KeyConfiguration>>> {
        self.cache
            .current()
            .await
            .map_err(KeyProviderError::ConfigurationUnavailable)
    }

    /// Ask for the keys to be fetched again on the next read.
    ///
    /// Honoured at most once per refresh interval; a no-op when refreshing
    /// is disabled. Never fetches by itself.
    pub fn request_refresh(&self) {
        self.cache.request_refresh();
    }

    /// Error of the most recent failed refresh, if it has not been followed
    /// by a successful one.
    pub fn last_error(&self) -> Option<Arc<KeyProviderError>> {
        self.cache.last_error()
    }

    pub fn document_url(&self) -> &str {
        &self.document_url
    }

    pub fn kind(&self) -> DocumentKind {
        self.kind
    }

    pub fn requires_https(&self) -> bool {
        self.require_https
    }

    pub fn refresh_interval(&self) -> RefreshInterval {
        self.cache.refresh_interval()
    }
}

async fn load_configuration(
    fetcher: DocumentFetcher,
    url: String,
    kind: DocumentKind,
) -> Result<KeyConfiguration> {
    let body = fetcher.fetch(&url).await?;

    let configuration = match kind {
        DocumentKind::RawJwks => KeyConfiguration {
            keys: parse_key_set(&body, &url, KeySetMode::Lenient)?,
            jwks_uri: url.clone(),
            source_url: url,
            issuer: None,
        },
        DocumentKind::Discovery => {
            let document = DiscoveryDocument::parse(&body, &url)?;
            let jwks_uri = document.jwks_uri.unwrap_or_default();
            debug!(url = %url, jwks_uri = %jwks_uri, "Resolved jwks_uri from discovery document");

            let body = fetcher.fetch(&jwks_uri).await?;
            KeyConfiguration {
                keys: parse_key_set(&body, &jwks_uri, KeySetMode::SigningOnly)?,
                jwks_uri,
                source_url: url,
                issuer: document.issuer,
            }
        }
    };

    debug!(
        url = %configuration.source_url,
        key_count = configuration.keys.len(),
        "Loaded signing keys"
    );

    Ok(configuration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oidc::error::FetchFailure;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Serves fixed documents by URL and records every request.
    struct StaticRetriever {
        documents: Mutex<HashMap<String, Vec<u8>>>,
        requests: Mutex<Vec<String>>,
        delay: Duration,
    }

    impl StaticRetriever {
        fn serving(documents: &[(&str, &str)]) -> Arc<Self> {
            Self::serving_with_delay(documents, Duration::ZERO)
        }

        fn serving_with_delay(documents: &[(&str, &str)], delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                documents: Mutex::new(
                    documents
                        .iter()
                        .map(|(url, body)| (url.to_string(), body.as_bytes().to_vec()))
                        .collect(),
                ),
                requests: Mutex::new(Vec::new()),
                delay,
            })
        }

        fn set(&self, url: &str, body: &str) {
            self.documents.lock().insert(url.to_string(), body.as_bytes().to_vec());
        }

        fn remove(&self, url: &str) {
            self.documents.lock().remove(url);
        }

        fn requests(&self) -> Vec<String> {
            self.requests.lock().clone()
        }
    }

    #[async_trait]
    impl DocumentRetriever for StaticRetriever {
        async fn get_document(&self, url: &str) -> std::result::Result<Vec<u8>, FetchFailure> {
            self.requests.lock().push(url.to_string());
            tokio::time::sleep(self.delay).await;
            self.documents
                .lock()
                .get(url)
                .cloned()
                .ok_or(FetchFailure::Status(reqwest::StatusCode::NOT_FOUND))
        }
    }

    const JWKS_ONE_KEY: &str =
        r#"{"keys":[{"kty":"RSA","n":"0vx7agoebGcQSuuPiLJXZptN9nndrQmbXEps2aiAFbWh","e":"AQAB","kid":"key1","use":"sig"}]}"#;

    fn unavailable_cause(err: KeyProviderError) -> Arc<KeyProviderError> {
        match err {
            KeyProviderError::ConfigurationUnavailable(cause) => cause,
            other => panic!("unexpected error: {other:?}"),
        }
    }

    fn provider(issuer: &str, path: &str, retriever: Arc<StaticRetriever>) -> SigningKeyProvider {
        SigningKeyProvider::with_retriever(&OidcSettings::new(issuer, path), retriever).unwrap()
    }

    #[test]
    fn test_document_kind_from_path() {
        assert_eq!(DocumentKind::from_validation_path("/jwks"), DocumentKind::RawJwks);
        assert_eq!(DocumentKind::from_validation_path("/JWKS"), DocumentKind::RawJwks);
        assert_eq!(
            DocumentKind::from_validation_path("/.well-known/Jwks.json"),
            DocumentKind::RawJwks
        );
        assert_eq!(
            DocumentKind::from_validation_path("/.well-known/openid-configuration"),
            DocumentKind::Discovery
        );
    }

    #[test]
    fn test_construction_requires_issuer() {
        for issuer in ["", "   "] {
            let result = SigningKeyProvider::with_retriever(
                &OidcSettings::new(issuer, "/jwks"),
                StaticRetriever::serving(&[]),
            );
            assert!(matches!(result, Err(KeyProviderError::InvalidConfiguration(_))));
        }
    }

    #[test]
    fn test_https_requirement_follows_issuer_scheme() {
        let secure = provider("https://idp.example.com", "/jwks", StaticRetriever::serving(&[]));
        assert!(secure.requires_https());

        let plain = provider("http://localhost:8080", "/jwks", StaticRetriever::serving(&[]));
        assert!(!plain.requires_https());

        let upper = provider("HTTPS://idp.example.com", "/jwks", StaticRetriever::serving(&[]));
        assert!(upper.requires_https());
    }

    #[tokio::test]
    async fn test_raw_jwks_example() {
        let retriever = StaticRetriever::serving(&[("https://idp.example.com/jwks", JWKS_ONE_KEY)]);
        let provider = provider("https://idp.example.com", "/jwks", retriever.clone());
        assert_eq!(provider.kind(), DocumentKind::RawJwks);

        let keys = provider.issuer_signing_keys().await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].key_id(), "key1");
        assert_eq!(keys[0].exponent(), &[1, 0, 1]);
        assert_eq!(retriever.requests(), vec!["https://idp.example.com/jwks"]);
    }

    #[tokio::test]
    async fn test_raw_jwks_returns_every_published_key() {
        let body = r#"{"keys":[
            {"kty":"RSA","n":"AQAB","e":"AQAB","kid":"a","use":"sig"},
            {"kty":"oct","n":"AQAC","e":"AQAB","kid":"b","use":"enc"},
            {"kty":"RSA","n":"AQAD","e":"AQAB","kid":"a"}
        ]}"#;
        let retriever = StaticRetriever::serving(&[("https://idp.example.com/Keys/JWKS", body)]);
        let provider = provider("https://idp.example.com", "/Keys/JWKS", retriever);

        let keys = provider.issuer_signing_keys().await.unwrap();
        let kids: Vec<&str> = keys.iter().map(SigningKey::key_id).collect();
        assert_eq!(kids, vec!["a", "b", "a"]);
        assert_eq!(keys[1].modulus(), &[1, 0, 2]);
    }

    #[tokio::test]
    async fn test_discovery_document_follows_jwks_uri() {
        let discovery = r#"{"issuer":"https://idp.example.com","jwks_uri":"https://keys.example.com/certs"}"#;
        let key_set = r#"{"keys":[
            {"kty":"RSA","n":"AQAB","e":"AQAB","kid":"sig-key","use":"sig"},
            {"kty":"RSA","n":"AQAB","e":"AQAB","kid":"enc-key","use":"enc"}
        ]}"#;
        let retriever = StaticRetriever::serving(&[
            ("https://idp.example.com/.well-known/openid-configuration", discovery),
            ("https://keys.example.com/certs", key_set),
        ]);
        let provider = provider(
            "https://idp.example.com",
            "/.well-known/openid-configuration",
            retriever.clone(),
        );
        assert_eq!(provider.kind(), DocumentKind::Discovery);

        let configuration = provider.configuration().await.unwrap();
        let configuration = configuration.value();
        assert_eq!(configuration.issuer.as_deref(), Some("https://idp.example.com"));
        assert_eq!(configuration.jwks_uri, "https://keys.example.com/certs");
        assert_eq!(configuration.keys.len(), 1);
        assert_eq!(configuration.keys[0].key_id(), "sig-key");
        assert_eq!(retriever.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_discovery_rejects_insecure_jwks_uri() {
        let discovery = r#"{"jwks_uri":"http://idp.example.com/certs"}"#;
        let retriever = StaticRetriever::serving(&[(
            "https://idp.example.com/.well-known/openid-configuration",
            discovery,
        )]);
        let provider = provider(
            "https://idp.example.com",
            "/.well-known/openid-configuration",
            retriever.clone(),
        );

        let err = provider.issuer_signing_keys().await.unwrap_err();
        let cause = unavailable_cause(err);
        assert!(matches!(*cause, KeyProviderError::InsecureTransportRejected { .. }));
        assert_eq!(retriever.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_issuer_is_unavailable() {
        let retriever = StaticRetriever::serving(&[]);
        let provider = provider("https://idp.example.com", "/jwks", retriever);

        let err = provider.issuer_signing_keys().await.unwrap_err();
        let cause = unavailable_cause(err);
        assert!(matches!(*cause, KeyProviderError::DocumentFetchFailed { .. }));
        assert!(provider.last_error().is_some());
    }

    #[tokio::test]
    async fn test_malformed_document_is_unavailable() {
        let retriever = StaticRetriever::serving(&[("https://idp.example.com/jwks", "<html>")]);
        let provider = provider("https://idp.example.com", "/jwks", retriever);

        let err = provider.issuer_signing_keys().await.unwrap_err();
        let cause = unavailable_cause(err);
        assert!(matches!(*cause, KeyProviderError::DocumentParseFailed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_cold_calls_fetch_once() {
        let retriever = StaticRetriever::serving_with_delay(
            &[("https://idp.example.com/jwks", JWKS_ONE_KEY)],
            Duration::from_millis(200),
        );
        let provider = provider("https://idp.example.com", "/jwks", retriever.clone());

        let calls = (0..10).map(|_| provider.issuer_signing_keys());
        let results = futures::future::join_all(calls).await;

        assert!(results.iter().all(|r| r.as_ref().map(Vec::len).ok() == Some(1)));
        assert_eq!(retriever.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_refresh_refetches_within_interval() {
        let url = "https://idp.example.com/jwks";
        let retriever = StaticRetriever::serving(&[(url, JWKS_ONE_KEY)]);
        let provider = provider("https://idp.example.com", "/jwks", retriever.clone());

        provider.issuer_signing_keys().await.unwrap();
        provider.issuer_signing_keys().await.unwrap();
        assert_eq!(retriever.requests().len(), 1);

        retriever.set(url, r#"{"keys":[{"kty":"RSA","n":"AQAB","e":"AQAB","kid":"key2"}]}"#);
        provider.request_refresh();

        let keys = provider.issuer_signing_keys().await.unwrap();
        assert_eq!(keys[0].key_id(), "key2");
        assert_eq!(retriever.requests().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_refresh_ignored_when_never_refreshing() {
        let url = "https://idp.example.com/jwks";
        let retriever = StaticRetriever::serving(&[(url, JWKS_ONE_KEY)]);
        let mut settings = OidcSettings::new("https://idp.example.com", "/jwks");
        settings.never_refresh = true;
        let provider = SigningKeyProvider::with_retriever(&settings, retriever.clone()).unwrap();
        assert_eq!(provider.refresh_interval(), RefreshInterval::Never);

        provider.issuer_signing_keys().await.unwrap();
        provider.request_refresh();
        tokio::time::advance(Duration::from_secs(3600)).await;
        provider.issuer_signing_keys().await.unwrap();
        assert_eq!(retriever.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_keys_served_when_refresh_fails() {
        let url = "https://idp.example.com/jwks";
        let retriever = StaticRetriever::serving(&[(url, JWKS_ONE_KEY)]);
        let provider = provider("https://idp.example.com", "/jwks", retriever.clone());

        provider.issuer_signing_keys().await.unwrap();
        retriever.remove(url);
        tokio::time::advance(Duration::from_secs(31)).await;

        let keys = provider.issuer_signing_keys().await.unwrap();
        assert_eq!(keys[0].key_id(), "key1");
        assert_eq!(retriever.requests().len(), 2);
        assert!(matches!(
            provider.last_error().as_deref(),
            Some(KeyProviderError::DocumentFetchFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_http_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tenant/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_string(JWKS_ONE_KEY))
            .expect(1)
            .mount(&server)
            .await;

        let settings = OidcSettings::new(format!("{}/tenant", server.uri()), "/jwks");
        let provider = SigningKeyProvider::new(&settings).unwrap();
        assert!(!provider.requires_https());

        let keys = provider.issuer_signing_keys().await.unwrap();
        assert_eq!(keys[0].key_id(), "key1");
        // Second call is served from the cache; the mock expects one request.
        provider.issuer_signing_keys().await.unwrap();
    }
}
