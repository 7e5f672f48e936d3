//! OIDC signing key settings.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::cache::RefreshInterval;

/// Path of the standard OIDC discovery document.
pub const DISCOVERY_PATH: &str = "/.well-known/openid-configuration";

/// Where and how often signing keys are fetched.
///
/// `issuer_url` and `validation_path` are stored exactly as given and joined
/// without a separator, so `https://idp.example.com` + `/jwks` fetches
/// `https://idp.example.com/jwks`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OidcSettings {
    /// Issuer base URL.
    /// Example: "https://auth.example.com"
    #[serde(default)]
    pub issuer_url: String,

    /// Path appended to the issuer URL. A path containing "jwks" (any case)
    /// is read as a raw key set, anything else as a discovery document.
    #[serde(default = "default_validation_path")]
    pub validation_path: String,

    /// Seconds a fetched key set stays fresh.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,

    /// Fetch keys once and never refresh them.
    #[serde(default)]
    pub never_refresh: bool,

    /// Timeout for a single document request, in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_validation_path() -> String {
    DISCOVERY_PATH.to_string()
}

fn default_refresh_interval() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    10
}

impl Default for OidcSettings {
    fn default() -> Self {
        Self {
            issuer_url: String::new(),
            validation_path: default_validation_path(),
            refresh_interval_secs: default_refresh_interval(),
            never_refresh: false,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl OidcSettings {
    pub fn new(issuer_url: impl Into<String>, validation_path: impl Into<String>) -> Self {
        Self {
            issuer_url: issuer_url.into(),
            validation_path: validation_path.into(),
            ..Self::default()
        }
    }

    /// URL of the document holding (or pointing to) the keys.
    pub fn document_url(&self) -> String {
        format!("{}{}", self.issuer_url, self.validation_path)
    }

    pub fn refresh_interval(&self) -> RefreshInterval {
        if self.never_refresh {
            RefreshInterval::Never
        } else {
            RefreshInterval::Every(Duration::from_secs(self.refresh_interval_secs))
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Validate the settings.
    pub fn validate(&self) -> Result<(), String> {
        if self.issuer_url.trim().is_empty() {
            return Err("OIDC issuer_url is required".to_string());
        }

        let scheme = self.issuer_url.split_once("://").map(|(scheme, _)| scheme);
        if !scheme.is_some_and(|s| s.eq_ignore_ascii_case("https") || s.eq_ignore_ascii_case("http")) {
            return Err("OIDC issuer_url must be a valid HTTP(S) URL".to_string());
        }

        if !self.never_refresh && self.refresh_interval_secs == 0 {
            return Err("OIDC refresh_interval_secs must be greater than zero".to_string());
        }

        if self.request_timeout_secs == 0 {
            return Err("OIDC request_timeout_secs must be greater than zero".to_string());
        }

        Ok(())
    }
}

/// JSON settings file layered over command line values.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct OidcSettingsJson {
    pub issuer_url: Option<String>,
    pub validation_path: Option<String>,
    pub refresh_interval_secs: Option<u64>,
    pub never_refresh: Option<bool>,
    pub request_timeout_secs: Option<u64>,
}

impl OidcSettingsJson {
    /// Apply JSON settings to existing settings.
    pub fn apply_to(&self, settings: &mut OidcSettings) {
        if let Some(ref issuer_url) = self.issuer_url {
            settings.issuer_url = issuer_url.clone();
        }
        if let Some(ref path) = self.validation_path {
            settings.validation_path = path.clone();
        }
        if let Some(refresh) = self.refresh_interval_secs {
            settings.refresh_interval_secs = refresh;
        }
        if let Some(never) = self.never_refresh {
            settings.never_refresh = never;
        }
        if let Some(timeout) = self.request_timeout_secs {
            settings.request_timeout_secs = timeout;
        }
    }
}
