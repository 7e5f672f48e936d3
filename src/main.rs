//! OIDC Signing Key Tool
//!
//! Fetches the signing keys of an OpenID Connect issuer through the caching
//! key provider and prints them. Can keep watching the issuer for key
//! rotation, or verify a bearer token against the keys.

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use clap::Parser;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

use oidc_signing_keys::oidc::{
    verify_token, OidcSettings, OidcSettingsJson, SigningKey, SigningKeyProvider, VerifyOptions,
};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "oidc-signing-keys")]
#[command(about = "Fetch and cache the signing keys of an OpenID Connect issuer")]
struct Args {
    /// Issuer base URL, e.g. https://idp.example.com
    #[arg(long, env = "OIDC_ISSUER_URL")]
    issuer_url: Option<String>,

    /// Path appended to the issuer URL (discovery document or JWKS endpoint)
    #[arg(long, env = "OIDC_VALIDATION_PATH")]
    validation_path: Option<String>,

    /// Seconds fetched keys stay fresh
    #[arg(long, env = "OIDC_REFRESH_INTERVAL_SECS")]
    refresh_interval_secs: Option<u64>,

    /// Fetch keys once and never refresh them
    #[arg(long, env = "OIDC_NEVER_REFRESH")]
    never_refresh: bool,

    /// JSON settings file, applied over command line values
    #[arg(long, env = "OIDC_CONFIG")]
    config: Option<PathBuf>,

    /// Keep running and re-read the keys every N seconds
    #[arg(long)]
    watch_secs: Option<u64>,

    /// Verify this bearer token instead of listing keys
    #[arg(long)]
    verify_token: Option<String>,

    /// Expected token issuer (iss claim)
    #[arg(long, env = "OIDC_EXPECTED_ISSUER")]
    expected_issuer: Option<String>,

    /// Expected token audience (aud claim)
    #[arg(long, env = "OIDC_AUDIENCE")]
    audience: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, env = "OIDC_VERBOSE")]
    verbose: bool,
}

/// Printable view of a signing key.
#[derive(Debug, Serialize)]
struct KeySummary {
    kid: String,
    kty: String,
    modulus_bits: usize,
    e: String,
}

impl From<&SigningKey> for KeySummary {
    fn from(key: &SigningKey) -> Self {
        Self {
            kid: key.key_id().to_string(),
            kty: key.key_type().to_string(),
            modulus_bits: key.modulus_bits(),
            e: URL_SAFE_NO_PAD.encode(key.exponent()),
        }
    }
}

fn load_settings_file(path: &Path) -> Result<OidcSettingsJson> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file: {:?}", path))?;
    serde_json::from_str(&data).with_context(|| format!("Failed to parse settings file: {:?}", path))
}

fn settings_from_args(args: &Args) -> Result<OidcSettings> {
    let mut settings = OidcSettings::default();

    if let Some(ref issuer_url) = args.issuer_url {
        settings.issuer_url = issuer_url.clone();
    }
    if let Some(ref path) = args.validation_path {
        settings.validation_path = path.clone();
    }
    if let Some(refresh) = args.refresh_interval_secs {
        settings.refresh_interval_secs = refresh;
    }
    settings.never_refresh = args.never_refresh;

    if let Some(ref path) = args.config {
        load_settings_file(path)?.apply_to(&mut settings);
    }

    settings
        .validate()
        .map_err(|e| anyhow!("Invalid settings: {}", e))?;

    Ok(settings)
}

fn summarize(keys: &[SigningKey]) -> Vec<KeySummary> {
    keys.iter().map(KeySummary::from).collect()
}

fn key_ids(keys: &[SigningKey]) -> BTreeSet<String> {
    keys.iter().map(|k| k.key_id().to_string()).collect()
}

async fn print_keys(provider: &SigningKeyProvider) -> Result<Vec<SigningKey>> {
    let keys = provider
        .issuer_signing_keys()
        .await
        .context("Failed to obtain issuer signing keys")?;

    println!("{}", serde_json::to_string_pretty(&summarize(&keys))?);
    Ok(keys)
}

/// Re-read the keys on an interval until interrupted, reporting rotation.
async fn watch(provider: &SigningKeyProvider, mut known: BTreeSet<String>, every: Duration) -> Result<()> {
    let mut ticker = interval(every);

    // Skip the first immediate tick
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping");
                return Ok(());
            }
        }

        match provider.issuer_signing_keys().await {
            Ok(keys) => {
                let current = key_ids(&keys);
                if current != known {
                    let added: Vec<&String> = current.difference(&known).collect();
                    let removed: Vec<&String> = known.difference(&current).collect();
                    info!(added = ?added, removed = ?removed, "Signing keys rotated");
                    println!("{}", serde_json::to_string_pretty(&summarize(&keys))?);
                    known = current;
                } else {
                    debug!(key_count = keys.len(), "Signing keys unchanged");
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to read signing keys");
            }
        }

        if let Some(e) = provider.last_error() {
            debug!(error = %e, "Last refresh failed, serving cached keys");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("{}={}", env!("CARGO_CRATE_NAME"), log_level))
        .with_writer(std::io::stderr)
        .json()
        .init();

    let settings = settings_from_args(&args)?;

    info!(
        url = %settings.document_url(),
        refresh_interval = ?settings.refresh_interval(),
        "Settings loaded"
    );

    let provider = SigningKeyProvider::new(&settings).context("Failed to create key provider")?;

    if let Some(ref token) = args.verify_token {
        let options = VerifyOptions {
            issuer: args.expected_issuer.clone(),
            audience: args.audience.clone(),
            ..VerifyOptions::default()
        };
        let data = verify_token::<serde_json::Value>(&provider, token, &options)
            .await
            .context("Token verification failed")?;
        println!("{}", serde_json::to_string_pretty(&data.claims)?);
        return Ok(());
    }

    let keys = print_keys(&provider).await?;

    if let Some(secs) = args.watch_secs {
        if secs == 0 {
            return Err(anyhow!("--watch-secs must be greater than zero"));
        }
        info!(every_secs = secs, "Watching signing keys");
        watch(&provider, key_ids(&keys), Duration::from_secs(secs)).await?;
    }

    Ok(())
}
