//! Configuration module for egresswatch.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::profile::{mask_credentials, Profile, ProfileKind};

/// Configuration errors. These stop startup or fail a health check outright;
/// they are never reported as a probe outcome.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("profile name must not be empty")]
    EmptyName,
    #[error("duplicate profile name: {0}")]
    DuplicateName(String),
    #[error("invalid descriptor for profile '{profile}': {reason}")]
    InvalidDescriptor { profile: String, reason: String },
    #[error("invalid profile JSON: {0}")]
    ProfileJson(#[from] serde_json::Error),
    #[error("cannot read profile file {path:?}: {source}")]
    ProfileFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("unsupported proxy URL: {0}")]
    UnsupportedProxy(String),
}

/// Venue endpoints used by the connectivity diagnostic.
#[derive(Debug, Clone)]
pub struct VenueConfig {
    pub base_url: String,
    pub status_path: String,
    pub auth_path: String,
}

impl Default for VenueConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.elections.kalshi.com/trade-api/v2".to_string(),
            status_path: "/exchange/status".to_string(),
            auth_path: "/portfolio/balance".to_string(),
        }
    }
}

impl VenueConfig {
    pub fn status_url(&self) -> String {
        join_url(&self.base_url, &self.status_path)
    }

    pub fn auth_url(&self) -> String {
        join_url(&self.base_url, &self.auth_path)
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 8080)
    pub http_port: u16,
    /// URL every profile is probed against
    pub target_url: String,
    /// Bound on one whole probe, all stages included (default: 5s)
    pub probe_timeout: Duration,
    /// Selection suppression after a failed probe (default: 300s)
    pub cooldown: Duration,
    /// Background refresh period; `None` keeps probing request-driven only
    pub refresh_interval: Option<Duration>,
    /// Probe results retained per profile for diagnostics
    pub history_len: usize,
    /// Egress profiles in configuration order
    pub profiles: Vec<Profile>,
    pub venue: VenueConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            target_url: "https://api.elections.kalshi.com/trade-api/v2/exchange/status".to_string(),
            probe_timeout: Duration::from_millis(5000),
            cooldown: Duration::from_secs(300),
            refresh_interval: None,
            history_len: 20,
            profiles: vec![Profile::direct("direct")],
            venue: VenueConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `EGRESSWATCH_HTTP_PORT`: HTTP port (default: 8080)
    /// - `EGRESSWATCH_TARGET_URL`: probe target URL
    /// - `EGRESSWATCH_PROBE_TIMEOUT_MS`: per-probe timeout (default: 5000)
    /// - `EGRESSWATCH_COOLDOWN_SECS`: cooldown after a failure (default: 300)
    /// - `EGRESSWATCH_REFRESH_SECS`: background refresh period, 0 disables (default: 0)
    /// - `EGRESSWATCH_HISTORY_LEN`: results kept per profile (default: 20)
    /// - `EGRESSWATCH_PROFILES`: JSON array of profiles
    /// - `EGRESSWATCH_PROFILES_FILE`: path to a JSON array of profiles
    /// - `EGRESSWATCH_PROXY_URLS`: comma separated proxy URLs, added after `direct`
    /// - `EGRESSWATCH_VENUE_BASE_URL`, `EGRESSWATCH_VENUE_STATUS_PATH`,
    ///   `EGRESSWATCH_VENUE_AUTH_PATH`: venue diagnostic endpoints
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn load_from<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        cfg.http_port = parse_var(&lookup, "EGRESSWATCH_HTTP_PORT", cfg.http_port);

        if let Some(url) = lookup("EGRESSWATCH_TARGET_URL") {
            cfg.target_url = url;
        }

        let timeout_ms = parse_var(&lookup, "EGRESSWATCH_PROBE_TIMEOUT_MS", 5000u64);
        if timeout_ms > 0 {
            cfg.probe_timeout = Duration::from_millis(timeout_ms);
        }

        cfg.cooldown = Duration::from_secs(parse_var(&lookup, "EGRESSWATCH_COOLDOWN_SECS", 300u64));

        let refresh = parse_var(&lookup, "EGRESSWATCH_REFRESH_SECS", 0u64);
        cfg.refresh_interval = (refresh > 0).then(|| Duration::from_secs(refresh));

        cfg.history_len = parse_var(&lookup, "EGRESSWATCH_HISTORY_LEN", cfg.history_len);

        if let Some(base) = lookup("EGRESSWATCH_VENUE_BASE_URL") {
            cfg.venue.base_url = base;
        }
        if let Some(path) = lookup("EGRESSWATCH_VENUE_STATUS_PATH") {
            cfg.venue.status_path = path;
        }
        if let Some(path) = lookup("EGRESSWATCH_VENUE_AUTH_PATH") {
            cfg.venue.auth_path = path;
        }

        if let Some(json) = lookup("EGRESSWATCH_PROFILES") {
            cfg.profiles = serde_json::from_str(&json)?;
        } else if let Some(path) = lookup("EGRESSWATCH_PROFILES_FILE") {
            cfg.profiles = load_profiles_file(PathBuf::from(path))?;
        } else if let Some(urls) = lookup("EGRESSWATCH_PROXY_URLS") {
            cfg.profiles.extend(profiles_from_proxy_urls(&urls)?);
        }

        Ok(cfg)
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!("Ignoring unparseable {}={:?}, using default", key, raw);
                default
            }
        },
        None => default,
    }
}

fn load_profiles_file(path: PathBuf) -> Result<Vec<Profile>, ConfigError> {
    let contents = std::fs::read_to_string(&path)
        .map_err(|source| ConfigError::ProfileFile { path, source })?;
    Ok(serde_json::from_str(&contents)?)
}

/// Turn `EGRESSWATCH_PROXY_URLS` into `proxy-1`, `proxy-2`, ... profiles.
fn profiles_from_proxy_urls(urls: &str) -> Result<Vec<Profile>, ConfigError> {
    urls.split(',')
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .enumerate()
        .map(|(i, raw)| {
            let scheme = raw.split("://").next().unwrap_or_default().to_ascii_lowercase();
            let kind = ProfileKind::from_scheme(&scheme)
                .ok_or_else(|| ConfigError::UnsupportedProxy(mask_credentials(raw)))?;
            Ok(Profile::proxy(&format!("proxy-{}", i + 1), kind, raw))
        })
        .collect()
}
