//! Probe module for egress profiles.
//!
//! A probe walks the path a real request would take through a profile
//! (DNS, TCP, proxy tunnel, TLS, HTTP) and stops at the first failing stage.
//! Network failures are reported as data in [`ProbeOutcome`]; only
//! configuration mistakes surface as [`ProbeError`].

mod dns;
mod http;
mod network;
mod tls;
mod tunnel;

#[cfg(test)]
pub mod testing;

pub use network::*;

use crate::config::ConfigError;
use crate::profile::{mask_credentials, Profile};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Probe error types. Stage failures are never returned through this type.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("invalid probe target: {0}")]
    InvalidTarget(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("profile '{0}' is disabled")]
    Disabled(String),
}

/// One step of a probe, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Dns,
    Tcp,
    Tunnel,
    Tls,
    Http,
}

impl Stage {
    fn code(&self) -> &'static str {
        match self {
            Stage::Dns => "DNS",
            Stage::Tcp => "TCP",
            Stage::Tunnel => "TUNNEL",
            Stage::Tls => "TLS",
            Stage::Http => "HTTP",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code().to_ascii_lowercase())
    }
}

/// Failure classification reported in `error_class`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    Dns,
    Tcp,
    Tls,
    Http,
    Auth,
    Timeout,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Dns => "dns",
            ErrorClass::Tcp => "tcp",
            ErrorClass::Tls => "tls",
            ErrorClass::Http => "http",
            ErrorClass::Auth => "auth",
            ErrorClass::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Ok,
    Failed,
    Skipped,
}

/// Evidence recorded for one stage of a probe.
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub status: StageStatus,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Why a stage failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    pub stage: Stage,
    pub class: ErrorClass,
    pub code: String,
    pub message: String,
    /// Set when the failure is an HTTP response from the target.
    pub http_status: Option<u16>,
}

impl StageFailure {
    pub fn new(stage: Stage, class: ErrorClass, code: &str, message: impl Into<String>) -> Self {
        Self {
            stage,
            class,
            code: code.to_string(),
            message: message.into(),
            http_status: None,
        }
    }

    pub fn timeout(stage: Stage) -> Self {
        Self::new(
            stage,
            ErrorClass::Timeout,
            &format!("TIMEOUT_{}", stage.code()),
            format!("probe deadline exceeded during {} stage", stage),
        )
    }
}

/// Classify a target HTTP status. `None` means the probe succeeded.
pub fn classify_status(status: u16) -> Option<StageFailure> {
    let class = match status {
        100..=399 => return None,
        401 | 403 => ErrorClass::Auth,
        _ => ErrorClass::Http,
    };
    let mut failure = StageFailure::new(
        Stage::Http,
        class,
        &format!("HTTP_{}", status),
        format!("target answered HTTP {}", status),
    );
    failure.http_status = Some(status);
    Some(failure)
}

/// What a prober observed, before it is stamped into a [`ProbeResult`].
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub ok: bool,
    pub http_status: Option<u16>,
    pub latency_ms: Option<u64>,
    pub error_class: Option<ErrorClass>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub stages: Vec<StageReport>,
}

impl ProbeOutcome {
    pub fn success(http_status: u16, latency_ms: u64, stages: Vec<StageReport>) -> Self {
        Self {
            ok: true,
            http_status: Some(http_status),
            latency_ms: Some(latency_ms),
            error_class: None,
            error_code: None,
            error_message: None,
            stages,
        }
    }

    /// A failed probe. Latency is only kept when the HTTP layer answered.
    pub fn failure(failure: StageFailure, latency_ms: u64, stages: Vec<StageReport>) -> Self {
        Self {
            ok: false,
            http_status: failure.http_status,
            latency_ms: failure.http_status.map(|_| latency_ms),
            error_class: Some(failure.class),
            error_code: Some(failure.code),
            error_message: Some(mask_credentials(&failure.message)),
            stages,
        }
    }

    /// Report of a given stage, if it ran or was skipped.
    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|r| r.stage == stage)
    }
}

/// The stored outcome of one probe of one profile.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub profile_name: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub checked_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<DateTime<Utc>>,
    pub stages: Vec<StageReport>,
}

impl ProbeResult {
    pub fn from_outcome(
        profile_name: &str,
        outcome: ProbeOutcome,
        checked_at: DateTime<Utc>,
        cooldown_until: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            profile_name: profile_name.to_string(),
            ok: outcome.ok,
            http_status: outcome.http_status,
            latency_ms: outcome.latency_ms,
            error_class: outcome.error_class,
            error_code: outcome.error_code,
            error_message: outcome.error_message,
            checked_at,
            cooldown_until,
            stages: outcome.stages,
        }
    }

    /// Short human summary of the failure, e.g. `timeout (TIMEOUT_TCP): ...`.
    pub fn failure_summary(&self) -> Option<String> {
        let class = self.error_class?;
        Some(format!(
            "{} ({}): {}",
            class,
            self.error_code.as_deref().unwrap_or("UNKNOWN"),
            self.error_message.as_deref().unwrap_or("no detail")
        ))
    }
}

/// The URL a probe is run against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub url: String,
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub path: String,
}

impl ProbeTarget {
    pub fn parse(raw: &str) -> Result<Self, ProbeError> {
        let url =
            Url::parse(raw).map_err(|e| ProbeError::InvalidTarget(format!("{}: {}", raw, e)))?;
        let tls = match url.scheme() {
            "https" => true,
            "http" => false,
            other => {
                return Err(ProbeError::InvalidTarget(format!(
                    "unsupported scheme '{}'",
                    other
                )))
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| ProbeError::InvalidTarget(format!("{}: missing host", raw)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| ProbeError::InvalidTarget(format!("{}: missing port", raw)))?;

        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        Ok(Self {
            url: url.to_string(),
            host,
            port,
            tls,
            path,
        })
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Value for the `Host` header; default ports are omitted.
    pub fn host_header(&self) -> String {
        let default_port = if self.tls { 443 } else { 80 };
        if self.port == default_port {
            if self.host.contains(':') {
                format!("[{}]", self.host)
            } else {
                self.host.clone()
            }
        } else {
            self.authority()
        }
    }
}

/// Runs one end-to-end probe of a profile.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Probe `target` through `profile`, bounded by `timeout` overall.
    async fn probe(
        &self,
        profile: &Profile,
        target: &ProbeTarget,
        timeout: Duration,
    ) -> Result<ProbeOutcome, ProbeError>;
}
