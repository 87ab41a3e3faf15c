//! Venue connectivity diagnostics.
//!
//! Runs the staged probe against the venue's own status endpoint through the
//! selected egress profile, then checks that an auth-protected endpoint is
//! reachable, and flattens everything into one report.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use crate::config::VenueConfig;
use crate::probe::{ProbeError, ProbeOutcome, ProbeTarget, Stage, StageStatus};
use crate::profile::{mask_credentials, Profile, ProfileKind};
use crate::selector::ProxySelector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VenueStatus {
    Ok,
    Degraded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceStatus {
    Ok,
    Failed,
    Skipped,
    NotRun,
}

/// Evidence for one step of the diagnostic.
#[derive(Debug, Clone, Serialize)]
pub struct StageEvidence {
    pub status: EvidenceStatus,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl StageEvidence {
    fn not_run() -> Self {
        Self {
            status: EvidenceStatus::NotRun,
            elapsed_ms: 0,
            detail: None,
        }
    }

    fn ok(elapsed_ms: u64, detail: impl Into<String>) -> Self {
        Self {
            status: EvidenceStatus::Ok,
            elapsed_ms,
            detail: Some(detail.into()),
        }
    }

    fn failed(elapsed_ms: u64, detail: impl Into<String>) -> Self {
        Self {
            status: EvidenceStatus::Failed,
            elapsed_ms,
            detail: Some(mask_credentials(&detail.into())),
        }
    }

    fn from_stage(outcome: &ProbeOutcome, stage: Stage) -> Self {
        match outcome.stage(stage) {
            Some(report) => Self {
                status: match report.status {
                    StageStatus::Ok => EvidenceStatus::Ok,
                    StageStatus::Failed => EvidenceStatus::Failed,
                    StageStatus::Skipped => EvidenceStatus::Skipped,
                },
                elapsed_ms: report.elapsed_ms,
                detail: report.detail.as_deref().map(mask_credentials),
            },
            None => Self::not_run(),
        }
    }
}

/// Flattened venue diagnostic.
#[derive(Debug, Clone, Serialize)]
pub struct VenueReport {
    pub status: VenueStatus,
    pub reason: String,
    pub checked_at: DateTime<Utc>,
    pub target: String,
    pub profile_used: Option<String>,
    pub profile_kind: Option<ProfileKind>,
    pub selection_reason: String,
    pub dns: StageEvidence,
    pub tcp: StageEvidence,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<StageEvidence>,
    pub tls: StageEvidence,
    pub https: StageEvidence,
    pub auth_test: StageEvidence,
}

impl VenueReport {
    fn failed(
        checked_at: DateTime<Utc>,
        target: &str,
        selection_reason: String,
        reason: String,
    ) -> Self {
        Self {
            status: VenueStatus::Failed,
            reason,
            checked_at,
            target: target.to_string(),
            profile_used: None,
            profile_kind: None,
            selection_reason,
            dns: StageEvidence::not_run(),
            tcp: StageEvidence::not_run(),
            tunnel: None,
            tls: StageEvidence::not_run(),
            https: StageEvidence::not_run(),
            auth_test: StageEvidence::not_run(),
        }
    }
}

/// Venue diagnostics runner.
pub struct VenueDiagnostics {
    selector: Arc<ProxySelector>,
    status_target: ProbeTarget,
    auth_url: String,
}

impl VenueDiagnostics {
    pub fn new(selector: Arc<ProxySelector>, venue: &VenueConfig) -> Result<Self, ProbeError> {
        Ok(Self {
            selector,
            status_target: ProbeTarget::parse(&venue.status_url())?,
            auth_url: venue.auth_url(),
        })
    }

    /// Run the diagnostic. Failures are reported in the result, never returned.
    pub async fn run(&self) -> VenueReport {
        let checked_at = self.selector.now();
        let decision = self.selector.select_best_profile().await;
        let registry = self.selector.registry();

        let chosen = decision.chosen.as_deref().and_then(|n| registry.get(n));
        let (profile, selection_reason) = match chosen {
            Some(profile) => (Some(profile), decision.reason.clone()),
            None => (
                registry.list_enabled().into_iter().next(),
                format!(
                    "{}; falling back to first enabled profile",
                    decision.failure_reason.as_deref().unwrap_or(&decision.reason)
                ),
            ),
        };

        let target = self.status_target.url.as_str();
        let Some(profile) = profile else {
            return VenueReport::failed(
                checked_at,
                target,
                selection_reason,
                "no enabled profiles configured".to_string(),
            );
        };

        let timeout = self.selector.settings().probe_timeout;
        let probed = self
            .selector
            .prober()
            .probe(profile, &self.status_target, timeout)
            .await;
        let outcome = match probed {
            Ok(outcome) => outcome,
            Err(e) => {
                let reason = format!("probe could not run: {}", e);
                let mut report = VenueReport::failed(checked_at, target, selection_reason, reason);
                report.profile_used = Some(profile.name.clone());
                report.profile_kind = Some(profile.kind);
                return report;
            }
        };

        let mut report = VenueReport {
            status: VenueStatus::Failed,
            reason: String::new(),
            checked_at,
            target: target.to_string(),
            profile_used: Some(profile.name.clone()),
            profile_kind: Some(profile.kind),
            selection_reason,
            dns: StageEvidence::from_stage(&outcome, Stage::Dns),
            tcp: StageEvidence::from_stage(&outcome, Stage::Tcp),
            tunnel: match profile.kind {
                ProfileKind::Direct => None,
                _ => Some(StageEvidence::from_stage(&outcome, Stage::Tunnel)),
            },
            tls: StageEvidence::from_stage(&outcome, Stage::Tls),
            https: StageEvidence::from_stage(&outcome, Stage::Http),
            auth_test: StageEvidence::not_run(),
        };

        if !outcome.ok {
            report.reason = format!(
                "venue status check via {} failed: {} ({}): {}",
                profile.name,
                outcome.error_class.map_or("unknown", |c| c.as_str()),
                outcome.error_code.as_deref().unwrap_or("UNKNOWN"),
                outcome.error_message.as_deref().unwrap_or("no detail")
            );
            tracing::warn!("Venue diagnostics: {}", report.reason);
            return report;
        }

        report.auth_test = self.auth_test(profile).await;
        if report.auth_test.status == EvidenceStatus::Ok {
            report.status = VenueStatus::Ok;
            report.reason = format!(
                "venue reachable via {} (HTTP {} in {}ms), auth layer answered",
                profile.name,
                outcome.http_status.unwrap_or_default(),
                outcome.latency_ms.unwrap_or_default()
            );
        } else {
            report.status = VenueStatus::Degraded;
            report.reason = format!(
                "venue reachable via {} but auth test failed: {}",
                profile.name,
                report.auth_test.detail.as_deref().unwrap_or("no detail")
            );
            tracing::warn!("Venue diagnostics: {}", report.reason);
        }

        report
    }

    /// Unauthenticated request to an auth-protected path through `profile`.
    async fn auth_test(&self, profile: &Profile) -> StageEvidence {
        let client = match self.selector.client_for(profile) {
            Ok(client) => client,
            Err(e) => return StageEvidence::failed(0, e.to_string()),
        };

        let started = Instant::now();
        let response = client.get(&self.auth_url).send().await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match response {
            Ok(resp) => classify_auth_status(resp.status().as_u16(), elapsed_ms),
            Err(e) => StageEvidence::failed(elapsed_ms, describe_request_error(&e)),
        }
    }
}

/// 401 and 2xx mean the auth layer is reachable; 403 means the egress is blocked.
fn classify_auth_status(status: u16, elapsed_ms: u64) -> StageEvidence {
    match status {
        401 => StageEvidence::ok(elapsed_ms, "HTTP 401: auth layer reachable"),
        200..=299 => StageEvidence::ok(elapsed_ms, format!("HTTP {}", status)),
        403 => StageEvidence::failed(elapsed_ms, "HTTP 403: blocked (geo or IP restriction)"),
        _ => StageEvidence::failed(
            elapsed_ms,
            format!("HTTP {}: unexpected auth response", status),
        ),
    }
}

fn describe_request_error(error: &reqwest::Error) -> String {
    let kind = if error.is_timeout() {
        "timed out"
    } else if error.is_connect() {
        "connection failed"
    } else if error.is_redirect() {
        "redirect error"
    } else if error.is_request() {
        "request error"
    } else {
        "transport error"
    };
    mask_credentials(&format!("{}: {}", kind, error))
}
