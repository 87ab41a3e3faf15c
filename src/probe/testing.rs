//! Scripted prober for selector and handler tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use super::{
    ErrorClass, ProbeError, ProbeOutcome, ProbeTarget, Prober, Stage, StageFailure, StageReport,
    StageStatus,
};
use crate::profile::Profile;

/// A successful outcome with the given status and latency.
pub fn ok(status: u16, latency_ms: u64) -> ProbeOutcome {
    ProbeOutcome::success(
        status,
        latency_ms,
        vec![StageReport {
            stage: Stage::Http,
            status: StageStatus::Ok,
            elapsed_ms: latency_ms,
            detail: Some(format!("HTTP {}", status)),
        }],
    )
}

/// A failed outcome of the given class.
pub fn failed(class: ErrorClass, code: &str) -> ProbeOutcome {
    let stage = match class {
        ErrorClass::Dns => Stage::Dns,
        ErrorClass::Tcp => Stage::Tcp,
        ErrorClass::Tls => Stage::Tls,
        _ => Stage::Http,
    };
    let failure = StageFailure::new(stage, class, code, format!("scripted {} failure", class));
    let report = StageReport {
        stage,
        status: StageStatus::Failed,
        elapsed_ms: 1,
        detail: Some(failure.message.clone()),
    };
    ProbeOutcome::failure(failure, 1, vec![report])
}

/// Returns preset outcomes per profile name; unscripted profiles succeed.
#[derive(Default)]
pub struct ScriptedProber {
    script: Mutex<HashMap<String, (ProbeOutcome, Duration)>>,
    broken: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, profile: &str, outcome: ProbeOutcome) {
        self.set_delayed(profile, outcome, Duration::ZERO);
    }

    pub fn set_delayed(&self, profile: &str, outcome: ProbeOutcome, delay: Duration) {
        self.script
            .lock()
            .unwrap()
            .insert(profile.to_string(), (outcome, delay));
    }

    /// Make probes of `profile` return a configuration error.
    pub fn break_profile(&self, profile: &str) {
        self.broken.lock().unwrap().insert(profile.to_string());
    }

    /// Profile names probed so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(
        &self,
        profile: &Profile,
        _target: &ProbeTarget,
        timeout: Duration,
    ) -> Result<ProbeOutcome, ProbeError> {
        if !profile.enabled {
            return Err(ProbeError::Disabled(profile.name.clone()));
        }
        self.calls.lock().unwrap().push(profile.name.clone());
        if self.broken.lock().unwrap().contains(&profile.name) {
            return Err(ProbeError::InvalidTarget(format!("scripted error for {}", profile.name)));
        }

        let scripted = self.script.lock().unwrap().get(&profile.name).cloned();
        let (outcome, delay) = scripted.unwrap_or_else(|| (ok(200, 10), Duration::ZERO));

        if delay >= timeout {
            tokio::time::sleep(timeout).await;
            let failure = StageFailure::timeout(Stage::Http);
            return Ok(ProbeOutcome::failure(failure, timeout.as_millis() as u64, vec![]));
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(outcome)
    }
}
