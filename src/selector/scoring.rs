//! Best-profile selection over stored probe results.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::probe::ProbeResult;
use crate::profile::Profile;

/// Display label when nothing qualifies.
pub const NO_PROFILE_LABEL: &str = "None (all failed)";

/// Outcome of scoring all candidates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectionDecision {
    pub ok: bool,
    pub chosen: Option<String>,
    /// Chosen name, or [`NO_PROFILE_LABEL`].
    pub active: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub candidates: usize,
}

/// Why an enabled profile is not a candidate.
enum Exclusion<'a> {
    Failed(&'a ProbeResult),
    CoolingDown(DateTime<Utc>),
}

fn exclusion<'a>(result: Option<&'a ProbeResult>, now: DateTime<Utc>) -> Option<Exclusion<'a>> {
    let result = result?;
    if !result.ok {
        return Some(Exclusion::Failed(result));
    }
    match result.cooldown_until {
        Some(until) if now < until => Some(Exclusion::CoolingDown(until)),
        _ => None,
    }
}

/// Lower sorts first: measured latency before unknown.
fn latency_key(result: Option<&ProbeResult>) -> (bool, u64) {
    match result.and_then(|r| r.latency_ms) {
        Some(ms) => (false, ms),
        None => (true, 0),
    }
}

/// Choose the best profile.
///
/// `entries` are the enabled profiles in configuration order, each with its
/// latest result (`None` when never probed, which counts as eligible).
/// Ties break on higher weight, then lower latency, then configuration order.
pub fn select_best(
    entries: &[(&Profile, Option<&ProbeResult>)],
    now: DateTime<Utc>,
) -> SelectionDecision {
    if entries.is_empty() {
        let reason = "no enabled profiles configured".to_string();
        return SelectionDecision {
            ok: false,
            chosen: None,
            active: NO_PROFILE_LABEL.to_string(),
            reason: reason.clone(),
            failure_reason: Some(reason),
            candidates: 0,
        };
    }

    let candidates: Vec<(usize, &Profile, Option<&ProbeResult>)> = entries
        .iter()
        .enumerate()
        .filter(|(_, (_, result))| exclusion(*result, now).is_none())
        .map(|(i, (profile, result))| (i, *profile, *result))
        .collect();

    let best = candidates.iter().min_by(|a, b| {
        b.1.weight
            .cmp(&a.1.weight)
            .then_with(|| latency_key(a.2).cmp(&latency_key(b.2)))
            .then_with(|| a.0.cmp(&b.0))
    });

    match best {
        Some((_, profile, result)) => {
            let detail = match result {
                Some(r) => format!(
                    "healthy: HTTP {} in {}ms",
                    r.http_status.map_or_else(|| "?".to_string(), |s| s.to_string()),
                    r.latency_ms.map_or_else(|| "?".to_string(), |ms| ms.to_string())
                ),
                None => "not yet probed, assumed healthy".to_string(),
            };
            SelectionDecision {
                ok: true,
                chosen: Some(profile.name.clone()),
                active: profile.name.clone(),
                reason: format!(
                    "{} {} (weight {}, {} of {} profiles eligible)",
                    profile.name,
                    detail,
                    profile.weight,
                    candidates.len(),
                    entries.len()
                ),
                failure_reason: None,
                candidates: candidates.len(),
            }
        }
        None => {
            let failure = failure_reason(entries, now);
            SelectionDecision {
                ok: false,
                chosen: None,
                active: NO_PROFILE_LABEL.to_string(),
                reason: format!("no eligible profile among {} enabled", entries.len()),
                failure_reason: Some(failure),
                candidates: 0,
            }
        }
    }
}

/// Summarize why nothing qualified, leading with the highest-weight profile.
fn failure_reason(entries: &[(&Profile, Option<&ProbeResult>)], now: DateTime<Utc>) -> String {
    let primary = entries
        .iter()
        .enumerate()
        .max_by(|(ia, (a, _)), (ib, (b, _))| a.weight.cmp(&b.weight).then(ib.cmp(ia)))
        .map(|(_, entry)| entry);

    let mut tally: HashMap<&str, usize> = HashMap::new();
    for (_, result) in entries {
        match exclusion(*result, now) {
            Some(Exclusion::Failed(r)) => {
                let class = r.error_class.map_or("unknown", |c| c.as_str());
                *tally.entry(class).or_default() += 1;
            }
            Some(Exclusion::CoolingDown(_)) => *tally.entry("cooldown").or_default() += 1,
            None => {}
        }
    }
    let mut tally: Vec<_> = tally.into_iter().collect();
    tally.sort_by(|a, b| match b.1.cmp(&a.1) {
        Ordering::Equal => a.0.cmp(b.0),
        other => other,
    });
    let tally = tally
        .iter()
        .map(|(class, n)| format!("{}={}", class, n))
        .collect::<Vec<_>>()
        .join(", ");

    let lead = match primary {
        Some((profile, result)) => match exclusion(*result, now) {
            Some(Exclusion::Failed(r)) => format!(
                "'{}' failed with {}",
                profile.name,
                r.failure_summary().unwrap_or_else(|| "unknown error".to_string())
            ),
            Some(Exclusion::CoolingDown(until)) => format!(
                "'{}' cooling down until {}",
                profile.name,
                until.to_rfc3339()
            ),
            None => format!("'{}' unavailable", profile.name),
        },
        None => "no profiles".to_string(),
    };

    format!("all {} profiles unavailable; {}; failures: {}", entries.len(), lead, tally)
}
