//! HTTP request handlers.

use super::AppState;
use crate::probe::ProbeResult;
use crate::profile::ProfileView;
use crate::selector::{SelectionDecision, SelectorError};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;

// ============================================================================
// Response types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct TargetInfo {
    pub url: String,
    pub host: String,
}

/// A profile's masked metadata with its latest result.
#[derive(Debug, Serialize)]
pub struct ProfileEntry {
    #[serde(flatten)]
    pub profile: ProfileView,
    pub result: Option<ProbeResult>,
}

#[derive(Debug, Serialize)]
pub struct HealthSnapshot {
    pub checked_at: DateTime<Utc>,
    pub target: TargetInfo,
    pub selection: SelectionDecision,
    pub profiles: Vec<ProfileEntry>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(e: SelectorError) -> Response {
    let status = match &e {
        SelectorError::UnknownProfile(_) => StatusCode::NOT_FOUND,
        SelectorError::NoHealthyProfile(_) => StatusCode::SERVICE_UNAVAILABLE,
        SelectorError::NoEnabledProfiles | SelectorError::Probe(_) | SelectorError::Client(_) => {
            tracing::error!("Request failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(ErrorBody { error: e.to_string() })).into_response()
}

// ============================================================================
// Egress health
// ============================================================================

/// Probe every enabled profile, then report the selection.
pub async fn handle_health(State(state): State<AppState>) -> Response {
    let selector = &state.selector;
    let checked_at = selector.now();

    let results = match selector.health_check_all().await {
        Ok(results) => results,
        Err(e) => return error_response(e),
    };
    let selection = selector.select_best_profile().await;

    let mut profiles = Vec::with_capacity(selector.registry().all().len());
    for profile in selector.registry().all() {
        let result = match results.iter().find(|r| r.profile_name == profile.name) {
            Some(r) => Some(r.clone()),
            None => selector.latest(&profile.name).await,
        };
        profiles.push(ProfileEntry {
            profile: ProfileView::from(profile),
            result,
        });
    }

    let target = &selector.settings().target;
    Json(HealthSnapshot {
        checked_at,
        target: TargetInfo {
            url: target.url.clone(),
            host: target.host.clone(),
        },
        selection,
        profiles,
    })
    .into_response()
}

pub async fn handle_selection(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.selector.select_best_profile().await)
}

// ============================================================================
// Profiles
// ============================================================================

pub async fn handle_profiles(State(state): State<AppState>) -> impl IntoResponse {
    let mut entries = Vec::new();
    for profile in state.selector.registry().all() {
        entries.push(ProfileEntry {
            profile: ProfileView::from(profile),
            result: state.selector.latest(&profile.name).await,
        });
    }
    Json(entries)
}

pub async fn handle_profile_history(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    match state.selector.history(&name).await {
        Some(history) => Json(history).into_response(),
        None => error_response(SelectorError::UnknownProfile(name)),
    }
}

pub async fn handle_check_profile(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    match state.selector.check_profile(&name).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => error_response(e),
    }
}

// ============================================================================
// Venue
// ============================================================================

pub async fn handle_venue_diagnostics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.venue.run().await)
}

pub async fn handle_healthz() -> &'static str {
    "ok"
}
