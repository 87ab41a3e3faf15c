//! Health-check orchestration and best-profile selection.

mod clock;
mod refresh;
mod scoring;

pub use clock::*;
pub use refresh::RefreshManager;
pub use scoring::{select_best, SelectionDecision};

use crate::config::ServerConfig;
use crate::probe::{ProbeError, ProbeResult, ProbeTarget, Prober, USER_AGENT};
use crate::profile::{mask_credentials, Profile, ProfileRegistry, Route};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

#[derive(Error, Debug)]
pub enum SelectorError {
    #[error("no enabled profiles configured")]
    NoEnabledProfiles,
    #[error("no healthy profile available: {0}")]
    NoHealthyProfile(String),
    #[error("unknown profile: {0}")]
    UnknownProfile(String),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

/// Probe parameters shared by every round.
#[derive(Debug, Clone)]
pub struct SelectorSettings {
    pub target: ProbeTarget,
    pub probe_timeout: Duration,
    pub cooldown: Duration,
    pub history_len: usize,
}

impl SelectorSettings {
    pub fn from_config(config: &ServerConfig) -> Result<Self, ProbeError> {
        Ok(Self {
            target: ProbeTarget::parse(&config.target_url)?,
            probe_timeout: config.probe_timeout,
            cooldown: config.cooldown,
            history_len: config.history_len,
        })
    }
}

#[derive(Debug, Default)]
struct ProfileState {
    latest: Option<ProbeResult>,
    history: VecDeque<ProbeResult>,
}

/// Probes the registry's profiles and picks the one to route through.
pub struct ProxySelector {
    registry: ProfileRegistry,
    prober: Arc<dyn Prober>,
    clock: Arc<dyn Clock>,
    settings: SelectorSettings,
    state: RwLock<HashMap<String, ProfileState>>,
    last_choice: Mutex<Option<String>>,
}

impl ProxySelector {
    pub fn new(
        registry: ProfileRegistry,
        prober: Arc<dyn Prober>,
        settings: SelectorSettings,
    ) -> Self {
        Self {
            registry,
            prober,
            clock: Arc::new(SystemClock),
            settings,
            state: RwLock::new(HashMap::new()),
            last_choice: Mutex::new(None),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn registry(&self) -> &ProfileRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &SelectorSettings {
        &self.settings
    }

    pub fn prober(&self) -> Arc<dyn Prober> {
        self.prober.clone()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Probe every enabled profile concurrently and store the results.
    ///
    /// Results come back in configuration order. Descriptor problems are
    /// reported before any probe runs.
    pub async fn health_check_all(&self) -> Result<Vec<ProbeResult>, SelectorError> {
        let enabled = self.registry.list_enabled();
        if enabled.is_empty() {
            return Err(SelectorError::NoEnabledProfiles);
        }
        for profile in &enabled {
            profile.route().map_err(ProbeError::from)?;
        }

        let started = Instant::now();
        let results = join_all(enabled.iter().map(|p| self.probe_and_store(p)))
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;

        let healthy = results.iter().filter(|r| r.ok).count();
        tracing::info!(
            "Health check: {}/{} profiles healthy in {}ms",
            healthy,
            results.len(),
            started.elapsed().as_millis()
        );

        Ok(results)
    }

    /// Probe a single profile on demand.
    pub async fn check_profile(&self, name: &str) -> Result<ProbeResult, SelectorError> {
        let profile = self
            .registry
            .get(name)
            .ok_or_else(|| SelectorError::UnknownProfile(name.to_string()))?;
        if !profile.enabled {
            return Err(ProbeError::Disabled(name.to_string()).into());
        }
        self.probe_and_store(profile).await
    }

    async fn probe_and_store(&self, profile: &Profile) -> Result<ProbeResult, SelectorError> {
        let outcome = self
            .prober
            .probe(profile, &self.settings.target, self.settings.probe_timeout)
            .await?;
        let checked_at = self.clock.now();

        let result = {
            let mut state = self.state.write().await;
            let entry = state.entry(profile.name.clone()).or_default();
            let previous = entry.latest.as_ref().and_then(|r| r.cooldown_until);
            let cooldown_until =
                next_cooldown(outcome.ok, checked_at, previous, self.settings.cooldown);

            let result =
                ProbeResult::from_outcome(&profile.name, outcome, checked_at, cooldown_until);
            entry.latest = Some(result.clone());
            entry.history.push_back(result.clone());
            while entry.history.len() > self.settings.history_len {
                entry.history.pop_front();
            }
            result
        };

        if result.ok {
            tracing::debug!(
                "Profile {} healthy: HTTP {:?} in {:?}ms",
                profile.name,
                result.http_status,
                result.latency_ms
            );
        } else {
            tracing::warn!(
                "Profile {} failed: {}",
                profile.name,
                result.failure_summary().unwrap_or_default()
            );
        }

        Ok(result)
    }

    /// Pick the best profile from stored state. Never probes.
    pub async fn select_best_profile(&self) -> SelectionDecision {
        let now = self.clock.now();
        let decision = {
            let state = self.state.read().await;
            let entries: Vec<(&Profile, Option<&ProbeResult>)> = self
                .registry
                .list_enabled()
                .into_iter()
                .map(|p| (p, state.get(&p.name).and_then(|s| s.latest.as_ref())))
                .collect();
            select_best(&entries, now)
        };

        let mut last = self.last_choice.lock().await;
        if *last != decision.chosen {
            tracing::info!(
                "Selected egress profile: {} -> {}",
                last.as_deref().unwrap_or("none"),
                decision.active
            );
            *last = decision.chosen.clone();
        }

        decision
    }

    pub async fn latest(&self, name: &str) -> Option<ProbeResult> {
        let state = self.state.read().await;
        state.get(name).and_then(|s| s.latest.clone())
    }

    /// Recent results for a profile, oldest first. `None` for unknown names.
    pub async fn history(&self, name: &str) -> Option<Vec<ProbeResult>> {
        self.registry.get(name)?;
        let state = self.state.read().await;
        Some(
            state
                .get(name)
                .map(|s| s.history.iter().cloned().collect())
                .unwrap_or_default(),
        )
    }

    /// A client routed through the currently selected profile.
    pub async fn http_client(&self) -> Result<(String, reqwest::Client), SelectorError> {
        let decision = self.select_best_profile().await;
        let name = decision.chosen.ok_or_else(|| {
            SelectorError::NoHealthyProfile(decision.failure_reason.unwrap_or(decision.reason))
        })?;
        let profile = self
            .registry
            .get(&name)
            .ok_or_else(|| SelectorError::UnknownProfile(name.clone()))?;
        let client = self.client_for(profile)?;
        Ok((name, client))
    }

    /// A client routed through `profile`.
    pub fn client_for(&self, profile: &Profile) -> Result<reqwest::Client, SelectorError> {
        let builder = reqwest::Client::builder()
            .timeout(self.settings.probe_timeout)
            .user_agent(USER_AGENT);

        let builder = match profile.route().map_err(ProbeError::from)? {
            Route::Direct => builder.no_proxy(),
            Route::HttpProxy(endpoint) | Route::Socks5(endpoint) => {
                let proxy = reqwest::Proxy::all(endpoint.url.as_str())
                    .map_err(|e| SelectorError::Client(mask_credentials(&e.to_string())))?;
                builder.proxy(proxy)
            }
        };

        builder
            .build()
            .map_err(|e| SelectorError::Client(mask_credentials(&e.to_string())))
    }
}

/// Cooldown marker after a probe: set on failure, kept through a success
/// until it expires.
fn next_cooldown(
    ok: bool,
    checked_at: DateTime<Utc>,
    previous: Option<DateTime<Utc>>,
    cooldown: Duration,
) -> Option<DateTime<Utc>> {
    if !ok {
        let span =
            chrono::Duration::from_std(cooldown).unwrap_or_else(|_| chrono::Duration::zero());
        return checked_at.checked_add_signed(span);
    }
    previous.filter(|until| checked_at < *until)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::testing::{failed, ok, ScriptedProber};
    use crate::probe::ErrorClass;
    use crate::profile::ProfileKind;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn settings() -> SelectorSettings {
        SelectorSettings {
            target: ProbeTarget::parse("https://venue.test/status").unwrap(),
            probe_timeout: Duration::from_millis(500),
            cooldown: Duration::from_secs(300),
            history_len: 3,
        }
    }

    fn selector(
        profiles: Vec<Profile>,
        prober: Arc<ScriptedProber>,
    ) -> (ProxySelector, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        let registry = ProfileRegistry::new(profiles).unwrap();
        let selector = ProxySelector::new(registry, prober, settings()).with_clock(clock.clone());
        (selector, clock)
    }

    fn three_profiles() -> Vec<Profile> {
        vec![
            Profile::direct("direct"),
            Profile::proxy("res-a", ProfileKind::HttpProxy, "http://user:pw@proxy-a:3128"),
            Profile::proxy("res-b", ProfileKind::SocksProxy, "socks5h://proxy-b:1080"),
        ]
    }

    #[tokio::test]
    async fn test_health_check_all_one_result_per_enabled_profile() {
        let mut profiles = three_profiles();
        profiles.push(Profile::direct("off").disabled());
        let prober = Arc::new(ScriptedProber::new());
        let (selector, _) = selector(profiles, prober.clone());

        let results = selector.health_check_all().await.unwrap();
        let names: Vec<_> = results.iter().map(|r| r.profile_name.as_str()).collect();
        assert_eq!(names, vec!["direct", "res-a", "res-b"]);
        assert!(results.iter().all(|r| r.checked_at == start()));
        assert!(!prober.calls().contains(&"off".to_string()));
        assert!(selector.latest("off").await.is_none());
    }

    #[tokio::test]
    async fn test_probes_run_concurrently() {
        let prober = Arc::new(ScriptedProber::new());
        for name in ["direct", "res-a", "res-b"] {
            prober.set_delayed(name, ok(200, 10), Duration::from_millis(200));
        }
        let (selector, _) = selector(three_profiles(), prober);

        let started = Instant::now();
        selector.health_check_all().await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(550));
    }

    #[tokio::test]
    async fn test_each_round_replaces_latest() {
        let prober = Arc::new(ScriptedProber::new());
        let (selector, clock) = selector(three_profiles(), prober.clone());

        selector.health_check_all().await.unwrap();
        clock.advance(chrono::Duration::seconds(5));
        prober.set("res-a", ok(200, 99));
        selector.health_check_all().await.unwrap();

        let latest = selector.latest("res-a").await.unwrap();
        assert_eq!(latest.latency_ms, Some(99));
        assert_eq!(latest.checked_at, start() + chrono::Duration::seconds(5));
    }

    #[tokio::test]
    async fn test_one_failure_does_not_affect_others() {
        let prober = Arc::new(ScriptedProber::new());
        prober.set("res-a", failed(ErrorClass::Tcp, "TCP_CONNECTION_REFUSED"));
        let (selector, _) = selector(three_profiles(), prober);

        let results = selector.health_check_all().await.unwrap();
        assert!(results[0].ok);
        assert!(!results[1].ok);
        assert!(results[2].ok);
        assert_eq!(results[1].cooldown_until, Some(start() + chrono::Duration::seconds(300)));
    }

    #[tokio::test]
    async fn test_timeout_profile_not_selected() {
        let prober = Arc::new(ScriptedProber::new());
        prober.set_delayed("direct", ok(200, 10), Duration::from_secs(5));
        let (selector, _) = selector(vec![Profile::direct("direct")], prober);

        let results = selector.health_check_all().await.unwrap();
        assert_eq!(results[0].error_class, Some(ErrorClass::Timeout));

        let decision = selector.select_best_profile().await;
        assert!(!decision.ok);
        assert_eq!(decision.active, scoring::NO_PROFILE_LABEL);
        assert!(decision.failure_reason.unwrap().contains("timeout"));
    }

    #[tokio::test]
    async fn test_all_failed_never_panics() {
        let prober = Arc::new(ScriptedProber::new());
        prober.set("direct", failed(ErrorClass::Dns, "DNS_LOOKUP_FAILED"));
        prober.set("res-a", failed(ErrorClass::Auth, "PROXY_AUTH_REQUIRED"));
        prober.set("res-b", failed(ErrorClass::Tls, "TLS_HANDSHAKE_FAILED"));
        let (selector, _) = selector(three_profiles(), prober);

        let results = selector.health_check_all().await.unwrap();
        assert!(results.iter().all(|r| !r.ok));

        let decision = selector.select_best_profile().await;
        assert!(!decision.ok);
        assert!(decision.chosen.is_none());
        assert!(!decision.failure_reason.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cooldown_survives_success_until_expiry() {
        let prober = Arc::new(ScriptedProber::new());
        prober.set("direct", failed(ErrorClass::Tcp, "TCP_CONNECTION_RESET"));
        let (selector, clock) = selector(vec![Profile::direct("direct")], prober.clone());

        selector.health_check_all().await.unwrap();
        let until = start() + chrono::Duration::seconds(300);

        // Recovered, but still inside the cooldown window
        clock.advance(chrono::Duration::seconds(10));
        prober.set("direct", ok(200, 20));
        let results = selector.health_check_all().await.unwrap();
        assert!(results[0].ok);
        assert_eq!(results[0].cooldown_until, Some(until));
        assert!(!selector.select_best_profile().await.ok);

        // Past the window the next success clears it
        clock.advance(chrono::Duration::seconds(300));
        let results = selector.health_check_all().await.unwrap();
        assert_eq!(results[0].cooldown_until, None);
        let decision = selector.select_best_profile().await;
        assert_eq!(decision.chosen.as_deref(), Some("direct"));
    }

    #[tokio::test]
    async fn test_failure_renews_cooldown() {
        let prober = Arc::new(ScriptedProber::new());
        prober.set("direct", failed(ErrorClass::Http, "HTTP_503"));
        let (selector, clock) = selector(vec![Profile::direct("direct")], prober);

        selector.health_check_all().await.unwrap();
        clock.advance(chrono::Duration::seconds(60));
        let results = selector.health_check_all().await.unwrap();
        assert_eq!(
            results[0].cooldown_until,
            Some(start() + chrono::Duration::seconds(360))
        );
    }

    #[tokio::test]
    async fn test_selection_prefers_lower_latency() {
        let prober = Arc::new(ScriptedProber::new());
        prober.set("res-a", ok(200, 200));
        prober.set("res-b", ok(200, 50));
        let profiles = vec![
            Profile::proxy("res-a", ProfileKind::HttpProxy, "http://proxy-a:3128"),
            Profile::proxy("res-b", ProfileKind::HttpProxy, "http://proxy-b:3128"),
        ];
        let (selector, _) = selector(profiles, prober);

        selector.health_check_all().await.unwrap();
        let decision = selector.select_best_profile().await;
        assert_eq!(decision.chosen.as_deref(), Some("res-b"));
    }

    #[tokio::test]
    async fn test_selection_does_not_probe() {
        let prober = Arc::new(ScriptedProber::new());
        let (selector, _) = selector(three_profiles(), prober.clone());

        let decision = selector.select_best_profile().await;
        assert!(decision.ok);
        assert!(prober.calls().is_empty());
    }

    #[tokio::test]
    async fn test_no_enabled_profiles() {
        let prober = Arc::new(ScriptedProber::new());
        let (selector, _) = selector(vec![Profile::direct("direct").disabled()], prober);

        assert!(matches!(
            selector.health_check_all().await,
            Err(SelectorError::NoEnabledProfiles)
        ));
    }

    #[tokio::test]
    async fn test_probe_error_is_distinct_from_failure() {
        let prober = Arc::new(ScriptedProber::new());
        prober.break_profile("res-b");
        let (selector, _) = selector(three_profiles(), prober);

        assert!(matches!(
            selector.health_check_all().await,
            Err(SelectorError::Probe(ProbeError::InvalidTarget(_)))
        ));
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let prober = Arc::new(ScriptedProber::new());
        let (selector, clock) = selector(vec![Profile::direct("direct")], prober);

        for _ in 0..5 {
            selector.health_check_all().await.unwrap();
            clock.advance(chrono::Duration::seconds(1));
        }

        let history = selector.history("direct").await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].checked_at, start() + chrono::Duration::seconds(2));
        assert!(selector.history("nope").await.is_none());
    }

    #[tokio::test]
    async fn test_check_profile() {
        let prober = Arc::new(ScriptedProber::new());
        let mut profiles = three_profiles();
        profiles.push(Profile::direct("off").disabled());
        let (selector, _) = selector(profiles, prober.clone());

        let result = selector.check_profile("res-b").await.unwrap();
        assert_eq!(result.profile_name, "res-b");
        assert_eq!(prober.calls(), vec!["res-b".to_string()]);

        assert!(matches!(
            selector.check_profile("missing").await,
            Err(SelectorError::UnknownProfile(_))
        ));
        assert!(matches!(
            selector.check_profile("off").await,
            Err(SelectorError::Probe(ProbeError::Disabled(_)))
        ));
    }

    #[tokio::test]
    async fn test_http_client_requires_healthy_profile() {
        let prober = Arc::new(ScriptedProber::new());
        prober.set("direct", failed(ErrorClass::Dns, "DNS_LOOKUP_FAILED"));
        let (selector, _) = selector(vec![Profile::direct("direct")], prober);

        selector.health_check_all().await.unwrap();
        match selector.http_client().await {
            Err(SelectorError::NoHealthyProfile(reason)) => {
                assert!(reason.contains("DNS_LOOKUP_FAILED"))
            }
            other => panic!("unexpected: {:?}", other.map(|(name, _)| name)),
        }
    }

    #[tokio::test]
    async fn test_http_client_routes_through_choice() {
        let prober = Arc::new(ScriptedProber::new());
        let (selector, _) = selector(three_profiles(), prober);

        let (name, _client) = selector.http_client().await.unwrap();
        assert_eq!(name, "direct");

        let socks = selector.registry().get("res-b").unwrap();
        assert!(selector.client_for(socks).is_ok());
    }

    #[test]
    fn test_next_cooldown() {
        let cooldown = Duration::from_secs(300);
        let until = start() + chrono::Duration::seconds(300);

        assert_eq!(next_cooldown(false, start(), None, cooldown), Some(until));
        assert_eq!(next_cooldown(true, start(), None, cooldown), None);
        assert_eq!(next_cooldown(true, start(), Some(until), cooldown), Some(until));
        assert_eq!(next_cooldown(true, until, Some(until), cooldown), None);
    }
}
