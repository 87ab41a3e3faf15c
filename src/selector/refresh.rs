//! Periodic background health checks.

use super::ProxySelector;

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Longest random delay added before a round.
const MAX_JITTER: Duration = Duration::from_millis(500);

/// Runs `health_check_all` on a fixed interval until stopped.
pub struct RefreshManager {
    selector: Arc<ProxySelector>,
    interval: Duration,
    stop: broadcast::Sender<()>,
}

impl RefreshManager {
    pub fn new(selector: Arc<ProxySelector>, interval: Duration) -> Self {
        Self {
            selector,
            interval,
            stop: broadcast::channel(1).0,
        }
    }

    /// Start the refresh background task. The first round runs immediately.
    pub fn start(&self) {
        let selector = self.selector.clone();
        let period = self.interval;
        // Subscribed before spawning so a stop sent right after start is seen.
        let mut rx = self.stop.subscribe();

        tokio::spawn(async move {
            tracing::info!("Background refresh every {:?}", period);
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        tokio::select! {
                            biased;
                            _ = rx.recv() => break,
                            _ = refresh_round(&selector, jitter(period)) => {}
                        }
                    }
                }
            }

            tracing::info!("Background refresh stopped");
        });
    }

    /// Stop the refresh task.
    pub async fn stop(&self) {
        // No receivers means the task was never started.
        let _ = self.stop.send(());
    }
}

async fn refresh_round(selector: &ProxySelector, delay: Duration) {
    tokio::time::sleep(delay).await;
    match selector.health_check_all().await {
        Ok(_) => {
            selector.select_best_profile().await;
        }
        Err(e) => tracing::error!("Background refresh failed: {}", e),
    }
}

/// Random delay up to a quarter of the period, capped at [`MAX_JITTER`].
fn jitter(period: Duration) -> Duration {
    let cap = (period / 4).min(MAX_JITTER);
    let max_ms = cap.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}
