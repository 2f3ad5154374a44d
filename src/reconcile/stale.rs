//! The stale-score detector.
//!
//! Finds analysis scores older than the configured age whose `ready`
//! feature row has been refreshed since the score was computed. The
//! detector reports; it does not rescore. Rescore enqueueing is gated on
//! the rescoring feature flag and logged until the queue is wired.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::Clock;
use crate::engines::flags::{names as flag_names, FeatureFlagReader};
use crate::errors::StoreError;
use crate::store::{CampaignStore, StaleScore};

fn default_interval_secs() -> u64 {
    3600
}

fn default_max_age_hours() -> u64 {
    24
}

fn default_pass_limit() -> usize {
    1000
}

const SAMPLE_SIZE: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaleScoreConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: u64,
    #[serde(default = "default_pass_limit")]
    pub pass_limit: usize,
}

impl Default for StaleScoreConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            max_age_hours: default_max_age_hours(),
            pass_limit: default_pass_limit(),
        }
    }
}

/// Result of one detection pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaleScoreReport {
    pub count: usize,
    /// Up to ten affected domain names, for the logs.
    pub sample: Vec<String>,
}

pub struct StaleScoreDetector {
    store: Arc<dyn CampaignStore>,
    clock: Arc<dyn Clock>,
    flags: Arc<dyn FeatureFlagReader>,
    config: StaleScoreConfig,
}

impl StaleScoreDetector {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        clock: Arc<dyn Clock>,
        flags: Arc<dyn FeatureFlagReader>,
        config: StaleScoreConfig,
    ) -> Self {
        Self {
            store,
            clock,
            flags,
            config,
        }
    }

    /// One detection pass.
    pub async fn run_once(&self) -> Result<StaleScoreReport, StoreError> {
        let cutoff =
            self.clock.now() - chrono::Duration::hours(self.config.max_age_hours as i64);
        let stale: Vec<StaleScore> = self
            .store
            .find_stale_scores(cutoff, self.config.pass_limit)
            .await?;

        let sample: Vec<String> = stale
            .iter()
            .take(SAMPLE_SIZE)
            .map(|s| s.domain_name.clone())
            .collect();

        if !stale.is_empty() {
            if self.flags.is_enabled(flag_names::RESCORING_ENABLED, false) {
                // TODO(rescore queue): enqueue rescore jobs once the queue lands
                tracing::info!(
                    count = stale.len(),
                    sample = ?sample,
                    "stale analysis scores found, rescoring pending queue wiring"
                );
            } else {
                tracing::info!(
                    count = stale.len(),
                    sample = ?sample,
                    "stale analysis scores found, rescoring disabled"
                );
            }
        }

        Ok(StaleScoreReport {
            count: stale.len(),
            sample,
        })
    }

    /// Periodic loop; one pass per interval until cancelled.
    pub async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.run_once().await {
                        tracing::error!(error = %err, "stale score detection pass failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::flags::StaticFlags;
    use crate::reconcile::test_support::FixedClock;
    use crate::store::SqliteStore;
    use uuid::Uuid;

    async fn seed_stale_pair(store: &SqliteStore, campaign: Uuid, domain: &str) {
        // Score first, feature second: the feature is fresher
        store.upsert_analysis_score(campaign, domain, 0.3).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        store
            .upsert_extraction_features(
                campaign,
                domain,
                &serde_json::json!({"kw_unique": 1}),
                "ready",
            )
            .await
            .unwrap();
    }

    fn detector(
        store: Arc<SqliteStore>,
        clock: Arc<dyn Clock>,
        config: StaleScoreConfig,
    ) -> StaleScoreDetector {
        StaleScoreDetector::new(
            store as Arc<dyn CampaignStore>,
            clock,
            Arc::new(StaticFlags::new()),
            config,
        )
    }

    #[tokio::test]
    async fn test_detects_stale_scores_past_max_age() {
        let store = Arc::new(SqliteStore::new_in_memory().unwrap());
        let campaign = Uuid::new_v4();
        seed_stale_pair(&store, campaign, "stale.example").await;

        // Two days from now, a 24h max age puts today's score past cutoff
        let clock = Arc::new(FixedClock(chrono::Utc::now() + chrono::Duration::days(2)));
        let report = detector(store, clock, StaleScoreConfig::default())
            .run_once()
            .await
            .unwrap();

        assert_eq!(report.count, 1);
        assert_eq!(report.sample, vec!["stale.example".to_string()]);
    }

    #[tokio::test]
    async fn test_fresh_scores_are_not_reported() {
        let store = Arc::new(SqliteStore::new_in_memory().unwrap());
        let campaign = Uuid::new_v4();
        seed_stale_pair(&store, campaign, "recent.example").await;

        // Right now the score is too young to be stale
        let clock = Arc::new(FixedClock(chrono::Utc::now()));
        let report = detector(store, clock, StaleScoreConfig::default())
            .run_once()
            .await
            .unwrap();
        assert_eq!(report.count, 0);
        assert!(report.sample.is_empty());
    }

    #[tokio::test]
    async fn test_sample_caps_at_ten() {
        let store = Arc::new(SqliteStore::new_in_memory().unwrap());
        let campaign = Uuid::new_v4();
        for i in 0..15 {
            seed_stale_pair(&store, campaign, &format!("d{}.example", i)).await;
        }

        let clock = Arc::new(FixedClock(chrono::Utc::now() + chrono::Duration::days(2)));
        let report = detector(store, clock, StaleScoreConfig::default())
            .run_once()
            .await
            .unwrap();
        assert_eq!(report.count, 15);
        assert_eq!(report.sample.len(), 10);
    }

    #[tokio::test]
    async fn test_pass_limit_bounds_the_query() {
        let store = Arc::new(SqliteStore::new_in_memory().unwrap());
        let campaign = Uuid::new_v4();
        for i in 0..5 {
            seed_stale_pair(&store, campaign, &format!("d{}.example", i)).await;
        }

        let clock = Arc::new(FixedClock(chrono::Utc::now() + chrono::Duration::days(2)));
        let report = detector(
            store,
            clock,
            StaleScoreConfig {
                pass_limit: 3,
                ..Default::default()
            },
        )
        .run_once()
        .await
        .unwrap();
        assert_eq!(report.count, 3);
    }
}
