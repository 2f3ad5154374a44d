//! The counter reconciler.
//!
//! Joins the counters table with an on-the-fly aggregate from the domain
//! table and corrects drift. Per metric, drift is
//! `|actual - counter| / max(actual, 1)`; any metric past the threshold is
//! logged, and with auto-correct on, the campaign's counter row is
//! rewritten to the authoritative values in one UPDATE, up to a per-pass
//! correction cap.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::errors::StoreError;
use crate::events::EventBus;
use crate::store::CampaignStore;

fn default_interval_hours() -> u64 {
    24
}

fn default_drift_threshold_percent() -> f64 {
    0.01
}

fn default_auto_correct() -> bool {
    true
}

fn default_max_corrections() -> usize {
    100
}

/// Loaded from the `[reconciler.counters]` config section. The threshold
/// is expressed as a percentage there and converted to a fraction here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterReconcilerConfig {
    #[serde(default = "default_interval_hours")]
    pub interval_hours: u64,
    #[serde(default = "default_drift_threshold_percent")]
    pub drift_threshold_percent: f64,
    #[serde(default = "default_auto_correct")]
    pub auto_correct: bool,
    #[serde(default = "default_max_corrections")]
    pub max_corrections: usize,
}

impl Default for CounterReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_hours: default_interval_hours(),
            drift_threshold_percent: default_drift_threshold_percent(),
            auto_correct: default_auto_correct(),
            max_corrections: default_max_corrections(),
        }
    }
}

impl CounterReconcilerConfig {
    /// The comparison value the loop actually uses.
    pub fn drift_threshold_fraction(&self) -> f64 {
        self.drift_threshold_percent / 100.0
    }
}

/// One drifted metric on one campaign.
#[derive(Debug, Clone, Serialize)]
pub struct CounterDrift {
    pub campaign_id: Uuid,
    pub metric: &'static str,
    pub counter_value: i64,
    pub actual_value: i64,
    pub drift: f64,
}

/// Result of one reconciliation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CounterPassSummary {
    pub campaigns_checked: usize,
    pub drift_count: usize,
    pub corrections: usize,
    pub drifts: Vec<CounterDrift>,
}

pub struct CounterReconciler {
    store: Arc<dyn CampaignStore>,
    bus: Arc<dyn EventBus>,
    config: CounterReconcilerConfig,
}

impl CounterReconciler {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        bus: Arc<dyn EventBus>,
        config: CounterReconcilerConfig,
    ) -> Self {
        Self { store, bus, config }
    }

    /// One full pass over every campaign with a counter row.
    pub async fn run_once(&self) -> Result<CounterPassSummary, StoreError> {
        let threshold = self.config.drift_threshold_fraction();
        let mut summary = CounterPassSummary::default();

        for campaign_id in self.store.list_counter_campaigns().await? {
            summary.campaigns_checked += 1;
            let counters = self.store.get_campaign_domain_counters(campaign_id).await?;
            let actual = self.store.aggregate_domain_counters(campaign_id).await?;

            let mut campaign_drifted = false;
            for ((metric, counter_value), (_, actual_value)) in
                counters.metrics().into_iter().zip(actual.metrics())
            {
                let drift =
                    (actual_value - counter_value).unsigned_abs() as f64 / actual_value.max(1) as f64;
                if drift > threshold {
                    campaign_drifted = true;
                    summary.drift_count += 1;
                    tracing::warn!(
                        %campaign_id,
                        metric,
                        counter_value,
                        actual_value,
                        drift,
                        "domain counter drift detected"
                    );
                    summary.drifts.push(CounterDrift {
                        campaign_id,
                        metric,
                        counter_value,
                        actual_value,
                        drift,
                    });
                }
            }

            if campaign_drifted
                && self.config.auto_correct
                && summary.corrections < self.config.max_corrections
            {
                self.store
                    .replace_campaign_domain_counters(campaign_id, &actual)
                    .await?;
                summary.corrections += 1;
                tracing::info!(%campaign_id, "counters rewritten to authoritative values");
            }
        }

        if summary.drift_count > 0 || summary.corrections > 0 {
            self.bus
                .publish_system_event(
                    "counters_reconciled",
                    serde_json::json!({
                        "driftCount": summary.drift_count,
                        "corrections": summary.corrections,
                        "ts": chrono::Utc::now(),
                    }),
                )
                .await;
        }
        Ok(summary)
    }

    /// Periodic loop; one pass per interval until cancelled.
    pub async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        let period = Duration::from_secs(self.config.interval_hours * 3600);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.run_once().await {
                        tracing::error!(error = %err, "counter reconciliation pass failed");
                    }
                }
            }
        }
    }
}
