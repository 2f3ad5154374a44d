//! Progress emission.
//!
//! Two sinks with different guarantees: the in-memory channel gets every
//! update but drops under backpressure; the durable row is written at most
//! once per throttle interval and is best-effort (a failed write is logged,
//! never fatal). The event bus rides along with the in-memory path.

use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::execution::ExecutionHandle;
use super::{PhaseProgress, PhaseRunContext};
use crate::errors::PhaseError;
use crate::events::EventBus;
use crate::model::progress_pct;
use crate::store::CampaignStore;

/// Minimum spacing between durable progress writes.
pub const DURABLE_PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

pub struct ProgressEmitter {
    handle: Arc<ExecutionHandle>,
    store: Arc<dyn CampaignStore>,
    bus: Arc<dyn EventBus>,
    min_durable_interval: Duration,
    last_durable: Mutex<Option<Instant>>,
}

impl ProgressEmitter {
    pub fn new(
        handle: Arc<ExecutionHandle>,
        store: Arc<dyn CampaignStore>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            handle,
            store,
            bus,
            min_durable_interval: DURABLE_PROGRESS_INTERVAL,
            last_durable: Mutex::new(None),
        }
    }

    /// Override the durable throttle (tests).
    pub fn with_durable_interval(mut self, interval: Duration) -> Self {
        self.min_durable_interval = interval;
        self
    }

    /// Emit one progress update. Runs the run-id guard first: a stale
    /// context performs no write anywhere and errors out.
    pub async fn emit(
        &self,
        run: &PhaseRunContext,
        items_processed: u64,
        items_total: u64,
        message: &str,
    ) -> Result<(), PhaseError> {
        self.handle.guard(run)?;
        self.handle.record_progress(items_processed, items_total);

        let pct = progress_pct(items_processed, items_total);
        let progress = PhaseProgress {
            campaign_id: run.campaign_id,
            phase: run.phase,
            status: self.handle.status(),
            progress_pct: pct,
            items_total,
            items_processed,
            message: message.to_string(),
            error: None,
            timestamp: Utc::now(),
        };
        self.handle.try_send_progress(progress.clone());
        self.bus.publish_progress(&progress).await;

        if self.take_durable_slot() {
            if let Err(err) = self
                .store
                .update_phase_progress(run.campaign_id, run.phase, items_processed, items_total, pct)
                .await
            {
                tracing::warn!(
                    campaign_id = %run.campaign_id,
                    phase = %run.phase,
                    error = %err,
                    "durable progress write failed"
                );
            }
        }
        Ok(())
    }

    fn take_durable_slot(&self) -> bool {
        let mut last = self.last_durable.lock().unwrap();
        match *last {
            Some(at) if at.elapsed() < self.min_durable_interval => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BroadcastBus;
    use crate::model::PhaseType;
    use crate::phase::execution::ExecutionRegistry;
    use crate::store::SqliteStore;
    use uuid::Uuid;

    async fn setup() -> (
        Arc<SqliteStore>,
        Arc<ExecutionHandle>,
        tokio::sync::mpsc::Receiver<PhaseProgress>,
        Uuid,
    ) {
        let store = Arc::new(SqliteStore::new_in_memory().unwrap());
        let campaign = Uuid::new_v4();
        store
            .update_phase_configuration(campaign, PhaseType::DnsValidation, &serde_json::json!({}))
            .await
            .unwrap();
        store
            .start_phase(campaign, PhaseType::DnsValidation)
            .await
            .unwrap();
        let registry = ExecutionRegistry::new();
        let (handle, rx) = registry.begin(campaign, PhaseType::DnsValidation).unwrap();
        (store, handle, rx, campaign)
    }

    #[tokio::test]
    async fn test_emit_feeds_channel_and_durable_row() {
        let (store, handle, mut rx, campaign) = setup().await;
        let emitter = ProgressEmitter::new(
            Arc::clone(&handle),
            store.clone() as Arc<dyn CampaignStore>,
            Arc::new(BroadcastBus::new()),
        )
        .with_durable_interval(Duration::ZERO);

        let run = handle.run_context();
        emitter.emit(&run, 25, 100, "batch committed").await.unwrap();

        let progress = rx.recv().await.unwrap();
        assert_eq!(progress.items_processed, 25);
        assert_eq!(progress.progress_pct, 25.0);
        assert_eq!(progress.message, "batch committed");

        let row = store
            .get_campaign_phase(campaign, PhaseType::DnsValidation)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.items_processed, 25);
        assert_eq!(row.progress_percentage, 25.0);
    }

    #[tokio::test]
    async fn test_durable_writes_are_throttled() {
        let (store, handle, _rx, campaign) = setup().await;
        let emitter = ProgressEmitter::new(
            Arc::clone(&handle),
            store.clone() as Arc<dyn CampaignStore>,
            Arc::new(BroadcastBus::new()),
        )
        .with_durable_interval(Duration::from_secs(3600));

        let run = handle.run_context();
        emitter.emit(&run, 1, 100, "first").await.unwrap();
        emitter.emit(&run, 2, 100, "second").await.unwrap();
        emitter.emit(&run, 3, 100, "third").await.unwrap();

        // Only the first write lands durably within the interval
        let row = store
            .get_campaign_phase(campaign, PhaseType::DnsValidation)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.items_processed, 1);
    }

    #[tokio::test]
    async fn test_stale_run_context_writes_nothing() {
        let (store, handle, mut rx, campaign) = setup().await;
        let emitter = ProgressEmitter::new(
            Arc::clone(&handle),
            store.clone() as Arc<dyn CampaignStore>,
            Arc::new(BroadcastBus::new()),
        )
        .with_durable_interval(Duration::ZERO);

        let stale = PhaseRunContext {
            run_id: Uuid::new_v4(),
            ..handle.run_context()
        };
        let err = emitter.emit(&stale, 50, 100, "late write").await.unwrap_err();
        assert!(matches!(err, PhaseError::StaleExecution));

        assert!(rx.try_recv().is_err(), "no progress should be streamed");
        let row = store
            .get_campaign_phase(campaign, PhaseType::DnsValidation)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.items_processed, 0, "no durable write on stale context");
    }
}
