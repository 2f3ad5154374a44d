//! Extraction phase: the batch engine.
//!
//! Pulls extraction tasks in `pending`/`error` state (retry_count asc,
//! created_at asc), pipes them through a bounded worker pool with a
//! per-domain timeout, and records per-item failures on the task rows.
//! Item errors never abort the phase; the full control protocol
//! (pause/resume/stop) is drained between batches.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use uuid::Uuid;

use super::runner::{PhaseRuntime, RunCtx};
use crate::engines::flags::{names as flag_names, FeatureFlagReader};
use crate::engines::{HttpFetcher, KeywordScanner, PageAnalyzer, RelevanceScorer};
use crate::errors::{EngineError, PhaseError};
use crate::events::EventBus;
use crate::model::{
    ExtractionTask, FeatureVector, HttpStatus, PhaseType, TaskState,
};
use crate::phase::execution::ExecutionHandle;
use crate::phase::status::PhaseStatusReport;
use crate::phase::{Capabilities, ControlCommand, PhaseProgress, PhaseRunContext, PhaseService};
use crate::store::CampaignStore;

fn default_worker_count() -> usize {
    10
}

fn default_batch_size() -> usize {
    50
}

fn default_domain_timeout_secs() -> u64 {
    60
}

fn default_queue_limit() -> usize {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_domain_timeout_secs")]
    pub domain_timeout_secs: u64,
    #[serde(default = "default_queue_limit")]
    pub queue_limit: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            batch_size: default_batch_size(),
            domain_timeout_secs: default_domain_timeout_secs(),
            queue_limit: default_queue_limit(),
        }
    }
}

impl ExtractionConfig {
    fn validate(&self) -> Result<(), String> {
        if self.worker_count == 0 {
            return Err("worker_count must be greater than zero".into());
        }
        if self.batch_size == 0 {
            return Err("batch_size must be greater than zero".into());
        }
        if self.domain_timeout_secs == 0 {
            return Err("domain timeout must be greater than zero".into());
        }
        Ok(())
    }
}

/// One task's failure inside a batch. Collected, logged, never fatal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItemError {
    pub domain_name: String,
    pub message: String,
}

pub struct ExtractionService {
    runtime: PhaseRuntime,
    fetcher: Arc<dyn HttpFetcher>,
    analyzer: Arc<dyn PageAnalyzer>,
    scanner: Arc<dyn KeywordScanner>,
    scorer: Arc<dyn RelevanceScorer>,
    flags: Arc<dyn FeatureFlagReader>,
}

impl ExtractionService {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        bus: Arc<dyn EventBus>,
        fetcher: Arc<dyn HttpFetcher>,
        analyzer: Arc<dyn PageAnalyzer>,
        scanner: Arc<dyn KeywordScanner>,
        scorer: Arc<dyn RelevanceScorer>,
        flags: Arc<dyn FeatureFlagReader>,
    ) -> Self {
        // Extraction sweeps can legitimately outlast the default deadline
        let runtime = PhaseRuntime::new(PhaseType::Extraction, store, bus)
            .with_execution_timeout(Duration::from_secs(2 * 3600));
        Self {
            runtime,
            fetcher,
            analyzer,
            scanner,
            scorer,
            flags,
        }
    }

    fn parse_config(&self, config: &serde_json::Value) -> Result<ExtractionConfig, PhaseError> {
        let parsed: ExtractionConfig =
            serde_json::from_value(config.clone()).map_err(|e| PhaseError::Validation {
                phase: PhaseType::Extraction,
                message: e.to_string(),
            })?;
        parsed.validate().map_err(|message| PhaseError::Validation {
            phase: PhaseType::Extraction,
            message,
        })?;
        Ok(parsed)
    }
}

#[async_trait]
impl PhaseService for ExtractionService {
    fn phase_type(&self) -> PhaseType {
        PhaseType::Extraction
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::full()
    }

    fn validate(&self, config: &serde_json::Value) -> Result<(), PhaseError> {
        self.parse_config(config).map(|_| ())
    }

    async fn configure(
        &self,
        campaign_id: Uuid,
        config: serde_json::Value,
    ) -> Result<(), PhaseError> {
        self.parse_config(&config)?;
        self.runtime.configure_slot(campaign_id, &config).await
    }

    async fn execute(
        &self,
        campaign_id: Uuid,
    ) -> Result<mpsc::Receiver<PhaseProgress>, PhaseError> {
        let raw = self
            .runtime
            .store()
            .get_phase_config(campaign_id, PhaseType::Extraction)
            .await?
            .ok_or(PhaseError::NotConfigured {
                phase: PhaseType::Extraction,
                campaign_id,
            })?;
        let config = self.parse_config(&raw)?;
        let worker = ExtractionWorker {
            fetcher: Arc::clone(&self.fetcher),
            analyzer: Arc::clone(&self.analyzer),
            scanner: Arc::clone(&self.scanner),
            scorer: Arc::clone(&self.scorer),
            flags: Arc::clone(&self.flags),
        };

        self.runtime
            .launch(campaign_id, move |mut ctx: RunCtx| async move {
                run_extraction(&mut ctx, config, worker).await
            })
            .await
    }

    async fn status(&self, campaign_id: Uuid) -> Result<PhaseStatusReport, PhaseError> {
        self.runtime.status(campaign_id).await
    }

    async fn cancel(&self, campaign_id: Uuid) -> Result<(), PhaseError> {
        self.runtime.cancel(campaign_id).await
    }

    fn attach_control_channel(
        &self,
        campaign_id: Uuid,
        commands: mpsc::Receiver<ControlCommand>,
    ) {
        self.runtime.attach_control(campaign_id, commands);
    }
}

/// The collaborators one per-domain worker needs, cloned per spawn.
#[derive(Clone)]
struct ExtractionWorker {
    fetcher: Arc<dyn HttpFetcher>,
    analyzer: Arc<dyn PageAnalyzer>,
    scanner: Arc<dyn KeywordScanner>,
    scorer: Arc<dyn RelevanceScorer>,
    flags: Arc<dyn FeatureFlagReader>,
}

impl ExtractionWorker {
    /// Feature extraction → keyword extraction → optional adaptive crawl →
    /// optional advanced scoring, for one task.
    async fn run_one(
        &self,
        store: Arc<dyn CampaignStore>,
        handle: Arc<ExecutionHandle>,
        run: PhaseRunContext,
        task: ExtractionTask,
    ) -> Result<Option<BatchItemError>, PhaseError> {
        handle.guard(&run)?;
        let campaign_id = run.campaign_id;
        store
            .mark_extraction_task(task.id, TaskState::Running)
            .await?;

        let outcome = match self
            .fetcher
            .validate_domains_bulk(&[task.domain_name.clone()], 1, None, None)
            .await
        {
            Ok(mut outcomes) if !outcomes.is_empty() => outcomes.remove(0),
            Ok(_) => {
                let message = "fetcher returned no outcome".to_string();
                store
                    .record_extraction_task_error(task.id, &message)
                    .await?;
                return Ok(Some(BatchItemError {
                    domain_name: task.domain_name,
                    message,
                }));
            }
            Err(err) => {
                let message = err.to_string();
                store
                    .record_extraction_task_error(task.id, &message)
                    .await?;
                return Ok(Some(BatchItemError {
                    domain_name: task.domain_name,
                    message,
                }));
            }
        };

        let Some(body) = outcome.raw_body.as_deref() else {
            let message = "no body captured".to_string();
            store
                .record_extraction_task_error(task.id, &message)
                .await?;
            return Ok(Some(BatchItemError {
                domain_name: task.domain_name,
                message,
            }));
        };

        let mut signals = self.analyzer.analyze(body);
        let mut hits = self.scanner.scan(body);

        // Adaptive crawl: take a second pass at the landing URL when the
        // first body is thin and the flag is on.
        if signals.content_bytes < 512
            && self
                .flags
                .is_enabled(flag_names::ADAPTIVE_CRAWL_ENABLED, false)
        {
            if let Some(final_url) = outcome.final_url.clone() {
                if let Ok(mut deeper) = self
                    .fetcher
                    .validate_domains_bulk(&[final_url], 1, None, None)
                    .await
                {
                    if let Some(deeper_body) =
                        deeper.pop().and_then(|o| o.raw_body)
                    {
                        let deeper_signals = self.analyzer.analyze(&deeper_body);
                        if deeper_signals.content_bytes > signals.content_bytes {
                            hits = self.scanner.scan(&deeper_body);
                            signals = deeper_signals;
                        }
                    }
                }
            }
        }

        let features = FeatureVector {
            content_bytes: Some(signals.content_bytes),
            parked_confidence: Some(signals.parked_confidence),
            has_structural_signals: Some(signals.has_structural_signals),
            link_external_count: Some(signals.link_external_count),
            link_internal_count: Some(signals.link_internal_count),
            h1_count: Some(signals.h1_count),
            kw_unique: Some(hits.unique),
            kw_hits_total: Some(hits.total),
        };
        let feature_value = features.to_value();

        handle.guard(&run)?;
        store
            .upsert_extraction_features(campaign_id, &task.domain_name, &feature_value, "ready")
            .await?;
        store
            .upsert_extracted_keywords(campaign_id, &task.domain_name, &hits.keywords)
            .await?;
        store
            .update_domain_features(
                campaign_id,
                &task.domain_name,
                &feature_value,
                signals.is_parked,
                signals.parked_confidence,
            )
            .await?;

        if self
            .flags
            .is_enabled(flag_names::ADVANCED_SCORING_ENABLED, false)
        {
            let score = self.scorer.score(&features);
            store
                .update_domain_score(campaign_id, &task.domain_name, score)
                .await?;
        }

        store
            .mark_extraction_task(task.id, TaskState::Completed)
            .await?;
        Ok(None)
    }
}

async fn run_extraction(
    ctx: &mut RunCtx,
    config: ExtractionConfig,
    worker: ExtractionWorker,
) -> Result<u64, PhaseError> {
    let campaign_id = ctx.campaign_id();

    if !worker
        .flags
        .is_enabled(flag_names::EXTRACTION_ENABLED, true)
    {
        tracing::warn!(%campaign_id, "extraction disabled by feature flag, completing empty");
        return Ok(0);
    }

    seed_task_queue(ctx, campaign_id).await?;

    let tasks = ctx
        .store
        .list_extraction_tasks(
            campaign_id,
            &[TaskState::Pending, TaskState::Error],
            config.queue_limit,
        )
        .await?;
    let total = tasks.len() as u64;
    if total == 0 {
        tracing::info!(%campaign_id, "no extraction tasks to process");
        return Ok(0);
    }

    ctx.emit(0, total, "extraction started").await?;
    let semaphore = Arc::new(Semaphore::new(config.worker_count));
    let domain_timeout = Duration::from_secs(config.domain_timeout_secs);
    let cancel = ctx.cancel_token();
    let mut processed: u64 = 0;
    let mut item_errors: Vec<BatchItemError> = Vec::new();

    for chunk in tasks.chunks(config.batch_size) {
        ctx.checkpoint().await?;

        let mut handles = Vec::with_capacity(chunk.len());
        for task in chunk {
            let permit = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(if ctx.handle.stop_requested() {
                        PhaseError::Stopped(PhaseType::Extraction)
                    } else {
                        PhaseError::Cancelled(PhaseType::Extraction)
                    });
                }
                permit = Arc::clone(&semaphore).acquire_owned() => {
                    permit.expect("extraction semaphore is never closed")
                }
            };

            let worker = worker.clone();
            let store = Arc::clone(&ctx.store);
            let handle = Arc::clone(&ctx.handle);
            let run = ctx.run;
            let task = task.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let domain_name = task.domain_name.clone();
                let task_id = task.id;
                match tokio::time::timeout(
                    domain_timeout,
                    worker.run_one(store.clone(), handle, run, task),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        let message = format!("extraction timed out after {:?}", domain_timeout);
                        if let Err(err) =
                            store.record_extraction_task_error(task_id, &message).await
                        {
                            tracing::warn!(error = %err, "failed to record timeout");
                        }
                        Ok(Some(BatchItemError {
                            domain_name,
                            message,
                        }))
                    }
                }
            }));
        }

        for join in futures::future::join_all(handles).await {
            match join {
                Ok(Ok(None)) => {}
                Ok(Ok(Some(item_error))) => item_errors.push(item_error),
                // Stale context or store failure aborts the phase
                Ok(Err(err)) => return Err(err),
                Err(join_err) => {
                    return Err(PhaseError::Engine {
                        phase: PhaseType::Extraction,
                        source: EngineError::Other(format!(
                            "extraction worker panicked: {}",
                            join_err
                        )),
                    });
                }
            }
        }

        processed += chunk.len() as u64;
        ctx.emit(
            processed,
            total,
            &format!("extracted {} of {} tasks", processed, total),
        )
        .await?;
    }

    if !item_errors.is_empty() {
        tracing::warn!(
            %campaign_id,
            failed = item_errors.len(),
            total,
            "extraction finished with item errors"
        );
    }
    Ok(total)
}

/// Make sure every fetchable domain has an extraction task.
async fn seed_task_queue(ctx: &RunCtx, campaign_id: Uuid) -> Result<(), PhaseError> {
    let mut cursor: Option<u64> = None;
    loop {
        let page = ctx
            .store
            .get_generated_domains_with_cursor(campaign_id, cursor, 500)
            .await?;
        if page.is_empty() {
            return Ok(());
        }
        cursor = page.last().map(|d| d.offset_index);
        let eligible: Vec<String> = page
            .iter()
            .filter(|d| d.http_status == HttpStatus::Ok)
            .map(|d| d.domain_name.clone())
            .collect();
        if !eligible.is_empty() {
            ctx.store
                .enqueue_extraction_tasks(campaign_id, &eligible)
                .await?;
        }
    }
}
