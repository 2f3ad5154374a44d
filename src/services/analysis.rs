//! Analysis phase.
//!
//! Sweeps domains whose extraction features are `ready` and delegates
//! scoring to the relevance scorer collaborator; this crate does no feature
//! engineering of its own. Each rescore lands in `analysis_scores` and is
//! mirrored onto the domain row's `domain_score`, keeping the score row at
//! least as fresh as the feature row it was computed from.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::runner::{PhaseRuntime, RunCtx};
use crate::engines::flags::{names as flag_names, FeatureFlagReader};
use crate::engines::RelevanceScorer;
use crate::errors::PhaseError;
use crate::events::EventBus;
use crate::model::{FeatureVector, PhaseType};
use crate::phase::status::PhaseStatusReport;
use crate::phase::{Capabilities, ControlCommand, PhaseProgress, PhaseService};
use crate::store::CampaignStore;

fn default_batch_size() -> usize {
    200
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
        }
    }
}

impl AnalysisConfig {
    fn validate(&self) -> Result<(), String> {
        if self.batch_size == 0 {
            return Err("batch_size must be greater than zero".into());
        }
        Ok(())
    }
}

pub struct AnalysisService {
    runtime: PhaseRuntime,
    scorer: Arc<dyn RelevanceScorer>,
    flags: Arc<dyn FeatureFlagReader>,
}

impl AnalysisService {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        bus: Arc<dyn EventBus>,
        scorer: Arc<dyn RelevanceScorer>,
        flags: Arc<dyn FeatureFlagReader>,
    ) -> Self {
        Self {
            runtime: PhaseRuntime::new(PhaseType::Analysis, store, bus),
            scorer,
            flags,
        }
    }

    fn parse_config(&self, config: &serde_json::Value) -> Result<AnalysisConfig, PhaseError> {
        let parsed: AnalysisConfig =
            serde_json::from_value(config.clone()).map_err(|e| PhaseError::Validation {
                phase: PhaseType::Analysis,
                message: e.to_string(),
            })?;
        parsed.validate().map_err(|message| PhaseError::Validation {
            phase: PhaseType::Analysis,
            message,
        })?;
        Ok(parsed)
    }
}

#[async_trait]
impl PhaseService for AnalysisService {
    fn phase_type(&self) -> PhaseType {
        PhaseType::Analysis
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::stop_restart()
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
        // Without feature rows there is nothing to score
        let ready = self
            .runtime
            .store()
            .list_domains_with_ready_features(campaign_id, None, 1)
            .await?;
        if ready.is_empty() {
            return Err(PhaseError::MissingPrerequisite {
                phase: PhaseType::Analysis,
                message: "no ready feature vectors to analyse".into(),
            });
        }
        self.runtime.configure_slot(campaign_id, &config).await
    }

    async fn execute(
        &self,
        campaign_id: Uuid,
    ) -> Result<mpsc::Receiver<PhaseProgress>, PhaseError> {
        let raw = self
            .runtime
            .store()
            .get_phase_config(campaign_id, PhaseType::Analysis)
            .await?
            .ok_or(PhaseError::NotConfigured {
                phase: PhaseType::Analysis,
                campaign_id,
            })?;
        let config = self.parse_config(&raw)?;
        let scorer = Arc::clone(&self.scorer);
        let flags = Arc::clone(&self.flags);

        self.runtime
            .launch(campaign_id, move |mut ctx: RunCtx| async move {
                run_analysis(&mut ctx, config, scorer, flags).await
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

async fn run_analysis(
    ctx: &mut RunCtx,
    config: AnalysisConfig,
    scorer: Arc<dyn RelevanceScorer>,
    flags: Arc<dyn FeatureFlagReader>,
) -> Result<u64, PhaseError> {
    let campaign_id = ctx.campaign_id();

    // First sweep just sizes the work
    let mut total: u64 = 0;
    let mut cursor: Option<u64> = None;
    loop {
        let page = ctx
            .store
            .list_domains_with_ready_features(campaign_id, cursor, config.batch_size)
            .await?;
        if page.is_empty() {
            break;
        }
        total += page.len() as u64;
        cursor = page.last().map(|(d, _)| d.offset_index);
    }
    if total == 0 {
        return Err(PhaseError::MissingPrerequisite {
            phase: PhaseType::Analysis,
            message: "no ready feature vectors to analyse".into(),
        });
    }

    // Dual-read: compare fresh scores against the stored ones and report
    // high-variance domains without changing what gets persisted.
    let dual_read = flags.is_enabled(flag_names::DUAL_READ_ENABLED, false);
    let variance_threshold = flags.threshold(flag_names::VARIANCE_THRESHOLD).unwrap_or(0.2);
    let min_coverage = flags.threshold(flag_names::MIN_COVERAGE).unwrap_or(0.0);
    let mut compared: u64 = 0;
    let mut high_variance: Vec<String> = Vec::new();

    ctx.emit(0, total, "analysis started").await?;
    let mut processed: u64 = 0;
    let mut cursor: Option<u64> = None;
    loop {
        ctx.checkpoint().await?;

        let page = ctx
            .store
            .list_domains_with_ready_features(campaign_id, cursor, config.batch_size)
            .await?;
        if page.is_empty() {
            break;
        }
        cursor = page.last().map(|(d, _)| d.offset_index);

        for (domain, feature_row) in &page {
            let features = FeatureVector::from_value(&feature_row.features);
            let score = scorer.score(&features);

            if dual_read {
                if let Some(prior) = ctx
                    .store
                    .get_analysis_score(campaign_id, &domain.domain_name)
                    .await?
                {
                    compared += 1;
                    if (score - prior.relevance_score).abs() > variance_threshold {
                        high_variance.push(domain.domain_name.clone());
                    }
                }
            }

            ctx.guard()?;
            ctx.store
                .upsert_analysis_score(campaign_id, &domain.domain_name, score)
                .await?;
            ctx.store
                .update_domain_score(campaign_id, &domain.domain_name, score)
                .await?;
            processed += 1;
        }
        ctx.emit(
            processed,
            total,
            &format!("scored {} of {} domains", processed, total),
        )
        .await?;
    }

    if dual_read && compared > 0 && (compared as f64 / total.max(1) as f64) >= min_coverage {
        ctx.bus
            .publish_system_event(
                "dualread_variance_summary",
                serde_json::json!({
                    "campaignId": campaign_id,
                    "highVarianceDomains": high_variance,
                    "totalDomainsCompared": compared,
                    "threshold": variance_threshold,
                }),
            )
            .await;
    }
    Ok(total)
}
