//! Enrichment phase.
//!
//! Sweeps the campaign in offset order, applies the pure lead evaluator to
//! every domain, and persists the verdicts. Candidates whose HTTP outcome
//! is still pending are evaluated but not written. A run-context mismatch
//! terminates the sweep immediately.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::runner::{PhaseRuntime, RunCtx};
use crate::errors::PhaseError;
use crate::events::EventBus;
use crate::lead::{evaluate_lead, EvaluatorConfig, LeadCandidate};
use crate::model::{FeatureVector, GeneratedDomain, PhaseType};
use crate::phase::status::PhaseStatusReport;
use crate::phase::{Capabilities, ControlCommand, PhaseProgress, PhaseService};
use crate::store::CampaignStore;

/// Sweep page size.
const ENRICHMENT_BATCH_SIZE: usize = 200;

/// Progress tick cadence, in evaluated candidates.
const PROGRESS_TICK_EVERY: u64 = 25;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    /// Evaluator threshold overrides; omitted fields keep spec defaults.
    #[serde(flatten)]
    pub evaluator: EvaluatorConfig,
}

pub struct EnrichmentService {
    runtime: PhaseRuntime,
}

impl EnrichmentService {
    pub fn new(store: Arc<dyn CampaignStore>, bus: Arc<dyn EventBus>) -> Self {
        Self {
            runtime: PhaseRuntime::new(PhaseType::Enrichment, store, bus),
        }
    }

    fn parse_config(&self, config: &serde_json::Value) -> Result<EnrichmentConfig, PhaseError> {
        serde_json::from_value(config.clone()).map_err(|e| PhaseError::Validation {
            phase: PhaseType::Enrichment,
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl PhaseService for EnrichmentService {
    fn phase_type(&self) -> PhaseType {
        PhaseType::Enrichment
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
        let generated = self
            .runtime
            .store()
            .count_generated_domains(campaign_id)
            .await?;
        if generated == 0 {
            return Err(PhaseError::MissingPrerequisite {
                phase: PhaseType::Enrichment,
                message: "no domains to enrich".into(),
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
            .get_phase_config(campaign_id, PhaseType::Enrichment)
            .await?
            .ok_or(PhaseError::NotConfigured {
                phase: PhaseType::Enrichment,
                campaign_id,
            })?;
        let config = self.parse_config(&raw)?;

        self.runtime
            .launch(campaign_id, move |mut ctx: RunCtx| async move {
                run_enrichment(&mut ctx, config).await
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

/// Assemble the evaluator's view of one domain row.
fn candidate_from(domain: &GeneratedDomain) -> LeadCandidate {
    LeadCandidate {
        http_status: domain.http_status,
        is_parked: domain.is_parked,
        parked_confidence: domain.parked_confidence,
        domain_score: domain.domain_score,
        features: domain
            .feature_vector
            .as_ref()
            .map(FeatureVector::from_value)
            .unwrap_or_default(),
    }
}

async fn run_enrichment(ctx: &mut RunCtx, config: EnrichmentConfig) -> Result<u64, PhaseError> {
    let campaign_id = ctx.campaign_id();
    let total = ctx.store.count_generated_domains(campaign_id).await?;
    if total == 0 {
        return Err(PhaseError::MissingPrerequisite {
            phase: PhaseType::Enrichment,
            message: "no domains to enrich".into(),
        });
    }

    ctx.emit(0, total, "enrichment started").await?;
    let mut cursor: Option<u64> = None;
    let mut processed: u64 = 0;
    let mut since_tick: u64 = 0;
    loop {
        ctx.checkpoint().await?;
        // A stale run context ends the sweep before the next batch
        ctx.guard()?;

        let page = ctx
            .store
            .get_generated_domains_with_cursor(campaign_id, cursor, ENRICHMENT_BATCH_SIZE)
            .await?;
        if page.is_empty() {
            break;
        }
        cursor = page.last().map(|d| d.offset_index);

        for domain in &page {
            let verdict = evaluate_lead(&candidate_from(domain), &config.evaluator);
            if !verdict.skip_persistence {
                ctx.guard()?;
                ctx.store
                    .update_domain_lead_status(
                        campaign_id,
                        &domain.domain_name,
                        verdict.status,
                        verdict.lead_score,
                        verdict.rejection_reason.as_str(),
                    )
                    .await?;
            }
            processed += 1;
            since_tick += 1;
            if since_tick >= PROGRESS_TICK_EVERY {
                since_tick = 0;
                ctx.emit(
                    processed,
                    total,
                    &format!("evaluated {} of {} candidates", processed, total),
                )
                .await?;
            }
        }
    }
    ctx.emit(processed, total, "enrichment sweep complete")
        .await?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DnsStatus, HttpStatus, LeadStatus};
    use chrono::Utc;

    fn domain_row(http_status: HttpStatus) -> GeneratedDomain {
        GeneratedDomain {
            id: 1,
            campaign_id: Uuid::nil(),
            domain_name: "d.example".into(),
            offset_index: 0,
            generated_at: Utc::now(),
            dns_status: DnsStatus::Ok,
            http_status,
            http_status_code: Some(200),
            body_hash: None,
            latency_ms: Some(10),
            lead_status: LeadStatus::Pending,
            lead_score: None,
            domain_score: Some(0.5),
            feature_vector: Some(serde_json::json!({
                "has_structural_signals": true,
                "kw_unique": 2,
                "content_bytes": 2048
            })),
            is_parked: false,
            parked_confidence: 0.1,
            last_http_fetched_at: Some(Utc::now()),
        }
    }

    #[test]
    fn test_candidate_from_row() {
        let row = domain_row(HttpStatus::Ok);
        let candidate = candidate_from(&row);
        assert_eq!(candidate.http_status, HttpStatus::Ok);
        assert_eq!(candidate.domain_score, Some(0.5));
        assert_eq!(candidate.features.kw_unique, Some(2));
    }

    #[test]
    fn test_candidate_from_row_without_features() {
        let mut row = domain_row(HttpStatus::Pending);
        row.feature_vector = None;
        let candidate = candidate_from(&row);
        assert_eq!(candidate.features, FeatureVector::default());
    }

    #[test]
    fn test_enrichment_config_flattens_evaluator_overrides() {
        let config: EnrichmentConfig = serde_json::from_value(serde_json::json!({
            "match_score_threshold": 0.6,
            "min_content_bytes": 2048
        }))
        .unwrap();
        assert_eq!(config.evaluator.match_score_threshold, 0.6);
        assert_eq!(config.evaluator.min_content_bytes, 2048);
        // Untouched fields keep their defaults
        assert_eq!(config.evaluator.parked_confidence_floor, 0.45);
    }
}
