//! HTTP / keyword validation phase.
//!
//! Same sweep shape as DNS validation, against the HTTP fetcher. Each
//! fetched domain's row records the status bucket, status code, sha256 body
//! hash, latency, parsed structural signals, keyword hits, and parked
//! verdict. Per-domain failures stay row-level; phase-level failure is
//! reserved for store errors and cancellation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::runner::{PhaseRuntime, RunCtx};
use crate::engines::{FetchOutcome, FetchStatus, HttpFetcher, KeywordScanner, PageAnalyzer};
use crate::errors::PhaseError;
use crate::events::EventBus;
use crate::model::{DnsStatus, FeatureVector, HttpStatus, PhaseType};
use crate::phase::status::PhaseStatusReport;
use crate::phase::{Capabilities, ControlCommand, PhaseProgress, PhaseService};
use crate::store::{CampaignStore, HttpUpdate};

fn default_batch_size() -> usize {
    50
}

fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub persona_ids: Vec<String>,
    #[serde(default)]
    pub proxy_id: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl HttpConfig {
    fn validate(&self) -> Result<(), String> {
        if self.persona_ids.is_empty() {
            return Err("persona_ids must not be empty".into());
        }
        if self.batch_size == 0 {
            return Err("batch_size must be greater than zero".into());
        }
        if self.timeout_secs == 0 {
            return Err("timeout must be greater than zero".into());
        }
        Ok(())
    }
}

/// Hex sha256 of a fetched body.
pub fn body_hash(body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn bucket_for(outcome: &FetchOutcome) -> HttpStatus {
    match outcome.status {
        FetchStatus::Ok if outcome.is_success => HttpStatus::Ok,
        FetchStatus::Ok => HttpStatus::Error,
        FetchStatus::Error => HttpStatus::Error,
        FetchStatus::Timeout => HttpStatus::Timeout,
    }
}

/// Build the row update for one fetch outcome, running the page analyzer
/// and keyword scanner over the body when one was captured.
fn build_update(
    outcome: &FetchOutcome,
    analyzer: &Arc<dyn PageAnalyzer>,
    scanner: &Arc<dyn KeywordScanner>,
) -> HttpUpdate {
    let mut update = HttpUpdate {
        domain_name: outcome.domain.clone(),
        status: Some(bucket_for(outcome)),
        status_code: outcome.status_code,
        latency_ms: Some(outcome.latency_ms),
        fetched_at: Some(outcome.fetched_at),
        ..Default::default()
    };

    if let Some(body) = outcome.raw_body.as_deref() {
        let signals = analyzer.analyze(body);
        let hits = scanner.scan(body);
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
        update.body_hash = Some(body_hash(body));
        update.feature_vector = Some(features.to_value());
        update.is_parked = Some(signals.is_parked);
        update.parked_confidence = Some(signals.parked_confidence);
    }
    update
}

pub struct HttpService {
    runtime: PhaseRuntime,
    fetcher: Arc<dyn HttpFetcher>,
    analyzer: Arc<dyn PageAnalyzer>,
    scanner: Arc<dyn KeywordScanner>,
}

impl HttpService {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        bus: Arc<dyn EventBus>,
        fetcher: Arc<dyn HttpFetcher>,
        analyzer: Arc<dyn PageAnalyzer>,
        scanner: Arc<dyn KeywordScanner>,
    ) -> Self {
        Self {
            runtime: PhaseRuntime::new(PhaseType::HttpKeywordValidation, store, bus),
            fetcher,
            analyzer,
            scanner,
        }
    }

    fn parse_config(&self, config: &serde_json::Value) -> Result<HttpConfig, PhaseError> {
        let parsed: HttpConfig =
            serde_json::from_value(config.clone()).map_err(|e| PhaseError::Validation {
                phase: PhaseType::HttpKeywordValidation,
                message: e.to_string(),
            })?;
        parsed.validate().map_err(|message| PhaseError::Validation {
            phase: PhaseType::HttpKeywordValidation,
            message,
        })?;
        Ok(parsed)
    }
}

#[async_trait]
impl PhaseService for HttpService {
    fn phase_type(&self) -> PhaseType {
        PhaseType::HttpKeywordValidation
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
                phase: PhaseType::HttpKeywordValidation,
                message: "no generated domains to validate".into(),
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
            .get_phase_config(campaign_id, PhaseType::HttpKeywordValidation)
            .await?
            .ok_or(PhaseError::NotConfigured {
                phase: PhaseType::HttpKeywordValidation,
                campaign_id,
            })?;
        let config = self.parse_config(&raw)?;
        let fetcher = Arc::clone(&self.fetcher);
        let analyzer = Arc::clone(&self.analyzer);
        let scanner = Arc::clone(&self.scanner);

        self.runtime
            .launch(campaign_id, move |mut ctx: RunCtx| async move {
                run_http_validation(&mut ctx, config, fetcher, analyzer, scanner).await
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

async fn run_http_validation(
    ctx: &mut RunCtx,
    config: HttpConfig,
    fetcher: Arc<dyn HttpFetcher>,
    analyzer: Arc<dyn PageAnalyzer>,
    scanner: Arc<dyn KeywordScanner>,
) -> Result<u64, PhaseError> {
    let campaign_id = ctx.campaign_id();
    let total = ctx.store.count_generated_domains(campaign_id).await?;
    if total == 0 {
        return Err(PhaseError::MissingPrerequisite {
            phase: PhaseType::HttpKeywordValidation,
            message: "no generated domains to validate".into(),
        });
    }

    let persona = config.persona_ids.first().cloned();
    ctx.emit(0, total, "http validation started").await?;
    let mut cursor: Option<u64> = None;
    let mut processed: u64 = 0;
    loop {
        ctx.checkpoint().await?;

        let page = ctx
            .store
            .get_generated_domains_with_cursor(campaign_id, cursor, config.batch_size)
            .await?;
        if page.is_empty() {
            break;
        }
        cursor = page.last().map(|d| d.offset_index);

        // Only domains that resolved get fetched; the rest just advance
        // the sweep.
        let names: Vec<String> = page
            .iter()
            .filter(|d| d.dns_status == DnsStatus::Ok)
            .map(|d| d.domain_name.clone())
            .collect();

        if !names.is_empty() {
            let outcomes = fetch_with_retries(
                &fetcher,
                &names,
                config.batch_size,
                persona.as_deref(),
                config.proxy_id.as_deref(),
                config.max_retries,
            )
            .await;
            let updates: Vec<HttpUpdate> = outcomes
                .iter()
                .map(|outcome| build_update(outcome, &analyzer, &scanner))
                .collect();

            ctx.guard()?;
            let delta = ctx
                .store
                .update_domains_bulk_http_status(campaign_id, &updates)
                .await?;
            ctx.bus
                .publish_system_event(
                    "domain_status_delta",
                    serde_json::json!({
                        "campaignId": campaign_id,
                        "phase": PhaseType::HttpKeywordValidation,
                        "count": updates.len(),
                        "delta": delta,
                    }),
                )
                .await;
        }

        processed += page.len() as u64;
        ctx.emit(
            processed,
            total,
            &format!("fetched {} of {} domains", processed, total),
        )
        .await?;
    }
    Ok(total)
}

/// Retry transient fetcher failures; after retries are spent the batch
/// degrades to per-item timeouts/errors and the phase continues.
async fn fetch_with_retries(
    fetcher: &Arc<dyn HttpFetcher>,
    domains: &[String],
    batch_size: usize,
    persona: Option<&str>,
    proxy: Option<&str>,
    max_retries: u32,
) -> Vec<FetchOutcome> {
    let mut attempt = 0;
    loop {
        match fetcher
            .validate_domains_bulk(domains, batch_size, persona, proxy)
            .await
        {
            Ok(outcomes) => return outcomes,
            Err(err) => {
                attempt += 1;
                if attempt > max_retries {
                    tracing::warn!(
                        error = %err,
                        attempts = attempt,
                        "fetcher exhausted retries, recording batch as per-item errors"
                    );
                    return domains
                        .iter()
                        .map(|domain| FetchOutcome {
                            domain: domain.clone(),
                            status: FetchStatus::Error,
                            status_code: None,
                            raw_body: None,
                            latency_ms: 0,
                            final_url: None,
                            fetched_at: chrono::Utc::now(),
                            is_success: false,
                        })
                        .collect();
                }
                tracing::debug!(error = %err, attempt, "fetcher call failed, retrying");
            }
        }
    }
}
