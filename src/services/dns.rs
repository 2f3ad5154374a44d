//! DNS validation phase.
//!
//! Sweeps the campaign's generated domains with a cursor, resolves each
//! batch through the resolver collaborator, normalises every result into a
//! status bucket plus a reason, and persists each batch atomically (domain
//! rows, dns_validation_results, counter delta in one transaction).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::runner::{PhaseRuntime, RunCtx};
use crate::engines::{DomainResolver, ResolveOutcome, ResolveStatus};
use crate::errors::{EngineError, PhaseError};
use crate::events::EventBus;
use crate::model::{DnsReason, DnsStatus, PhaseType};
use crate::phase::status::PhaseStatusReport;
use crate::phase::{Capabilities, ControlCommand, PhaseProgress, PhaseService};
use crate::store::{CampaignStore, DnsUpdate};

fn default_batch_size() -> usize {
    50
}

fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    pub persona_ids: Vec<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl DnsConfig {
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

/// Normalise one resolver result into a status bucket and reason.
pub fn classify_resolution(outcome: &ResolveOutcome) -> (DnsStatus, DnsReason) {
    let error = outcome.error.as_deref().unwrap_or("").to_lowercase();
    match outcome.status {
        ResolveStatus::Resolved if !outcome.ips.is_empty() => (DnsStatus::Ok, DnsReason::Ok),
        ResolveStatus::Timeout => (DnsStatus::Timeout, DnsReason::Timeout),
        _ if error.contains("timeout") => (DnsStatus::Timeout, DnsReason::Timeout),
        ResolveStatus::NotFound => (DnsStatus::Error, DnsReason::Nxdomain),
        _ if error.contains("no such host") => (DnsStatus::Error, DnsReason::Nxdomain),
        _ if error.contains("connection refused") => (DnsStatus::Error, DnsReason::Refused),
        _ if error.contains("servfail") => (DnsStatus::Error, DnsReason::Servfail),
        // Resolved with an empty answer section
        ResolveStatus::Resolved => (DnsStatus::Error, DnsReason::Noanswer),
        _ if error.contains("no answer") => (DnsStatus::Error, DnsReason::Noanswer),
        _ => (DnsStatus::Error, DnsReason::Error),
    }
}

pub struct DnsService {
    runtime: PhaseRuntime,
    resolver: Arc<dyn DomainResolver>,
}

impl DnsService {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        bus: Arc<dyn EventBus>,
        resolver: Arc<dyn DomainResolver>,
    ) -> Self {
        Self {
            runtime: PhaseRuntime::new(PhaseType::DnsValidation, store, bus),
            resolver,
        }
    }

    fn parse_config(&self, config: &serde_json::Value) -> Result<DnsConfig, PhaseError> {
        let parsed: DnsConfig =
            serde_json::from_value(config.clone()).map_err(|e| PhaseError::Validation {
                phase: PhaseType::DnsValidation,
                message: e.to_string(),
            })?;
        parsed.validate().map_err(|message| PhaseError::Validation {
            phase: PhaseType::DnsValidation,
            message,
        })?;
        Ok(parsed)
    }
}

#[async_trait]
impl PhaseService for DnsService {
    fn phase_type(&self) -> PhaseType {
        PhaseType::DnsValidation
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
        // Upstream data must exist before this phase can be armed
        let generated = self
            .runtime
            .store()
            .count_generated_domains(campaign_id)
            .await?;
        if generated == 0 {
            return Err(PhaseError::MissingPrerequisite {
                phase: PhaseType::DnsValidation,
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
            .get_phase_config(campaign_id, PhaseType::DnsValidation)
            .await?
            .ok_or(PhaseError::NotConfigured {
                phase: PhaseType::DnsValidation,
                campaign_id,
            })?;
        let config = self.parse_config(&raw)?;
        let resolver = Arc::clone(&self.resolver);

        self.runtime
            .launch(campaign_id, move |mut ctx: RunCtx| async move {
                run_dns_validation(&mut ctx, config, resolver).await
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

/// Call the resolver, retrying transient failures. After the retries are
/// spent the whole batch degrades to per-item errors; the phase continues.
async fn resolve_with_retries(
    resolver: &Arc<dyn DomainResolver>,
    domains: &[String],
    batch_size: usize,
    max_retries: u32,
) -> Vec<ResolveOutcome> {
    let mut attempt = 0;
    loop {
        match resolver.validate_domains_bulk(domains, batch_size).await {
            Ok(outcomes) => return outcomes,
            Err(err) => {
                attempt += 1;
                if attempt > max_retries {
                    tracing::warn!(
                        error = %err,
                        attempts = attempt,
                        "resolver exhausted retries, recording batch as per-item errors"
                    );
                    return domains
                        .iter()
                        .map(|domain| ResolveOutcome {
                            domain: domain.clone(),
                            status: ResolveStatus::Error,
                            ips: Vec::new(),
                            error: Some(describe_engine_error(&err)),
                        })
                        .collect();
                }
                tracing::debug!(error = %err, attempt, "resolver call failed, retrying");
            }
        }
    }
}

fn describe_engine_error(err: &EngineError) -> String {
    match err {
        EngineError::Timeout(msg) => format!("timeout: {}", msg),
        other => other.to_string(),
    }
}

async fn run_dns_validation(
    ctx: &mut RunCtx,
    config: DnsConfig,
    resolver: Arc<dyn DomainResolver>,
) -> Result<u64, PhaseError> {
    let campaign_id = ctx.campaign_id();
    let total = ctx.store.count_generated_domains(campaign_id).await?;
    if total == 0 {
        return Err(PhaseError::MissingPrerequisite {
            phase: PhaseType::DnsValidation,
            message: "no generated domains to validate".into(),
        });
    }

    ctx.emit(0, total, "dns validation started").await?;
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

        let names: Vec<String> = page.iter().map(|d| d.domain_name.clone()).collect();
        let outcomes =
            resolve_with_retries(&resolver, &names, config.batch_size, config.max_retries).await;

        let updates: Vec<DnsUpdate> = outcomes
            .iter()
            .map(|outcome| {
                let (status, reason) = classify_resolution(outcome);
                DnsUpdate {
                    domain_name: outcome.domain.clone(),
                    status,
                    reason,
                    ips: outcome.ips.clone(),
                }
            })
            .collect();

        ctx.guard()?;
        let delta = ctx
            .store
            .update_domains_bulk_dns_status(campaign_id, &updates)
            .await?;
        ctx.bus
            .publish_system_event(
                "domain_status_delta",
                serde_json::json!({
                    "campaignId": campaign_id,
                    "phase": PhaseType::DnsValidation,
                    "count": updates.len(),
                    "delta": delta,
                }),
            )
            .await;

        processed += page.len() as u64;
        ctx.emit(
            processed,
            total,
            &format!("validated {} of {} domains", processed, total),
        )
        .await?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(status: ResolveStatus, ips: &[&str], error: Option<&str>) -> ResolveOutcome {
        ResolveOutcome {
            domain: "x.example".into(),
            status,
            ips: ips.iter().map(|ip| ip.parse().unwrap()).collect(),
            error: error.map(String::from),
        }
    }

    #[test]
    fn test_resolved_with_ip_is_ok() {
        let (status, reason) =
            classify_resolution(&outcome(ResolveStatus::Resolved, &["1.2.3.4"], None));
        assert_eq!(status, DnsStatus::Ok);
        assert_eq!(reason, DnsReason::Ok);
    }

    #[test]
    fn test_explicit_timeout_and_timeout_substring() {
        let (status, reason) = classify_resolution(&outcome(ResolveStatus::Timeout, &[], None));
        assert_eq!((status, reason), (DnsStatus::Timeout, DnsReason::Timeout));

        let (status, reason) = classify_resolution(&outcome(
            ResolveStatus::Error,
            &[],
            Some("i/o timeout reading response"),
        ));
        assert_eq!((status, reason), (DnsStatus::Timeout, DnsReason::Timeout));
    }

    #[test]
    fn test_nxdomain_variants() {
        let (status, reason) = classify_resolution(&outcome(ResolveStatus::NotFound, &[], None));
        assert_eq!((status, reason), (DnsStatus::Error, DnsReason::Nxdomain));

        let (status, reason) = classify_resolution(&outcome(
            ResolveStatus::Error,
            &[],
            Some("lookup x.example: no such host"),
        ));
        assert_eq!((status, reason), (DnsStatus::Error, DnsReason::Nxdomain));
    }

    #[test]
    fn test_refused_servfail_noanswer() {
        let (status, reason) = classify_resolution(&outcome(
            ResolveStatus::Error,
            &[],
            Some("connection refused"),
        ));
        assert_eq!((status, reason), (DnsStatus::Error, DnsReason::Refused));

        let (status, reason) =
            classify_resolution(&outcome(ResolveStatus::Error, &[], Some("SERVFAIL")));
        assert_eq!((status, reason), (DnsStatus::Error, DnsReason::Servfail));

        // Resolved but no addresses in the answer
        let (status, reason) = classify_resolution(&outcome(ResolveStatus::Resolved, &[], None));
        assert_eq!((status, reason), (DnsStatus::Error, DnsReason::Noanswer));
    }

    #[test]
    fn test_unclassified_errors_fall_through() {
        let (status, reason) = classify_resolution(&outcome(
            ResolveStatus::Error,
            &[],
            Some("network unreachable"),
        ));
        assert_eq!((status, reason), (DnsStatus::Error, DnsReason::Error));
    }

    #[test]
    fn test_config_validation() {
        let base = DnsConfig {
            persona_ids: vec!["persona-1".into()],
            batch_size: 50,
            timeout_secs: 10,
            max_retries: 3,
        };
        assert!(base.validate().is_ok());

        let cfg = DnsConfig {
            persona_ids: vec![],
            ..base.clone()
        };
        assert!(cfg.validate().is_err());

        let cfg = DnsConfig {
            timeout_secs: 0,
            ..base.clone()
        };
        assert!(cfg.validate().is_err());

        let cfg = DnsConfig {
            batch_size: 0,
            ..base
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_config_defaults() {
        let cfg: DnsConfig = serde_json::from_value(serde_json::json!({
            "persona_ids": ["p1"],
            "timeout_secs": 5
        }))
        .unwrap();
        assert_eq!(cfg.batch_size, 50);
        assert_eq!(cfg.max_retries, 3);
    }
}
