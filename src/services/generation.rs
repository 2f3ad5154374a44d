//! Domain generation phase.
//!
//! Generates candidate domain strings deterministically from an offset
//! index: each offset maps to exactly one domain via base-|charset|
//! encoding of the variable positions, so a cancelled run resumes from
//! `offset_start` without duplicating rows.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::runner::{PhaseRuntime, RunCtx};
use crate::errors::PhaseError;
use crate::events::EventBus;
use crate::model::PhaseType;
use crate::phase::status::PhaseStatusReport;
use crate::phase::{Capabilities, ControlCommand, PhaseProgress, PhaseService};
use crate::store::{CampaignStore, NewDomain};

fn default_batch_size() -> usize {
    1000
}

/// Where the variable segment sits relative to the constant string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    /// Variable segment first: `<var><constant>.<tld>`
    Prefix,
    /// Constant first: `<constant><var>.<tld>`
    Suffix,
    /// Variable split around the constant: `<var_l><constant><var_r>.<tld>`
    Both,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub pattern_type: PatternType,
    pub variable_length: usize,
    pub character_set: String,
    #[serde(default)]
    pub constant_string: String,
    pub tld: String,
    pub num_domains: u64,
    #[serde(default)]
    pub offset_start: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl GenerationConfig {
    /// The character set with duplicates removed, order preserved.
    pub fn charset(&self) -> Vec<char> {
        let mut seen = std::collections::HashSet::new();
        self.character_set
            .chars()
            .filter(|c| seen.insert(*c))
            .collect()
    }

    fn validate(&self) -> Result<(), String> {
        if self.variable_length == 0 {
            return Err("variable_length must be greater than zero".into());
        }
        if self.character_set.is_empty() {
            return Err("character_set must not be empty".into());
        }
        if self.tld.is_empty() {
            return Err("tld must not be empty".into());
        }
        if self.num_domains == 0 {
            return Err("num_domains must be greater than zero".into());
        }
        let capacity = (self.charset().len() as u64)
            .checked_pow(self.variable_length as u32)
            .unwrap_or(u64::MAX);
        if self.offset_start.saturating_add(self.num_domains) > capacity {
            return Err(format!(
                "offset range exceeds keyspace capacity of {} domains",
                capacity
            ));
        }
        Ok(())
    }
}

/// Encode an offset as a fixed-width string over the charset, most
/// significant position first, padded with the first charset character.
pub fn encode_offset(offset: u64, charset: &[char], width: usize) -> String {
    let base = charset.len() as u64;
    let mut digits = vec![charset[0]; width];
    let mut remaining = offset;
    for slot in digits.iter_mut().rev() {
        *slot = charset[(remaining % base) as usize];
        remaining /= base;
        if remaining == 0 {
            break;
        }
    }
    digits.into_iter().collect()
}

/// The one domain string a given offset maps to.
pub fn domain_for_offset(config: &GenerationConfig, charset: &[char], offset: u64) -> String {
    let variable = encode_offset(offset, charset, config.variable_length);
    let label = match config.pattern_type {
        PatternType::Prefix => format!("{}{}", variable, config.constant_string),
        PatternType::Suffix => format!("{}{}", config.constant_string, variable),
        PatternType::Both => {
            let split = variable.len().div_ceil(2);
            let (left, right) = variable.split_at(split);
            format!("{}{}{}", left, config.constant_string, right)
        }
    };
    format!("{}.{}", label, config.tld)
}

pub struct GenerationService {
    runtime: PhaseRuntime,
}

impl GenerationService {
    pub fn new(store: Arc<dyn CampaignStore>, bus: Arc<dyn EventBus>) -> Self {
        Self {
            runtime: PhaseRuntime::new(PhaseType::DomainGeneration, store, bus),
        }
    }

    fn parse_config(&self, config: &serde_json::Value) -> Result<GenerationConfig, PhaseError> {
        let parsed: GenerationConfig =
            serde_json::from_value(config.clone()).map_err(|e| PhaseError::Validation {
                phase: PhaseType::DomainGeneration,
                message: e.to_string(),
            })?;
        parsed.validate().map_err(|message| PhaseError::Validation {
            phase: PhaseType::DomainGeneration,
            message,
        })?;
        Ok(parsed)
    }
}

#[async_trait]
impl PhaseService for GenerationService {
    fn phase_type(&self) -> PhaseType {
        PhaseType::DomainGeneration
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
        self.runtime.configure_slot(campaign_id, &config).await
    }

    async fn execute(
        &self,
        campaign_id: Uuid,
    ) -> Result<mpsc::Receiver<PhaseProgress>, PhaseError> {
        let raw = self
            .runtime
            .store()
            .get_phase_config(campaign_id, PhaseType::DomainGeneration)
            .await?
            .ok_or(PhaseError::NotConfigured {
                phase: PhaseType::DomainGeneration,
                campaign_id,
            })?;
        let config = self.parse_config(&raw)?;

        self.runtime
            .launch(campaign_id, move |mut ctx: RunCtx| async move {
                run_generation(&mut ctx, config).await
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

async fn run_generation(ctx: &mut RunCtx, config: GenerationConfig) -> Result<u64, PhaseError> {
    let campaign_id = ctx.campaign_id();
    let charset = config.charset();
    let total = config.num_domains;
    let mut produced: u64 = 0;
    let mut offset = config.offset_start;

    ctx.emit(0, total, "domain generation started").await?;
    while produced < total {
        ctx.checkpoint().await?;

        let batch_len = (config.batch_size as u64).min(total - produced);
        let batch: Vec<NewDomain> = (0..batch_len)
            .map(|i| NewDomain {
                domain_name: domain_for_offset(&config, &charset, offset + i),
                offset_index: offset + i,
            })
            .collect();

        ctx.guard()?;
        ctx.store
            .insert_generated_domains(campaign_id, &batch)
            .await?;
        produced += batch_len;
        offset += batch_len;
        ctx.emit(
            produced,
            total,
            &format!("generated {} of {} domains", produced, total),
        )
        .await?;
    }
    Ok(total)
}
