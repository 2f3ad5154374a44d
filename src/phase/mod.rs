//! The phase-service framework.
//!
//! This module provides:
//! - `PhaseService` — the contract every phase variant implements
//! - `PhaseRegistry` — phase services keyed by their `PhaseType`
//! - `PhaseProgress` / `ControlCommand` — the streaming and control
//!   protocol shared by every phase
//! - `execution` — in-memory run state, the run-id guard and pause gate
//! - `control` — the per-campaign control watcher
//! - `progress` — lossy channel emission plus throttled durable writes
//! - `status` — the aggregate status composer

pub mod control;
pub mod execution;
pub mod progress;
pub mod status;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::errors::PhaseError;
use crate::model::{PhaseStatus, PhaseType};
use status::PhaseStatusReport;

/// Capacity of the downstream control channel owned by each execution.
pub const CONTROL_CHANNEL_CAPACITY: usize = 8;

/// Capacity of the in-memory progress channel. Producers drop updates when
/// the consumer falls behind; status is recoverable from storage.
pub const PROGRESS_CHANNEL_CAPACITY: usize = 64;

/// One progress update on the in-memory stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseProgress {
    pub campaign_id: Uuid,
    pub phase: PhaseType,
    pub status: PhaseStatus,
    pub progress_pct: f64,
    pub items_total: u64,
    pub items_processed: u64,
    pub message: String,
    /// Populated on `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Inbound runtime control signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlSignal {
    Pause,
    Resume,
    Stop,
}

/// A control signal plus an optional acknowledgement slot. The service
/// acknowledges exactly once: `Ok(())` on success, the error otherwise.
#[derive(Debug)]
pub struct ControlCommand {
    pub signal: ControlSignal,
    pub ack: Option<oneshot::Sender<Result<(), PhaseError>>>,
}

impl ControlCommand {
    pub fn new(signal: ControlSignal) -> Self {
        Self { signal, ack: None }
    }

    pub fn with_ack(signal: ControlSignal) -> (Self, oneshot::Receiver<Result<(), PhaseError>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                signal,
                ack: Some(tx),
            },
            rx,
        )
    }

    /// Consume the ack slot, if any. Safe to call once only; the slot is
    /// taken out so a second call is a no-op.
    pub fn acknowledge(&mut self, result: Result<(), PhaseError>) {
        if let Some(tx) = self.ack.take() {
            let _ = tx.send(result);
        }
    }
}

/// Runtime control support reported by a phase service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub can_pause: bool,
    pub can_resume: bool,
    pub can_stop: bool,
    pub can_restart: bool,
}

impl Capabilities {
    /// Full control protocol support.
    pub fn full() -> Self {
        Self {
            can_pause: true,
            can_resume: true,
            can_stop: true,
            can_restart: true,
        }
    }

    /// Stop/restart only; pause is not offered.
    pub fn stop_restart() -> Self {
        Self {
            can_pause: false,
            can_resume: false,
            can_stop: true,
            can_restart: true,
        }
    }
}

/// The (campaign, phase, run) triple carried by every execution task.
///
/// Every durable write and every mutation of the in-memory execution row
/// first compares this run id with the execution's current run id; a
/// mismatch means a newer run has taken over and the task must terminate
/// without further writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseRunContext {
    pub campaign_id: Uuid,
    pub phase: PhaseType,
    pub run_id: Uuid,
}

/// The contract every phase variant implements. One service instance owns
/// exactly one `PhaseType` and at most one live execution per campaign.
#[async_trait]
pub trait PhaseService: Send + Sync {
    /// The phase this service owns.
    fn phase_type(&self) -> PhaseType;

    /// Runtime control support for this phase.
    fn capabilities(&self) -> Capabilities;

    /// Purely functional configuration check.
    fn validate(&self, config: &serde_json::Value) -> Result<(), PhaseError>;

    /// Persist a `Configured` row and seed in-memory state. Idempotent:
    /// re-calling after a failure re-arms the phase for another run.
    async fn configure(
        &self,
        campaign_id: Uuid,
        config: serde_json::Value,
    ) -> Result<(), PhaseError>;

    /// Start an execution and return its progress stream. The stream closes
    /// when the run reaches a terminal state; the consumer must drain it.
    /// A second call while a run is live returns the busy error.
    async fn execute(
        &self,
        campaign_id: Uuid,
    ) -> Result<mpsc::Receiver<PhaseProgress>, PhaseError>;

    /// Composed status: database dominates for terminal states, memory
    /// dominates for live progress.
    async fn status(&self, campaign_id: Uuid) -> Result<PhaseStatusReport, PhaseError>;

    /// Cancel the live run, transitioning it to `Failed`. No-op when no run
    /// is live.
    async fn cancel(&self, campaign_id: Uuid) -> Result<(), PhaseError>;

    /// Wire an external control source to this service's internal control
    /// bus for one campaign, replacing any prior watcher.
    fn attach_control_channel(
        &self,
        campaign_id: Uuid,
        commands: mpsc::Receiver<ControlCommand>,
    );
}

/// Phase services keyed by the phase they own.
#[derive(Default)]
pub struct PhaseRegistry {
    services: HashMap<PhaseType, Arc<dyn PhaseService>>,
}

impl PhaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service under its own `PhaseType`. Last registration for
    /// a phase wins.
    pub fn register(&mut self, service: Arc<dyn PhaseService>) {
        self.services.insert(service.phase_type(), service);
    }

    pub fn get(&self, phase: PhaseType) -> Option<Arc<dyn PhaseService>> {
        self.services.get(&phase).cloned()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Registered services in pipeline order.
    pub fn in_order(&self) -> Vec<Arc<dyn PhaseService>> {
        PhaseType::ALL
            .iter()
            .filter_map(|p| self.get(*p))
            .collect()
    }
}
