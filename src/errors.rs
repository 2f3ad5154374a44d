//! Typed error hierarchy for the campaign engine.
//!
//! Three top-level enums cover the three subsystems:
//! - `PhaseError` — phase service and execution failures
//! - `StoreError` — persistence facade failures
//! - `EngineError` — collaborator engine (resolver/fetcher) failures
//!
//! Every `PhaseError` carries a stable `code()` string; the code is what
//! gets persisted into a phase row's `error_details` and what external
//! callers should match on.

use thiserror::Error;
use uuid::Uuid;

use crate::model::PhaseType;

/// Errors from the phase services and their executions.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("Invalid {phase} configuration: {message}")]
    Validation { phase: PhaseType, message: String },

    #[error("{phase} already running for campaign {campaign_id}")]
    AlreadyRunning {
        phase: PhaseType,
        campaign_id: Uuid,
    },

    #[error("No {phase} execution for campaign {campaign_id}")]
    ExecutionMissing {
        phase: PhaseType,
        campaign_id: Uuid,
    },

    #[error("{phase} not configured for campaign {campaign_id}")]
    NotConfigured {
        phase: PhaseType,
        campaign_id: Uuid,
    },

    #[error("Missing prerequisite for {phase}: {message}")]
    MissingPrerequisite { phase: PhaseType, message: String },

    #[error("stale execution context")]
    StaleExecution,

    #[error("{0} cancelled")]
    Cancelled(PhaseType),

    #[error("{0} stopped")]
    Stopped(PhaseType),

    #[error("{phase} engine failure: {source}")]
    Engine {
        phase: PhaseType,
        #[source]
        source: EngineError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PhaseError {
    /// Stable code identifying the failure class.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_FAILED",
            Self::AlreadyRunning { .. } => "PHASE_ALREADY_RUNNING",
            Self::ExecutionMissing { .. } => "PHASE_EXECUTION_MISSING",
            Self::NotConfigured { .. } => "PHASE_NOT_CONFIGURED",
            Self::MissingPrerequisite { .. } => "MISSING_PREREQUISITE",
            Self::StaleExecution => "STALE_EXECUTION_CONTEXT",
            Self::Cancelled(_) => "PHASE_CANCELLED",
            Self::Stopped(_) => "PHASE_STOPPED",
            Self::Engine { .. } => "ENGINE_FAILURE",
            Self::Store(_) => "STORE_FAILURE",
        }
    }

    /// Cancellation (caller cancel, context done, or stop signal) is
    /// terminal for the run but semantically distinct from catastrophe.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled(_) | Self::Stopped(_))
    }
}

/// Errors from the persistence facade. The sqlite backend wraps its driver
/// errors here; callers only ever see this type.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("No {entity} row for campaign {campaign_id}")]
    NotFound {
        entity: &'static str,
        campaign_id: Uuid,
    },

    #[error("Corrupt {field} value in row: {message}")]
    Corrupt { field: &'static str, message: String },
}

/// Errors surfaced by collaborator engines (resolver, fetcher). Transient
/// failures are retried by the calling phase; only the final failure
/// propagates.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine timeout: {0}")]
    Timeout(String),

    #[error("engine unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Other(String),
}
