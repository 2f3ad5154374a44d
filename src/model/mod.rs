//! Core domain types for the campaign execution engine.
//!
//! Split in two:
//! - `campaign` — phase enums, the phase status state machine, durable and
//!   in-memory phase records
//! - `domain` — generated-domain rows, status buckets, counters, feature
//!   vectors and scores

pub mod campaign;
pub mod domain;

pub use campaign::{
    progress_pct, CampaignPhase, ErrorDetails, PhaseExecutionSnapshot, PhaseStatus, PhaseType,
};
pub use domain::{
    AnalysisScore, DnsReason, DnsStatus, DomainCounters, ExtractionFeatures, ExtractionTask,
    FeatureVector, GeneratedDomain, HttpStatus, LeadStatus, TaskState,
};
