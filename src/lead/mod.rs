//! Lead evaluation.
//!
//! The evaluator is a pure decision tree over a pre-loaded candidate; all
//! I/O (loading features, persisting the verdict) happens in the
//! enrichment phase around it.

pub mod evaluator;

pub use evaluator::{evaluate_lead, EvaluatorConfig, LeadCandidate, LeadVerdict, RejectionReason};
