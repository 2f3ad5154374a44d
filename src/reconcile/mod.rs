//! Background reconciliation loops.
//!
//! Three workers repair drift between durable state and ground truth:
//! - `counters` — recomputes authoritative domain counts and corrects the
//!   counters table
//! - `extraction` — resets stuck extraction tasks and retries completed
//!   tasks that never produced features
//! - `stale` — reports analysis scores older than the features they were
//!   computed from
//!
//! The clock is injected so tests can move time instead of sleeping.

pub mod counters;
pub mod extraction;
pub mod stale;

pub use counters::CounterReconciler;
pub use extraction::ExtractionReconciler;
pub use stale::StaleScoreDetector;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Injected time source.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// How one reconciler pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassOutcome {
    Success,
    Error,
    Skipped,
}

impl PassOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Skipped => "skipped",
        }
    }
}
