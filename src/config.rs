//! Engine configuration.
//!
//! Reads `prospector.toml`. Every field has a default, so a missing file
//! or an empty one yields a fully working configuration.
//!
//! # Configuration File Format
//!
//! ```toml
//! [engine]
//! db_path = "prospector.db"
//! event_buffer = 256
//!
//! [reconciler.counters]
//! interval_hours = 24
//! drift_threshold_percent = 0.01
//! auto_correct = true
//! max_corrections = 100
//!
//! [reconciler.extraction]
//! interval_secs = 300
//! stuck_running_max_age_secs = 900
//! stuck_pending_max_age_secs = 3600
//! missing_feature_grace_secs = 600
//! max_retries = 3
//! category_limit = 500
//! pass_budget_secs = 20
//!
//! [reconciler.stale_scores]
//! interval_secs = 3600
//! max_age_hours = 24
//! pass_limit = 1000
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::reconcile::counters::CounterReconcilerConfig;
use crate::reconcile::extraction::ExtractionReconcilerConfig;
use crate::reconcile::stale::StaleScoreConfig;

fn default_db_path() -> PathBuf {
    PathBuf::from("prospector.db")
}

fn default_event_buffer() -> usize {
    256
}

/// Process-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            event_buffer: default_event_buffer(),
        }
    }
}

/// Background worker settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcilerSection {
    #[serde(default)]
    pub counters: CounterReconcilerConfig,
    #[serde(default)]
    pub extraction: ExtractionReconcilerConfig,
    #[serde(default)]
    pub stale_scores: StaleScoreConfig,
}

/// The full engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub reconciler: ReconcilerSection,
}

impl EngineConfig {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load from a TOML file, falling back to defaults when it is absent.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}
