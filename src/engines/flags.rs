//! Feature flag reader interface.
//!
//! The concrete backend (remote config service, env, file) is not part of
//! this crate; `StaticFlags` covers tests and single-node deployments.

use std::collections::HashMap;

/// Well-known flag names consumed by the phases and reconcilers.
pub mod names {
    pub const EXTRACTION_ENABLED: &str = "extraction_enabled";
    pub const ADAPTIVE_CRAWL_ENABLED: &str = "adaptive_crawl_enabled";
    pub const ADVANCED_SCORING_ENABLED: &str = "advanced_scoring_enabled";
    pub const RESCORING_ENABLED: &str = "rescoring_enabled";
    pub const DUAL_READ_ENABLED: &str = "dual_read_enabled";
    pub const VARIANCE_THRESHOLD: &str = "variance_threshold";
    pub const MIN_COVERAGE: &str = "min_coverage";
}

/// Boolean flags and numeric thresholds by name.
pub trait FeatureFlagReader: Send + Sync {
    /// Whether a boolean flag is on. Unknown flags read as `default`.
    fn is_enabled(&self, flag: &str, default: bool) -> bool;

    /// Numeric threshold by name, if set.
    fn threshold(&self, name: &str) -> Option<f64>;
}

/// In-memory flag set.
#[derive(Debug, Clone, Default)]
pub struct StaticFlags {
    bools: HashMap<String, bool>,
    numbers: HashMap<String, f64>,
}

impl StaticFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flag(mut self, name: &str, enabled: bool) -> Self {
        self.bools.insert(name.to_string(), enabled);
        self
    }

    pub fn with_threshold(mut self, name: &str, value: f64) -> Self {
        self.numbers.insert(name.to_string(), value);
        self
    }
}

impl FeatureFlagReader for StaticFlags {
    fn is_enabled(&self, flag: &str, default: bool) -> bool {
        self.bools.get(flag).copied().unwrap_or(default)
    }

    fn threshold(&self, name: &str) -> Option<f64> {
        self.numbers.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_flags_lookup() {
        let flags = StaticFlags::new()
            .with_flag(names::EXTRACTION_ENABLED, true)
            .with_flag(names::ADAPTIVE_CRAWL_ENABLED, false)
            .with_threshold(names::VARIANCE_THRESHOLD, 0.15);

        assert!(flags.is_enabled(names::EXTRACTION_ENABLED, false));
        assert!(!flags.is_enabled(names::ADAPTIVE_CRAWL_ENABLED, true));
        assert_eq!(flags.threshold(names::VARIANCE_THRESHOLD), Some(0.15));
    }

    #[test]
    fn test_unknown_flags_use_default() {
        let flags = StaticFlags::new();
        assert!(flags.is_enabled("never_set", true));
        assert!(!flags.is_enabled("never_set", false));
        assert_eq!(flags.threshold("never_set"), None);
    }
}
