//! The lead-scoring evaluator.
//!
//! A pure function of (http_status, parked verdict, domain_score, feature
//! vector, config). Decision rules apply in a fixed order and the first
//! match wins, so identical inputs always yield identical verdicts.

use serde::{Deserialize, Serialize};

use crate::model::{FeatureVector, HttpStatus, LeadStatus};

fn default_match_score_threshold() -> f64 {
    0.27
}

fn default_low_score_grace_threshold() -> f64 {
    0.24
}

fn default_min_content_bytes() -> u64 {
    1024
}

fn default_parked_confidence_floor() -> f64 {
    0.45
}

fn default_require_structural_signals() -> bool {
    true
}

/// Evaluator thresholds, overridable per campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    /// domain_score at/above this qualifies outright.
    #[serde(default = "default_match_score_threshold")]
    pub match_score_threshold: f64,
    /// Scores between this and the match threshold may still qualify when
    /// the page carries substantial content.
    #[serde(default = "default_low_score_grace_threshold")]
    pub low_score_grace_threshold: f64,
    /// Content floor for the grace promotion.
    #[serde(default = "default_min_content_bytes")]
    pub min_content_bytes: u64,
    /// parked_confidence at/above this rejects as parked.
    #[serde(default = "default_parked_confidence_floor")]
    pub parked_confidence_floor: f64,
    /// Reject pages with no structural signals.
    #[serde(default = "default_require_structural_signals")]
    pub require_structural_signals: bool,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            match_score_threshold: default_match_score_threshold(),
            low_score_grace_threshold: default_low_score_grace_threshold(),
            min_content_bytes: default_min_content_bytes(),
            parked_confidence_floor: default_parked_confidence_floor(),
            require_structural_signals: default_require_structural_signals(),
        }
    }
}

/// Why a candidate landed where it did. Attached to every verdict,
/// including matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    Qualified,
    Parked,
    NoKeywords,
    LowScore,
    HttpError,
    HttpTimeout,
    Pending,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Qualified => "qualified",
            Self::Parked => "parked",
            Self::NoKeywords => "no_keywords",
            Self::LowScore => "low_score",
            Self::HttpError => "http_error",
            Self::HttpTimeout => "http_timeout",
            Self::Pending => "pending",
        }
    }
}

/// Everything the evaluator looks at, pre-loaded by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct LeadCandidate {
    pub http_status: HttpStatus,
    pub is_parked: bool,
    pub parked_confidence: f64,
    pub domain_score: Option<f64>,
    pub features: FeatureVector,
}

/// The evaluator's decision for one candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct LeadVerdict {
    pub status: LeadStatus,
    pub lead_score: Option<f64>,
    pub rejection_reason: RejectionReason,
    /// True when the caller must not write anything for this candidate.
    pub skip_persistence: bool,
}

impl LeadVerdict {
    fn new(status: LeadStatus, reason: RejectionReason) -> Self {
        Self {
            status,
            lead_score: None,
            rejection_reason: reason,
            skip_persistence: false,
        }
    }

    fn with_score(mut self, score: Option<f64>) -> Self {
        self.lead_score = score;
        self
    }

    fn skipped(mut self) -> Self {
        self.skip_persistence = true;
        self
    }
}

/// Evaluate one candidate. Rules apply in order; the first match wins.
pub fn evaluate_lead(candidate: &LeadCandidate, config: &EvaluatorConfig) -> LeadVerdict {
    // 1-3: the HTTP outcome gates everything else
    match candidate.http_status {
        HttpStatus::Timeout => {
            return LeadVerdict::new(LeadStatus::Timeout, RejectionReason::HttpTimeout);
        }
        HttpStatus::Error => {
            return LeadVerdict::new(LeadStatus::Error, RejectionReason::HttpError);
        }
        HttpStatus::Pending => {
            return LeadVerdict::new(LeadStatus::Pending, RejectionReason::Pending).skipped();
        }
        HttpStatus::Ok => {}
    }

    // 4: parked domains never qualify; the score is carried for reporting
    if candidate.is_parked || candidate.parked_confidence >= config.parked_confidence_floor {
        return LeadVerdict::new(LeadStatus::NoMatch, RejectionReason::Parked)
            .with_score(candidate.domain_score);
    }

    // 5: structural signals required (absent counts as missing)
    if config.require_structural_signals
        && !candidate.features.has_structural_signals.unwrap_or(false)
    {
        return LeadVerdict::new(LeadStatus::NoMatch, RejectionReason::NoKeywords);
    }

    // 6: keyword fields present but both zero
    let kw_present =
        candidate.features.kw_unique.is_some() || candidate.features.kw_hits_total.is_some();
    if kw_present
        && candidate.features.kw_unique.unwrap_or(0) == 0
        && candidate.features.kw_hits_total.unwrap_or(0) == 0
    {
        return LeadVerdict::new(LeadStatus::NoMatch, RejectionReason::NoKeywords);
    }

    // 7: nothing to score against
    let Some(score) = candidate.domain_score else {
        return LeadVerdict::new(LeadStatus::NoMatch, RejectionReason::NoKeywords);
    };

    // 8: outright qualification
    if score >= config.match_score_threshold {
        return LeadVerdict::new(LeadStatus::Match, RejectionReason::Qualified)
            .with_score(Some(score));
    }

    // 9: thin content never gets the grace path
    if candidate.features.content_bytes.unwrap_or(0) < config.min_content_bytes {
        return LeadVerdict::new(LeadStatus::NoMatch, RejectionReason::LowScore)
            .with_score(Some(score));
    }

    // 10: substantial content promotes near-threshold scores
    if score >= config.low_score_grace_threshold {
        return LeadVerdict::new(LeadStatus::Match, RejectionReason::Qualified)
            .with_score(Some(score));
    }

    // 11
    LeadVerdict::new(LeadStatus::NoMatch, RejectionReason::LowScore).with_score(Some(score))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(json: serde_json::Value) -> FeatureVector {
        FeatureVector::from_value(&json)
    }

    fn candidate(http_status: HttpStatus) -> LeadCandidate {
        LeadCandidate {
            http_status,
            is_parked: false,
            parked_confidence: 0.0,
            domain_score: None,
            features: FeatureVector::default(),
        }
    }

    // =========================================
    // HTTP gate rules (1-3)
    // =========================================

    #[test]
    fn test_http_timeout_short_circuits() {
        let verdict = evaluate_lead(&candidate(HttpStatus::Timeout), &EvaluatorConfig::default());
        assert_eq!(verdict.status, LeadStatus::Timeout);
        assert_eq!(verdict.rejection_reason, RejectionReason::HttpTimeout);
        assert!(!verdict.skip_persistence);
    }

    #[test]
    fn test_http_error_short_circuits() {
        let verdict = evaluate_lead(&candidate(HttpStatus::Error), &EvaluatorConfig::default());
        assert_eq!(verdict.status, LeadStatus::Error);
        assert_eq!(verdict.rejection_reason, RejectionReason::HttpError);
    }

    #[test]
    fn test_http_pending_skips_persistence() {
        let verdict = evaluate_lead(&candidate(HttpStatus::Pending), &EvaluatorConfig::default());
        assert_eq!(verdict.status, LeadStatus::Pending);
        assert!(verdict.skip_persistence);
    }

    // =========================================
    // Parked / signal / keyword rules (4-7)
    // =========================================

    #[test]
    fn test_parked_flag_rejects_and_carries_score() {
        // http ok, parked, strong score and content: parked still wins
        let mut c = candidate(HttpStatus::Ok);
        c.is_parked = true;
        c.parked_confidence = 0.5;
        c.domain_score = Some(0.8);
        c.features = features(serde_json::json!({
            "has_structural_signals": true,
            "kw_unique": 3,
            "content_bytes": 4096
        }));

        let verdict = evaluate_lead(&c, &EvaluatorConfig::default());
        assert_eq!(verdict.status, LeadStatus::NoMatch);
        assert_eq!(verdict.rejection_reason, RejectionReason::Parked);
        assert_eq!(verdict.lead_score, Some(0.8));
    }

    #[test]
    fn test_parked_confidence_floor_alone_rejects() {
        let mut c = candidate(HttpStatus::Ok);
        c.parked_confidence = 0.45;
        c.domain_score = Some(0.9);
        let verdict = evaluate_lead(&c, &EvaluatorConfig::default());
        assert_eq!(verdict.rejection_reason, RejectionReason::Parked);
    }

    #[test]
    fn test_missing_structural_signals_rejects() {
        let mut c = candidate(HttpStatus::Ok);
        c.domain_score = Some(0.9);
        c.features = features(serde_json::json!({"has_structural_signals": false}));
        let verdict = evaluate_lead(&c, &EvaluatorConfig::default());
        assert_eq!(verdict.status, LeadStatus::NoMatch);
        assert_eq!(verdict.rejection_reason, RejectionReason::NoKeywords);

        // Structural requirement can be disabled
        let relaxed = EvaluatorConfig {
            require_structural_signals: false,
            ..Default::default()
        };
        let verdict = evaluate_lead(&c, &relaxed);
        assert_eq!(verdict.status, LeadStatus::Match);
    }

    #[test]
    fn test_zero_keywords_rejects() {
        let mut c = candidate(HttpStatus::Ok);
        c.domain_score = Some(0.9);
        c.features = features(serde_json::json!({
            "has_structural_signals": true,
            "kw_unique": 0,
            "kw_hits_total": 0
        }));
        let verdict = evaluate_lead(&c, &EvaluatorConfig::default());
        assert_eq!(verdict.rejection_reason, RejectionReason::NoKeywords);
    }

    #[test]
    fn test_absent_keyword_fields_do_not_trigger_zero_rule() {
        let mut c = candidate(HttpStatus::Ok);
        c.domain_score = Some(0.9);
        c.features = features(serde_json::json!({"has_structural_signals": true}));
        let verdict = evaluate_lead(&c, &EvaluatorConfig::default());
        assert_eq!(verdict.status, LeadStatus::Match);
    }

    #[test]
    fn test_missing_domain_score_rejects() {
        let mut c = candidate(HttpStatus::Ok);
        c.features = features(serde_json::json!({"has_structural_signals": true, "kw_unique": 2}));
        let verdict = evaluate_lead(&c, &EvaluatorConfig::default());
        assert_eq!(verdict.status, LeadStatus::NoMatch);
        assert_eq!(verdict.rejection_reason, RejectionReason::NoKeywords);
    }

    // =========================================
    // Scoring rules (8-11)
    // =========================================

    #[test]
    fn test_score_at_threshold_qualifies() {
        let mut c = candidate(HttpStatus::Ok);
        c.domain_score = Some(0.27);
        c.features = features(serde_json::json!({"has_structural_signals": true, "kw_unique": 1}));
        let verdict = evaluate_lead(&c, &EvaluatorConfig::default());
        assert_eq!(verdict.status, LeadStatus::Match);
        assert_eq!(verdict.rejection_reason, RejectionReason::Qualified);
        assert_eq!(verdict.lead_score, Some(0.27));
    }

    #[test]
    fn test_grace_path_with_substantial_content() {
        // Score below match but at grace, with enough content
        let mut c = candidate(HttpStatus::Ok);
        c.parked_confidence = 0.1;
        c.domain_score = Some(0.24);
        c.features = features(serde_json::json!({
            "has_structural_signals": true,
            "kw_unique": 2,
            "kw_hits_total": 4,
            "content_bytes": 4096
        }));
        let verdict = evaluate_lead(&c, &EvaluatorConfig::default());
        assert_eq!(verdict.status, LeadStatus::Match);
        assert_eq!(verdict.rejection_reason, RejectionReason::Qualified);
        assert_eq!(verdict.lead_score, Some(0.24));
    }

    #[test]
    fn test_thin_content_blocks_grace() {
        let mut c = candidate(HttpStatus::Ok);
        c.parked_confidence = 0.1;
        c.domain_score = Some(0.24);
        c.features = features(serde_json::json!({
            "has_structural_signals": true,
            "kw_unique": 2,
            "kw_hits_total": 4,
            "content_bytes": 512
        }));
        let verdict = evaluate_lead(&c, &EvaluatorConfig::default());
        assert_eq!(verdict.status, LeadStatus::NoMatch);
        assert_eq!(verdict.rejection_reason, RejectionReason::LowScore);
        assert_eq!(verdict.lead_score, Some(0.24));
    }

    #[test]
    fn test_below_grace_is_low_score() {
        let mut c = candidate(HttpStatus::Ok);
        c.domain_score = Some(0.1);
        c.features = features(serde_json::json!({
            "has_structural_signals": true,
            "kw_unique": 2,
            "content_bytes": 4096
        }));
        let verdict = evaluate_lead(&c, &EvaluatorConfig::default());
        assert_eq!(verdict.status, LeadStatus::NoMatch);
        assert_eq!(verdict.rejection_reason, RejectionReason::LowScore);
        assert_eq!(verdict.lead_score, Some(0.1));
    }

    // =========================================
    // Purity and config plumbing
    // =========================================

    #[test]
    fn test_evaluator_is_deterministic() {
        let mut c = candidate(HttpStatus::Ok);
        c.parked_confidence = 0.3;
        c.domain_score = Some(0.25);
        c.features = features(serde_json::json!({
            "has_structural_signals": true,
            "kw_unique": 1,
            "content_bytes": 2000
        }));
        let config = EvaluatorConfig::default();
        let first = evaluate_lead(&c, &config);
        let second = evaluate_lead(&c, &config);
        assert_eq!(first, second);
    }

    #[test]
    fn test_config_defaults_match_spec_values() {
        let config = EvaluatorConfig::default();
        assert_eq!(config.match_score_threshold, 0.27);
        assert_eq!(config.low_score_grace_threshold, 0.24);
        assert_eq!(config.min_content_bytes, 1024);
        assert_eq!(config.parked_confidence_floor, 0.45);
        assert!(config.require_structural_signals);

        // Partial overrides keep the rest at defaults
        let parsed: EvaluatorConfig =
            serde_json::from_value(serde_json::json!({"match_score_threshold": 0.5})).unwrap();
        assert_eq!(parsed.match_score_threshold, 0.5);
        assert_eq!(parsed.min_content_bytes, 1024);
    }

    #[test]
    fn test_rejection_reason_strings() {
        assert_eq!(RejectionReason::Qualified.as_str(), "qualified");
        assert_eq!(RejectionReason::NoKeywords.as_str(), "no_keywords");
        assert_eq!(RejectionReason::HttpTimeout.as_str(), "http_timeout");
    }
}
