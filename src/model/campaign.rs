use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The six phases of a campaign, in pipeline order.
///
/// The ordering is fixed and defines dependency: a phase may assume all
/// earlier phases of the same campaign reached `Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseType {
    DomainGeneration,
    DnsValidation,
    HttpKeywordValidation,
    Extraction,
    Analysis,
    Enrichment,
}

impl PhaseType {
    /// All phases in pipeline order.
    pub const ALL: [PhaseType; 6] = [
        Self::DomainGeneration,
        Self::DnsValidation,
        Self::HttpKeywordValidation,
        Self::Extraction,
        Self::Analysis,
        Self::Enrichment,
    ];

    /// Position in the pipeline, 1-based.
    pub fn order(&self) -> u8 {
        match self {
            Self::DomainGeneration => 1,
            Self::DnsValidation => 2,
            Self::HttpKeywordValidation => 3,
            Self::Extraction => 4,
            Self::Analysis => 5,
            Self::Enrichment => 6,
        }
    }

    /// The phase that must complete before this one, if any.
    pub fn upstream(&self) -> Option<PhaseType> {
        match self.order() {
            1 => None,
            n => Some(Self::ALL[(n - 2) as usize]),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DomainGeneration => "domain_generation",
            Self::DnsValidation => "dns_validation",
            Self::HttpKeywordValidation => "http_keyword_validation",
            Self::Extraction => "extraction",
            Self::Analysis => "analysis",
            Self::Enrichment => "enrichment",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "domain_generation" => Ok(Self::DomainGeneration),
            "dns_validation" => Ok(Self::DnsValidation),
            "http_keyword_validation" => Ok(Self::HttpKeywordValidation),
            "extraction" => Ok(Self::Extraction),
            "analysis" => Ok(Self::Analysis),
            "enrichment" => Ok(Self::Enrichment),
            _ => Err(format!("Invalid phase type: {}", s)),
        }
    }
}

impl std::fmt::Display for PhaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of one phase of one campaign.
///
/// `NotStarted → Configured → InProgress ⇄ Paused → Completed | Failed`.
/// `Completed` and `Failed` are terminal; `Configured` is reachable again
/// from `Failed` (reconfigure-to-retry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    NotStarted,
    Configured,
    InProgress,
    Paused,
    Completed,
    Failed,
}

impl PhaseStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Configured => "configured",
            Self::InProgress => "in_progress",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "not_started" => Ok(Self::NotStarted),
            "configured" => Ok(Self::Configured),
            "in_progress" => Ok(Self::InProgress),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid phase status: {}", s)),
        }
    }
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validate that a phase status transition is legal.
pub fn is_valid_transition(from: PhaseStatus, to: PhaseStatus) -> bool {
    use PhaseStatus::*;
    matches!(
        (from, to),
        (NotStarted, Configured)
            | (Configured, InProgress)
            | (InProgress, Paused)
            | (Paused, InProgress)
            | (InProgress, Completed)
            | (InProgress, Failed)
            | (Paused, Failed)
            | (Failed, Configured)
    )
}

/// Structured failure record persisted on a phase row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Stable code identifying the failure class.
    pub code: String,
    pub message: String,
    pub phase: PhaseType,
    pub status: PhaseStatus,
    pub timestamp: DateTime<Utc>,
    /// Free-form context (batch offset, domain name, etc.).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl ErrorDetails {
    pub fn new(code: &str, message: impl Into<String>, phase: PhaseType) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            phase,
            status: PhaseStatus::Failed,
            timestamp: Utc::now(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }
}

/// The durable record of one (campaign, phase) pair. One row each; updated
/// only by the owning phase service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignPhase {
    pub campaign_id: Uuid,
    pub phase_type: PhaseType,
    pub phase_order: u8,
    pub status: PhaseStatus,
    pub progress_percentage: f64,
    pub items_total: u64,
    pub items_processed: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub error_details: Option<ErrorDetails>,
    pub configuration: Option<serde_json::Value>,
}

/// Point-in-time view of a live in-memory execution. The durable row is the
/// record of record; this is a cache of live progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseExecutionSnapshot {
    pub campaign_id: Uuid,
    pub phase: PhaseType,
    pub run_id: Uuid,
    pub status: PhaseStatus,
    pub items_total: u64,
    pub items_processed: u64,
    pub progress_pct: f64,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Progress percentage with one decimal of precision.
/// Zero totals report zero rather than dividing.
pub fn progress_pct(items_processed: u64, items_total: u64) -> f64 {
    if items_total == 0 {
        return 0.0;
    }
    ((items_processed as f64 / items_total as f64) * 1000.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order_is_fixed() {
        for (i, phase) in PhaseType::ALL.iter().enumerate() {
            assert_eq!(phase.order() as usize, i + 1);
        }
        assert_eq!(PhaseType::DomainGeneration.upstream(), None);
        assert_eq!(
            PhaseType::Enrichment.upstream(),
            Some(PhaseType::Analysis)
        );
    }

    #[test]
    fn test_phase_type_round_trip() {
        for phase in PhaseType::ALL {
            assert_eq!(PhaseType::from_str(phase.as_str()).unwrap(), phase);
        }
        assert!(PhaseType::from_str("minting").is_err());
    }

    #[test]
    fn test_status_serde_uses_snake_case() {
        let json = serde_json::to_string(&PhaseStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        let parsed: PhaseStatus = serde_json::from_str("\"not_started\"").unwrap();
        assert_eq!(parsed, PhaseStatus::NotStarted);
    }

    #[test]
    fn test_valid_transitions() {
        use PhaseStatus::*;
        assert!(is_valid_transition(NotStarted, Configured));
        assert!(is_valid_transition(Configured, InProgress));
        assert!(is_valid_transition(InProgress, Paused));
        assert!(is_valid_transition(Paused, InProgress));
        assert!(is_valid_transition(InProgress, Completed));
        assert!(is_valid_transition(InProgress, Failed));
        assert!(is_valid_transition(Paused, Failed));
        assert!(is_valid_transition(Failed, Configured));
    }

    #[test]
    fn test_terminal_states_are_absorbing() {
        use PhaseStatus::*;
        for to in [NotStarted, Configured, InProgress, Paused, Completed, Failed] {
            assert!(!is_valid_transition(Completed, to));
        }
        // Failed may only re-enter via reconfigure
        assert!(!is_valid_transition(Failed, InProgress));
        assert!(!is_valid_transition(Failed, Completed));
    }

    #[test]
    fn test_paused_only_from_in_progress() {
        use PhaseStatus::*;
        assert!(!is_valid_transition(Configured, Paused));
        assert!(!is_valid_transition(NotStarted, Paused));
        assert!(!is_valid_transition(Failed, Paused));
    }

    #[test]
    fn test_progress_pct_rounding() {
        assert_eq!(progress_pct(0, 0), 0.0);
        assert_eq!(progress_pct(0, 10), 0.0);
        assert_eq!(progress_pct(10, 10), 100.0);
        assert_eq!(progress_pct(1, 3), 33.3);
        assert_eq!(progress_pct(2, 3), 66.7);
        assert_eq!(progress_pct(1, 8), 12.5);
    }

    #[test]
    fn test_error_details_serialization() {
        let details = ErrorDetails::new(
            "PHASE_CANCELLED",
            "dns_validation cancelled",
            PhaseType::DnsValidation,
        )
        .with_context(serde_json::json!({"batch_offset": 400}));

        let json = serde_json::to_value(&details).unwrap();
        assert_eq!(json["code"], "PHASE_CANCELLED");
        assert_eq!(json["phase"], "dns_validation");
        assert_eq!(json["status"], "failed");
        assert_eq!(json["context"]["batch_offset"], 400);
    }
}
