use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// DNS validation bucket for a domain row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DnsStatus {
    Pending,
    Ok,
    Error,
    Timeout,
}

impl DnsStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Timeout => "timeout",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(Self::Pending),
            "ok" => Ok(Self::Ok),
            "error" => Ok(Self::Error),
            "timeout" => Ok(Self::Timeout),
            _ => Err(format!("Invalid dns status: {}", s)),
        }
    }
}

/// Fine-grained reason recorded next to the DNS bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DnsReason {
    Ok,
    Nxdomain,
    Refused,
    Servfail,
    Noanswer,
    Timeout,
    Error,
}

impl DnsReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Nxdomain => "NXDOMAIN",
            Self::Refused => "REFUSED",
            Self::Servfail => "SERVFAIL",
            Self::Noanswer => "NOANSWER",
            Self::Timeout => "TIMEOUT",
            Self::Error => "ERROR",
        }
    }
}

/// HTTP validation bucket for a domain row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HttpStatus {
    Pending,
    Ok,
    Error,
    Timeout,
}

impl HttpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Timeout => "timeout",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(Self::Pending),
            "ok" => Ok(Self::Ok),
            "error" => Ok(Self::Error),
            "timeout" => Ok(Self::Timeout),
            _ => Err(format!("Invalid http status: {}", s)),
        }
    }
}

/// Outcome of the enrichment lead evaluation for a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    Pending,
    Match,
    NoMatch,
    Error,
    Timeout,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Match => "match",
            Self::NoMatch => "no_match",
            Self::Error => "error",
            Self::Timeout => "timeout",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(Self::Pending),
            "match" => Ok(Self::Match),
            "no_match" => Ok(Self::NoMatch),
            "error" => Ok(Self::Error),
            "timeout" => Ok(Self::Timeout),
            _ => Err(format!("Invalid lead status: {}", s)),
        }
    }
}

/// Extraction task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Error,
    Fatal,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Fatal => "fatal",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            "fatal" => Ok(Self::Fatal),
            _ => Err(format!("Invalid task state: {}", s)),
        }
    }
}

/// One generated candidate domain. Created by domain generation, mutated
/// field-by-field as later phases run, never deleted by phase code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedDomain {
    pub id: i64,
    pub campaign_id: Uuid,
    pub domain_name: String,
    pub offset_index: u64,
    pub generated_at: DateTime<Utc>,
    pub dns_status: DnsStatus,
    pub http_status: HttpStatus,
    pub http_status_code: Option<u16>,
    pub body_hash: Option<String>,
    pub latency_ms: Option<u64>,
    pub lead_status: LeadStatus,
    pub lead_score: Option<f64>,
    pub domain_score: Option<f64>,
    pub feature_vector: Option<serde_json::Value>,
    pub is_parked: bool,
    pub parked_confidence: f64,
    pub last_http_fetched_at: Option<DateTime<Utc>>,
}

/// Per-campaign aggregate counts of domain rows by status bucket.
/// Maintained incrementally by the DNS/HTTP phases and reconciled
/// periodically against the domain table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainCounters {
    pub total: i64,
    pub dns_pending: i64,
    pub dns_ok: i64,
    pub dns_error: i64,
    pub dns_timeout: i64,
    pub http_pending: i64,
    pub http_ok: i64,
    pub http_error: i64,
    pub http_timeout: i64,
}

impl DomainCounters {
    /// The nine metrics the reconciler checks, in a stable order.
    pub fn metrics(&self) -> [(&'static str, i64); 9] {
        [
            ("total", self.total),
            ("dns_pending", self.dns_pending),
            ("dns_ok", self.dns_ok),
            ("dns_error", self.dns_error),
            ("dns_timeout", self.dns_timeout),
            ("http_pending", self.http_pending),
            ("http_ok", self.http_ok),
            ("http_error", self.http_error),
            ("http_timeout", self.http_timeout),
        ]
    }

    /// Counters equality invariant: every status axis must sum to the total.
    pub fn is_consistent(&self) -> bool {
        let dns = self.dns_pending + self.dns_ok + self.dns_error + self.dns_timeout;
        let http = self.http_pending + self.http_ok + self.http_error + self.http_timeout;
        dns == self.total && http == self.total
    }
}

/// Relevance score computed by the analysis phase for one domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisScore {
    pub campaign_id: Uuid,
    pub domain_name: String,
    pub relevance_score: f64,
    pub updated_at: DateTime<Utc>,
}

/// One unit of extraction work for a domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionTask {
    pub id: i64,
    pub campaign_id: Uuid,
    pub domain_name: String,
    pub state: TaskState,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Feature row written by the extraction phase, read by analysis and
/// enrichment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionFeatures {
    pub campaign_id: Uuid,
    pub domain_name: String,
    pub features: serde_json::Value,
    /// "ready" once usable for scoring.
    pub status: String,
    pub updated_at: DateTime<Utc>,
}

/// Typed view over the feature-vector JSON blob. Absent keys stay `None`,
/// which the enrichment decision rules distinguish from zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parked_confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_structural_signals: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_external_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_internal_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub h1_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kw_unique: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kw_hits_total: Option<u64>,
}

impl FeatureVector {
    /// Parse the typed fields out of a raw feature-vector blob, ignoring
    /// keys this view does not know about.
    pub fn from_value(value: &serde_json::Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_buckets_round_trip() {
        for s in ["pending", "ok", "error", "timeout"] {
            assert_eq!(DnsStatus::from_str(s).unwrap().as_str(), s);
            assert_eq!(HttpStatus::from_str(s).unwrap().as_str(), s);
        }
        for s in ["pending", "match", "no_match", "error", "timeout"] {
            assert_eq!(LeadStatus::from_str(s).unwrap().as_str(), s);
        }
        for s in ["pending", "running", "completed", "error", "fatal"] {
            assert_eq!(TaskState::from_str(s).unwrap().as_str(), s);
        }
    }

    #[test]
    fn test_dns_reason_is_uppercase() {
        assert_eq!(DnsReason::Nxdomain.as_str(), "NXDOMAIN");
        assert_eq!(DnsReason::Servfail.as_str(), "SERVFAIL");
        let json = serde_json::to_string(&DnsReason::Refused).unwrap();
        assert_eq!(json, "\"REFUSED\"");
    }

    #[test]
    fn test_counters_consistency() {
        let counters = DomainCounters {
            total: 10,
            dns_pending: 4,
            dns_ok: 3,
            dns_error: 2,
            dns_timeout: 1,
            http_pending: 10,
            ..Default::default()
        };
        assert!(counters.is_consistent());

        let drifted = DomainCounters {
            dns_ok: 100,
            ..counters
        };
        assert!(!drifted.is_consistent());
    }

    #[test]
    fn test_counters_metrics_count() {
        let counters = DomainCounters::default();
        assert_eq!(counters.metrics().len(), 9);
    }

    #[test]
    fn test_feature_vector_absent_keys_stay_none() {
        let value = serde_json::json!({
            "content_bytes": 4096,
            "has_structural_signals": true,
            "unknown_extra": "ignored"
        });
        let fv = FeatureVector::from_value(&value);
        assert_eq!(fv.content_bytes, Some(4096));
        assert_eq!(fv.has_structural_signals, Some(true));
        assert_eq!(fv.kw_unique, None);
        assert_eq!(fv.kw_hits_total, None);
    }

    #[test]
    fn test_feature_vector_zero_is_not_absent() {
        let value = serde_json::json!({"kw_unique": 0, "kw_hits_total": 0});
        let fv = FeatureVector::from_value(&value);
        assert_eq!(fv.kw_unique, Some(0));
        assert_eq!(fv.kw_hits_total, Some(0));
    }
}
