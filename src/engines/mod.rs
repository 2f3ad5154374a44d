//! Collaborator engine interfaces.
//!
//! The actual network engines (DNS resolver, HTTP fetcher, HTML analyzer,
//! keyword dictionary, relevance scorer) live outside this crate. Each is
//! consumed behind a narrow trait so phase services stay testable with
//! scripted fakes.

pub mod flags;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::errors::EngineError;
use crate::model::FeatureVector;

/// Raw resolver verdict before bucket normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveStatus {
    Resolved,
    NotFound,
    Timeout,
    Error,
}

/// One resolver result for one domain.
#[derive(Debug, Clone)]
pub struct ResolveOutcome {
    pub domain: String,
    pub status: ResolveStatus,
    pub ips: Vec<IpAddr>,
    pub error: Option<String>,
}

/// Bulk DNS resolution engine. Bounded parallelism is implementation
/// defined; implementations must honour task cancellation.
#[async_trait]
pub trait DomainResolver: Send + Sync {
    async fn validate_domains_bulk(
        &self,
        domains: &[String],
        batch_size: usize,
    ) -> Result<Vec<ResolveOutcome>, EngineError>;
}

/// Raw fetcher verdict before bucket normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Ok,
    Error,
    Timeout,
}

/// One HTTP fetch result for one domain.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub domain: String,
    pub status: FetchStatus,
    pub status_code: Option<u16>,
    pub raw_body: Option<String>,
    pub latency_ms: u64,
    pub final_url: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub is_success: bool,
}

/// Bulk HTTP validation engine.
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    async fn validate_domains_bulk(
        &self,
        domains: &[String],
        batch_size: usize,
        persona_id: Option<&str>,
        proxy_id: Option<&str>,
    ) -> Result<Vec<FetchOutcome>, EngineError>;
}

/// Structural signals parsed out of a page body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageSignals {
    pub has_structural_signals: bool,
    pub h1_count: u64,
    pub link_internal_count: u64,
    pub link_external_count: u64,
    pub content_bytes: u64,
    pub is_parked: bool,
    pub parked_confidence: f64,
}

/// HTML parser collaborator. Pure per-body; no network access.
pub trait PageAnalyzer: Send + Sync {
    fn analyze(&self, body: &str) -> PageSignals;
}

/// Hits against the campaign keyword dictionary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeywordHits {
    pub unique: u64,
    pub total: u64,
    pub keywords: Vec<String>,
}

/// Keyword dictionary collaborator.
pub trait KeywordScanner: Send + Sync {
    fn scan(&self, body: &str) -> KeywordHits;
}

/// Relevance scorer consumed by the analysis phase. Feature engineering is
/// out of scope for this crate; the scorer sees the assembled vector only.
pub trait RelevanceScorer: Send + Sync {
    fn score(&self, features: &FeatureVector) -> f64;
}
