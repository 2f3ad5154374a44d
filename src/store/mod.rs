//! Persistence facade.
//!
//! `CampaignStore` declares every durable operation the phase services and
//! reconcilers use. The store owns row-level atomicity: bulk updates
//! (DNS/HTTP batches, reconciler sweeps) commit in a single transaction, so
//! counter reads after a committed batch observe the exact bucket
//! distribution of the committed rows.
//!
//! `SqliteStore` is the shipped backend; `new_in_memory()` backs the tests.

pub mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use uuid::Uuid;

use crate::errors::StoreError;
use crate::model::{
    AnalysisScore, CampaignPhase, DnsReason, DnsStatus, DomainCounters, ErrorDetails,
    ExtractionFeatures, ExtractionTask, GeneratedDomain, HttpStatus, LeadStatus, PhaseType,
    TaskState,
};

/// A freshly generated domain row, before insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDomain {
    pub domain_name: String,
    pub offset_index: u64,
}

/// One domain's DNS verdict within a batch update.
#[derive(Debug, Clone)]
pub struct DnsUpdate {
    pub domain_name: String,
    pub status: DnsStatus,
    pub reason: DnsReason,
    pub ips: Vec<IpAddr>,
}

/// One domain's HTTP verdict within a batch update.
#[derive(Debug, Clone, Default)]
pub struct HttpUpdate {
    pub domain_name: String,
    pub status: Option<HttpStatus>,
    pub status_code: Option<u16>,
    pub body_hash: Option<String>,
    pub latency_ms: Option<u64>,
    pub feature_vector: Option<serde_json::Value>,
    pub is_parked: Option<bool>,
    pub parked_confidence: Option<f64>,
    pub fetched_at: Option<DateTime<Utc>>,
}

/// Outcome of one reconciler sweep category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSweep {
    pub examined: u64,
    pub reset: u64,
    pub fatal: u64,
}

/// A stale analysis score: the feature row it was computed from has been
/// refreshed since.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaleScore {
    pub campaign_id: Uuid,
    pub domain_name: String,
    pub score_updated_at: DateTime<Utc>,
    pub feature_updated_at: DateTime<Utc>,
}

/// Every durable operation used by the engine. Implementations serialise
/// conflicting writes at the row level; callers hold no locks across calls.
#[async_trait]
pub trait CampaignStore: Send + Sync {
    // ── campaign phases ──────────────────────────────────────────────

    async fn get_campaign_phase(
        &self,
        campaign_id: Uuid,
        phase: PhaseType,
    ) -> Result<Option<CampaignPhase>, StoreError>;

    async fn list_campaign_phases(
        &self,
        campaign_id: Uuid,
    ) -> Result<Vec<CampaignPhase>, StoreError>;

    async fn get_phase_config(
        &self,
        campaign_id: Uuid,
        phase: PhaseType,
    ) -> Result<Option<serde_json::Value>, StoreError>;

    /// Upsert the phase row into `Configured` with the given configuration,
    /// clearing prior error details and progress.
    async fn update_phase_configuration(
        &self,
        campaign_id: Uuid,
        phase: PhaseType,
        config: &serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Transition to `InProgress`, stamping `started_at`.
    async fn start_phase(&self, campaign_id: Uuid, phase: PhaseType) -> Result<(), StoreError>;

    async fn pause_phase(&self, campaign_id: Uuid, phase: PhaseType) -> Result<(), StoreError>;

    async fn resume_phase(&self, campaign_id: Uuid, phase: PhaseType) -> Result<(), StoreError>;

    async fn update_phase_progress(
        &self,
        campaign_id: Uuid,
        phase: PhaseType,
        items_processed: u64,
        items_total: u64,
        progress_pct: f64,
    ) -> Result<(), StoreError>;

    /// Terminal success: status `Completed`, 100 %, `completed_at` stamped.
    async fn complete_phase(
        &self,
        campaign_id: Uuid,
        phase: PhaseType,
        items_total: u64,
    ) -> Result<(), StoreError>;

    /// Terminal failure: status `Failed`, `failed_at` stamped, structured
    /// error details recorded.
    async fn fail_phase(
        &self,
        campaign_id: Uuid,
        phase: PhaseType,
        details: &ErrorDetails,
    ) -> Result<(), StoreError>;

    // ── generated domains ────────────────────────────────────────────

    /// Insert a generation batch. Already-present offsets are ignored so a
    /// cancelled run can resume without duplicating rows. Returns the number
    /// of rows actually inserted; counters gain `total`/`dns_pending`/
    /// `http_pending` for exactly those rows.
    async fn insert_generated_domains(
        &self,
        campaign_id: Uuid,
        batch: &[NewDomain],
    ) -> Result<u64, StoreError>;

    async fn count_generated_domains(&self, campaign_id: Uuid) -> Result<u64, StoreError>;

    /// Cursor pagination by `offset_index`; pass the last seen offset to
    /// fetch the next page.
    async fn get_generated_domains_with_cursor(
        &self,
        campaign_id: Uuid,
        after_offset: Option<u64>,
        limit: usize,
    ) -> Result<Vec<GeneratedDomain>, StoreError>;

    async fn get_generated_domain(
        &self,
        campaign_id: Uuid,
        domain_name: &str,
    ) -> Result<Option<GeneratedDomain>, StoreError>;

    /// Apply a DNS batch atomically: domain rows, dns_validation_results
    /// upserts, and the counter delta commit together. The returned delta
    /// reflects only rows that actually changed bucket, so reapplying the
    /// same batch yields an all-zero delta.
    async fn update_domains_bulk_dns_status(
        &self,
        campaign_id: Uuid,
        updates: &[DnsUpdate],
    ) -> Result<DomainCounters, StoreError>;

    /// HTTP sibling of `update_domains_bulk_dns_status`, with the same
    /// exact-delta and idempotency guarantees.
    async fn update_domains_bulk_http_status(
        &self,
        campaign_id: Uuid,
        updates: &[HttpUpdate],
    ) -> Result<DomainCounters, StoreError>;

    async fn update_domain_features(
        &self,
        campaign_id: Uuid,
        domain_name: &str,
        features: &serde_json::Value,
        is_parked: bool,
        parked_confidence: f64,
    ) -> Result<(), StoreError>;

    /// Mirror the analysis relevance score onto the domain row.
    async fn update_domain_score(
        &self,
        campaign_id: Uuid,
        domain_name: &str,
        score: f64,
    ) -> Result<(), StoreError>;

    async fn update_domain_lead_status(
        &self,
        campaign_id: Uuid,
        domain_name: &str,
        lead_status: LeadStatus,
        lead_score: Option<f64>,
        rejection_reason: &str,
    ) -> Result<(), StoreError>;

    // ── counters ─────────────────────────────────────────────────────

    async fn get_campaign_domain_counters(
        &self,
        campaign_id: Uuid,
    ) -> Result<DomainCounters, StoreError>;

    /// Authoritative aggregate recomputed from the domain table.
    async fn aggregate_domain_counters(
        &self,
        campaign_id: Uuid,
    ) -> Result<DomainCounters, StoreError>;

    /// Rewrite the counter row to the given values in a single UPDATE.
    async fn replace_campaign_domain_counters(
        &self,
        campaign_id: Uuid,
        counters: &DomainCounters,
    ) -> Result<(), StoreError>;

    /// Campaigns that have a counter row.
    async fn list_counter_campaigns(&self) -> Result<Vec<Uuid>, StoreError>;

    // ── extraction tasks & features ──────────────────────────────────

    /// Create pending extraction tasks for the given domains, skipping ones
    /// that already have a task. Returns how many were created.
    async fn enqueue_extraction_tasks(
        &self,
        campaign_id: Uuid,
        domain_names: &[String],
    ) -> Result<u64, StoreError>;

    /// Tasks in any of `states`, ordered `retry_count asc, created_at asc`.
    async fn list_extraction_tasks(
        &self,
        campaign_id: Uuid,
        states: &[TaskState],
        limit: usize,
    ) -> Result<Vec<ExtractionTask>, StoreError>;

    async fn mark_extraction_task(&self, task_id: i64, state: TaskState)
        -> Result<(), StoreError>;

    /// Record a per-item failure: state `error`, retry count incremented.
    async fn record_extraction_task_error(
        &self,
        task_id: i64,
        message: &str,
    ) -> Result<(), StoreError>;

    async fn upsert_extraction_features(
        &self,
        campaign_id: Uuid,
        domain_name: &str,
        features: &serde_json::Value,
        status: &str,
    ) -> Result<(), StoreError>;

    async fn upsert_extracted_keywords(
        &self,
        campaign_id: Uuid,
        domain_name: &str,
        keywords: &[String],
    ) -> Result<(), StoreError>;

    async fn get_extraction_features(
        &self,
        campaign_id: Uuid,
        domain_name: &str,
    ) -> Result<Option<ExtractionFeatures>, StoreError>;

    /// Domains whose feature row is `ready`, joined with that row, cursor
    /// paginated by `offset_index`.
    async fn list_domains_with_ready_features(
        &self,
        campaign_id: Uuid,
        after_offset: Option<u64>,
        limit: usize,
    ) -> Result<Vec<(GeneratedDomain, ExtractionFeatures)>, StoreError>;

    // ── analysis scores ──────────────────────────────────────────────

    async fn upsert_analysis_score(
        &self,
        campaign_id: Uuid,
        domain_name: &str,
        relevance_score: f64,
    ) -> Result<(), StoreError>;

    async fn get_analysis_score(
        &self,
        campaign_id: Uuid,
        domain_name: &str,
    ) -> Result<Option<AnalysisScore>, StoreError>;

    // ── reconciler sweeps ────────────────────────────────────────────

    /// Tasks in `state` untouched since `older_than`: reset to `pending`
    /// with retry increment while under `max_retries`, otherwise `fatal`.
    /// One transaction; at most `limit` rows examined.
    async fn recover_stuck_tasks(
        &self,
        state: TaskState,
        older_than: DateTime<Utc>,
        max_retries: u32,
        limit: usize,
    ) -> Result<TaskSweep, StoreError>;

    /// Errored tasks with retries left go back to `pending`.
    async fn requeue_retryable_errors(
        &self,
        max_retries: u32,
        limit: usize,
    ) -> Result<TaskSweep, StoreError>;

    /// Completed tasks past the grace window with no feature row: retry
    /// while retries remain, otherwise leave completed.
    async fn requeue_completed_missing_features(
        &self,
        older_than: DateTime<Utc>,
        max_retries: u32,
        limit: usize,
    ) -> Result<TaskSweep, StoreError>;

    /// Scores older than `older_than` whose `ready` feature row is newer
    /// than the score.
    async fn find_stale_scores(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StaleScore>, StoreError>;
}
