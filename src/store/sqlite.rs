use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use uuid::Uuid;

use super::{
    CampaignStore, DnsUpdate, HttpUpdate, NewDomain, StaleScore, TaskSweep,
};
use crate::errors::StoreError;
use crate::model::{
    AnalysisScore, CampaignPhase, DnsStatus, DomainCounters, ErrorDetails, ExtractionFeatures,
    ExtractionTask, GeneratedDomain, HttpStatus, LeadStatus, PhaseStatus, PhaseType, TaskState,
};

/// Fixed-width UTC timestamp so lexicographic order in SQL matches
/// chronological order.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str, field: &'static str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            field,
            message: e.to_string(),
        })
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Corrupt {
        field: "campaign_id",
        message: e.to_string(),
    })
}

/// SQLite-backed `CampaignStore`.
///
/// The connection sits behind a mutex; every operation locks, runs, and
/// releases before returning to async code. Bulk operations open a single
/// transaction so a batch commits atomically with its counter delta.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    pub fn new_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS campaign_phases (
                campaign_id TEXT NOT NULL,
                phase_type TEXT NOT NULL,
                phase_order INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'not_started',
                progress_percentage REAL NOT NULL DEFAULT 0,
                items_total INTEGER NOT NULL DEFAULT 0,
                items_processed INTEGER NOT NULL DEFAULT 0,
                started_at TEXT,
                completed_at TEXT,
                failed_at TEXT,
                error_details TEXT,
                configuration TEXT,
                PRIMARY KEY (campaign_id, phase_type)
            );

            CREATE TABLE IF NOT EXISTS generated_domains (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                campaign_id TEXT NOT NULL,
                domain_name TEXT NOT NULL,
                offset_index INTEGER NOT NULL,
                generated_at TEXT NOT NULL,
                dns_status TEXT NOT NULL DEFAULT 'pending',
                http_status TEXT NOT NULL DEFAULT 'pending',
                http_status_code INTEGER,
                body_hash TEXT,
                latency_ms INTEGER,
                lead_status TEXT NOT NULL DEFAULT 'pending',
                lead_score REAL,
                lead_rejection_reason TEXT,
                domain_score REAL,
                feature_vector TEXT,
                is_parked INTEGER NOT NULL DEFAULT 0,
                parked_confidence REAL NOT NULL DEFAULT 0,
                last_http_fetched_at TEXT,
                UNIQUE (campaign_id, domain_name),
                UNIQUE (campaign_id, offset_index)
            );

            CREATE TABLE IF NOT EXISTS dns_validation_results (
                campaign_id TEXT NOT NULL,
                domain_name TEXT NOT NULL,
                status TEXT NOT NULL,
                reason TEXT NOT NULL,
                ips TEXT NOT NULL DEFAULT '[]',
                checked_at TEXT NOT NULL,
                PRIMARY KEY (campaign_id, domain_name)
            );

            CREATE TABLE IF NOT EXISTS campaign_domain_counters (
                campaign_id TEXT PRIMARY KEY,
                total INTEGER NOT NULL DEFAULT 0,
                dns_pending INTEGER NOT NULL DEFAULT 0,
                dns_ok INTEGER NOT NULL DEFAULT 0,
                dns_error INTEGER NOT NULL DEFAULT 0,
                dns_timeout INTEGER NOT NULL DEFAULT 0,
                http_pending INTEGER NOT NULL DEFAULT 0,
                http_ok INTEGER NOT NULL DEFAULT 0,
                http_error INTEGER NOT NULL DEFAULT 0,
                http_timeout INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS domain_extraction_tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                campaign_id TEXT NOT NULL,
                domain_name TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending',
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (campaign_id, domain_name)
            );

            CREATE TABLE IF NOT EXISTS extraction_features (
                campaign_id TEXT NOT NULL,
                domain_name TEXT NOT NULL,
                features TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'ready',
                updated_at TEXT NOT NULL,
                PRIMARY KEY (campaign_id, domain_name)
            );

            CREATE TABLE IF NOT EXISTS extracted_keywords (
                campaign_id TEXT NOT NULL,
                domain_name TEXT NOT NULL,
                keywords TEXT NOT NULL DEFAULT '[]',
                updated_at TEXT NOT NULL,
                PRIMARY KEY (campaign_id, domain_name)
            );

            CREATE TABLE IF NOT EXISTS analysis_scores (
                campaign_id TEXT NOT NULL,
                domain_name TEXT NOT NULL,
                relevance_score REAL NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (campaign_id, domain_name)
            );

            CREATE INDEX IF NOT EXISTS idx_domains_campaign_offset
                ON generated_domains (campaign_id, offset_index);
            CREATE INDEX IF NOT EXISTS idx_tasks_state
                ON domain_extraction_tasks (state, updated_at);
            CREATE INDEX IF NOT EXISTS idx_scores_updated
                ON analysis_scores (updated_at);
            ",
        )?;
        Ok(())
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let conn = self.conn.lock().unwrap();
        f(&conn)
    }

    fn with_tx<T>(
        &self,
        f: impl FnOnce(&Transaction) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

// ── row mapping ──────────────────────────────────────────────────────

const DOMAIN_COLUMNS: &str = "id, campaign_id, domain_name, offset_index, generated_at, \
     dns_status, http_status, http_status_code, body_hash, latency_ms, \
     lead_status, lead_score, domain_score, feature_vector, is_parked, \
     parked_confidence, last_http_fetched_at";

struct RawDomain {
    id: i64,
    campaign_id: String,
    domain_name: String,
    offset_index: i64,
    generated_at: String,
    dns_status: String,
    http_status: String,
    http_status_code: Option<i64>,
    body_hash: Option<String>,
    latency_ms: Option<i64>,
    lead_status: String,
    lead_score: Option<f64>,
    domain_score: Option<f64>,
    feature_vector: Option<String>,
    is_parked: bool,
    parked_confidence: f64,
    last_http_fetched_at: Option<String>,
}

fn read_raw_domain(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawDomain> {
    Ok(RawDomain {
        id: row.get(0)?,
        campaign_id: row.get(1)?,
        domain_name: row.get(2)?,
        offset_index: row.get(3)?,
        generated_at: row.get(4)?,
        dns_status: row.get(5)?,
        http_status: row.get(6)?,
        http_status_code: row.get(7)?,
        body_hash: row.get(8)?,
        latency_ms: row.get(9)?,
        lead_status: row.get(10)?,
        lead_score: row.get(11)?,
        domain_score: row.get(12)?,
        feature_vector: row.get(13)?,
        is_parked: row.get(14)?,
        parked_confidence: row.get(15)?,
        last_http_fetched_at: row.get(16)?,
    })
}

impl TryFrom<RawDomain> for GeneratedDomain {
    type Error = StoreError;

    fn try_from(raw: RawDomain) -> Result<Self, StoreError> {
        let corrupt = |field: &'static str, message: String| StoreError::Corrupt { field, message };
        Ok(GeneratedDomain {
            id: raw.id,
            campaign_id: parse_uuid(&raw.campaign_id)?,
            domain_name: raw.domain_name,
            offset_index: raw.offset_index as u64,
            generated_at: parse_ts(&raw.generated_at, "generated_at")?,
            dns_status: DnsStatus::from_str(&raw.dns_status)
                .map_err(|e| corrupt("dns_status", e))?,
            http_status: HttpStatus::from_str(&raw.http_status)
                .map_err(|e| corrupt("http_status", e))?,
            http_status_code: raw.http_status_code.map(|c| c as u16),
            body_hash: raw.body_hash,
            latency_ms: raw.latency_ms.map(|l| l as u64),
            lead_status: LeadStatus::from_str(&raw.lead_status)
                .map_err(|e| corrupt("lead_status", e))?,
            lead_score: raw.lead_score,
            domain_score: raw.domain_score,
            feature_vector: raw
                .feature_vector
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            is_parked: raw.is_parked,
            parked_confidence: raw.parked_confidence,
            last_http_fetched_at: raw
                .last_http_fetched_at
                .as_deref()
                .map(|s| parse_ts(s, "last_http_fetched_at"))
                .transpose()?,
        })
    }
}

struct RawPhase {
    campaign_id: String,
    phase_type: String,
    phase_order: i64,
    status: String,
    progress_percentage: f64,
    items_total: i64,
    items_processed: i64,
    started_at: Option<String>,
    completed_at: Option<String>,
    failed_at: Option<String>,
    error_details: Option<String>,
    configuration: Option<String>,
}

fn read_raw_phase(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawPhase> {
    Ok(RawPhase {
        campaign_id: row.get(0)?,
        phase_type: row.get(1)?,
        phase_order: row.get(2)?,
        status: row.get(3)?,
        progress_percentage: row.get(4)?,
        items_total: row.get(5)?,
        items_processed: row.get(6)?,
        started_at: row.get(7)?,
        completed_at: row.get(8)?,
        failed_at: row.get(9)?,
        error_details: row.get(10)?,
        configuration: row.get(11)?,
    })
}

impl TryFrom<RawPhase> for CampaignPhase {
    type Error = StoreError;

    fn try_from(raw: RawPhase) -> Result<Self, StoreError> {
        let corrupt = |field: &'static str, message: String| StoreError::Corrupt { field, message };
        let opt_ts = |s: &Option<String>, field: &'static str| {
            s.as_deref().map(|v| parse_ts(v, field)).transpose()
        };
        Ok(CampaignPhase {
            campaign_id: parse_uuid(&raw.campaign_id)?,
            phase_type: PhaseType::from_str(&raw.phase_type)
                .map_err(|e| corrupt("phase_type", e))?,
            phase_order: raw.phase_order as u8,
            status: PhaseStatus::from_str(&raw.status).map_err(|e| corrupt("status", e))?,
            progress_percentage: raw.progress_percentage,
            items_total: raw.items_total as u64,
            items_processed: raw.items_processed as u64,
            started_at: opt_ts(&raw.started_at, "started_at")?,
            completed_at: opt_ts(&raw.completed_at, "completed_at")?,
            failed_at: opt_ts(&raw.failed_at, "failed_at")?,
            error_details: raw
                .error_details
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            configuration: raw
                .configuration
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
        })
    }
}

const PHASE_COLUMNS: &str = "campaign_id, phase_type, phase_order, status, progress_percentage, \
     items_total, items_processed, started_at, completed_at, failed_at, error_details, \
     configuration";

fn read_counters(row: &rusqlite::Row<'_>) -> rusqlite::Result<DomainCounters> {
    Ok(DomainCounters {
        total: row.get(0)?,
        dns_pending: row.get(1)?,
        dns_ok: row.get(2)?,
        dns_error: row.get(3)?,
        dns_timeout: row.get(4)?,
        http_pending: row.get(5)?,
        http_ok: row.get(6)?,
        http_error: row.get(7)?,
        http_timeout: row.get(8)?,
    })
}

fn read_raw_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, String, String, String, i64, String, String)>
{
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn task_from_raw(
    raw: (i64, String, String, String, i64, String, String),
) -> Result<ExtractionTask, StoreError> {
    let (id, campaign_id, domain_name, state, retry_count, created_at, updated_at) = raw;
    Ok(ExtractionTask {
        id,
        campaign_id: parse_uuid(&campaign_id)?,
        domain_name,
        state: TaskState::from_str(&state).map_err(|e| StoreError::Corrupt {
            field: "state",
            message: e,
        })?,
        retry_count: retry_count as u32,
        created_at: parse_ts(&created_at, "created_at")?,
        updated_at: parse_ts(&updated_at, "updated_at")?,
    })
}

/// Apply a counter delta inside the same transaction as the rows it
/// describes.
fn apply_counter_delta(
    tx: &Transaction,
    campaign_id: Uuid,
    delta: &DomainCounters,
) -> Result<(), StoreError> {
    if *delta == DomainCounters::default() {
        return Ok(());
    }
    tx.execute(
        "INSERT INTO campaign_domain_counters (
             campaign_id, total, dns_pending, dns_ok, dns_error, dns_timeout,
             http_pending, http_ok, http_error, http_timeout, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT (campaign_id) DO UPDATE SET
             total = total + excluded.total,
             dns_pending = dns_pending + excluded.dns_pending,
             dns_ok = dns_ok + excluded.dns_ok,
             dns_error = dns_error + excluded.dns_error,
             dns_timeout = dns_timeout + excluded.dns_timeout,
             http_pending = http_pending + excluded.http_pending,
             http_ok = http_ok + excluded.http_ok,
             http_error = http_error + excluded.http_error,
             http_timeout = http_timeout + excluded.http_timeout,
             updated_at = excluded.updated_at",
        params![
            campaign_id.to_string(),
            delta.total,
            delta.dns_pending,
            delta.dns_ok,
            delta.dns_error,
            delta.dns_timeout,
            delta.http_pending,
            delta.http_ok,
            delta.http_error,
            delta.http_timeout,
            ts(Utc::now()),
        ],
    )?;
    Ok(())
}

fn dns_bucket_field(delta: &mut DomainCounters, status: DnsStatus) -> &mut i64 {
    match status {
        DnsStatus::Pending => &mut delta.dns_pending,
        DnsStatus::Ok => &mut delta.dns_ok,
        DnsStatus::Error => &mut delta.dns_error,
        DnsStatus::Timeout => &mut delta.dns_timeout,
    }
}

fn http_bucket_field(delta: &mut DomainCounters, status: HttpStatus) -> &mut i64 {
    match status {
        HttpStatus::Pending => &mut delta.http_pending,
        HttpStatus::Ok => &mut delta.http_ok,
        HttpStatus::Error => &mut delta.http_error,
        HttpStatus::Timeout => &mut delta.http_timeout,
    }
}

#[async_trait]
impl CampaignStore for SqliteStore {
    // ── campaign phases ──────────────────────────────────────────────

    async fn get_campaign_phase(
        &self,
        campaign_id: Uuid,
        phase: PhaseType,
    ) -> Result<Option<CampaignPhase>, StoreError> {
        self.with_conn(|conn| {
            let raw = conn
                .query_row(
                    &format!(
                        "SELECT {PHASE_COLUMNS} FROM campaign_phases
                         WHERE campaign_id = ?1 AND phase_type = ?2"
                    ),
                    params![campaign_id.to_string(), phase.as_str()],
                    read_raw_phase,
                )
                .optional()?;
            raw.map(CampaignPhase::try_from).transpose()
        })
    }

    async fn list_campaign_phases(
        &self,
        campaign_id: Uuid,
    ) -> Result<Vec<CampaignPhase>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PHASE_COLUMNS} FROM campaign_phases
                 WHERE campaign_id = ?1 ORDER BY phase_order"
            ))?;
            let raws = stmt
                .query_map(params![campaign_id.to_string()], read_raw_phase)?
                .collect::<Result<Vec<_>, _>>()?;
            raws.into_iter().map(CampaignPhase::try_from).collect()
        })
    }

    async fn get_phase_config(
        &self,
        campaign_id: Uuid,
        phase: PhaseType,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(self
            .get_campaign_phase(campaign_id, phase)
            .await?
            .and_then(|row| row.configuration))
    }

    async fn update_phase_configuration(
        &self,
        campaign_id: Uuid,
        phase: PhaseType,
        config: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let config_json = serde_json::to_string(config)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO campaign_phases (
                     campaign_id, phase_type, phase_order, status, configuration
                 ) VALUES (?1, ?2, ?3, 'configured', ?4)
                 ON CONFLICT (campaign_id, phase_type) DO UPDATE SET
                     status = 'configured',
                     configuration = excluded.configuration,
                     progress_percentage = 0,
                     items_total = 0,
                     items_processed = 0,
                     started_at = NULL,
                     completed_at = NULL,
                     failed_at = NULL,
                     error_details = NULL",
                params![
                    campaign_id.to_string(),
                    phase.as_str(),
                    phase.order(),
                    config_json,
                ],
            )?;
            Ok(())
        })
    }

    async fn start_phase(&self, campaign_id: Uuid, phase: PhaseType) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE campaign_phases
                 SET status = 'in_progress', started_at = COALESCE(started_at, ?3)
                 WHERE campaign_id = ?1 AND phase_type = ?2",
                params![campaign_id.to_string(), phase.as_str(), ts(Utc::now())],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound {
                    entity: "campaign_phase",
                    campaign_id,
                });
            }
            Ok(())
        })
    }

    async fn pause_phase(&self, campaign_id: Uuid, phase: PhaseType) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE campaign_phases SET status = 'paused'
                 WHERE campaign_id = ?1 AND phase_type = ?2 AND status = 'in_progress'",
                params![campaign_id.to_string(), phase.as_str()],
            )?;
            Ok(())
        })
    }

    async fn resume_phase(&self, campaign_id: Uuid, phase: PhaseType) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE campaign_phases SET status = 'in_progress'
                 WHERE campaign_id = ?1 AND phase_type = ?2 AND status = 'paused'",
                params![campaign_id.to_string(), phase.as_str()],
            )?;
            Ok(())
        })
    }

    async fn update_phase_progress(
        &self,
        campaign_id: Uuid,
        phase: PhaseType,
        items_processed: u64,
        items_total: u64,
        progress_pct: f64,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE campaign_phases
                 SET items_processed = ?3, items_total = ?4, progress_percentage = ?5
                 WHERE campaign_id = ?1 AND phase_type = ?2",
                params![
                    campaign_id.to_string(),
                    phase.as_str(),
                    items_processed as i64,
                    items_total as i64,
                    progress_pct,
                ],
            )?;
            Ok(())
        })
    }

    async fn complete_phase(
        &self,
        campaign_id: Uuid,
        phase: PhaseType,
        items_total: u64,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE campaign_phases
                 SET status = 'completed', progress_percentage = 100,
                     items_total = ?3, items_processed = ?3, completed_at = ?4
                 WHERE campaign_id = ?1 AND phase_type = ?2",
                params![
                    campaign_id.to_string(),
                    phase.as_str(),
                    items_total as i64,
                    ts(Utc::now()),
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound {
                    entity: "campaign_phase",
                    campaign_id,
                });
            }
            Ok(())
        })
    }

    async fn fail_phase(
        &self,
        campaign_id: Uuid,
        phase: PhaseType,
        details: &ErrorDetails,
    ) -> Result<(), StoreError> {
        let details_json = serde_json::to_string(details)?;
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE campaign_phases
                 SET status = 'failed', failed_at = ?3, error_details = ?4
                 WHERE campaign_id = ?1 AND phase_type = ?2",
                params![
                    campaign_id.to_string(),
                    phase.as_str(),
                    ts(Utc::now()),
                    details_json,
                ],
            )?;
            Ok(())
        })
    }

    // ── generated domains ────────────────────────────────────────────

    async fn insert_generated_domains(
        &self,
        campaign_id: Uuid,
        batch: &[NewDomain],
    ) -> Result<u64, StoreError> {
        self.with_tx(|tx| {
            let now = ts(Utc::now());
            let mut inserted: u64 = 0;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO generated_domains
                         (campaign_id, domain_name, offset_index, generated_at)
                     VALUES (?1, ?2, ?3, ?4)",
                )?;
                for domain in batch {
                    let changed = stmt.execute(params![
                        campaign_id.to_string(),
                        domain.domain_name,
                        domain.offset_index as i64,
                        now,
                    ])?;
                    inserted += changed as u64;
                }
            }
            let delta = DomainCounters {
                total: inserted as i64,
                dns_pending: inserted as i64,
                http_pending: inserted as i64,
                ..Default::default()
            };
            apply_counter_delta(tx, campaign_id, &delta)?;
            Ok(inserted)
        })
    }

    async fn count_generated_domains(&self, campaign_id: Uuid) -> Result<u64, StoreError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM generated_domains WHERE campaign_id = ?1",
                params![campaign_id.to_string()],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }

    async fn get_generated_domains_with_cursor(
        &self,
        campaign_id: Uuid,
        after_offset: Option<u64>,
        limit: usize,
    ) -> Result<Vec<GeneratedDomain>, StoreError> {
        self.with_conn(|conn| {
            let cursor = after_offset.map(|o| o as i64).unwrap_or(-1);
            let mut stmt = conn.prepare(&format!(
                "SELECT {DOMAIN_COLUMNS} FROM generated_domains
                 WHERE campaign_id = ?1 AND offset_index > ?2
                 ORDER BY offset_index ASC LIMIT ?3"
            ))?;
            let raws = stmt
                .query_map(
                    params![campaign_id.to_string(), cursor, limit as i64],
                    read_raw_domain,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            raws.into_iter().map(GeneratedDomain::try_from).collect()
        })
    }

    async fn get_generated_domain(
        &self,
        campaign_id: Uuid,
        domain_name: &str,
    ) -> Result<Option<GeneratedDomain>, StoreError> {
        self.with_conn(|conn| {
            let raw = conn
                .query_row(
                    &format!(
                        "SELECT {DOMAIN_COLUMNS} FROM generated_domains
                         WHERE campaign_id = ?1 AND domain_name = ?2"
                    ),
                    params![campaign_id.to_string(), domain_name],
                    read_raw_domain,
                )
                .optional()?;
            raw.map(GeneratedDomain::try_from).transpose()
        })
    }

    async fn update_domains_bulk_dns_status(
        &self,
        campaign_id: Uuid,
        updates: &[DnsUpdate],
    ) -> Result<DomainCounters, StoreError> {
        self.with_tx(|tx| {
            let now = ts(Utc::now());
            let mut delta = DomainCounters::default();
            for update in updates {
                let current: Option<String> = tx
                    .query_row(
                        "SELECT dns_status FROM generated_domains
                         WHERE campaign_id = ?1 AND domain_name = ?2",
                        params![campaign_id.to_string(), update.domain_name],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(current) = current else {
                    continue;
                };
                let current = DnsStatus::from_str(&current).map_err(|e| StoreError::Corrupt {
                    field: "dns_status",
                    message: e,
                })?;
                if current != update.status {
                    tx.execute(
                        "UPDATE generated_domains SET dns_status = ?3
                         WHERE campaign_id = ?1 AND domain_name = ?2",
                        params![
                            campaign_id.to_string(),
                            update.domain_name,
                            update.status.as_str(),
                        ],
                    )?;
                    *dns_bucket_field(&mut delta, current) -= 1;
                    *dns_bucket_field(&mut delta, update.status) += 1;
                }
                let ips = serde_json::to_string(
                    &update.ips.iter().map(|ip| ip.to_string()).collect::<Vec<_>>(),
                )?;
                tx.execute(
                    "INSERT INTO dns_validation_results
                         (campaign_id, domain_name, status, reason, ips, checked_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT (campaign_id, domain_name) DO UPDATE SET
                         status = excluded.status,
                         reason = excluded.reason,
                         ips = excluded.ips,
                         checked_at = excluded.checked_at",
                    params![
                        campaign_id.to_string(),
                        update.domain_name,
                        update.status.as_str(),
                        update.reason.as_str(),
                        ips,
                        now,
                    ],
                )?;
            }
            apply_counter_delta(tx, campaign_id, &delta)?;
            Ok(delta)
        })
    }

    async fn update_domains_bulk_http_status(
        &self,
        campaign_id: Uuid,
        updates: &[HttpUpdate],
    ) -> Result<DomainCounters, StoreError> {
        self.with_tx(|tx| {
            let mut delta = DomainCounters::default();
            for update in updates {
                let current: Option<String> = tx
                    .query_row(
                        "SELECT http_status FROM generated_domains
                         WHERE campaign_id = ?1 AND domain_name = ?2",
                        params![campaign_id.to_string(), update.domain_name],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(current) = current else {
                    continue;
                };
                let current = HttpStatus::from_str(&current).map_err(|e| StoreError::Corrupt {
                    field: "http_status",
                    message: e,
                })?;
                if let Some(status) = update.status {
                    if current != status {
                        tx.execute(
                            "UPDATE generated_domains SET http_status = ?3
                             WHERE campaign_id = ?1 AND domain_name = ?2",
                            params![
                                campaign_id.to_string(),
                                update.domain_name,
                                status.as_str(),
                            ],
                        )?;
                        *http_bucket_field(&mut delta, current) -= 1;
                        *http_bucket_field(&mut delta, status) += 1;
                    }
                }
                let feature_json = update
                    .feature_vector
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                tx.execute(
                    "UPDATE generated_domains SET
                         http_status_code = COALESCE(?3, http_status_code),
                         body_hash = COALESCE(?4, body_hash),
                         latency_ms = COALESCE(?5, latency_ms),
                         feature_vector = COALESCE(?6, feature_vector),
                         is_parked = COALESCE(?7, is_parked),
                         parked_confidence = COALESCE(?8, parked_confidence),
                         last_http_fetched_at = COALESCE(?9, last_http_fetched_at)
                     WHERE campaign_id = ?1 AND domain_name = ?2",
                    params![
                        campaign_id.to_string(),
                        update.domain_name,
                        update.status_code.map(|c| c as i64),
                        update.body_hash,
                        update.latency_ms.map(|l| l as i64),
                        feature_json,
                        update.is_parked,
                        update.parked_confidence,
                        update.fetched_at.map(ts),
                    ],
                )?;
            }
            apply_counter_delta(tx, campaign_id, &delta)?;
            Ok(delta)
        })
    }

    async fn update_domain_features(
        &self,
        campaign_id: Uuid,
        domain_name: &str,
        features: &serde_json::Value,
        is_parked: bool,
        parked_confidence: f64,
    ) -> Result<(), StoreError> {
        let feature_json = serde_json::to_string(features)?;
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE generated_domains SET
                     feature_vector = ?3, is_parked = ?4, parked_confidence = ?5
                 WHERE campaign_id = ?1 AND domain_name = ?2",
                params![
                    campaign_id.to_string(),
                    domain_name,
                    feature_json,
                    is_parked,
                    parked_confidence,
                ],
            )?;
            Ok(())
        })
    }

    async fn update_domain_score(
        &self,
        campaign_id: Uuid,
        domain_name: &str,
        score: f64,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE generated_domains SET domain_score = ?3
                 WHERE campaign_id = ?1 AND domain_name = ?2",
                params![campaign_id.to_string(), domain_name, score],
            )?;
            Ok(())
        })
    }

    async fn update_domain_lead_status(
        &self,
        campaign_id: Uuid,
        domain_name: &str,
        lead_status: LeadStatus,
        lead_score: Option<f64>,
        rejection_reason: &str,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE generated_domains SET
                     lead_status = ?3, lead_score = ?4, lead_rejection_reason = ?5
                 WHERE campaign_id = ?1 AND domain_name = ?2",
                params![
                    campaign_id.to_string(),
                    domain_name,
                    lead_status.as_str(),
                    lead_score,
                    rejection_reason,
                ],
            )?;
            Ok(())
        })
    }

    // ── counters ─────────────────────────────────────────────────────

    async fn get_campaign_domain_counters(
        &self,
        campaign_id: Uuid,
    ) -> Result<DomainCounters, StoreError> {
        self.with_conn(|conn| {
            let counters = conn
                .query_row(
                    "SELECT total, dns_pending, dns_ok, dns_error, dns_timeout,
                            http_pending, http_ok, http_error, http_timeout
                     FROM campaign_domain_counters WHERE campaign_id = ?1",
                    params![campaign_id.to_string()],
                    read_counters,
                )
                .optional()?;
            Ok(counters.unwrap_or_default())
        })
    }

    async fn aggregate_domain_counters(
        &self,
        campaign_id: Uuid,
    ) -> Result<DomainCounters, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*),
                        SUM(CASE WHEN dns_status = 'pending' THEN 1 ELSE 0 END),
                        SUM(CASE WHEN dns_status = 'ok' THEN 1 ELSE 0 END),
                        SUM(CASE WHEN dns_status = 'error' THEN 1 ELSE 0 END),
                        SUM(CASE WHEN dns_status = 'timeout' THEN 1 ELSE 0 END),
                        SUM(CASE WHEN http_status = 'pending' THEN 1 ELSE 0 END),
                        SUM(CASE WHEN http_status = 'ok' THEN 1 ELSE 0 END),
                        SUM(CASE WHEN http_status = 'error' THEN 1 ELSE 0 END),
                        SUM(CASE WHEN http_status = 'timeout' THEN 1 ELSE 0 END)
                 FROM generated_domains WHERE campaign_id = ?1",
                params![campaign_id.to_string()],
                |row| {
                    Ok(DomainCounters {
                        total: row.get(0)?,
                        dns_pending: row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                        dns_ok: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                        dns_error: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                        dns_timeout: row.get::<_, Option<i64>>(4)?.unwrap_or(0),
                        http_pending: row.get::<_, Option<i64>>(5)?.unwrap_or(0),
                        http_ok: row.get::<_, Option<i64>>(6)?.unwrap_or(0),
                        http_error: row.get::<_, Option<i64>>(7)?.unwrap_or(0),
                        http_timeout: row.get::<_, Option<i64>>(8)?.unwrap_or(0),
                    })
                },
            )
            .map_err(StoreError::from)
        })
    }

    async fn replace_campaign_domain_counters(
        &self,
        campaign_id: Uuid,
        counters: &DomainCounters,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO campaign_domain_counters (
                     campaign_id, total, dns_pending, dns_ok, dns_error, dns_timeout,
                     http_pending, http_ok, http_error, http_timeout, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT (campaign_id) DO UPDATE SET
                     total = excluded.total,
                     dns_pending = excluded.dns_pending,
                     dns_ok = excluded.dns_ok,
                     dns_error = excluded.dns_error,
                     dns_timeout = excluded.dns_timeout,
                     http_pending = excluded.http_pending,
                     http_ok = excluded.http_ok,
                     http_error = excluded.http_error,
                     http_timeout = excluded.http_timeout,
                     updated_at = excluded.updated_at",
                params![
                    campaign_id.to_string(),
                    counters.total,
                    counters.dns_pending,
                    counters.dns_ok,
                    counters.dns_error,
                    counters.dns_timeout,
                    counters.http_pending,
                    counters.http_ok,
                    counters.http_error,
                    counters.http_timeout,
                    ts(Utc::now()),
                ],
            )?;
            Ok(())
        })
    }

    async fn list_counter_campaigns(&self) -> Result<Vec<Uuid>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT campaign_id FROM campaign_domain_counters ORDER BY campaign_id")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids.iter().map(|s| parse_uuid(s)).collect()
        })
    }

    // ── extraction tasks & features ──────────────────────────────────

    async fn enqueue_extraction_tasks(
        &self,
        campaign_id: Uuid,
        domain_names: &[String],
    ) -> Result<u64, StoreError> {
        self.with_tx(|tx| {
            let now = ts(Utc::now());
            let mut created: u64 = 0;
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO domain_extraction_tasks
                     (campaign_id, domain_name, state, created_at, updated_at)
                 VALUES (?1, ?2, 'pending', ?3, ?3)",
            )?;
            for name in domain_names {
                created += stmt.execute(params![campaign_id.to_string(), name, now])? as u64;
            }
            drop(stmt);
            Ok(created)
        })
    }

    async fn list_extraction_tasks(
        &self,
        campaign_id: Uuid,
        states: &[TaskState],
        limit: usize,
    ) -> Result<Vec<ExtractionTask>, StoreError> {
        self.with_conn(|conn| {
            let placeholders = states
                .iter()
                .enumerate()
                .map(|(i, _)| format!("?{}", i + 2))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "SELECT id, campaign_id, domain_name, state, retry_count, created_at, updated_at
                 FROM domain_extraction_tasks
                 WHERE campaign_id = ?1 AND state IN ({placeholders})
                 ORDER BY retry_count ASC, created_at ASC
                 LIMIT {limit}"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut values: Vec<Box<dyn rusqlite::ToSql>> =
                vec![Box::new(campaign_id.to_string())];
            for state in states {
                values.push(Box::new(state.as_str()));
            }
            let params = values
                .iter()
                .map(|v| v.as_ref() as &dyn rusqlite::ToSql)
                .collect::<Vec<_>>();
            let raws = stmt
                .query_map(params.as_slice(), read_raw_task)?
                .collect::<Result<Vec<_>, _>>()?;
            raws.into_iter().map(task_from_raw).collect()
        })
    }

    async fn mark_extraction_task(
        &self,
        task_id: i64,
        state: TaskState,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE domain_extraction_tasks SET state = ?2, updated_at = ?3 WHERE id = ?1",
                params![task_id, state.as_str(), ts(Utc::now())],
            )?;
            Ok(())
        })
    }

    async fn record_extraction_task_error(
        &self,
        task_id: i64,
        message: &str,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE domain_extraction_tasks
                 SET state = 'error', retry_count = retry_count + 1,
                     last_error = ?2, updated_at = ?3
                 WHERE id = ?1",
                params![task_id, message, ts(Utc::now())],
            )?;
            Ok(())
        })
    }

    async fn upsert_extraction_features(
        &self,
        campaign_id: Uuid,
        domain_name: &str,
        features: &serde_json::Value,
        status: &str,
    ) -> Result<(), StoreError> {
        let features_json = serde_json::to_string(features)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO extraction_features
                     (campaign_id, domain_name, features, status, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (campaign_id, domain_name) DO UPDATE SET
                     features = excluded.features,
                     status = excluded.status,
                     updated_at = excluded.updated_at",
                params![
                    campaign_id.to_string(),
                    domain_name,
                    features_json,
                    status,
                    ts(Utc::now()),
                ],
            )?;
            Ok(())
        })
    }

    async fn upsert_extracted_keywords(
        &self,
        campaign_id: Uuid,
        domain_name: &str,
        keywords: &[String],
    ) -> Result<(), StoreError> {
        let keywords_json = serde_json::to_string(keywords)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO extracted_keywords
                     (campaign_id, domain_name, keywords, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (campaign_id, domain_name) DO UPDATE SET
                     keywords = excluded.keywords,
                     updated_at = excluded.updated_at",
                params![
                    campaign_id.to_string(),
                    domain_name,
                    keywords_json,
                    ts(Utc::now()),
                ],
            )?;
            Ok(())
        })
    }

    async fn get_extraction_features(
        &self,
        campaign_id: Uuid,
        domain_name: &str,
    ) -> Result<Option<ExtractionFeatures>, StoreError> {
        self.with_conn(|conn| {
            let raw: Option<(String, String, String)> = conn
                .query_row(
                    "SELECT features, status, updated_at FROM extraction_features
                     WHERE campaign_id = ?1 AND domain_name = ?2",
                    params![campaign_id.to_string(), domain_name],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            let Some((features, status, updated_at)) = raw else {
                return Ok(None);
            };
            Ok(Some(ExtractionFeatures {
                campaign_id,
                domain_name: domain_name.to_string(),
                features: serde_json::from_str(&features)?,
                status,
                updated_at: parse_ts(&updated_at, "updated_at")?,
            }))
        })
    }

    async fn list_domains_with_ready_features(
        &self,
        campaign_id: Uuid,
        after_offset: Option<u64>,
        limit: usize,
    ) -> Result<Vec<(GeneratedDomain, ExtractionFeatures)>, StoreError> {
        self.with_conn(|conn| {
            let cursor = after_offset.map(|o| o as i64).unwrap_or(-1);
            let mut stmt = conn.prepare(&format!(
                "SELECT {qualified}, f.features, f.status, f.updated_at
                 FROM generated_domains
                 JOIN extraction_features f
                   ON f.campaign_id = generated_domains.campaign_id
                  AND f.domain_name = generated_domains.domain_name
                 WHERE generated_domains.campaign_id = ?1
                   AND f.status = 'ready'
                   AND offset_index > ?2
                 ORDER BY offset_index ASC LIMIT ?3",
                qualified = DOMAIN_COLUMNS
                    .split(", ")
                    .map(|c| format!("generated_domains.{c}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            ))?;
            let raws = stmt
                .query_map(
                    params![campaign_id.to_string(), cursor, limit as i64],
                    |row| {
                        let domain = read_raw_domain(row)?;
                        let features: String = row.get(17)?;
                        let status: String = row.get(18)?;
                        let updated_at: String = row.get(19)?;
                        Ok((domain, features, status, updated_at))
                    },
                )?
                .collect::<Result<Vec<_>, _>>()?;
            raws.into_iter()
                .map(|(raw, features, status, updated_at)| {
                    let domain = GeneratedDomain::try_from(raw)?;
                    let features = ExtractionFeatures {
                        campaign_id,
                        domain_name: domain.domain_name.clone(),
                        features: serde_json::from_str(&features)?,
                        status,
                        updated_at: parse_ts(&updated_at, "updated_at")?,
                    };
                    Ok((domain, features))
                })
                .collect()
        })
    }

    // ── analysis scores ──────────────────────────────────────────────

    async fn upsert_analysis_score(
        &self,
        campaign_id: Uuid,
        domain_name: &str,
        relevance_score: f64,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO analysis_scores
                     (campaign_id, domain_name, relevance_score, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (campaign_id, domain_name) DO UPDATE SET
                     relevance_score = excluded.relevance_score,
                     updated_at = excluded.updated_at",
                params![
                    campaign_id.to_string(),
                    domain_name,
                    relevance_score,
                    ts(Utc::now()),
                ],
            )?;
            Ok(())
        })
    }

    async fn get_analysis_score(
        &self,
        campaign_id: Uuid,
        domain_name: &str,
    ) -> Result<Option<AnalysisScore>, StoreError> {
        self.with_conn(|conn| {
            let raw: Option<(f64, String)> = conn
                .query_row(
                    "SELECT relevance_score, updated_at FROM analysis_scores
                     WHERE campaign_id = ?1 AND domain_name = ?2",
                    params![campaign_id.to_string(), domain_name],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((relevance_score, updated_at)) = raw else {
                return Ok(None);
            };
            Ok(Some(AnalysisScore {
                campaign_id,
                domain_name: domain_name.to_string(),
                relevance_score,
                updated_at: parse_ts(&updated_at, "updated_at")?,
            }))
        })
    }

    // ── reconciler sweeps ────────────────────────────────────────────

    async fn recover_stuck_tasks(
        &self,
        state: TaskState,
        older_than: DateTime<Utc>,
        max_retries: u32,
        limit: usize,
    ) -> Result<TaskSweep, StoreError> {
        self.with_tx(|tx| {
            let rows: Vec<(i64, i64)> = {
                let mut stmt = tx.prepare(
                    "SELECT id, retry_count FROM domain_extraction_tasks
                     WHERE state = ?1 AND updated_at < ?2
                     ORDER BY updated_at ASC LIMIT ?3",
                )?;
                stmt.query_map(
                    params![state.as_str(), ts(older_than), limit as i64],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?
                .collect::<Result<Vec<_>, _>>()?
            };
            let now = ts(Utc::now());
            let mut sweep = TaskSweep::default();
            for (id, retry_count) in rows {
                sweep.examined += 1;
                if (retry_count as u32) < max_retries {
                    tx.execute(
                        "UPDATE domain_extraction_tasks
                         SET state = 'pending', retry_count = retry_count + 1, updated_at = ?2
                         WHERE id = ?1",
                        params![id, now],
                    )?;
                    sweep.reset += 1;
                } else {
                    tx.execute(
                        "UPDATE domain_extraction_tasks
                         SET state = 'fatal', updated_at = ?2
                         WHERE id = ?1",
                        params![id, now],
                    )?;
                    sweep.fatal += 1;
                }
            }
            Ok(sweep)
        })
    }

    async fn requeue_retryable_errors(
        &self,
        max_retries: u32,
        limit: usize,
    ) -> Result<TaskSweep, StoreError> {
        self.with_tx(|tx| {
            let rows: Vec<i64> = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM domain_extraction_tasks
                     WHERE state = 'error' AND retry_count < ?1
                     ORDER BY updated_at ASC LIMIT ?2",
                )?;
                stmt.query_map(params![max_retries, limit as i64], |row| row.get(0))?
                    .collect::<Result<Vec<_>, _>>()?
            };
            let now = ts(Utc::now());
            let mut sweep = TaskSweep::default();
            for id in rows {
                tx.execute(
                    "UPDATE domain_extraction_tasks
                     SET state = 'pending', retry_count = retry_count + 1, updated_at = ?2
                     WHERE id = ?1",
                    params![id, now],
                )?;
                sweep.examined += 1;
                sweep.reset += 1;
            }
            Ok(sweep)
        })
    }

    async fn requeue_completed_missing_features(
        &self,
        older_than: DateTime<Utc>,
        max_retries: u32,
        limit: usize,
    ) -> Result<TaskSweep, StoreError> {
        self.with_tx(|tx| {
            let rows: Vec<(i64, i64)> = {
                let mut stmt = tx.prepare(
                    "SELECT t.id, t.retry_count FROM domain_extraction_tasks t
                     LEFT JOIN extraction_features f
                       ON f.campaign_id = t.campaign_id AND f.domain_name = t.domain_name
                     WHERE t.state = 'completed' AND t.updated_at < ?1
                       AND f.domain_name IS NULL
                     ORDER BY t.updated_at ASC LIMIT ?2",
                )?;
                stmt.query_map(params![ts(older_than), limit as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?
            };
            let now = ts(Utc::now());
            let mut sweep = TaskSweep::default();
            for (id, retry_count) in rows {
                sweep.examined += 1;
                // Retries exhausted: the task stays completed
                if (retry_count as u32) < max_retries {
                    tx.execute(
                        "UPDATE domain_extraction_tasks
                         SET state = 'pending', retry_count = retry_count + 1, updated_at = ?2
                         WHERE id = ?1",
                        params![id, now],
                    )?;
                    sweep.reset += 1;
                }
            }
            Ok(sweep)
        })
    }

    async fn find_stale_scores(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StaleScore>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT s.campaign_id, s.domain_name, s.updated_at, f.updated_at
                 FROM analysis_scores s
                 JOIN extraction_features f
                   ON f.campaign_id = s.campaign_id AND f.domain_name = s.domain_name
                 WHERE s.updated_at < ?1
                   AND f.status = 'ready'
                   AND f.updated_at > s.updated_at
                 ORDER BY s.updated_at ASC LIMIT ?2",
            )?;
            let raws = stmt
                .query_map(params![ts(older_than), limit as i64], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            raws.into_iter()
                .map(|(campaign_id, domain_name, score_at, feature_at)| {
                    Ok(StaleScore {
                        campaign_id: parse_uuid(&campaign_id)?,
                        domain_name,
                        score_updated_at: parse_ts(&score_at, "updated_at")?,
                        feature_updated_at: parse_ts(&feature_at, "updated_at")?,
                    })
                })
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DnsReason;

    fn seed_domains(n: u64) -> Vec<NewDomain> {
        (0..n)
            .map(|i| NewDomain {
                domain_name: format!("d{}.example", i),
                offset_index: i,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_configure_start_complete_round_trip() {
        let store = SqliteStore::new_in_memory().unwrap();
        let campaign = Uuid::new_v4();
        let phase = PhaseType::DnsValidation;

        store
            .update_phase_configuration(campaign, phase, &serde_json::json!({"batch_size": 50}))
            .await
            .unwrap();
        let row = store.get_campaign_phase(campaign, phase).await.unwrap().unwrap();
        assert_eq!(row.status, PhaseStatus::Configured);
        assert_eq!(row.configuration.unwrap()["batch_size"], 50);

        store.start_phase(campaign, phase).await.unwrap();
        let row = store.get_campaign_phase(campaign, phase).await.unwrap().unwrap();
        assert_eq!(row.status, PhaseStatus::InProgress);
        assert!(row.started_at.is_some());

        store.complete_phase(campaign, phase, 42).await.unwrap();
        let row = store.get_campaign_phase(campaign, phase).await.unwrap().unwrap();
        assert_eq!(row.status, PhaseStatus::Completed);
        assert_eq!(row.progress_percentage, 100.0);
        assert_eq!(row.items_processed, 42);
        assert!(row.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_reconfigure_after_failure_clears_error() {
        let store = SqliteStore::new_in_memory().unwrap();
        let campaign = Uuid::new_v4();
        let phase = PhaseType::Extraction;

        store
            .update_phase_configuration(campaign, phase, &serde_json::json!({}))
            .await
            .unwrap();
        store.start_phase(campaign, phase).await.unwrap();
        store
            .fail_phase(
                campaign,
                phase,
                &ErrorDetails::new("PHASE_CANCELLED", "extraction cancelled", phase),
            )
            .await
            .unwrap();
        let row = store.get_campaign_phase(campaign, phase).await.unwrap().unwrap();
        assert_eq!(row.status, PhaseStatus::Failed);
        assert!(row.failed_at.is_some());
        assert_eq!(row.error_details.as_ref().unwrap().code, "PHASE_CANCELLED");

        store
            .update_phase_configuration(campaign, phase, &serde_json::json!({"retry": true}))
            .await
            .unwrap();
        let row = store.get_campaign_phase(campaign, phase).await.unwrap().unwrap();
        assert_eq!(row.status, PhaseStatus::Configured);
        assert!(row.error_details.is_none());
        assert!(row.failed_at.is_none());
        assert!(row.started_at.is_none());
    }

    #[tokio::test]
    async fn test_insert_generated_domains_is_resumable() {
        let store = SqliteStore::new_in_memory().unwrap();
        let campaign = Uuid::new_v4();

        let inserted = store
            .insert_generated_domains(campaign, &seed_domains(10))
            .await
            .unwrap();
        assert_eq!(inserted, 10);

        // Re-inserting the same offsets is a no-op
        let inserted = store
            .insert_generated_domains(campaign, &seed_domains(10))
            .await
            .unwrap();
        assert_eq!(inserted, 0);

        let counters = store.get_campaign_domain_counters(campaign).await.unwrap();
        assert_eq!(counters.total, 10);
        assert_eq!(counters.dns_pending, 10);
        assert_eq!(counters.http_pending, 10);
        assert!(counters.is_consistent());
    }

    #[tokio::test]
    async fn test_cursor_pagination_orders_by_offset() {
        let store = SqliteStore::new_in_memory().unwrap();
        let campaign = Uuid::new_v4();
        store
            .insert_generated_domains(campaign, &seed_domains(7))
            .await
            .unwrap();

        let page1 = store
            .get_generated_domains_with_cursor(campaign, None, 3)
            .await
            .unwrap();
        assert_eq!(page1.len(), 3);
        assert_eq!(page1[0].offset_index, 0);
        assert_eq!(page1[2].offset_index, 2);

        let page2 = store
            .get_generated_domains_with_cursor(campaign, Some(page1[2].offset_index), 5)
            .await
            .unwrap();
        assert_eq!(page2.len(), 4);
        assert_eq!(page2[0].offset_index, 3);
    }

    #[tokio::test]
    async fn test_dns_batch_counter_delta_is_exact_and_idempotent() {
        let store = SqliteStore::new_in_memory().unwrap();
        let campaign = Uuid::new_v4();
        store
            .insert_generated_domains(campaign, &seed_domains(6))
            .await
            .unwrap();

        let updates = vec![
            DnsUpdate {
                domain_name: "d0.example".into(),
                status: DnsStatus::Ok,
                reason: DnsReason::Ok,
                ips: vec!["1.2.3.4".parse().unwrap()],
            },
            DnsUpdate {
                domain_name: "d1.example".into(),
                status: DnsStatus::Ok,
                reason: DnsReason::Ok,
                ips: vec!["1.2.3.5".parse().unwrap()],
            },
            DnsUpdate {
                domain_name: "d2.example".into(),
                status: DnsStatus::Timeout,
                reason: DnsReason::Timeout,
                ips: vec![],
            },
            DnsUpdate {
                domain_name: "d3.example".into(),
                status: DnsStatus::Error,
                reason: DnsReason::Nxdomain,
                ips: vec![],
            },
            DnsUpdate {
                domain_name: "d4.example".into(),
                status: DnsStatus::Ok,
                reason: DnsReason::Ok,
                ips: vec!["1.2.3.6".parse().unwrap()],
            },
            DnsUpdate {
                domain_name: "d5.example".into(),
                status: DnsStatus::Timeout,
                reason: DnsReason::Timeout,
                ips: vec![],
            },
        ];

        let delta = store
            .update_domains_bulk_dns_status(campaign, &updates)
            .await
            .unwrap();
        assert_eq!(delta.dns_ok, 3);
        assert_eq!(delta.dns_timeout, 2);
        assert_eq!(delta.dns_error, 1);
        assert_eq!(delta.dns_pending, -6);

        let counters = store.get_campaign_domain_counters(campaign).await.unwrap();
        assert_eq!(counters.dns_ok, 3);
        assert_eq!(counters.dns_timeout, 2);
        assert_eq!(counters.dns_error, 1);
        assert_eq!(counters.dns_pending, 0);
        assert!(counters.is_consistent());

        // Reapplying the same batch changes nothing
        let delta = store
            .update_domains_bulk_dns_status(campaign, &updates)
            .await
            .unwrap();
        assert_eq!(delta, DomainCounters::default());
        let counters_after = store.get_campaign_domain_counters(campaign).await.unwrap();
        assert_eq!(counters_after, counters);
    }

    #[tokio::test]
    async fn test_http_batch_updates_row_fields() {
        let store = SqliteStore::new_in_memory().unwrap();
        let campaign = Uuid::new_v4();
        store
            .insert_generated_domains(campaign, &seed_domains(2))
            .await
            .unwrap();

        let updates = vec![HttpUpdate {
            domain_name: "d0.example".into(),
            status: Some(HttpStatus::Ok),
            status_code: Some(200),
            body_hash: Some("abc123".into()),
            latency_ms: Some(120),
            feature_vector: Some(serde_json::json!({"content_bytes": 2048})),
            is_parked: Some(false),
            parked_confidence: Some(0.05),
            fetched_at: Some(Utc::now()),
        }];
        let delta = store
            .update_domains_bulk_http_status(campaign, &updates)
            .await
            .unwrap();
        assert_eq!(delta.http_ok, 1);
        assert_eq!(delta.http_pending, -1);

        let row = store
            .get_generated_domain(campaign, "d0.example")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.http_status, HttpStatus::Ok);
        assert_eq!(row.http_status_code, Some(200));
        assert_eq!(row.body_hash.as_deref(), Some("abc123"));
        assert_eq!(row.latency_ms, Some(120));
        assert!(row.last_http_fetched_at.is_some());
        assert_eq!(row.feature_vector.unwrap()["content_bytes"], 2048);
    }

    #[tokio::test]
    async fn test_aggregate_matches_counters_after_batches() {
        let store = SqliteStore::new_in_memory().unwrap();
        let campaign = Uuid::new_v4();
        store
            .insert_generated_domains(campaign, &seed_domains(4))
            .await
            .unwrap();
        store
            .update_domains_bulk_dns_status(
                campaign,
                &[DnsUpdate {
                    domain_name: "d1.example".into(),
                    status: DnsStatus::Ok,
                    reason: DnsReason::Ok,
                    ips: vec![],
                }],
            )
            .await
            .unwrap();

        let counters = store.get_campaign_domain_counters(campaign).await.unwrap();
        let aggregate = store.aggregate_domain_counters(campaign).await.unwrap();
        assert_eq!(counters, aggregate);
    }

    #[tokio::test]
    async fn test_extraction_task_queue_ordering() {
        let store = SqliteStore::new_in_memory().unwrap();
        let campaign = Uuid::new_v4();
        store
            .enqueue_extraction_tasks(
                campaign,
                &["a.example".into(), "b.example".into(), "c.example".into()],
            )
            .await
            .unwrap();

        let tasks = store
            .list_extraction_tasks(campaign, &[TaskState::Pending], 100)
            .await
            .unwrap();
        assert_eq!(tasks.len(), 3);

        // Failing one task bumps its retry_count, pushing it to the back
        store
            .record_extraction_task_error(tasks[0].id, "fetch failed")
            .await
            .unwrap();
        let tasks = store
            .list_extraction_tasks(campaign, &[TaskState::Pending, TaskState::Error], 100)
            .await
            .unwrap();
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[2].domain_name, "a.example");
        assert_eq!(tasks[2].retry_count, 1);
        assert_eq!(tasks[2].state, TaskState::Error);
    }

    #[tokio::test]
    async fn test_recover_stuck_tasks_respects_max_retries() {
        let store = SqliteStore::new_in_memory().unwrap();
        let campaign = Uuid::new_v4();
        store
            .enqueue_extraction_tasks(campaign, &["a.example".into(), "b.example".into()])
            .await
            .unwrap();
        let tasks = store
            .list_extraction_tasks(campaign, &[TaskState::Pending], 10)
            .await
            .unwrap();
        store
            .mark_extraction_task(tasks[0].id, TaskState::Running)
            .await
            .unwrap();
        store
            .mark_extraction_task(tasks[1].id, TaskState::Running)
            .await
            .unwrap();
        // Exhaust retries on the second task
        for _ in 0..3 {
            store
                .record_extraction_task_error(tasks[1].id, "boom")
                .await
                .unwrap();
        }
        store
            .mark_extraction_task(tasks[1].id, TaskState::Running)
            .await
            .unwrap();

        let future = Utc::now() + chrono::Duration::hours(1);
        let sweep = store
            .recover_stuck_tasks(TaskState::Running, future, 3, 500)
            .await
            .unwrap();
        assert_eq!(sweep.examined, 2);
        assert_eq!(sweep.reset, 1);
        assert_eq!(sweep.fatal, 1);

        let pending = store
            .list_extraction_tasks(campaign, &[TaskState::Pending], 10)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].domain_name, "a.example");
        assert_eq!(pending[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_missing_features_requeue_leaves_exhausted_completed() {
        let store = SqliteStore::new_in_memory().unwrap();
        let campaign = Uuid::new_v4();
        store
            .enqueue_extraction_tasks(campaign, &["a.example".into(), "b.example".into()])
            .await
            .unwrap();
        let tasks = store
            .list_extraction_tasks(campaign, &[TaskState::Pending], 10)
            .await
            .unwrap();
        // a: completed with features, b: completed without
        store
            .mark_extraction_task(tasks[0].id, TaskState::Completed)
            .await
            .unwrap();
        store
            .upsert_extraction_features(
                campaign,
                "a.example",
                &serde_json::json!({"kw_unique": 2}),
                "ready",
            )
            .await
            .unwrap();
        for _ in 0..3 {
            store
                .record_extraction_task_error(tasks[1].id, "flaky")
                .await
                .unwrap();
        }
        store
            .mark_extraction_task(tasks[1].id, TaskState::Completed)
            .await
            .unwrap();

        let future = Utc::now() + chrono::Duration::hours(1);
        let sweep = store
            .requeue_completed_missing_features(future, 3, 500)
            .await
            .unwrap();
        assert_eq!(sweep.examined, 1);
        assert_eq!(sweep.reset, 0);
        assert_eq!(sweep.fatal, 0);

        // b stays completed: retries exhausted, never fatal
        let all = store
            .list_extraction_tasks(campaign, &[TaskState::Completed], 10)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_find_stale_scores_requires_newer_ready_feature() {
        let store = SqliteStore::new_in_memory().unwrap();
        let campaign = Uuid::new_v4();

        // Score first, feature second: feature is newer, score is stale
        store
            .upsert_analysis_score(campaign, "stale.example", 0.4)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store
            .upsert_extraction_features(
                campaign,
                "stale.example",
                &serde_json::json!({"kw_unique": 1}),
                "ready",
            )
            .await
            .unwrap();

        // Feature first, score second: score is fresh
        store
            .upsert_extraction_features(
                campaign,
                "fresh.example",
                &serde_json::json!({"kw_unique": 1}),
                "ready",
            )
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store
            .upsert_analysis_score(campaign, "fresh.example", 0.6)
            .await
            .unwrap();

        // Newer feature but not ready: not reported
        store
            .upsert_analysis_score(campaign, "pending.example", 0.2)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store
            .upsert_extraction_features(
                campaign,
                "pending.example",
                &serde_json::json!({}),
                "pending",
            )
            .await
            .unwrap();

        let cutoff = Utc::now() + chrono::Duration::hours(1);
        let stale = store.find_stale_scores(cutoff, 1000).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].domain_name, "stale.example");
        assert!(stale[0].feature_updated_at > stale[0].score_updated_at);
    }

    #[tokio::test]
    async fn test_lead_status_update() {
        let store = SqliteStore::new_in_memory().unwrap();
        let campaign = Uuid::new_v4();
        store
            .insert_generated_domains(campaign, &seed_domains(1))
            .await
            .unwrap();

        store
            .update_domain_lead_status(campaign, "d0.example", LeadStatus::Match, Some(0.8), "qualified")
            .await
            .unwrap();
        let row = store
            .get_generated_domain(campaign, "d0.example")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.lead_status, LeadStatus::Match);
        assert_eq!(row.lead_score, Some(0.8));
    }
}
