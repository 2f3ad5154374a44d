//! The aggregate status composer.
//!
//! One rule, applied everywhere: the database dominates for terminal
//! states, memory dominates for live progress. A task may still be
//! unwinding after termination; its in-memory view must never contradict
//! the durable outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{
    CampaignPhase, ErrorDetails, PhaseExecutionSnapshot, PhaseStatus, PhaseType,
};

/// The composed status a phase service returns from `status()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseStatusReport {
    pub phase: PhaseType,
    pub status: PhaseStatus,
    pub progress_pct: f64,
    pub items_total: u64,
    pub items_processed: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub error_details: Option<ErrorDetails>,
}

impl PhaseStatusReport {
    fn not_started(phase: PhaseType) -> Self {
        Self {
            phase,
            status: PhaseStatus::NotStarted,
            progress_pct: 0.0,
            items_total: 0,
            items_processed: 0,
            started_at: None,
            completed_at: None,
            last_error: None,
            error_details: None,
        }
    }

    fn from_row(row: &CampaignPhase) -> Self {
        let progress_pct = if row.status == PhaseStatus::Completed {
            100.0
        } else {
            row.progress_percentage
        };
        Self {
            phase: row.phase_type,
            status: row.status,
            progress_pct,
            items_total: row.items_total,
            items_processed: row.items_processed,
            started_at: row.started_at,
            completed_at: row.completed_at,
            last_error: row.error_details.as_ref().map(|d| d.message.clone()),
            error_details: row.error_details.clone(),
        }
    }

    fn from_execution(exec: &PhaseExecutionSnapshot, row: Option<&CampaignPhase>) -> Self {
        Self {
            phase: exec.phase,
            status: exec.status,
            progress_pct: exec.progress_pct,
            items_total: exec.items_total,
            items_processed: exec.items_processed,
            started_at: exec.started_at,
            completed_at: exec.completed_at,
            last_error: exec.last_error.clone(),
            error_details: row.and_then(|r| r.error_details.clone()),
        }
    }
}

/// Compose one phase's status from its durable row and in-memory execution.
///
/// 1. A terminal row wins outright; in-memory state is ignored.
/// 2. A live (non-`NotStarted`) execution wins next.
/// 3. Then the row as persisted, then `NotStarted`.
pub fn compose_phase_status(
    phase: PhaseType,
    row: Option<&CampaignPhase>,
    exec: Option<&PhaseExecutionSnapshot>,
) -> PhaseStatusReport {
    if let Some(row) = row {
        if row.status.is_terminal() {
            return PhaseStatusReport::from_row(row);
        }
    }
    if let Some(exec) = exec {
        if exec.status != PhaseStatus::NotStarted {
            return PhaseStatusReport::from_execution(exec, row);
        }
    }
    match row {
        Some(row) => PhaseStatusReport::from_row(row),
        None => PhaseStatusReport::not_started(phase),
    }
}

/// Campaign-level aggregate across all six phases, in pipeline order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignStatus {
    pub campaign_id: Uuid,
    pub phases: Vec<PhaseStatusReport>,
    /// Equally-weighted mean of per-phase percentages.
    pub overall_pct: f64,
    pub as_of: DateTime<Utc>,
}

/// Per-phase contribution to the overall percentage.
fn phase_contribution(report: &PhaseStatusReport) -> f64 {
    match report.status {
        PhaseStatus::Completed => 100.0,
        PhaseStatus::NotStarted | PhaseStatus::Configured => 0.0,
        PhaseStatus::InProgress | PhaseStatus::Paused | PhaseStatus::Failed => report.progress_pct,
    }
}

pub fn compose_campaign_status(
    campaign_id: Uuid,
    phases: Vec<PhaseStatusReport>,
) -> CampaignStatus {
    let overall_pct = if phases.is_empty() {
        0.0
    } else {
        let sum: f64 = phases.iter().map(phase_contribution).sum();
        (sum / phases.len() as f64 * 10.0).round() / 10.0
    };
    CampaignStatus {
        campaign_id,
        phases,
        overall_pct,
        as_of: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(status: PhaseStatus, pct: f64) -> CampaignPhase {
        CampaignPhase {
            campaign_id: Uuid::nil(),
            phase_type: PhaseType::DnsValidation,
            phase_order: 2,
            status,
            progress_percentage: pct,
            items_total: 100,
            items_processed: (pct as u64).min(100),
            started_at: Some(Utc::now()),
            completed_at: None,
            failed_at: None,
            error_details: None,
            configuration: None,
        }
    }

    fn exec(status: PhaseStatus, pct: f64) -> PhaseExecutionSnapshot {
        PhaseExecutionSnapshot {
            campaign_id: Uuid::nil(),
            phase: PhaseType::DnsValidation,
            run_id: Uuid::new_v4(),
            status,
            items_total: 100,
            items_processed: (pct as u64).min(100),
            progress_pct: pct,
            last_error: None,
            started_at: Some(Utc::now()),
            completed_at: None,
        }
    }

    #[test]
    fn test_terminal_row_dominates_live_execution() {
        // The run terminated durably; a still-unwinding task reports
        // InProgress. The durable outcome must win.
        let mut failed_row = row(PhaseStatus::Failed, 40.0);
        failed_row.error_details = Some(ErrorDetails::new(
            "PHASE_CANCELLED",
            "dns_validation cancelled",
            PhaseType::DnsValidation,
        ));
        let live = exec(PhaseStatus::InProgress, 60.0);

        let report =
            compose_phase_status(PhaseType::DnsValidation, Some(&failed_row), Some(&live));
        assert_eq!(report.status, PhaseStatus::Failed);
        assert_eq!(report.progress_pct, 40.0);
        assert_eq!(report.last_error.as_deref(), Some("dns_validation cancelled"));
    }

    #[test]
    fn test_completed_row_forces_full_percentage() {
        let completed = row(PhaseStatus::Completed, 97.3);
        let report = compose_phase_status(PhaseType::DnsValidation, Some(&completed), None);
        assert_eq!(report.status, PhaseStatus::Completed);
        assert_eq!(report.progress_pct, 100.0);
    }

    #[test]
    fn test_live_execution_dominates_non_terminal_row() {
        let configured = row(PhaseStatus::Configured, 0.0);
        let live = exec(PhaseStatus::InProgress, 35.5);
        let report =
            compose_phase_status(PhaseType::DnsValidation, Some(&configured), Some(&live));
        assert_eq!(report.status, PhaseStatus::InProgress);
        assert_eq!(report.progress_pct, 35.5);
    }

    #[test]
    fn test_not_started_execution_falls_back_to_row() {
        let configured = row(PhaseStatus::Configured, 0.0);
        let idle = exec(PhaseStatus::NotStarted, 0.0);
        let report =
            compose_phase_status(PhaseType::DnsValidation, Some(&configured), Some(&idle));
        assert_eq!(report.status, PhaseStatus::Configured);
    }

    #[test]
    fn test_no_sources_means_not_started() {
        let report = compose_phase_status(PhaseType::Enrichment, None, None);
        assert_eq!(report.status, PhaseStatus::NotStarted);
        assert_eq!(report.progress_pct, 0.0);
    }

    #[test]
    fn test_campaign_aggregate_is_equally_weighted() {
        let reports = vec![
            // Completed counts 100 regardless of recorded pct
            PhaseStatusReport {
                progress_pct: 97.0,
                ..PhaseStatusReport::from_row(&row(PhaseStatus::Completed, 97.0))
            },
            PhaseStatusReport::from_row(&row(PhaseStatus::InProgress, 50.0)),
            PhaseStatusReport::from_row(&row(PhaseStatus::Configured, 0.0)),
            PhaseStatusReport::not_started(PhaseType::Extraction),
            PhaseStatusReport::not_started(PhaseType::Analysis),
            PhaseStatusReport::not_started(PhaseType::Enrichment),
        ];
        let status = compose_campaign_status(Uuid::nil(), reports);
        // (100 + 50 + 0 + 0 + 0 + 0) / 6 = 25.0
        assert_eq!(status.overall_pct, 25.0);
        assert_eq!(status.phases.len(), 6);
    }

    #[test]
    fn test_campaign_aggregate_empty_is_zero() {
        let status = compose_campaign_status(Uuid::nil(), vec![]);
        assert_eq!(status.overall_pct, 0.0);
    }
}
