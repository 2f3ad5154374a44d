//! In-memory run state for live phase executions.
//!
//! Each phase service owns one `ExecutionRegistry`; each live run is an
//! `ExecutionHandle` holding the run id, the cancellation token, the pause
//! gate, the control channel pair, and the progress sender. The handle
//! outlives its task so the status composer can still read the last
//! snapshot while the task unwinds; the durable row stays the record of
//! record.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
    ControlCommand, PhaseProgress, PhaseRunContext, CONTROL_CHANNEL_CAPACITY,
    PROGRESS_CHANNEL_CAPACITY,
};
use crate::errors::PhaseError;
use crate::model::{progress_pct, PhaseExecutionSnapshot, PhaseStatus, PhaseType};

/// Pause gate shared between the control watcher and the execution task.
///
/// A `watch` channel over a paused flag: setters broadcast on change,
/// waiters select the change stream against the cancellation token, which is
/// how a Stop unblocks a paused worker.
#[derive(Debug)]
pub struct PauseGate {
    tx: watch::Sender<bool>,
}

impl PauseGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn pause(&self) {
        let _ = self.tx.send(true);
    }

    pub fn resume(&self) {
        let _ = self.tx.send(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }

    /// Block until unpaused. Returns `false` if the token fired while
    /// waiting, in which case the caller must observe cancellation instead
    /// of resuming work.
    pub async fn wait_until_resumed(&self, cancel: &CancellationToken) -> bool {
        let mut rx = self.tx.subscribe();
        loop {
            if !*rx.borrow_and_update() {
                return true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return true;
                    }
                }
            }
        }
    }
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct ExecState {
    run_id: Uuid,
    status: PhaseStatus,
    items_total: u64,
    items_processed: u64,
    last_error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

/// One live (or just-terminated) execution of one phase for one campaign.
#[derive(Debug)]
pub struct ExecutionHandle {
    campaign_id: Uuid,
    phase: PhaseType,
    cancel: CancellationToken,
    pause: PauseGate,
    stop_requested: AtomicBool,
    control_tx: mpsc::Sender<ControlCommand>,
    control_rx: Mutex<Option<mpsc::Receiver<ControlCommand>>>,
    progress_tx: Mutex<Option<mpsc::Sender<PhaseProgress>>>,
    state: Mutex<ExecState>,
}

impl ExecutionHandle {
    fn new(campaign_id: Uuid, phase: PhaseType) -> (Arc<Self>, mpsc::Receiver<PhaseProgress>) {
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let (progress_tx, progress_rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
        let handle = Arc::new(Self {
            campaign_id,
            phase,
            cancel: CancellationToken::new(),
            pause: PauseGate::new(),
            stop_requested: AtomicBool::new(false),
            control_tx,
            control_rx: Mutex::new(Some(control_rx)),
            progress_tx: Mutex::new(Some(progress_tx)),
            state: Mutex::new(ExecState {
                run_id: Uuid::new_v4(),
                status: PhaseStatus::InProgress,
                items_total: 0,
                items_processed: 0,
                last_error: None,
                started_at: Some(Utc::now()),
                completed_at: None,
            }),
        });
        (handle, progress_rx)
    }

    pub fn campaign_id(&self) -> Uuid {
        self.campaign_id
    }

    pub fn phase(&self) -> PhaseType {
        self.phase
    }

    pub fn run_id(&self) -> Uuid {
        self.state.lock().unwrap().run_id
    }

    /// The (campaign, phase, run) triple for this execution.
    pub fn run_context(&self) -> PhaseRunContext {
        PhaseRunContext {
            campaign_id: self.campaign_id,
            phase: self.phase,
            run_id: self.run_id(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn pause_gate(&self) -> &PauseGate {
        &self.pause
    }

    pub fn control_sender(&self) -> mpsc::Sender<ControlCommand> {
        self.control_tx.clone()
    }

    /// Hand the control receiver to the execution task. Yields `None` on a
    /// second call; there is exactly one consumer.
    pub fn take_control_receiver(&self) -> Option<mpsc::Receiver<ControlCommand>> {
        self.control_rx.lock().unwrap().take()
    }

    /// The run-id guard. Mutating helpers call this first; a mismatch means
    /// a newer run (or a cancel) took over and the caller must terminate
    /// without further writes.
    pub fn guard(&self, run: &PhaseRunContext) -> Result<(), PhaseError> {
        let mut state = self.state.lock().unwrap();
        if state.run_id != run.run_id {
            state.last_error = Some(PhaseError::StaleExecution.to_string());
            return Err(PhaseError::StaleExecution);
        }
        Ok(())
    }

    /// Rotate the run id so any task still carrying the old one fails its
    /// next guard check. Called on cancel and when the slot is recycled.
    pub fn invalidate_run(&self) {
        self.state.lock().unwrap().run_id = Uuid::new_v4();
    }

    pub fn status(&self) -> PhaseStatus {
        self.state.lock().unwrap().status
    }

    pub fn set_status(&self, status: PhaseStatus) {
        self.state.lock().unwrap().status = status;
    }

    pub fn record_progress(&self, items_processed: u64, items_total: u64) {
        let mut state = self.state.lock().unwrap();
        state.items_processed = items_processed;
        state.items_total = items_total;
    }

    pub fn set_last_error(&self, message: impl Into<String>) {
        self.state.lock().unwrap().last_error = Some(message.into());
    }

    /// Terminal transition of the in-memory row.
    pub fn mark_terminal(&self, status: PhaseStatus, error: Option<String>) {
        let mut state = self.state.lock().unwrap();
        state.status = status;
        state.completed_at = Some(Utc::now());
        if let Some(error) = error {
            state.last_error = Some(error);
        }
        if status == PhaseStatus::Completed {
            state.items_processed = state.items_total;
        }
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        // Wake any pause waiter so it can observe the stop
        self.pause.resume();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Lossy in-memory progress send: drops the update when the consumer
    /// has fallen behind. Durable status remains recoverable from storage.
    pub fn try_send_progress(&self, progress: PhaseProgress) {
        let tx = self.progress_tx.lock().unwrap();
        let Some(tx) = tx.as_ref() else {
            return;
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(progress) {
            tracing::debug!(
                campaign_id = %self.campaign_id,
                phase = %self.phase,
                "progress channel full, dropping update"
            );
        }
    }

    /// Drop the progress sender so the consumer's stream closes once it
    /// drains what was delivered.
    pub fn close_progress(&self) {
        self.progress_tx.lock().unwrap().take();
    }

    pub fn snapshot(&self) -> PhaseExecutionSnapshot {
        let state = self.state.lock().unwrap();
        PhaseExecutionSnapshot {
            campaign_id: self.campaign_id,
            phase: self.phase,
            run_id: state.run_id,
            status: state.status,
            items_total: state.items_total,
            items_processed: state.items_processed,
            progress_pct: progress_pct(state.items_processed, state.items_total),
            last_error: state.last_error.clone(),
            started_at: state.started_at,
            completed_at: state.completed_at,
        }
    }
}

/// Live executions for one phase service, keyed by campaign id.
///
/// The lock is never held across an await point; handles are cheap to clone
/// out. Terminated handles stay registered until the next `begin` replaces
/// them, so status reads can still see the final in-memory state.
pub struct ExecutionRegistry {
    inner: RwLock<HashMap<Uuid, Arc<ExecutionHandle>>>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Begin a new execution, minting a fresh run id. Fails with the busy
    /// error when a non-terminal execution for the campaign is still
    /// registered.
    pub fn begin(
        &self,
        campaign_id: Uuid,
        phase: PhaseType,
    ) -> Result<(Arc<ExecutionHandle>, mpsc::Receiver<PhaseProgress>), PhaseError> {
        let mut inner = self.inner.write().unwrap();
        if let Some(existing) = inner.get(&campaign_id) {
            if !existing.is_terminal() {
                return Err(PhaseError::AlreadyRunning { phase, campaign_id });
            }
            // A replaced slot must not accept writes from its old task
            existing.invalidate_run();
        }
        let (handle, progress_rx) = ExecutionHandle::new(campaign_id, phase);
        inner.insert(campaign_id, Arc::clone(&handle));
        Ok((handle, progress_rx))
    }

    pub fn get(&self, campaign_id: Uuid) -> Option<Arc<ExecutionHandle>> {
        self.inner.read().unwrap().get(&campaign_id).cloned()
    }

    /// Drop the registered handle, resetting the run-id slot. Used by
    /// reconfigure so a later `begin` cannot collide with a stale run.
    pub fn clear(&self, campaign_id: Uuid) {
        if let Some(handle) = self.inner.write().unwrap().remove(&campaign_id) {
            handle.invalidate_run();
        }
    }
}

impl Default for ExecutionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_begin_rejects_second_live_execution() {
        let registry = ExecutionRegistry::new();
        let campaign = Uuid::new_v4();
        let (_handle, _rx) = registry
            .begin(campaign, PhaseType::DnsValidation)
            .unwrap();

        let err = registry
            .begin(campaign, PhaseType::DnsValidation)
            .unwrap_err();
        assert_eq!(err.code(), "PHASE_ALREADY_RUNNING");
    }

    #[test]
    fn test_begin_replaces_terminal_execution_with_fresh_run_id() {
        let registry = ExecutionRegistry::new();
        let campaign = Uuid::new_v4();
        let (first, _rx1) = registry.begin(campaign, PhaseType::Extraction).unwrap();
        let first_run = first.run_context();
        first.mark_terminal(PhaseStatus::Failed, Some("extraction cancelled".into()));

        let (second, _rx2) = registry.begin(campaign, PhaseType::Extraction).unwrap();
        assert_ne!(second.run_id(), first_run.run_id);
        assert_eq!(registry.get(campaign).unwrap().run_id(), second.run_id());

        // The replaced slot refuses writes from the old task
        assert!(matches!(
            first.guard(&first_run),
            Err(PhaseError::StaleExecution)
        ));
    }

    #[test]
    fn test_clear_invalidates_the_removed_slot() {
        let registry = ExecutionRegistry::new();
        let campaign = Uuid::new_v4();
        let (handle, _rx) = registry.begin(campaign, PhaseType::Analysis).unwrap();
        let run = handle.run_context();
        handle.mark_terminal(PhaseStatus::Failed, None);

        registry.clear(campaign);
        assert!(registry.get(campaign).is_none());
        assert!(matches!(handle.guard(&run), Err(PhaseError::StaleExecution)));
    }

    #[test]
    fn test_run_id_guard_blocks_stale_context() {
        let registry = ExecutionRegistry::new();
        let campaign = Uuid::new_v4();
        let (handle, _rx) = registry.begin(campaign, PhaseType::Enrichment).unwrap();

        let live = handle.run_context();
        assert!(handle.guard(&live).is_ok());

        let stale = PhaseRunContext {
            run_id: Uuid::new_v4(),
            ..live
        };
        let err = handle.guard(&stale).unwrap_err();
        assert!(matches!(err, PhaseError::StaleExecution));
        assert_eq!(
            handle.snapshot().last_error.as_deref(),
            Some("stale execution context")
        );
    }

    #[test]
    fn test_mark_terminal_completed_snaps_processed_to_total() {
        let registry = ExecutionRegistry::new();
        let (handle, _rx) = registry
            .begin(Uuid::new_v4(), PhaseType::DomainGeneration)
            .unwrap();
        handle.record_progress(7, 10);
        handle.mark_terminal(PhaseStatus::Completed, None);

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.status, PhaseStatus::Completed);
        assert_eq!(snapshot.items_processed, 10);
        assert_eq!(snapshot.progress_pct, 100.0);
        assert!(snapshot.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_pause_gate_blocks_until_resume() {
        let gate = Arc::new(PauseGate::new());
        let cancel = CancellationToken::new();
        gate.pause();
        assert!(gate.is_paused());

        let gate_clone = Arc::clone(&gate);
        let cancel_clone = cancel.clone();
        let waiter =
            tokio::spawn(async move { gate_clone.wait_until_resumed(&cancel_clone).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        gate.resume();
        let resumed = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(resumed);
    }

    #[tokio::test]
    async fn test_stop_unblocks_pause_waiter() {
        let registry = ExecutionRegistry::new();
        let (handle, _rx) = registry
            .begin(Uuid::new_v4(), PhaseType::Extraction)
            .unwrap();
        handle.pause_gate().pause();

        let handle_clone = Arc::clone(&handle);
        let waiter = tokio::spawn(async move {
            let cancel = handle_clone.cancel_token();
            handle_clone.pause_gate().wait_until_resumed(&cancel).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.request_stop();

        let outcome = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        // Either path is a wake-up; stop_requested tells the worker why
        assert!(handle.stop_requested());
        assert!(handle.cancel_token().is_cancelled());
        let _ = outcome;
    }

    #[test]
    fn test_lossy_progress_drops_when_full() {
        let registry = ExecutionRegistry::new();
        let (handle, mut rx) = registry
            .begin(Uuid::new_v4(), PhaseType::DnsValidation)
            .unwrap();

        // Overfill the channel; sends beyond capacity must not block or panic
        for i in 0..(PROGRESS_CHANNEL_CAPACITY + 16) {
            handle.try_send_progress(PhaseProgress {
                campaign_id: handle.campaign_id(),
                phase: handle.phase(),
                status: PhaseStatus::InProgress,
                progress_pct: 0.0,
                items_total: 100,
                items_processed: i as u64,
                message: String::new(),
                error: None,
                timestamp: Utc::now(),
            });
        }

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, PROGRESS_CHANNEL_CAPACITY);
    }

    #[test]
    fn test_take_control_receiver_is_single_consumer() {
        let registry = ExecutionRegistry::new();
        let (handle, _rx) = registry
            .begin(Uuid::new_v4(), PhaseType::Analysis)
            .unwrap();
        assert!(handle.take_control_receiver().is_some());
        assert!(handle.take_control_receiver().is_none());
    }
}
