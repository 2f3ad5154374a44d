//! Shared execution scaffold for the phase services.
//!
//! Every phase variant runs through the same lifecycle: check the durable
//! row, claim the campaign's execution slot, mint a run id, spawn the work
//! task, and write exactly one terminal transition when it finishes. The
//! per-phase work loop is the only thing that differs, so it comes in as a
//! closure over `RunCtx`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::errors::PhaseError;
use crate::events::{EventBus, StatusChange};
use crate::model::{ErrorDetails, PhaseStatus, PhaseType};
use crate::phase::control::ControlDispatcher;
use crate::phase::execution::{ExecutionHandle, ExecutionRegistry};
use crate::phase::progress::ProgressEmitter;
use crate::phase::status::{compose_phase_status, PhaseStatusReport};
use crate::phase::{ControlCommand, ControlSignal, PhaseProgress, PhaseRunContext};
use crate::store::CampaignStore;

/// Applied when the caller supplies no deadline of its own.
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(3600);

/// Everything a phase work loop needs: the run context, the guard, the
/// progress emitter, and the control-drain checkpoint.
pub struct RunCtx {
    pub run: PhaseRunContext,
    pub handle: Arc<ExecutionHandle>,
    pub store: Arc<dyn CampaignStore>,
    pub bus: Arc<dyn EventBus>,
    emitter: ProgressEmitter,
    control_rx: mpsc::Receiver<ControlCommand>,
    cancel: CancellationToken,
}

impl RunCtx {
    pub fn campaign_id(&self) -> Uuid {
        self.run.campaign_id
    }

    pub fn phase(&self) -> PhaseType {
        self.run.phase
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The run-id guard for this task's context.
    pub fn guard(&self) -> Result<(), PhaseError> {
        self.handle.guard(&self.run)
    }

    /// Emit progress through both sinks (guarded).
    pub async fn emit(
        &self,
        items_processed: u64,
        items_total: u64,
        message: &str,
    ) -> Result<(), PhaseError> {
        self.emitter
            .emit(&self.run, items_processed, items_total, message)
            .await
    }

    /// A safe preemption point: drain pending control commands, park while
    /// paused, and surface stop/cancel as the distinguishing errors.
    pub async fn checkpoint(&mut self) -> Result<(), PhaseError> {
        loop {
            while let Ok(command) = self.control_rx.try_recv() {
                self.apply_control(command).await;
            }
            if self.handle.stop_requested() {
                return Err(PhaseError::Stopped(self.run.phase));
            }
            if self.cancel.is_cancelled() {
                return Err(PhaseError::Cancelled(self.run.phase));
            }
            if !self.handle.pause_gate().is_paused() {
                return Ok(());
            }

            // Paused: wait for the next command, an external gate flip, or
            // cancellation, then re-evaluate from the top.
            tokio::select! {
                _ = self.cancel.cancelled() => {}
                command = self.control_rx.recv() => {
                    if let Some(command) = command {
                        self.apply_control(command).await;
                    } else {
                        let _ = self
                            .handle
                            .pause_gate()
                            .wait_until_resumed(&self.cancel)
                            .await;
                    }
                }
                _ = self.handle.pause_gate().wait_until_resumed(&self.cancel) => {}
            }
        }
    }

    /// Handle one control command. Pause/resume persistence is best-effort;
    /// the in-memory state is authoritative for the live run. Acks fire
    /// exactly once per command.
    async fn apply_control(&self, mut command: ControlCommand) {
        let campaign_id = self.run.campaign_id;
        let phase = self.run.phase;
        match command.signal {
            ControlSignal::Pause => {
                if !self.handle.pause_gate().is_paused() {
                    self.handle.pause_gate().pause();
                    self.handle.set_status(PhaseStatus::Paused);
                    if let Err(err) = self.store.pause_phase(campaign_id, phase).await {
                        tracing::warn!(%campaign_id, %phase, error = %err, "pause persist failed");
                    }
                    self.bus
                        .publish_status_change(&StatusChange::new(
                            campaign_id,
                            phase,
                            PhaseStatus::Paused,
                        ))
                        .await;
                }
                command.acknowledge(Ok(()));
            }
            ControlSignal::Resume => {
                if self.handle.pause_gate().is_paused() {
                    self.handle.pause_gate().resume();
                    self.handle.set_status(PhaseStatus::InProgress);
                    if let Err(err) = self.store.resume_phase(campaign_id, phase).await {
                        tracing::warn!(%campaign_id, %phase, error = %err, "resume persist failed");
                    }
                    self.bus
                        .publish_status_change(&StatusChange::new(
                            campaign_id,
                            phase,
                            PhaseStatus::InProgress,
                        ))
                        .await;
                }
                command.acknowledge(Ok(()));
            }
            ControlSignal::Stop => {
                self.handle.request_stop();
                command.acknowledge(Ok(()));
            }
        }
    }
}

/// The per-service runtime: registry, control dispatcher, and the execute
/// scaffold. One instance per phase service.
pub struct PhaseRuntime {
    phase: PhaseType,
    store: Arc<dyn CampaignStore>,
    bus: Arc<dyn EventBus>,
    registry: Arc<ExecutionRegistry>,
    dispatcher: ControlDispatcher,
    execution_timeout: Duration,
}

impl PhaseRuntime {
    pub fn new(phase: PhaseType, store: Arc<dyn CampaignStore>, bus: Arc<dyn EventBus>) -> Self {
        let registry = Arc::new(ExecutionRegistry::new());
        let dispatcher = ControlDispatcher::new(phase, Arc::clone(&registry));
        Self {
            phase,
            store,
            bus,
            registry,
            dispatcher,
            execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
        }
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn phase(&self) -> PhaseType {
        self.phase
    }

    pub fn store(&self) -> &Arc<dyn CampaignStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ExecutionRegistry> {
        &self.registry
    }

    pub fn attach_control(&self, campaign_id: Uuid, commands: mpsc::Receiver<ControlCommand>) {
        self.dispatcher.attach(campaign_id, commands);
    }

    /// Persist a `Configured` row and reset the campaign's run slot.
    /// Rejected while an execution is live; allowed from any settled state
    /// (including terminal ones, which is the reconfigure-to-retry path).
    pub async fn configure_slot(
        &self,
        campaign_id: Uuid,
        config: &serde_json::Value,
    ) -> Result<(), PhaseError> {
        if let Some(handle) = self.registry.get(campaign_id) {
            if !handle.is_terminal() {
                return Err(PhaseError::AlreadyRunning {
                    phase: self.phase,
                    campaign_id,
                });
            }
        }
        self.store
            .update_phase_configuration(campaign_id, self.phase, config)
            .await?;
        self.registry.clear(campaign_id);
        self.bus
            .publish_status_change(&StatusChange::new(
                campaign_id,
                self.phase,
                PhaseStatus::Configured,
            ))
            .await;
        Ok(())
    }

    /// Start an execution: claim the slot, persist `InProgress`, spawn the
    /// work task, and hand back the progress stream.
    pub async fn launch<F, Fut>(
        &self,
        campaign_id: Uuid,
        work: F,
    ) -> Result<mpsc::Receiver<PhaseProgress>, PhaseError>
    where
        F: FnOnce(RunCtx) -> Fut + Send + 'static,
        Fut: Future<Output = Result<u64, PhaseError>> + Send + 'static,
    {
        let row = self
            .store
            .get_campaign_phase(campaign_id, self.phase)
            .await?
            .ok_or(PhaseError::NotConfigured {
                phase: self.phase,
                campaign_id,
            })?;
        match row.status {
            PhaseStatus::Configured | PhaseStatus::InProgress | PhaseStatus::Paused => {}
            // Terminal rows must go through reconfigure first
            PhaseStatus::NotStarted | PhaseStatus::Completed | PhaseStatus::Failed => {
                return Err(PhaseError::NotConfigured {
                    phase: self.phase,
                    campaign_id,
                });
            }
        }

        let (handle, progress_rx) = self.registry.begin(campaign_id, self.phase)?;
        if let Err(err) = self.store.start_phase(campaign_id, self.phase).await {
            // Release the slot so the campaign is not stuck busy
            handle.mark_terminal(PhaseStatus::Failed, Some(err.to_string()));
            handle.close_progress();
            return Err(err.into());
        }
        self.bus
            .publish_status_change(&StatusChange::new(
                campaign_id,
                self.phase,
                PhaseStatus::InProgress,
            ))
            .await;

        let run = handle.run_context();
        let control_rx = handle
            .take_control_receiver()
            .expect("fresh execution handle always has its control receiver");
        let ctx = RunCtx {
            run,
            handle: Arc::clone(&handle),
            store: Arc::clone(&self.store),
            bus: Arc::clone(&self.bus),
            emitter: ProgressEmitter::new(
                Arc::clone(&handle),
                Arc::clone(&self.store),
                Arc::clone(&self.bus),
            ),
            control_rx,
            cancel: handle.cancel_token(),
        };

        let store = Arc::clone(&self.store);
        let bus = Arc::clone(&self.bus);
        let phase = self.phase;
        let timeout = self.execution_timeout;
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, work(ctx)).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(%campaign_id, %phase, "execution deadline exceeded");
                    handle.cancel_token().cancel();
                    Err(PhaseError::Cancelled(phase))
                }
            };
            finalize(run, handle, store, bus, result).await;
        });

        Ok(progress_rx)
    }

    /// Composed status per the terminal-dominance rule.
    pub async fn status(&self, campaign_id: Uuid) -> Result<PhaseStatusReport, PhaseError> {
        let row = self
            .store
            .get_campaign_phase(campaign_id, self.phase)
            .await?;
        let exec = self.registry.get(campaign_id).map(|h| h.snapshot());
        Ok(compose_phase_status(self.phase, row.as_ref(), exec.as_ref()))
    }

    /// Cancel the live run: invalidate its run id (suppressing any late
    /// writes from the task), persist `Failed` with the cancelled message,
    /// and close the progress stream. No-op without a live run.
    pub async fn cancel(&self, campaign_id: Uuid) -> Result<(), PhaseError> {
        let Some(handle) = self.registry.get(campaign_id) else {
            return Ok(());
        };
        if handle.is_terminal() {
            return Ok(());
        }

        handle.invalidate_run();
        handle.request_stop();

        let message = PhaseError::Cancelled(self.phase).to_string();
        let details = ErrorDetails::new("PHASE_CANCELLED", message.clone(), self.phase);
        self.store
            .fail_phase(campaign_id, self.phase, &details)
            .await?;
        handle.mark_terminal(PhaseStatus::Failed, Some(message.clone()));
        self.bus
            .publish_status_change(&StatusChange::new(
                campaign_id,
                self.phase,
                PhaseStatus::Failed,
            ))
            .await;

        let snapshot = handle.snapshot();
        handle.try_send_progress(PhaseProgress {
            campaign_id,
            phase: self.phase,
            status: PhaseStatus::Failed,
            progress_pct: snapshot.progress_pct,
            items_total: snapshot.items_total,
            items_processed: snapshot.items_processed,
            message: message.clone(),
            error: Some(message),
            timestamp: chrono::Utc::now(),
        });
        handle.close_progress();
        Ok(())
    }
}

/// Write the single terminal transition for a finished work task. A stale
/// run context suppresses every write; the slot's new owner has already
/// recorded its own outcome.
async fn finalize(
    run: PhaseRunContext,
    handle: Arc<ExecutionHandle>,
    store: Arc<dyn CampaignStore>,
    bus: Arc<dyn EventBus>,
    result: Result<u64, PhaseError>,
) {
    let campaign_id = run.campaign_id;
    let phase = run.phase;

    if matches!(result, Err(PhaseError::StaleExecution)) || handle.guard(&run).is_err() {
        tracing::debug!(%campaign_id, %phase, "suppressing terminal write from stale run");
        return;
    }

    match result {
        Ok(items_total) => {
            if let Err(err) = store.complete_phase(campaign_id, phase, items_total).await {
                tracing::error!(%campaign_id, %phase, error = %err, "completion write failed");
            }
            handle.mark_terminal(PhaseStatus::Completed, None);
            bus.publish_status_change(&StatusChange::new(
                campaign_id,
                phase,
                PhaseStatus::Completed,
            ))
            .await;
            let progress = PhaseProgress {
                campaign_id,
                phase,
                status: PhaseStatus::Completed,
                progress_pct: 100.0,
                items_total,
                items_processed: items_total,
                message: format!("{} completed", phase),
                error: None,
                timestamp: chrono::Utc::now(),
            };
            handle.try_send_progress(progress.clone());
            bus.publish_progress(&progress).await;
        }
        Err(err) => {
            let message = err.to_string();
            let details = ErrorDetails::new(err.code(), message.clone(), phase);
            if let Err(store_err) = store.fail_phase(campaign_id, phase, &details).await {
                tracing::error!(%campaign_id, %phase, error = %store_err, "failure write failed");
            }
            handle.mark_terminal(PhaseStatus::Failed, Some(message.clone()));
            bus.publish_status_change(&StatusChange::new(campaign_id, phase, PhaseStatus::Failed))
                .await;
            let snapshot = handle.snapshot();
            let progress = PhaseProgress {
                campaign_id,
                phase,
                status: PhaseStatus::Failed,
                progress_pct: snapshot.progress_pct,
                items_total: snapshot.items_total,
                items_processed: snapshot.items_processed,
                message: message.clone(),
                error: Some(message),
                timestamp: chrono::Utc::now(),
            };
            handle.try_send_progress(progress.clone());
            bus.publish_progress(&progress).await;
        }
    }
    handle.close_progress();
}
