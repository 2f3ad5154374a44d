//! Per-campaign control watchers.
//!
//! `attach_control_channel` binds an upstream command source (typically one
//! per orchestrator) to the live execution's buffered downstream channel.
//! Re-attaching for the same campaign cancels the prior watcher. Commands
//! that arrive with no live execution are acknowledged with the
//! execution-missing error and not forwarded; everything else is
//! acknowledged by the executor when it handles the command.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::execution::ExecutionRegistry;
use super::ControlCommand;
use crate::errors::PhaseError;
use crate::model::PhaseType;

pub struct ControlDispatcher {
    phase: PhaseType,
    registry: Arc<ExecutionRegistry>,
    watchers: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl ControlDispatcher {
    pub fn new(phase: PhaseType, registry: Arc<ExecutionRegistry>) -> Self {
        Self {
            phase,
            registry,
            watchers: Mutex::new(HashMap::new()),
        }
    }

    /// Bind `upstream` as the control source for one campaign, replacing
    /// any previous watcher.
    pub fn attach(&self, campaign_id: Uuid, mut upstream: mpsc::Receiver<ControlCommand>) {
        let token = CancellationToken::new();
        let previous = self
            .watchers
            .lock()
            .unwrap()
            .insert(campaign_id, token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }

        let registry = Arc::clone(&self.registry);
        let phase = self.phase;
        tokio::spawn(async move {
            loop {
                let command = tokio::select! {
                    _ = token.cancelled() => break,
                    command = upstream.recv() => command,
                };
                let Some(mut command) = command else {
                    break;
                };

                let handle = registry
                    .get(campaign_id)
                    .filter(|handle| !handle.is_terminal());
                let Some(handle) = handle else {
                    command.acknowledge(Err(PhaseError::ExecutionMissing { phase, campaign_id }));
                    continue;
                };

                let downstream = handle.control_sender();
                tokio::select! {
                    _ = token.cancelled() => break,
                    sent = downstream.send(command) => {
                        if let Err(mpsc::error::SendError(mut command)) = sent {
                            // Executor went away between lookup and send
                            command
                                .acknowledge(Err(PhaseError::ExecutionMissing { phase, campaign_id }));
                        }
                    }
                }
            }
            tracing::debug!(%campaign_id, %phase, "control watcher stopped");
        });
    }

    /// Cancel the watcher for a campaign, if any.
    pub fn detach(&self, campaign_id: Uuid) {
        if let Some(token) = self.watchers.lock().unwrap().remove(&campaign_id) {
            token.cancel();
        }
    }
}
