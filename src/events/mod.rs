//! Best-effort event fan-out.
//!
//! Phase services and reconcilers publish progress, status changes, and
//! system events here. Publishing never fails a caller: delivery problems
//! are logged and dropped. `BroadcastBus` ships a `tokio::sync::broadcast`
//! implementation suitable for SSE-style consumers; tests subscribe to it
//! directly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::model::{PhaseStatus, PhaseType};
use crate::phase::PhaseProgress;

/// Default buffer of the broadcast channel behind `BroadcastBus`.
const DEFAULT_EVENT_BUFFER: usize = 256;

/// A phase status transition observed by a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChange {
    pub campaign_id: Uuid,
    pub phase: PhaseType,
    pub status: PhaseStatus,
    pub timestamp: DateTime<Utc>,
}

impl StatusChange {
    pub fn new(campaign_id: Uuid, phase: PhaseType, status: PhaseStatus) -> Self {
        Self {
            campaign_id,
            phase,
            status,
            timestamp: Utc::now(),
        }
    }
}

/// Everything that goes over the wire to event subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EngineEvent {
    Progress(PhaseProgress),
    StatusChange(StatusChange),
    System {
        name: String,
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
}

/// Event publishing seam. Failures are logged, never surfaced.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish_progress(&self, progress: &PhaseProgress);
    async fn publish_status_change(&self, change: &StatusChange);
    async fn publish_system_event(&self, name: &str, payload: serde_json::Value);
}

/// Broadcast-channel bus. Serialized events are fanned out to however many
/// subscribers are attached; with no subscribers, sends drop silently.
pub struct BroadcastBus {
    tx: broadcast::Sender<String>,
}

impl BroadcastBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_BUFFER)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Attach a new subscriber. Slow subscribers observe `Lagged` and skip
    /// ahead; the bus never blocks on them.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    fn send(&self, event: &EngineEvent) {
        match serde_json::to_string(event) {
            Ok(json) => {
                // An Err here just means no subscriber is listening
                let _ = self.tx.send(json);
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to serialize engine event");
            }
        }
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for BroadcastBus {
    async fn publish_progress(&self, progress: &PhaseProgress) {
        self.send(&EngineEvent::Progress(progress.clone()));
    }

    async fn publish_status_change(&self, change: &StatusChange) {
        self.send(&EngineEvent::StatusChange(change.clone()));
    }

    async fn publish_system_event(&self, name: &str, payload: serde_json::Value) {
        self.send(&EngineEvent::System {
            name: name.to_string(),
            payload,
            timestamp: Utc::now(),
        });
    }
}
