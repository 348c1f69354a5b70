//! Event fan-out to observers
//!
//! Two planes: control events (status, sessions, features, alerts) go over
//! per-subscriber unbounded channels and are never dropped; the live agent
//! output stream goes over a bounded broadcast ring where a lagging
//! subscriber loses the oldest messages. Publishing never blocks the
//! scheduler on either plane.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::agent::AgentMessage;
use crate::features::Feature;
use crate::orchestrator::{RunState, TrackStatus};

/// Capacity of the live output ring per subscriber
const OUTPUT_CHANNEL_CAPACITY: usize = 1024;

/// Control-plane event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "topic")]
pub enum Event {
    #[serde(rename = "orchestrator:status")]
    OrchestratorStatus {
        state: RunState,
        tracks: Vec<TrackStatus>,
    },

    #[serde(rename = "session:started")]
    SessionStarted {
        session_id: String,
        feature_id: u64,
        track: String,
    },

    #[serde(rename = "session:finished")]
    SessionFinished {
        session_id: String,
        feature_id: u64,
        track: String,
        success: bool,
    },

    #[serde(rename = "feature:updated")]
    FeatureUpdated { feature: Feature },

    #[serde(rename = "track:critical_failure")]
    TrackCriticalFailure { track: String, reason: String },

    #[serde(rename = "tracks:new_categories")]
    NewCategories { categories: Vec<String> },
}

/// One streamed agent message, tagged with its session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutput {
    pub session_id: String,
    pub message: AgentMessage,
}

/// Fan-out bus for orchestrator events
///
/// Cheaply cloneable; all clones share the same subscriber set.
#[derive(Clone)]
pub struct EventBus {
    control: Arc<Mutex<Vec<mpsc::UnboundedSender<Event>>>>,
    output: broadcast::Sender<AgentOutput>,
}

impl EventBus {
    pub fn new() -> Self {
        let (output, _) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        Self {
            control: Arc::new(Mutex::new(Vec::new())),
            output,
        }
    }

    /// Register a control-plane subscriber
    ///
    /// The receiver sees every event published after this call.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.control.lock().expect("EventBus lock poisoned");
        subscribers.push(tx);
        rx
    }

    /// Register a live-output subscriber
    ///
    /// A subscriber that falls more than the ring capacity behind loses the
    /// oldest messages, never the newest.
    pub fn subscribe_output(&self) -> broadcast::Receiver<AgentOutput> {
        self.output.subscribe()
    }

    /// Publish a control event to all subscribers
    ///
    /// Disconnected subscribers are pruned.
    pub fn publish(&self, event: Event) {
        let mut subscribers = self.control.lock().expect("EventBus lock poisoned");
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Publish one streamed agent message
    pub fn publish_output(&self, output: AgentOutput) {
        // Err means no subscribers, which is fine
        let _ = self.output.send(output);
    }

    /// Number of control-plane subscribers
    pub fn subscriber_count(&self) -> usize {
        self.control.lock().expect("EventBus lock poisoned").len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
