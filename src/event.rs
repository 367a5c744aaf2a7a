//! Lifecycle event payloads and the event sink.
//!
//! Every state-changing or failing player operation reports exactly one
//! tagged payload to the sink. The sink forwards payloads to an optional
//! caller-supplied callback and, when logging is enabled, mirrors them to
//! `tracing`.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Callback type invoked by the sink for every emitted payload.
pub type EventCallback = Box<dyn Fn(&EventPayload) + Send + Sync>;

/// The kind tag of an event payload.
///
/// Serializes in kebab-case ("load-file", "load-patch", ...) so payloads can
/// be forwarded as JSON unchanged. `Custom` carries caller-defined kinds
/// emitted through `Player::emit_event`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    /// Player instance constructed and engine initialized.
    Init,
    /// A MIDI file is being retrieved/loaded.
    LoadFile,
    /// An instrument patch is being retrieved/installed.
    LoadPatch,
    /// Recurring playback progress (one per audio callback tick).
    Play,
    Pause,
    Resume,
    Stop,
    /// The engine produced its final chunk; playback finished on its own.
    End,
    Error,
    /// Caller-defined event kind.
    #[serde(untagged)]
    Custom(String),
}

/// A single tagged event record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    /// What happened.
    pub event: EventKind,
    /// Human-readable description.
    pub message: String,
    /// Failure detail, present on error payloads.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Elapsed playback time in seconds, where meaningful.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
}

impl EventPayload {
    /// Creates a payload with no error detail and no timestamp.
    pub fn new(event: EventKind, message: impl Into<String>) -> Self {
        Self {
            event,
            message: message.into(),
            error: None,
            time: None,
        }
    }

    /// Creates an error payload with optional failure detail.
    pub fn error(message: impl Into<String>, detail: Option<String>) -> Self {
        Self {
            event: EventKind::Error,
            message: message.into(),
            error: detail,
            time: None,
        }
    }

    /// Attaches an elapsed-time value in seconds.
    pub fn with_time(mut self, seconds: f64) -> Self {
        self.time = Some(seconds);
        self
    }
}

/// Mutable sink configuration, guarded by the sink's mutex.
struct SinkState {
    callback: Option<EventCallback>,
    logging: bool,
}

/// The event sink shared between the player and its audio callback.
///
/// `emit` never fails and never panics: a poisoned lock falls back to the
/// inner state, and callback errors cannot occur (callbacks are infallible
/// by type).
pub struct EventSink {
    state: Mutex<SinkState>,
}

impl EventSink {
    pub fn new(callback: Option<EventCallback>, logging: bool) -> Self {
        Self {
            state: Mutex::new(SinkState { callback, logging }),
        }
    }

    /// Delivers a payload to the callback and, when logging is enabled, to
    /// the `tracing` subscriber.
    pub fn emit(&self, payload: EventPayload) {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.logging {
            match payload.event {
                EventKind::Error => tracing::error!(
                    event = ?payload.event,
                    error = payload.error.as_deref(),
                    "{}",
                    payload.message
                ),
                _ => tracing::info!(event = ?payload.event, time = payload.time, "{}", payload.message),
            }
        }
        if let Some(callback) = state.callback.as_ref() {
            callback(&payload);
        }
    }

    /// Replaces the callback and logging flag at runtime.
    ///
    /// Playback is unaffected; only subsequent emissions see the change.
    pub fn set_logger(&self, callback: Option<EventCallback>, logging: bool) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.callback = callback;
        state.logging = logging;
    }
}
