//! Events delivered to observers.

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::process::ExitStatus;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bridge::protocol::{DeviceList, Transcription};
use crate::state::LifecycleState;

/// Message payload as the worker sent it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
}

impl Payload {
    pub fn new(data: Value, timestamp: Option<Value>) -> Self {
        Self { data, timestamp }
    }

    /// Human-readable `data.message`, carried by most worker messages.
    pub fn message(&self) -> Option<&str> {
        self.data.get("message").and_then(Value::as_str)
    }

    pub fn transcription(&self) -> Result<Transcription, serde_json::Error> {
        Transcription::deserialize(&self.data)
    }

    pub fn devices(&self) -> Result<DeviceList, serde_json::Error> {
        DeviceList::deserialize(&self.data)
    }
}

/// Which worker stream a diagnostic line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputSource {
    Stdout,
    Stderr,
}

/// Why a worker session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum ExitReason {
    /// Process exited on its own with this code.
    Exited(i32),
    /// Process was terminated by a signal.
    Signaled(i32),
    /// Process never started (target missing, permission denied, ...).
    SpawnFailed(String),
    /// Exit happened but its status could not be collected.
    WaitFailed(String),
}

impl ExitReason {
    /// Exit code forwarded verbatim, when the process produced one.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(*code),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl From<ExitStatus> for ExitReason {
    fn from(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Exited(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::Signaled(signal);
            }
        }
        Self::WaitFailed(format!("unrecognized exit status: {status}"))
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {code}"),
            Self::Signaled(signal) => write!(f, "terminated by {}", signal_name(*signal)),
            Self::SpawnFailed(reason) => write!(f, "failed to start: {reason}"),
            Self::WaitFailed(reason) => write!(f, "exit status unavailable: {reason}"),
        }
    }
}

#[cfg(unix)]
fn signal_name(signal: i32) -> String {
    match nix::sys::signal::Signal::try_from(signal) {
        Ok(sig) => sig.as_str().to_string(),
        Err(_) => format!("signal {signal}"),
    }
}

#[cfg(not(unix))]
fn signal_name(signal: i32) -> String {
    format!("signal {signal}")
}

/// Termination notification, delivered exactly once per session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Termination {
    pub reason: ExitReason,
    /// The grace period expired and the process was killed.
    pub forced_kill: bool,
}

impl Termination {
    pub fn spawn_failed(reason: impl Into<String>) -> Self {
        Self {
            reason: ExitReason::SpawnFailed(reason.into()),
            forced_kill: false,
        }
    }
}

/// Event delivered to observers, in worker output order.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Ready(Payload),
    Initialized(Payload),
    Started(Payload),
    Stopped(Payload),
    Transcription(Payload),
    SpeechDetected(Payload),
    Devices(Payload),
    Status(Payload),
    /// Error reported by the worker. Does not change lifecycle state.
    Error(Payload),
    Warning(Payload),
    /// Message with a `type` this bridge does not know.
    Unknown { kind: String, payload: Payload },
    /// Non-protocol output line.
    Diagnostic { source: OutputSource, line: String },
    Closed(Termination),
}

impl WorkerEvent {
    /// Map a message type to its event. Unrecognized types become `Unknown`.
    pub fn from_message(kind: String, payload: Payload) -> Self {
        match kind.as_str() {
            "ready" => Self::Ready(payload),
            "initialized" => Self::Initialized(payload),
            "started" => Self::Started(payload),
            "stopped" => Self::Stopped(payload),
            "transcription" => Self::Transcription(payload),
            "speech_detected" => Self::SpeechDetected(payload),
            "devices" => Self::Devices(payload),
            "status" => Self::Status(payload),
            "error" => Self::Error(payload),
            "warning" => Self::Warning(payload),
            _ => Self::Unknown { kind, payload },
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::Ready(_) => EventKind::Ready,
            Self::Initialized(_) => EventKind::Initialized,
            Self::Started(_) => EventKind::Started,
            Self::Stopped(_) => EventKind::Stopped,
            Self::Transcription(_) => EventKind::Transcription,
            Self::SpeechDetected(_) => EventKind::SpeechDetected,
            Self::Devices(_) => EventKind::Devices,
            Self::Status(_) => EventKind::Status,
            Self::Error(_) => EventKind::Error,
            Self::Warning(_) => EventKind::Warning,
            Self::Unknown { .. } => EventKind::Unknown,
            Self::Diagnostic { .. } => EventKind::Diagnostic,
            Self::Closed(_) => EventKind::Closed,
        }
    }

    /// Lifecycle transition this event drives, if any.
    pub fn lifecycle_effect(&self) -> Option<LifecycleState> {
        match self {
            Self::Ready(_) => Some(LifecycleState::Ready),
            Self::Initialized(_) => Some(LifecycleState::Initialized),
            Self::Started(_) => Some(LifecycleState::Running),
            Self::Stopped(_) => Some(LifecycleState::Stopped),
            Self::Closed(_) => Some(LifecycleState::Closed),
            _ => None,
        }
    }

    pub fn payload(&self) -> Option<&Payload> {
        match self {
            Self::Ready(p)
            | Self::Initialized(p)
            | Self::Started(p)
            | Self::Stopped(p)
            | Self::Transcription(p)
            | Self::SpeechDetected(p)
            | Self::Devices(p)
            | Self::Status(p)
            | Self::Error(p)
            | Self::Warning(p) => Some(p),
            Self::Unknown { payload, .. } => Some(payload),
            Self::Diagnostic { .. } | Self::Closed(_) => None,
        }
    }
}

/// Event discriminant, used to filter observer subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Ready,
    Initialized,
    Started,
    Stopped,
    Transcription,
    SpeechDetected,
    Devices,
    Status,
    Error,
    Warning,
    Unknown,
    Diagnostic,
    Closed,
}

/// Synchronous event observer.
///
/// Called on the session's event loop in arrival order, after the lifecycle
/// state already reflects the event. Must not block. A panic is caught and
/// logged; later observers and the event channel still see the event.
pub trait Observer: Send + Sync {
    fn on_event(&self, event: &WorkerEvent);
}

impl<F> Observer for F
where
    F: Fn(&WorkerEvent) + Send + Sync,
{
    fn on_event(&self, event: &WorkerEvent) {
        self(event)
    }
}

/// An observer and the event kinds it wants (`None` means all).
#[derive(Clone)]
pub struct Subscription {
    kinds: Option<HashSet<EventKind>>,
    observer: Arc<dyn Observer>,
}

impl Subscription {
    pub fn all(observer: Arc<dyn Observer>) -> Self {
        Self {
            kinds: None,
            observer,
        }
    }

    pub fn only(kinds: impl IntoIterator<Item = EventKind>, observer: Arc<dyn Observer>) -> Self {
        Self {
            kinds: Some(kinds.into_iter().collect()),
            observer,
        }
    }

    pub fn wants(&self, kind: EventKind) -> bool {
        self.kinds.as_ref().is_none_or(|kinds| kinds.contains(&kind))
    }

    pub(crate) fn notify(&self, event: &WorkerEvent) {
        if !self.wants(event.kind()) {
            return;
        }
        let delivered = panic::catch_unwind(AssertUnwindSafe(|| self.observer.on_event(event)));
        if delivered.is_err() {
            tracing::error!(kind = ?event.kind(), "Observer panicked");
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("kinds", &self.kinds)
            .finish_non_exhaustive()
    }
}
