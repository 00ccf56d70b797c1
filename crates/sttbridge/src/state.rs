//! Worker lifecycle state.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// The host's approximation of the worker's readiness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// No worker process has been spawned
    #[default]
    NotStarted,
    /// Spawned, waiting for `ready`
    Starting,
    /// Worker answered `ready`
    Ready,
    /// Model loaded and capture device opened
    Initialized,
    /// Transcription running
    Running,
    /// Transcription stopped, worker still alive
    Stopped,
    /// Process exited, crashed, or never spawned. Terminal.
    Closed,
}

impl LifecycleState {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// A worker process is attached and has not exited.
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::NotStarted | Self::Closed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single source of truth for one session's lifecycle state.
///
/// Written only by the router and by exit observation; everyone else reads
/// or subscribes.
#[derive(Debug)]
pub struct StateCell {
    tx: watch::Sender<LifecycleState>,
}

impl StateCell {
    pub fn new(initial: LifecycleState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn get(&self) -> LifecycleState {
        *self.tx.borrow()
    }

    /// Move to `next`. Returns false if the state is Closed or already `next`.
    pub(crate) fn advance(&self, next: LifecycleState) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_closed() || *current == next {
                return false;
            }
            *current = next;
            true
        })
    }

    /// Force Closed from any state. Returns false if already Closed.
    pub(crate) fn close(&self) -> bool {
        self.advance(LifecycleState::Closed)
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.tx.subscribe()
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new(LifecycleState::NotStarted)
    }
}
