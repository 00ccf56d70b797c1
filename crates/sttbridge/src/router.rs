//! Router - turns decoded worker output into observer events.
//!
//! For each message, in arrival order:
//! 1. Apply its lifecycle effect to the session state
//! 2. Notify registered observers (registration order)
//! 3. Forward to the event channel
//!
//! Step 1 happens before 2 so an observer reacting to `initialized` already
//! sees Initialized.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;

use crate::bridge::codec::Frame;
use crate::bridge::protocol::InboundMessage;
use crate::events::{OutputSource, Payload, Subscription, Termination, WorkerEvent};
use crate::state::StateCell;

/// Which stderr lines are surfaced as `Diagnostic` events.
///
/// Every stderr line is logged regardless.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StderrFilter {
    #[default]
    All,
    /// Only lines carrying an explicit error marker.
    ErrorsOnly,
}

const ERROR_MARKERS: &[&str] = &["ERROR", "Exception", "Traceback"];

impl StderrFilter {
    pub fn accepts(&self, line: &str) -> bool {
        match self {
            Self::All => true,
            Self::ErrorsOnly => ERROR_MARKERS.iter().any(|marker| line.contains(marker)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Router {
    subscriptions: Arc<[Subscription]>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    stderr_filter: StderrFilter,
}

impl Router {
    pub fn new(
        subscriptions: Arc<[Subscription]>,
        events_tx: mpsc::UnboundedSender<WorkerEvent>,
        stderr_filter: StderrFilter,
    ) -> Self {
        Self {
            subscriptions,
            events_tx,
            stderr_filter,
        }
    }

    pub fn handle_frame(&self, frame: Frame, state: &StateCell) {
        match frame {
            Frame::Message(msg) => self.dispatch(msg, state),
            Frame::Malformed { line, error } => {
                tracing::debug!(%error, "Non-protocol line on worker stdout");
                self.diagnostic(OutputSource::Stdout, line);
            }
        }
    }

    pub fn dispatch(&self, msg: InboundMessage, state: &StateCell) {
        let InboundMessage {
            kind,
            data,
            timestamp,
        } = msg;
        tracing::debug!(target: "sttbridge::worker", kind = %kind, data = %data, "Worker message");

        let event = WorkerEvent::from_message(kind, Payload::new(data, timestamp));
        match &event {
            WorkerEvent::Unknown { kind, .. } => {
                tracing::warn!(kind = %kind, "Unknown message type from worker");
            }
            WorkerEvent::Error(payload) => {
                tracing::warn!(
                    error = payload.message().unwrap_or_default(),
                    "Worker reported error"
                );
            }
            _ => {}
        }

        // Closed is only reachable through exit observation, never a message.
        if let Some(next) = event.lifecycle_effect()
            && !next.is_closed()
            && state.advance(next)
        {
            tracing::debug!(state = %next, "Lifecycle state changed");
        }

        self.emit(event);
    }

    pub fn stderr_line(&self, line: String) {
        tracing::debug!(target: "sttbridge::worker", source = "stderr", "{}", line);
        if self.stderr_filter.accepts(&line) {
            self.diagnostic(OutputSource::Stderr, line);
        }
    }

    pub fn diagnostic(&self, source: OutputSource, line: String) {
        self.emit(WorkerEvent::Diagnostic { source, line });
    }

    pub fn closed(&self, termination: Termination) {
        self.emit(WorkerEvent::Closed(termination));
    }

    /// No process was started: an `Error` event, then the single `Closed`.
    pub fn spawn_failed(&self, reason: String) {
        let payload = Payload::new(json!({ "message": reason }), None);
        self.emit(WorkerEvent::Error(payload));
        self.closed(Termination::spawn_failed(reason));
    }

    fn emit(&self, event: WorkerEvent) {
        for subscription in self.subscriptions.iter() {
            subscription.notify(&event);
        }
        if self.events_tx.send(event).is_err() {
            tracing::trace!("Event receiver dropped");
        }
    }
}
