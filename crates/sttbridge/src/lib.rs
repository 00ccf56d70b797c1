//! sttbridge: supervisor and JSON line bridge for speech-to-text worker processes.

pub mod bridge;
pub mod events;
pub mod launch;
pub mod router;
pub mod session;
pub mod shutdown;
pub mod state;
pub mod supervisor;

pub use bridge::codec::{Frame, MessageCodec};
pub use bridge::framer::LineFramer;
pub use bridge::protocol::{AudioDevice, Command, DeviceList, InboundMessage, Transcription};
pub use events::{
    EventKind, ExitReason, Observer, OutputSource, Payload, Subscription, Termination, WorkerEvent,
};
pub use launch::{LaunchMode, LaunchPlan};
pub use router::StderrFilter;
pub use session::{SessionError, SessionId, WorkerSession};
pub use shutdown::{DEFAULT_GRACE_PERIOD, ShutdownOutcome};
pub use state::LifecycleState;
pub use supervisor::{
    CommandSpawner, EventReceiver, SpawnError, StartOutcome, SupervisorConfig, SupervisorError,
    WorkerSpawner, WorkerSupervisor,
};
