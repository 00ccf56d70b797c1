//! Worker supervisor - owns at most one live worker session.
//!
//! Flow:
//! 1. `start()` resolves the launch plan and spawns the worker
//! 2. The session's event loop routes worker output to observers
//! 3. Callers drive the worker with commands (`initialize`, `start`, ...)
//! 4. `terminate()` requests exit, killing the worker after the grace period
//! 5. Once the session is Closed, `start()` spawns a fresh one

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::bridge::protocol;
use crate::events::{EventKind, Observer, Subscription, Termination, WorkerEvent};
use crate::launch::{DEFAULT_INTERPRETER, LaunchMode, LaunchPlan};
use crate::router::{Router, StderrFilter};
use crate::session::{SessionError, WorkerSession};
use crate::shutdown::{DEFAULT_GRACE_PERIOD, ShutdownOutcome};
use crate::state::LifecycleState;

/// Receives every event from every session of one supervisor.
pub type EventReceiver = mpsc::UnboundedReceiver<WorkerEvent>;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("worker {0} was not captured")]
    MissingPipe(&'static str),
}

/// Extension point for different worker spawn strategies.
///
/// Implementations must pipe stdin, stdout and stderr.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, plan: &LaunchPlan) -> Result<Child, SpawnError>;
}

/// Spawns the plan as a plain child process.
#[derive(Debug, Default)]
pub struct CommandSpawner;

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, plan: &LaunchPlan) -> Result<Child, SpawnError> {
        let child = Command::new(&plan.program)
            .args(&plan.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

pub struct SupervisorConfig {
    pub target: PathBuf,
    pub launch_mode: LaunchMode,
    pub interpreter: PathBuf,
    pub grace_period: Duration,
    pub stderr_filter: StderrFilter,
    pub spawner: Arc<dyn WorkerSpawner>,
    subscriptions: Vec<Subscription>,
}

impl SupervisorConfig {
    pub fn new(target: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
            launch_mode: LaunchMode::Auto,
            interpreter: PathBuf::from(DEFAULT_INTERPRETER),
            grace_period: DEFAULT_GRACE_PERIOD,
            stderr_filter: StderrFilter::All,
            spawner: Arc::new(CommandSpawner),
            subscriptions: Vec::new(),
        }
    }

    pub fn with_launch_mode(mut self, mode: LaunchMode) -> Self {
        self.launch_mode = mode;
        self
    }

    pub fn with_interpreter(mut self, interpreter: impl Into<PathBuf>) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn with_stderr_filter(mut self, filter: StderrFilter) -> Self {
        self.stderr_filter = filter;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    /// Register an observer for every event.
    pub fn with_observer(mut self, observer: impl Observer + 'static) -> Self {
        self.subscriptions.push(Subscription::all(Arc::new(observer)));
        self
    }

    /// Register an observer for the given event kinds only.
    pub fn with_observer_for(
        mut self,
        kinds: impl IntoIterator<Item = EventKind>,
        observer: impl Observer + 'static,
    ) -> Self {
        self.subscriptions
            .push(Subscription::only(kinds, Arc::new(observer)));
        self
    }

    pub fn launch_plan(&self) -> LaunchPlan {
        LaunchPlan::new(&self.target, self.launch_mode, &self.interpreter)
    }
}

impl std::fmt::Debug for SupervisorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorConfig")
            .field("target", &self.target)
            .field("launch_mode", &self.launch_mode)
            .field("interpreter", &self.interpreter)
            .field("grace_period", &self.grace_period)
            .field("stderr_filter", &self.stderr_filter)
            .field("observers", &self.subscriptions.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to start worker {target}: {source}")]
    Spawn {
        target: String,
        #[source]
        source: SpawnError,
    },
    #[error("worker not started")]
    NotStarted,
}

impl From<SessionError> for SupervisorError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotAttached => Self::NotStarted,
        }
    }
}

/// Result of `start()`.
#[derive(Debug, Clone)]
pub enum StartOutcome {
    Started(WorkerSession),
    /// A live session already exists; nothing was spawned.
    AlreadyRunning(WorkerSession),
}

impl StartOutcome {
    pub fn session(&self) -> &WorkerSession {
        match self {
            Self::Started(session) | Self::AlreadyRunning(session) => session,
        }
    }

    pub fn into_session(self) -> WorkerSession {
        match self {
            Self::Started(session) | Self::AlreadyRunning(session) => session,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Self::Started(_))
    }
}

#[derive(Debug)]
pub struct WorkerSupervisor {
    config: SupervisorConfig,
    router: Router,
    session: Option<WorkerSession>,
}

impl WorkerSupervisor {
    pub fn new(config: SupervisorConfig) -> (Self, EventReceiver) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let router = Router::new(
            config.subscriptions.clone().into(),
            events_tx,
            config.stderr_filter,
        );
        let supervisor = Self {
            config,
            router,
            session: None,
        };
        (supervisor, events_rx)
    }

    /// Spawn the worker unless a live session already exists.
    ///
    /// # Panics
    ///
    /// Panics outside a tokio runtime.
    pub fn start(&mut self) -> Result<StartOutcome, SupervisorError> {
        if let Some(session) = &self.session
            && session.state().is_live()
        {
            tracing::warn!(session = %session.id(), "Worker already started");
            return Ok(StartOutcome::AlreadyRunning(session.clone()));
        }
        self.session = None;

        let plan = self.config.launch_plan();
        tracing::info!(
            target_path = %self.config.target.display(),
            mode = ?plan.mode,
            command = %plan,
            "Spawning worker"
        );

        let child = match self.config.spawner.spawn(&plan) {
            Ok(child) => child,
            Err(e) => return Err(self.spawn_failed(e)),
        };
        let router = self.router.clone();
        let session = match WorkerSession::attach(child, plan, router, self.config.grace_period) {
            Ok(session) => session,
            Err(e) => return Err(self.spawn_failed(e)),
        };

        self.session = Some(session.clone());
        Ok(StartOutcome::Started(session))
    }

    fn spawn_failed(&self, err: SpawnError) -> SupervisorError {
        let target = self.config.target.display().to_string();
        tracing::error!(target_path = %target, error = %err, "Failed to start worker");
        self.router.spawn_failed(err.to_string());
        SupervisorError::Spawn {
            target,
            source: err,
        }
    }

    /// Current session, live or retired.
    pub fn session(&self) -> Option<&WorkerSession> {
        self.session.as_ref()
    }

    pub fn state(&self) -> LifecycleState {
        self.session
            .as_ref()
            .map_or(LifecycleState::NotStarted, WorkerSession::state)
    }

    fn live_session(&self) -> Result<&WorkerSession, SupervisorError> {
        match &self.session {
            Some(session) if session.state().is_live() => Ok(session),
            _ => Err(SupervisorError::NotStarted),
        }
    }

    pub fn send(&self, command: protocol::Command) -> Result<(), SupervisorError> {
        Ok(self.live_session()?.send(command)?)
    }

    pub fn initialize(
        &self,
        device_index: i64,
        model: impl Into<String>,
    ) -> Result<(), SupervisorError> {
        Ok(self.live_session()?.initialize(device_index, model)?)
    }

    pub fn start_transcription(&self) -> Result<(), SupervisorError> {
        Ok(self.live_session()?.start_transcription()?)
    }

    pub fn stop_transcription(&self) -> Result<(), SupervisorError> {
        Ok(self.live_session()?.stop_transcription()?)
    }

    pub fn list_devices(&self) -> Result<(), SupervisorError> {
        Ok(self.live_session()?.list_devices()?)
    }

    /// Graceful-then-forced shutdown of the current session. No-op without one.
    pub fn terminate(&self) -> ShutdownOutcome {
        match &self.session {
            Some(session) => session.terminate(),
            None => ShutdownOutcome::AlreadyClosed,
        }
    }

    /// Wait for the current session to close. `None` if nothing was started.
    pub async fn wait_closed(&self) -> Option<Termination> {
        match &self.session {
            Some(session) => Some(session.wait_closed().await),
            None => None,
        }
    }
}
