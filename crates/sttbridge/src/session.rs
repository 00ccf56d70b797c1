//! Worker session - one spawned worker process and the tasks around it.
//!
//! Tasks per session:
//! 1. Writer: ordered command queue -> worker stdin
//! 2. Exit watcher: owns the Child, waits for exit, kills on shutdown timeout
//! 3. Event loop: worker stdout/stderr -> Router, then the close sequence
//!
//! Nothing else touches the worker's pipes.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::MessageCodec;
use crate::bridge::framer::LineFramer;
use crate::bridge::protocol::Command;
use crate::events::{ExitReason, Termination};
use crate::launch::LaunchPlan;
use crate::router::Router;
use crate::shutdown::{ShutdownCoordinator, ShutdownOutcome};
use crate::state::{LifecycleState, StateCell};
use crate::supervisor::SpawnError;

/// How long to keep reading worker output after the process has exited.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Unique identifier for a worker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("worker process is not attached")]
    NotAttached,
}

#[derive(Debug)]
struct Shared {
    state: StateCell,
    shutdown: ShutdownCoordinator,
    termination: OnceLock<Termination>,
}

/// Handle to a live (or retired) worker process.
///
/// Cheap to clone; all clones drive the same process.
#[derive(Debug, Clone)]
pub struct WorkerSession {
    id: SessionId,
    pid: Option<u32>,
    plan: LaunchPlan,
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl WorkerSession {
    /// Take ownership of a freshly spawned child and start its tasks.
    ///
    /// All three stdio streams must be piped. Must be called from within a
    /// tokio runtime.
    pub fn attach(
        mut child: Child,
        plan: LaunchPlan,
        router: Router,
        grace_period: Duration,
    ) -> Result<Self, SpawnError> {
        let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let (stdin, stdout, stderr) = match pipes {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            (stdin, stdout, _) => {
                let missing = if stdin.is_none() {
                    "stdin"
                } else if stdout.is_none() {
                    "stdout"
                } else {
                    "stderr"
                };
                if let Err(e) = child.start_kill() {
                    tracing::warn!(error = %e, "Failed to kill partially attached worker");
                }
                return Err(SpawnError::MissingPipe(missing));
            }
        };

        let id = SessionId::new();
        let pid = child.id();
        let shared = Arc::new(Shared {
            state: StateCell::new(LifecycleState::Starting),
            shutdown: ShutdownCoordinator::new(grace_period),
            termination: OnceLock::new(),
        });
        tracing::info!(session = %id, pid = ?pid, mode = ?plan.mode, "Worker process spawned");

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        tokio::spawn(run_writer(
            id,
            FramedWrite::new(stdin, MessageCodec::new()),
            commands_rx,
            shared.shutdown.closed_token(),
        ));
        tokio::spawn(watch_exit(id, child, Arc::clone(&shared), exit_tx));
        tokio::spawn(run_event_loop(
            id,
            FramedRead::new(stdout, MessageCodec::new()),
            FramedRead::new(stderr, LineFramer::new()),
            exit_rx,
            router,
            Arc::clone(&shared),
        ));

        Ok(Self {
            id,
            pid,
            plan,
            commands: commands_tx,
            shared,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// OS process id, if the process was still running when attached.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn launch_plan(&self) -> &LaunchPlan {
        &self.plan
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.state.get()
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.shared.state.subscribe()
    }

    /// Queue a command for the worker. Commands are written in call order.
    ///
    /// The bridge does not enforce protocol ordering (e.g. `initialize`
    /// before `ready`); that is the caller's responsibility.
    pub fn send(&self, command: Command) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::NotAttached);
        }
        tracing::debug!(session = %self.id, command = command.name(), "Sending command");
        self.commands
            .send(command)
            .map_err(|_| SessionError::NotAttached)
    }

    pub fn initialize(
        &self,
        device_index: i64,
        model: impl Into<String>,
    ) -> Result<(), SessionError> {
        tracing::info!(session = %self.id, device_index, "Initializing worker");
        self.send(Command::initialize(device_index, model))
    }

    pub fn start_transcription(&self) -> Result<(), SessionError> {
        self.send(Command::start())
    }

    pub fn stop_transcription(&self) -> Result<(), SessionError> {
        self.send(Command::stop())
    }

    pub fn list_devices(&self) -> Result<(), SessionError> {
        self.send(Command::list_devices())
    }

    /// Ask the worker to exit; kill it if it is still alive after the grace
    /// period. Idempotent.
    pub fn terminate(&self) -> ShutdownOutcome {
        if self.is_closed() {
            return ShutdownOutcome::AlreadyClosed;
        }
        tracing::info!(session = %self.id, "Terminating worker");
        self.shared.shutdown.begin(|| self.send(Command::exit()))
    }

    /// Termination details, once the process is gone.
    pub fn termination(&self) -> Option<Termination> {
        self.shared.termination.get().cloned()
    }

    /// Wait for the process to exit.
    pub async fn wait_closed(&self) -> Termination {
        let mut rx = self.subscribe_state();
        // The sender lives in `self.shared`, so the channel cannot close under us.
        let _ = rx.wait_for(LifecycleState::is_closed).await;
        self.termination().unwrap_or_else(|| Termination {
            reason: ExitReason::WaitFailed("termination not recorded".to_string()),
            forced_kill: false,
        })
    }
}

async fn run_writer(
    session: SessionId,
    mut writer: FramedWrite<ChildStdin, MessageCodec>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    closed: CancellationToken,
) {
    loop {
        let command = tokio::select! {
            command = commands.recv() => command,
            _ = closed.cancelled() => None,
        };
        let Some(command) = command else { break };

        let name = command.name().to_string();
        if let Err(e) = writer.send(command).await {
            tracing::warn!(
                %session,
                command = %name,
                error = %e,
                "Failed to write command to worker"
            );
            break;
        }
    }
    tracing::debug!(%session, "Command writer exiting");
}

async fn watch_exit(
    session: SessionId,
    mut child: Child,
    shared: Arc<Shared>,
    exit_tx: oneshot::Sender<Termination>,
) {
    let kill = shared.shutdown.kill_token();
    let (status, forced_kill) = tokio::select! {
        status = child.wait() => {
            // Reaped: no kill, even if output stays open past the grace period.
            shared.shutdown.disarm();
            (status, false)
        }
        _ = kill.cancelled() => {
            tracing::warn!(%session, "Killing worker process");
            if let Err(e) = child.start_kill() {
                tracing::warn!(%session, error = %e, "Failed to kill worker process");
            }
            (child.wait().await, true)
        }
    };

    let reason = match status {
        Ok(status) => ExitReason::from(status),
        Err(e) => ExitReason::WaitFailed(e.to_string()),
    };
    let _ = exit_tx.send(Termination {
        reason,
        forced_kill,
    });
}

async fn run_event_loop(
    session: SessionId,
    mut stdout: FramedRead<ChildStdout, MessageCodec>,
    mut stderr: FramedRead<ChildStderr, LineFramer>,
    mut exit_rx: oneshot::Receiver<Termination>,
    router: Router,
    shared: Arc<Shared>,
) {
    let mut stdout_open = true;
    let mut stderr_open = true;

    let termination = loop {
        tokio::select! {
            biased;

            frame = stdout.next(), if stdout_open => match frame {
                Some(Ok(frame)) => router.handle_frame(frame, &shared.state),
                Some(Err(e)) => {
                    tracing::error!(%session, error = %e, "Worker stdout read failed");
                    stdout_open = false;
                }
                None => {
                    tracing::debug!(%session, "Worker stdout closed");
                    stdout_open = false;
                }
            },

            line = stderr.next(), if stderr_open => match line {
                Some(Ok(line)) => router.stderr_line(line),
                Some(Err(e)) => {
                    tracing::error!(%session, error = %e, "Worker stderr read failed");
                    stderr_open = false;
                }
                None => stderr_open = false,
            },

            outcome = &mut exit_rx => {
                break outcome.unwrap_or_else(|_| Termination {
                    reason: ExitReason::WaitFailed("exit watcher dropped".to_string()),
                    forced_kill: false,
                });
            }
        }
    };

    // Output written right before exit may still be in the pipes.
    let drain = async {
        while stdout_open {
            match stdout.next().await {
                Some(Ok(frame)) => router.handle_frame(frame, &shared.state),
                Some(Err(_)) | None => stdout_open = false,
            }
        }
        while stderr_open {
            match stderr.next().await {
                Some(Ok(line)) => router.stderr_line(line),
                Some(Err(_)) | None => stderr_open = false,
            }
        }
    };
    if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::warn!(%session, "Worker output still open after exit, dropping the rest");
    }

    if termination.reason.is_success() {
        tracing::info!(%session, reason = %termination.reason, "Worker exited");
    } else {
        tracing::warn!(
            %session,
            reason = %termination.reason,
            forced_kill = termination.forced_kill,
            "Worker exited abnormally"
        );
    }

    let _ = shared.termination.set(termination.clone());
    shared.state.close();
    shared.shutdown.mark_closed();
    router.closed(termination);
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::events::{EventKind, OutputSource, Subscription, WorkerEvent};
    use crate::router::StderrFilter;
    use std::process::Stdio;

    const GRACE: Duration = Duration::from_millis(300);

    fn spawn_sh(script: &str) -> (WorkerSession, mpsc::UnboundedReceiver<WorkerEvent>) {
        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let router = Router::new(Arc::from(Vec::<Subscription>::new()), tx, StderrFilter::All);
        let session =
            WorkerSession::attach(child, LaunchPlan::direct("sh"), router, GRACE).unwrap();
        assert!(session.pid().is_some());
        (session, rx)
    }

    /// Collect events until the router is dropped (after Closed).
    async fn collect(rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> Vec<WorkerEvent> {
        tokio::time::timeout(Duration::from_secs(10), async {
            let mut events = Vec::new();
            while let Some(event) = rx.recv().await {
                events.push(event);
            }
            events
        })
        .await
        .expect("session did not close")
    }

    async fn next_kind(
        rx: &mut mpsc::UnboundedReceiver<WorkerEvent>,
        kind: EventKind,
    ) -> WorkerEvent {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let event = rx.recv().await.expect("event channel closed");
                if event.kind() == kind {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    fn closed_events(events: &[WorkerEvent]) -> Vec<&Termination> {
        events
            .iter()
            .filter_map(|e| match e {
                WorkerEvent::Closed(t) => Some(t),
                _ => None,
            })
            .collect()
    }

    const EXIT_ON_COMMAND: &str = r#"
printf '{"type":"ready","data":{"message":"Transcriber ready"}}\n'
while read line; do
  case "$line" in
    *'"exit"'*) exit 0 ;;
  esac
  printf '{"type":"status","data":%s}\n' "$line"
done
"#;

    #[tokio::test]
    async fn unexpected_exit_reports_code_once() {
        let (session, mut rx) = spawn_sh(r#"printf '{"type":"ready","data":{}}\n'; exit 1"#);
        let events = collect(&mut rx).await;

        assert_eq!(events.first().map(WorkerEvent::kind), Some(EventKind::Ready));
        assert_eq!(events.last().map(WorkerEvent::kind), Some(EventKind::Closed));
        let closed = closed_events(&events);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].reason, ExitReason::Exited(1));
        assert!(!closed[0].forced_kill);

        assert_eq!(session.state(), LifecycleState::Closed);
        assert_eq!(session.wait_closed().await.reason.code(), Some(1));
    }

    #[tokio::test]
    async fn graceful_exit_within_grace_period() {
        let (session, mut rx) = spawn_sh(EXIT_ON_COMMAND);
        next_kind(&mut rx, EventKind::Ready).await;
        assert_eq!(session.state(), LifecycleState::Ready);

        assert_eq!(session.terminate(), ShutdownOutcome::Initiated);
        assert_eq!(session.terminate(), ShutdownOutcome::InFlight);

        let termination = session.wait_closed().await;
        assert_eq!(termination.reason, ExitReason::Exited(0));
        assert!(!termination.forced_kill);

        // The second terminate must not have queued a second exit request,
        // and nothing was echoed back as status.
        let events = collect(&mut rx).await;
        assert!(events.iter().all(|e| e.kind() != EventKind::Status));
        assert_eq!(closed_events(&events).len(), 1);
        assert_eq!(session.terminate(), ShutdownOutcome::AlreadyClosed);
        assert!(!session.shared.shutdown.kill_requested());
    }

    #[tokio::test]
    async fn exit_with_inherited_stdout_still_open_is_not_killed() {
        // The background sleep keeps stdout open well past the grace period.
        let (session, mut rx) = spawn_sh("(sleep 3) & read line; exit 0");

        assert_eq!(session.terminate(), ShutdownOutcome::Initiated);
        let termination = session.wait_closed().await;
        assert_eq!(termination.reason, ExitReason::Exited(0));
        assert!(!termination.forced_kill);

        // The output drain outlasts the grace period; the timer must stay disarmed.
        tokio::time::sleep(GRACE * 2).await;
        assert!(!session.shared.shutdown.kill_requested());
        assert_eq!(closed_events(&collect(&mut rx).await).len(), 1);
    }

    #[tokio::test]
    async fn unresponsive_worker_is_killed_after_grace() {
        let (session, mut rx) = spawn_sh("while read line; do :; done");
        let started = tokio::time::Instant::now();

        assert_eq!(session.terminate(), ShutdownOutcome::Initiated);
        let termination = session.wait_closed().await;

        assert!(started.elapsed() >= GRACE);
        assert!(termination.forced_kill);
        assert_eq!(termination.reason, ExitReason::Signaled(9));
        assert_eq!(closed_events(&collect(&mut rx).await).len(), 1);
    }

    #[tokio::test]
    async fn commands_are_written_in_order() {
        let (session, mut rx) = spawn_sh(EXIT_ON_COMMAND);

        session.list_devices().unwrap();
        session.initialize(34, "tiny").unwrap();
        session.start_transcription().unwrap();
        session.stop_transcription().unwrap();
        session.terminate();

        let events = collect(&mut rx).await;
        let echoed: Vec<String> = events
            .iter()
            .filter_map(|e| match e {
                WorkerEvent::Status(p) => p.data["command"].as_str().map(str::to_string),
                _ => None,
            })
            .collect();
        assert_eq!(echoed, vec!["list_devices", "initialize", "start", "stop"]);

        let init = events
            .iter()
            .find_map(|e| match e {
                WorkerEvent::Status(p) if p.data["command"] == "initialize" => Some(p),
                _ => None,
            })
            .unwrap();
        assert_eq!(init.data["deviceIndex"], 34);
        assert_eq!(init.data["model"], "tiny");
    }

    #[tokio::test]
    async fn commands_fail_after_close() {
        let (session, mut rx) = spawn_sh("exit 0");
        collect(&mut rx).await;

        assert!(matches!(session.start_transcription(), Err(SessionError::NotAttached)));
        assert_eq!(session.terminate(), ShutdownOutcome::AlreadyClosed);
    }

    #[tokio::test]
    async fn non_protocol_output_becomes_diagnostics() {
        let (_session, mut rx) = spawn_sh(concat!(
            r#"echo "Transcriber booting"; echo "ERROR: no device" >&2; "#,
            r#"printf '{"type":"ready"}\n'"#,
        ));
        let events = collect(&mut rx).await;

        assert!(events.contains(&WorkerEvent::Diagnostic {
            source: OutputSource::Stdout,
            line: "Transcriber booting".to_string(),
        }));
        assert!(events.contains(&WorkerEvent::Diagnostic {
            source: OutputSource::Stderr,
            line: "ERROR: no device".to_string(),
        }));
        let stdout_kinds: Vec<EventKind> = events
            .iter()
            .filter(|e| !matches!(e, WorkerEvent::Diagnostic { source: OutputSource::Stderr, .. }))
            .map(WorkerEvent::kind)
            .collect();
        assert_eq!(
            stdout_kinds,
            vec![EventKind::Diagnostic, EventKind::Ready, EventKind::Closed]
        );
    }

    #[tokio::test]
    async fn final_record_without_newline_is_dispatched() {
        let (session, mut rx) = spawn_sh(r#"printf '{"type":"stopped","data":{}}'"#);
        let kinds: Vec<EventKind> = collect(&mut rx).await.iter().map(WorkerEvent::kind).collect();

        assert_eq!(kinds, vec![EventKind::Stopped, EventKind::Closed]);
        assert_eq!(session.state(), LifecycleState::Closed);
    }
}
