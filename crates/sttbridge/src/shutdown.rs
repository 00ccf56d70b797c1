//! Two-phase worker shutdown: graceful request, then forced kill.
//!
//! `begin` sends the graceful request once and arms a single timer. The exit
//! watcher calls `disarm` as soon as the process is reaped; if the grace
//! period elapses first the kill token fires and the exit watcher kills the
//! process. `mark_closed` follows once the session has finished draining
//! output. All tokens are one-shot, so there is never more than one kill.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Grace period between the exit request and the forced kill.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Exit requested and kill timer armed by this call.
    Initiated,
    /// A shutdown is already in flight; nothing was sent.
    InFlight,
    /// The worker is already gone (or was never attached).
    AlreadyClosed,
}

#[derive(Debug)]
pub struct ShutdownCoordinator {
    grace: Duration,
    started: AtomicBool,
    exited: CancellationToken,
    closed: CancellationToken,
    kill: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            started: AtomicBool::new(false),
            exited: CancellationToken::new(),
            closed: CancellationToken::new(),
            kill: CancellationToken::new(),
        }
    }

    /// Start shutdown. `request_exit` runs at most once per coordinator.
    ///
    /// Must be called from within a tokio runtime (the timer is a task).
    pub fn begin<F, E>(&self, request_exit: F) -> ShutdownOutcome
    where
        F: FnOnce() -> Result<(), E>,
        E: std::fmt::Display,
    {
        if self.closed.is_cancelled() {
            return ShutdownOutcome::AlreadyClosed;
        }
        if self.started.swap(true, Ordering::AcqRel) {
            tracing::debug!("Shutdown already in flight");
            return ShutdownOutcome::InFlight;
        }

        tracing::info!(grace_ms = self.grace.as_millis() as u64, "Requesting worker exit");
        if let Err(e) = request_exit() {
            // Still arm the timer: a worker that cannot read stdin may never exit on its own.
            tracing::warn!(error = %e, "Failed to send exit request");
        }

        let grace = self.grace;
        let exited = self.exited.clone();
        let kill = self.kill.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = exited.cancelled() => {
                    tracing::debug!("Worker exited within grace period");
                }
                _ = tokio::time::sleep(grace) => {
                    tracing::warn!(
                        grace_ms = grace.as_millis() as u64,
                        "Worker did not exit in time, force killing"
                    );
                    kill.cancel();
                }
            }
        });

        ShutdownOutcome::Initiated
    }

    /// Process reaped. Disarms a pending kill timer.
    pub fn disarm(&self) {
        self.exited.cancel();
    }

    /// Session fully closed. Later `begin` calls are no-ops.
    pub fn mark_closed(&self) {
        self.exited.cancel();
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn is_in_flight(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.is_closed()
    }

    /// Token cancelled once exit has been observed.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Token cancelled when the process must be killed.
    pub fn kill_token(&self) -> CancellationToken {
        self.kill.clone()
    }

    pub fn kill_requested(&self) -> bool {
        self.kill.is_cancelled()
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_PERIOD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting(requests: &AtomicUsize) -> impl FnOnce() -> Result<(), std::io::Error> + '_ {
        move || {
            requests.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn double_terminate_sends_one_request() {
        let coordinator = ShutdownCoordinator::default();
        let requests = AtomicUsize::new(0);

        assert_eq!(coordinator.begin(counting(&requests)), ShutdownOutcome::Initiated);
        assert_eq!(coordinator.begin(counting(&requests)), ShutdownOutcome::InFlight);
        assert_eq!(requests.load(Ordering::SeqCst), 1);
        assert!(coordinator.is_in_flight());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(coordinator.kill_requested());
    }

    #[tokio::test(start_paused = true)]
    async fn kill_fires_after_grace_period() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(2));
        let kill = coordinator.kill_token();
        let requests = AtomicUsize::new(0);

        coordinator.begin(counting(&requests));

        tokio::time::sleep(Duration::from_millis(1999)).await;
        assert!(!kill.is_cancelled());

        tokio::time::sleep(Duration::from_millis(2)).await;
        tokio::task::yield_now().await;
        assert!(kill.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn exit_within_grace_cancels_kill() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(2));
        let requests = AtomicUsize::new(0);

        coordinator.begin(counting(&requests));
        tokio::time::sleep(Duration::from_millis(500)).await;
        coordinator.mark_closed();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!coordinator.kill_requested());
        assert!(!coordinator.is_in_flight());
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_before_close_cancels_kill() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(200));
        let requests = AtomicUsize::new(0);

        coordinator.begin(counting(&requests));
        tokio::time::sleep(Duration::from_millis(50)).await;
        coordinator.disarm();

        // Output still draining: not closed yet, but the kill must never fire.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!coordinator.kill_requested());
        assert!(coordinator.is_in_flight());

        coordinator.mark_closed();
        assert!(!coordinator.is_in_flight());
    }

    #[tokio::test(start_paused = true)]
    async fn terminate_after_close_is_noop() {
        let coordinator = ShutdownCoordinator::default();
        let requests = AtomicUsize::new(0);
        coordinator.mark_closed();

        assert_eq!(coordinator.begin(counting(&requests)), ShutdownOutcome::AlreadyClosed);
        assert_eq!(requests.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!coordinator.kill_requested());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_request_still_arms_timer() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(100));
        let outcome = coordinator.begin(|| Err::<(), _>("stdin closed"));
        assert_eq!(outcome, ShutdownOutcome::Initiated);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(coordinator.kill_requested());
    }
}
