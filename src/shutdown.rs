//! Graceful shutdown management for the producer and consumer tasks

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Extra time granted past the grace period before loops are aborted
const ABORT_MARGIN: Duration = Duration::from_millis(250);

/// Shutdown progress of one task
#[derive(Debug)]
pub struct ShutdownState {
    /// Whether shutdown has been initiated
    shutting_down: AtomicBool,
    /// Whether the task's loops have finished
    shutdown_complete: AtomicBool,
    /// Shutdown initiated timestamp
    shutdown_start: RwLock<Option<Instant>>,
    /// Accepted messages the task gave up on while stopping
    dropped_messages: AtomicU64,
}

impl ShutdownState {
    /// Create a new shutdown state
    pub fn new() -> Self {
        Self {
            shutting_down: AtomicBool::new(false),
            shutdown_complete: AtomicBool::new(false),
            shutdown_start: RwLock::new(None),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Begin the shutdown process, returning `false` if it had already begun
    pub fn begin_shutdown(&self) -> bool {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return false;
        }
        *self.shutdown_start.write() = Some(Instant::now());
        true
    }

    /// Check if shutdown is in progress
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Mark the task as finished
    pub fn complete_shutdown(&self) {
        self.shutdown_complete.store(true, Ordering::SeqCst);
        if let Some(duration) = self.shutdown_duration() {
            debug!("Shutdown completed in {:?}", duration);
        }
    }

    /// Check if shutdown is complete
    pub fn is_shutdown_complete(&self) -> bool {
        self.shutdown_complete.load(Ordering::SeqCst)
    }

    /// Record accepted messages that were never handed to the broker
    pub fn record_dropped(&self, count: u64) {
        self.dropped_messages.fetch_add(count, Ordering::SeqCst);
    }

    /// Accepted messages dropped so far
    pub fn dropped_messages(&self) -> u64 {
        self.dropped_messages.load(Ordering::SeqCst)
    }

    /// Get the duration since shutdown started
    pub fn shutdown_duration(&self) -> Option<Duration> {
        let start = *self.shutdown_start.read();
        start.map(|start| start.elapsed())
    }
}

impl Default for ShutdownState {
    fn default() -> Self {
        Self::new()
    }
}

/// How the background loops of a task ended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Loops that returned on their own
    pub completed: usize,
    /// Loops that ended with a panic
    pub panicked: usize,
    /// Loops still running at the deadline, now aborted
    pub abandoned: usize,
    /// Accepted messages dropped because the grace period ran out
    pub dropped_messages: u64,
}

impl ShutdownReport {
    /// True when every loop returned normally and nothing accepted was lost
    pub fn is_clean(&self) -> bool {
        self.panicked == 0 && self.abandoned == 0 && self.dropped_messages == 0
    }
}

/// Shutdown signal and completion handle shared by a task's loops
#[derive(Debug)]
pub struct TaskShutdown {
    name: &'static str,
    token: CancellationToken,
    state: Arc<ShutdownState>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    grace: Duration,
}

impl TaskShutdown {
    /// Create a shutdown handle that also fires when `parent` is cancelled
    pub fn new(name: &'static str, parent: &CancellationToken, grace: Duration) -> Self {
        Self {
            name,
            token: parent.child_token(),
            state: Arc::new(ShutdownState::new()),
            handles: Mutex::new(Vec::new()),
            grace,
        }
    }

    /// Token observed by the task's loops
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Shared shutdown state
    pub fn state(&self) -> Arc<ShutdownState> {
        self.state.clone()
    }

    /// Register a loop to be awaited on shutdown
    pub fn track(&self, handle: JoinHandle<()>) {
        self.handles.lock().push(handle);
    }

    /// Signal shutdown. Repeated calls only cancel an already cancelled token.
    pub fn signal(&self) {
        if self.state.begin_shutdown() {
            info!(task = self.name, "Shutdown signalled");
        } else {
            debug!(task = self.name, "Shutdown already signalled");
        }
        self.token.cancel();
    }

    /// Whether shutdown was signalled here or by the parent token
    pub fn is_signalled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Time the loops get to finish their work once signalled
    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Whether the task's loops have finished
    pub fn is_complete(&self) -> bool {
        self.state.is_shutdown_complete()
    }

    /// Wait for the tracked loops, aborting those still running after the grace period
    pub async fn wait(&self) -> ShutdownReport {
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        // Loops enforce the grace period themselves; the margin lets them report first
        let deadline = Instant::now() + self.grace + ABORT_MARGIN;
        let mut report = ShutdownReport::default();

        for mut handle in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => report.completed += 1,
                Ok(Err(e)) if e.is_panic() => {
                    error!(task = self.name, "Task loop panicked: {}", e);
                    report.panicked += 1;
                }
                Ok(Err(e)) => {
                    warn!(task = self.name, "Task loop cancelled: {}", e);
                    report.completed += 1;
                }
                Err(_) => {
                    warn!(
                        task = self.name,
                        grace = ?self.grace,
                        "Task loop did not finish within grace period, abandoning"
                    );
                    handle.abort();
                    report.abandoned += 1;
                }
            }
        }

        report.dropped_messages = self.state.dropped_messages();
        info!(
            task = self.name,
            completed = report.completed,
            panicked = report.panicked,
            abandoned = report.abandoned,
            dropped_messages = report.dropped_messages,
            "Shutdown finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_state() {
        let state = ShutdownState::new();

        assert!(!state.is_shutting_down());
        assert!(!state.is_shutdown_complete());

        assert!(state.begin_shutdown());
        assert!(state.is_shutting_down());
        assert!(!state.begin_shutdown());
        assert!(state.shutdown_duration().is_some());

        state.complete_shutdown();
        assert!(state.is_shutdown_complete());
    }

    #[tokio::test]
    async fn test_signal_twice_is_noop() {
        let parent = CancellationToken::new();
        let shutdown = TaskShutdown::new("test", &parent, Duration::from_secs(1));

        shutdown.signal();
        shutdown.signal();
        assert!(shutdown.is_signalled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_signal_after_loop_exit_still_cancels() {
        let parent = CancellationToken::new();
        let shutdown = TaskShutdown::new("test", &parent, Duration::from_secs(1));

        // A loop that ended on its own marks the state before anyone signals
        assert!(shutdown.state().begin_shutdown());
        shutdown.state().complete_shutdown();

        shutdown.signal();
        assert!(shutdown.is_signalled());
    }

    #[tokio::test]
    async fn test_dropped_messages_make_report_unclean() {
        let parent = CancellationToken::new();
        let shutdown = TaskShutdown::new("test", &parent, Duration::from_secs(1));
        shutdown.state().record_dropped(3);

        shutdown.signal();
        let report = shutdown.wait().await;
        assert_eq!(report.dropped_messages, 3);
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn test_parent_cancellation_propagates() {
        let parent = CancellationToken::new();
        let shutdown = TaskShutdown::new("test", &parent, Duration::from_secs(1));

        parent.cancel();
        assert!(shutdown.is_signalled());
    }

    #[tokio::test]
    async fn test_wait_collects_loops() {
        let parent = CancellationToken::new();
        let shutdown = TaskShutdown::new("test", &parent, Duration::from_secs(1));
        let token = shutdown.token();
        shutdown.track(tokio::spawn(async move { token.cancelled().await }));

        shutdown.signal();
        let report = shutdown.wait().await;
        assert_eq!(report.completed, 1);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_wait_abandons_stuck_loop() {
        let parent = CancellationToken::new();
        let shutdown = TaskShutdown::new("test", &parent, Duration::from_millis(50));
        shutdown.track(tokio::spawn(std::future::pending::<()>()));

        shutdown.signal();
        let report = shutdown.wait().await;
        assert_eq!(report.abandoned, 1);
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn test_wait_reports_panic() {
        let parent = CancellationToken::new();
        let shutdown = TaskShutdown::new("test", &parent, Duration::from_secs(1));
        shutdown.track(tokio::spawn(async { panic!("handler failed") }));

        let report = shutdown.wait().await;
        assert_eq!(report.panicked, 1);
    }
}
