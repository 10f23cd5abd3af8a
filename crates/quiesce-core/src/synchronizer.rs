//! The UI-thread synchronizer.
//!
//! [`Synchronizer`] is the single gate between driver-facing code and the
//! application's UI state. Work handed to it is queued for the UI thread,
//! held there until the app is quiescent (no tracked activity, every idling
//! resource idle), then run, and its result is handed back to the caller.
//!
//! # Task lifecycle
//!
//! ```text
//! Queued -> IdleWait -> Executing -> Completed
//!              |            \------> Failed      (body panicked)
//!              \-------------------> TimedOut    (never went idle, or the caller gave up)
//! ```
//!
//! The caller waits with a deadline. When the deadline passes first the caller
//! returns [`SyncError::SynchronizationTimeout`] with the busy set, and the
//! task left in the queue notices its caller is gone and is discarded without
//! running its body.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use quiesce_core::engine::SyncEngine;
//! use quiesce_core::config::SyncConfig;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = SyncEngine::start(SyncConfig::default())?;
//! let label = engine
//!     .synchronizer()
//!     .execute_sync(|| "hello".to_string(), Duration::from_secs(5))
//!     .await?;
//! assert_eq!(label, "hello");
//! # Ok(())
//! # }
//! ```

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info_span, trace, warn, Span};

use crate::config::SyncConfig;
use crate::idling::{BusyResource, IdlingResourceRegistry};
use crate::poller::{wait_until, PollOutcome};
use crate::tracker::{AppStateTracker, TrackingError};
use crate::ui_thread::{Pump, QueuedTask, UiHandle, UiThreadStopped};

/// How often a blocking caller checks for its task's result.
const BLOCKING_RECV_INTERVAL: Duration = Duration::from_millis(5);

/// Errors surfaced to callers of the synchronizer.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The app did not become idle before the deadline.
    #[error(
        "synchronization timed out after {}ms; busy: [{}]",
        .waited.as_millis(),
        join_busy(.busy)
    )]
    SynchronizationTimeout {
        waited: Duration,
        busy: Vec<BusyResource>,
    },

    /// Synchronized work was requested from the UI thread itself.
    #[error("synchronized execution requested from the UI thread; this would deadlock")]
    ReentrantSynchronizationError,

    /// The task body panicked.
    #[error("task failed: {0}")]
    TaskFailed(String),

    /// The UI thread stopped before the task finished.
    #[error(transparent)]
    UiThreadStopped(#[from] UiThreadStopped),

    /// The tracker rejected an operation.
    #[error(transparent)]
    InvalidTrackingState(#[from] TrackingError),
}

fn join_busy(busy: &[BusyResource]) -> String {
    busy.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Where a synchronized task is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    IdleWait,
    Executing,
    Completed,
    TimedOut,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::TimedOut | TaskState::Failed)
    }

    fn advance(&mut self, next: TaskState) {
        use TaskState::*;
        debug_assert!(
            matches!(
                (*self, next),
                (Queued, IdleWait)
                    | (Queued, Executing)
                    | (Queued, TimedOut)
                    | (Queued, Failed)
                    | (IdleWait, Executing)
                    | (IdleWait, TimedOut)
                    | (IdleWait, Failed)
                    | (Executing, Completed)
                    | (Executing, Failed)
            ),
            "illegal task transition {self:?} -> {next:?}"
        );
        trace!(from = ?*self, to = ?next, "task state");
        *self = next;
    }
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

/// The derived idle state of the application.
///
/// Nothing is cached: every call consults the tracker and the registry at
/// that instant.
#[derive(Debug, Clone)]
pub struct AppState {
    registry: Arc<IdlingResourceRegistry>,
    tracker: Arc<AppStateTracker>,
}

impl AppState {
    pub fn new(registry: Arc<IdlingResourceRegistry>, tracker: Arc<AppStateTracker>) -> Self {
        Self { registry, tracker }
    }

    /// Idle iff nothing is tracked and every idling resource is idle.
    pub fn is_idle(&self) -> bool {
        self.tracker.is_idle() && self.registry.is_everything_idle()
    }

    /// Everything currently keeping the app busy: activities first, then
    /// resources.
    pub fn busy_resources(&self) -> Vec<BusyResource> {
        let mut busy = self.tracker.busy_resources();
        busy.extend(self.registry.busy_resources());
        busy
    }

    pub fn registry(&self) -> &Arc<IdlingResourceRegistry> {
        &self.registry
    }

    pub fn tracker(&self) -> &Arc<AppStateTracker> {
        &self.tracker
    }
}

// ---------------------------------------------------------------------------
// SynchronizedTask
// ---------------------------------------------------------------------------

type TaskResult<T> = Result<T, SyncError>;

struct SynchronizedTask<T> {
    body: Box<dyn FnOnce() -> T + Send>,
    reply: oneshot::Sender<TaskResult<T>>,
    submitted_at: Instant,
    deadline: Instant,
    wait_for_idle: bool,
    poll_interval: Duration,
    app: AppState,
    span: Span,
}

impl<T: Send + 'static> QueuedTask for SynchronizedTask<T> {
    fn run(self: Box<Self>, pump: &mut Pump<'_>) {
        let SynchronizedTask {
            body,
            reply,
            submitted_at,
            deadline,
            wait_for_idle,
            poll_interval,
            app,
            span,
        } = *self;
        let _entered = span.enter();
        let mut state = TaskState::Queued;

        if reply.is_closed() {
            state.advance(TaskState::TimedOut);
            warn!("caller already timed out, discarding task");
            return;
        }

        if wait_for_idle {
            state.advance(TaskState::IdleWait);
            let remaining = deadline.saturating_duration_since(Instant::now());
            let outcome = wait_until(
                || {
                    pump.pump();
                    pump.is_stopping() || reply.is_closed() || app.is_idle()
                },
                poll_interval,
                remaining,
            );

            if pump.is_stopping() {
                state.advance(TaskState::Failed);
                let _ = reply.send(Err(SyncError::UiThreadStopped(UiThreadStopped)));
                return;
            }
            if reply.is_closed() {
                state.advance(TaskState::TimedOut);
                warn!("caller timed out during idle wait, discarding task");
                return;
            }
            if outcome == PollOutcome::TimedOut {
                state.advance(TaskState::TimedOut);
                let busy = app.busy_resources();
                warn!(busy = %join_busy(&busy), "app never became idle");
                let _ = reply.send(Err(SyncError::SynchronizationTimeout {
                    waited: submitted_at.elapsed(),
                    busy,
                }));
                return;
            }
        }

        state.advance(TaskState::Executing);
        let started = Instant::now();
        let result = match catch_unwind(AssertUnwindSafe(body)) {
            Ok(value) => {
                state.advance(TaskState::Completed);
                Ok(value)
            }
            Err(payload) => {
                state.advance(TaskState::Failed);
                let message = panic_message(payload.as_ref());
                warn!(error = %message, "task body panicked");
                Err(SyncError::TaskFailed(message))
            }
        };
        debug!(
            queued_ms = started.duration_since(submitted_at).as_millis() as u64,
            run_ms = started.elapsed().as_millis() as u64,
            state = ?state,
            "task finished"
        );

        if reply.send(result).is_err() {
            warn!("caller timed out while the task ran, result discarded");
        }
    }

    fn abort(self: Box<Self>) {
        let SynchronizedTask { reply, span, .. } = *self;
        span.in_scope(|| debug!("UI thread stopping, task aborted"));
        let _ = reply.send(Err(SyncError::UiThreadStopped(UiThreadStopped)));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked".to_string()
    }
}

// ---------------------------------------------------------------------------
// Synchronizer
// ---------------------------------------------------------------------------

/// Runs work on the UI thread once the application is idle.
///
/// Cheap to clone; clones share the same queue and idle sources.
#[derive(Clone)]
pub struct Synchronizer {
    ui: UiHandle,
    app: AppState,
    config: Arc<SyncConfig>,
    next_task_id: Arc<AtomicU64>,
}

impl Synchronizer {
    pub fn new(ui: UiHandle, app: AppState, config: SyncConfig) -> Self {
        Self {
            ui,
            app,
            config: Arc::new(config),
            next_task_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn app_state(&self) -> &AppState {
        &self.app
    }

    pub fn ui_handle(&self) -> &UiHandle {
        &self.ui
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn default_timeout(&self) -> Duration {
        self.config.default_timeout()
    }

    /// Returns `true` if the app is idle right now.
    pub fn is_idle(&self) -> bool {
        self.app.is_idle()
    }

    /// Everything currently keeping the app busy.
    pub fn busy_resources(&self) -> Vec<BusyResource> {
        self.app.busy_resources()
    }

    /// Runs `body` on the UI thread once the app is idle and returns its
    /// result.
    ///
    /// # Errors
    ///
    /// - [`SyncError::ReentrantSynchronizationError`] when called on the UI thread
    /// - [`SyncError::SynchronizationTimeout`] when `timeout` passes first
    /// - [`SyncError::TaskFailed`] when `body` panics
    /// - [`SyncError::UiThreadStopped`] when the UI thread is gone
    pub async fn execute_sync<F, T>(&self, body: F, timeout: Duration) -> Result<T, SyncError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.check_not_ui_thread()?;
        let rx = self.enqueue(body, timeout)?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SyncError::UiThreadStopped(UiThreadStopped)),
            // The receiver was dropped with the timeout future, so the
            // queued task will see a closed channel and skip itself.
            Err(_) => Err(self.timeout_error(timeout)),
        }
    }

    /// Blocking form of [`execute_sync`](Self::execute_sync) for callers that
    /// are not async, such as a test thread.
    pub fn execute_sync_blocking<F, T>(&self, body: F, timeout: Duration) -> Result<T, SyncError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.check_not_ui_thread()?;
        let mut rx = self.enqueue(body, timeout)?;
        let mut received = None;
        wait_until(
            || match rx.try_recv() {
                Err(oneshot::error::TryRecvError::Empty) => false,
                other => {
                    received = Some(other);
                    true
                }
            },
            BLOCKING_RECV_INTERVAL,
            timeout,
        );
        match received {
            Some(Ok(result)) => result,
            Some(Err(_)) => Err(SyncError::UiThreadStopped(UiThreadStopped)),
            None => {
                drop(rx);
                Err(self.timeout_error(timeout))
            }
        }
    }

    /// Queues `body` without waiting for it.
    ///
    /// The task is bounded by the default timeout. Dropping the returned
    /// handle before the task starts cancels it.
    pub fn execute_async<F, T>(&self, body: F) -> Result<TaskHandle<T>, SyncError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let timeout = self.default_timeout();
        let rx = self.enqueue(body, timeout)?;
        Ok(TaskHandle {
            rx,
            timeout,
            deadline: tokio::time::Instant::now() + timeout,
            app: self.app.clone(),
        })
    }

    /// Waits until the app is idle, as observed from the UI thread.
    pub async fn wait_for_idle(&self, timeout: Duration) -> Result<(), SyncError> {
        self.execute_sync(|| (), timeout).await
    }

    fn check_not_ui_thread(&self) -> Result<(), SyncError> {
        if self.ui.is_ui_thread() {
            warn!("synchronized execution requested from the UI thread");
            return Err(SyncError::ReentrantSynchronizationError);
        }
        Ok(())
    }

    fn enqueue<F, T>(&self, body: F, timeout: Duration) -> Result<oneshot::Receiver<TaskResult<T>>, SyncError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let task_id = self.next_task_id.fetch_add(1, Ordering::SeqCst);
        let span = info_span!("sync_task", task_id, timeout_ms = timeout.as_millis() as u64);
        let (reply, rx) = oneshot::channel();
        let submitted_at = Instant::now();
        let task = SynchronizedTask {
            body: Box::new(body),
            reply,
            submitted_at,
            deadline: submitted_at + timeout,
            wait_for_idle: self.config.synchronization_enabled,
            poll_interval: self.config.poll_interval(),
            app: self.app.clone(),
            span,
        };
        self.ui.submit(Box::new(task))?;
        Ok(rx)
    }

    fn timeout_error(&self, waited: Duration) -> SyncError {
        let busy = self.app.busy_resources();
        warn!(waited_ms = waited.as_millis() as u64, busy = %join_busy(&busy), "synchronization timed out");
        SyncError::SynchronizationTimeout { waited, busy }
    }
}

impl std::fmt::Debug for Synchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synchronizer")
            .field("ui", &self.ui)
            .field("poll_interval", &self.config.poll_interval())
            .field("synchronization_enabled", &self.config.synchronization_enabled)
            .finish()
    }
}

/// Handle to a task queued with [`Synchronizer::execute_async`].
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<TaskResult<T>>,
    timeout: Duration,
    deadline: tokio::time::Instant,
    app: AppState,
}

impl<T> TaskHandle<T> {
    /// Waits for the task's result, bounded by the task's own deadline.
    pub async fn join(self) -> Result<T, SyncError> {
        match tokio::time::timeout_at(self.deadline, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SyncError::UiThreadStopped(UiThreadStopped)),
            Err(_) => Err(SyncError::SynchronizationTimeout {
                waited: self.timeout,
                busy: self.app.busy_resources(),
            }),
        }
    }
}
