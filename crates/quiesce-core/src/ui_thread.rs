//! The application's UI-owning thread.
//!
//! All UI mutation and query work runs on one designated OS thread. The
//! thread runs a small event loop over a [`crossbeam_channel`] queue:
//!
//! - **Jobs** posted by application code ([`UiHandle::post`],
//!   [`UiHandle::post_delayed`]) run as soon as they are due.
//! - **Synchronized tasks** submitted by the synchronizer run strictly in
//!   submission order. While one of them waits for idle it keeps pumping the
//!   queue, so the application's own jobs keep running (and can bring the app
//!   to idle) but a later synchronized task never overtakes an earlier one.
//!
//! Nothing else ever executes on this thread, which is what lets the
//! synchronizer promise that a task body observes the idle state it waited
//! for.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use thiserror::Error;
use tracing::{debug, error, info, trace};

/// Name given to the UI-owning OS thread.
pub const UI_THREAD_NAME: &str = "quiesce-ui";

/// A unit of application work for the UI thread.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// The UI thread has shut down and no longer accepts work.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("UI thread is not running")]
pub struct UiThreadStopped;

/// Work that the event loop runs in FIFO order and that may pump the loop
/// while it is running.
pub(crate) trait QueuedTask: Send {
    /// Runs the task on the UI thread.
    fn run(self: Box<Self>, pump: &mut Pump<'_>);

    /// Called instead of [`run`](Self::run) when the loop shuts down first.
    fn abort(self: Box<Self>);
}

enum Message {
    Post(Job),
    PostDelayed { due: Instant, job: Job },
    Task(Box<dyn QueuedTask>),
    Shutdown,
}

// ---------------------------------------------------------------------------
// UiHandle
// ---------------------------------------------------------------------------

/// Cloneable handle for submitting work to the UI thread.
#[derive(Clone)]
pub struct UiHandle {
    tx: Sender<Message>,
    thread_id: ThreadId,
}

impl UiHandle {
    /// Queues `job` to run on the UI thread.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) -> Result<(), UiThreadStopped> {
        self.send(Message::Post(Box::new(job)))
    }

    /// Queues `job` to run on the UI thread once `delay` has passed.
    pub fn post_delayed(
        &self,
        delay: Duration,
        job: impl FnOnce() + Send + 'static,
    ) -> Result<(), UiThreadStopped> {
        self.send(Message::PostDelayed {
            due: Instant::now() + delay,
            job: Box::new(job),
        })
    }

    /// Returns `true` when called from the UI thread itself.
    pub fn is_ui_thread(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub(crate) fn submit(&self, task: Box<dyn QueuedTask>) -> Result<(), UiThreadStopped> {
        self.send(Message::Task(task))
    }

    fn send(&self, message: Message) -> Result<(), UiThreadStopped> {
        self.tx.send(message).map_err(|_| UiThreadStopped)
    }
}

impl std::fmt::Debug for UiHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UiHandle")
            .field("thread_id", &self.thread_id)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// UiThread
// ---------------------------------------------------------------------------

/// Owner of the UI thread. Dropping it stops the loop and joins the thread.
pub struct UiThread {
    handle: UiHandle,
    join_handle: Option<JoinHandle<()>>,
}

impl UiThread {
    /// Spawns the UI thread and starts its event loop.
    pub fn spawn() -> std::io::Result<Self> {
        let (tx, rx) = unbounded();
        let join_handle = std::thread::Builder::new()
            .name(UI_THREAD_NAME.to_string())
            .spawn(move || MainLoop::new(rx).run())?;
        let handle = UiHandle {
            tx,
            thread_id: join_handle.thread().id(),
        };
        info!(thread = UI_THREAD_NAME, "UI thread started");
        Ok(Self {
            handle,
            join_handle: Some(join_handle),
        })
    }

    pub fn handle(&self) -> UiHandle {
        self.handle.clone()
    }

    /// Stops the loop after the work already queued ahead of the request and
    /// waits for the thread to exit. Synchronized tasks still queued behind it
    /// are aborted.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        let _ = self.handle.tx.send(Message::Shutdown);
        if let Some(join_handle) = self.join_handle.take() {
            if self.handle.is_ui_thread() {
                // Joining ourselves would deadlock; the loop exits on its own.
                return;
            }
            if join_handle.join().is_err() {
                error!("UI thread panicked");
            }
            info!("UI thread stopped");
        }
    }
}

impl Drop for UiThread {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

struct Timer {
    due: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    // Reversed so the max-heap pops the earliest timer first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct MainLoop {
    rx: Receiver<Message>,
    timers: BinaryHeap<Timer>,
    tasks: VecDeque<Box<dyn QueuedTask>>,
    next_timer_seq: u64,
    stopping: bool,
}

impl MainLoop {
    fn new(rx: Receiver<Message>) -> Self {
        Self {
            rx,
            timers: BinaryHeap::new(),
            tasks: VecDeque::new(),
            next_timer_seq: 0,
            stopping: false,
        }
    }

    fn run(mut self) {
        loop {
            while let Some(task) = self.tasks.pop_front() {
                if self.stopping {
                    task.abort();
                    continue;
                }
                task.run(&mut Pump { main_loop: &mut self });
            }
            if self.stopping {
                break;
            }

            self.run_due_timers();
            let message = match self.timers.peek() {
                Some(timer) => {
                    let wait = timer.due.saturating_duration_since(Instant::now());
                    match self.rx.recv_timeout(wait) {
                        Ok(message) => message,
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match self.rx.recv() {
                    Ok(message) => message,
                    Err(_) => break,
                },
            };
            self.dispatch(message);
        }

        for task in self.tasks.drain(..) {
            task.abort();
        }
        for message in self.rx.try_iter() {
            if let Message::Task(task) = message {
                task.abort();
            }
        }
        debug!(dropped_timers = self.timers.len(), "UI event loop exited");
    }

    fn dispatch(&mut self, message: Message) {
        match message {
            Message::Post(job) => run_job(job),
            Message::PostDelayed { due, job } => {
                self.next_timer_seq += 1;
                self.timers.push(Timer {
                    due,
                    seq: self.next_timer_seq,
                    job,
                });
            }
            Message::Task(task) => self.tasks.push_back(task),
            Message::Shutdown => {
                trace!("shutdown requested");
                self.stopping = true;
            }
        }
    }

    fn run_due_timers(&mut self) {
        let now = Instant::now();
        while self.timers.peek().map_or(false, |timer| timer.due <= now) {
            if let Some(timer) = self.timers.pop() {
                run_job(timer.job);
            }
        }
    }

    /// Runs everything that is ready without blocking.
    fn pump(&mut self) {
        while let Ok(message) = self.rx.try_recv() {
            self.dispatch(message);
        }
        self.run_due_timers();
    }
}

fn run_job(job: Job) {
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        error!("UI job panicked");
    }
}

/// Access to the event loop for a running [`QueuedTask`].
pub(crate) struct Pump<'a> {
    main_loop: &'a mut MainLoop,
}

impl Pump<'_> {
    /// Runs ready jobs and due timers. Synchronized tasks that arrive are
    /// queued behind the current one.
    pub(crate) fn pump(&mut self) {
        self.main_loop.pump();
    }

    /// Returns `true` once a shutdown has been requested.
    pub(crate) fn is_stopping(&self) -> bool {
        self.main_loop.stopping
    }
}
