//! Caller-facing task handles and the type-erased items the consumer runs.
//!
//! A submitted task and its [`TaskHandle`] share one result cell. The
//! consumer thread moves the cell `Pending -> Running -> Done | Failed`;
//! the handle can move it `Pending -> Cancelled` (and, when asked to
//! interrupt, `Running -> Cancelled`). Whoever changes the state first under
//! the cell lock wins, so a task cancelled between dequeue and start is
//! skipped without running its body.
//!
//! A finished cell keeps its outcome; every `get` returns a copy of the same
//! value or the same failure.

use crate::delay_queue::Unschedule;
use crate::error::{Error, Result};
use crate::ordering::OrderedHandle;
use std::any::Any;
use std::cell::RefCell;
use std::error::Error as StdError;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

thread_local! {
    static RUNNING_INTERRUPT: RefCell<Option<Arc<AtomicBool>>> = const { RefCell::new(None) };
}

/// Whether the task currently running on this thread was cancelled with
/// `interrupt_if_running = true`.
///
/// Long-running task bodies poll this to stop early. Always `false` outside
/// a scheduled task.
#[must_use]
pub fn is_interrupted() -> bool {
    RUNNING_INTERRUPT.with(|slot| {
        slot.borrow()
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    })
}

struct InterruptScope;

impl InterruptScope {
    fn enter(flag: &Arc<AtomicBool>) -> Self {
        RUNNING_INTERRUPT.with(|slot| *slot.borrow_mut() = Some(Arc::clone(flag)));
        Self
    }
}

impl Drop for InterruptScope {
    fn drop(&mut self) {
        RUNNING_INTERRUPT.with(|slot| *slot.borrow_mut() = None);
    }
}

/// Observable lifecycle of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Pending,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl TaskState {
    /// Done, failed and cancelled are all terminal.
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

/// A stored task failure that can be reported any number of times.
enum Failure {
    Error(Arc<dyn StdError + Send + Sync>),
    Panic(String),
}

impl Failure {
    fn to_error(&self) -> Error {
        match self {
            Self::Error(source) => Error::TaskFailed(Arc::clone(source)),
            Self::Panic(message) => Error::panicked(message.clone()),
        }
    }
}

enum Slot<V> {
    Pending,
    Running,
    Done(V),
    Failed(Failure),
    Cancelled,
}

impl<V> Slot<V> {
    const fn state(&self) -> TaskState {
        match self {
            Self::Pending => TaskState::Pending,
            Self::Running => TaskState::Running,
            Self::Done(_) => TaskState::Done,
            Self::Failed(_) => TaskState::Failed,
            Self::Cancelled => TaskState::Cancelled,
        }
    }
}

impl<V: Clone> Slot<V> {
    /// Copy of the outcome. Only called once the slot is finished.
    fn outcome(&self) -> Result<V> {
        match self {
            Self::Done(value) => Ok(value.clone()),
            Self::Failed(failure) => Err(failure.to_error()),
            Self::Pending | Self::Running | Self::Cancelled => Err(Error::Cancelled),
        }
    }
}

struct TaskCell<V> {
    slot: Mutex<Slot<V>>,
    finished: Condvar,
    interrupt: Arc<AtomicBool>,
}

impl<V> TaskCell<V> {
    fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Pending),
            finished: Condvar::new(),
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot<V>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `Pending -> Running`. `false` if the task was cancelled first.
    fn begin(&self) -> bool {
        let mut slot = self.lock();
        if matches!(*slot, Slot::Pending) {
            *slot = Slot::Running;
            true
        } else {
            false
        }
    }

    /// Store the outcome unless the task was cancelled while running.
    ///
    /// `observe` sees the final [`RunOutcome`] while the cell is still
    /// locked, before any waiter can read the result.
    fn complete(
        &self,
        outcome: std::result::Result<V, Failure>,
        kind: RunOutcome,
        observe: &dyn Fn(RunOutcome),
    ) -> RunOutcome {
        let mut slot = self.lock();
        if !matches!(*slot, Slot::Running) {
            observe(RunOutcome::Discarded);
            return RunOutcome::Discarded;
        }
        *slot = match outcome {
            Ok(value) => Slot::Done(value),
            Err(failure) => Slot::Failed(failure),
        };
        observe(kind);
        drop(slot);
        self.finished.notify_all();
        kind
    }

    /// `Pending -> Cancelled`.
    fn cancel_pending(&self) -> bool {
        let mut slot = self.lock();
        if !matches!(*slot, Slot::Pending) {
            return false;
        }
        *slot = Slot::Cancelled;
        drop(slot);
        self.finished.notify_all();
        true
    }
}

/// How a dequeued item ended on the consumer thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed,
    Panicked,
    /// Cancelled after dequeue but before the body started.
    Skipped,
    /// Cancelled with interruption while running; the result was dropped.
    Discarded,
}

trait Runnable: Send {
    fn run(self: Box<Self>, order: &OrderedHandle, observe: &dyn Fn(RunOutcome)) -> RunOutcome;
    fn cancel(&self) -> bool;
}

struct ScheduledTask<V, F> {
    cell: Arc<TaskCell<V>>,
    work: F,
}

impl<V, F> Runnable for ScheduledTask<V, F>
where
    V: Send + 'static,
    F: FnOnce() -> anyhow::Result<V> + Send + 'static,
{
    fn run(self: Box<Self>, order: &OrderedHandle, observe: &dyn Fn(RunOutcome)) -> RunOutcome {
        let Self { cell, work } = *self;
        if !cell.begin() {
            observe(RunOutcome::Skipped);
            return RunOutcome::Skipped;
        }

        let result = {
            let _scope = InterruptScope::enter(&cell.interrupt);
            panic::catch_unwind(AssertUnwindSafe(work))
        };

        let (outcome, kind) = match result {
            Ok(Ok(value)) => (Ok(value), RunOutcome::Completed),
            Ok(Err(err)) => {
                tracing::warn!(
                    event = "scheduler.task.failed",
                    %order,
                    error = %err,
                    "Task returned an error"
                );
                let source: Box<dyn StdError + Send + Sync> = err.into();
                (Err(Failure::Error(Arc::from(source))), RunOutcome::Failed)
            }
            Err(payload) => {
                let message = panic_message(&*payload);
                tracing::warn!(
                    event = "scheduler.task.panicked",
                    %order,
                    panic = %message,
                    "Task panicked"
                );
                (Err(Failure::Panic(message)), RunOutcome::Panicked)
            }
        };

        cell.complete(outcome, kind, observe)
    }

    fn cancel(&self) -> bool {
        self.cell.cancel_pending()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// A task waiting in the queue, paired with its ordering key.
pub struct QueuedItem {
    order: OrderedHandle,
    task: Box<dyn Runnable>,
}

impl QueuedItem {
    #[must_use]
    pub const fn order(&self) -> &OrderedHandle {
        &self.order
    }

    /// Run the task on the calling thread, storing its outcome in the handle.
    pub fn run(self) -> RunOutcome {
        self.run_observed(&|_| {})
    }

    /// Like [`run`](Self::run), reporting the outcome to `observe` before
    /// the handle can see the result.
    pub fn run_observed(self, observe: &dyn Fn(RunOutcome)) -> RunOutcome {
        self.task.run(&self.order, observe)
    }

    /// Cancel the task if it has not started.
    pub fn cancel(&self) -> bool {
        self.task.cancel()
    }
}

impl fmt::Debug for QueuedItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedItem")
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}

/// Build a queued item and the handle bound to it.
///
/// `scheduler` is asked to drop the item from its queue when the handle
/// cancels a pending task.
pub(crate) fn bind<V, F>(
    order: OrderedHandle,
    work: F,
    scheduler: Weak<dyn Unschedule>,
) -> (QueuedItem, TaskHandle<V>)
where
    V: Send + 'static,
    F: FnOnce() -> anyhow::Result<V> + Send + 'static,
{
    let cell = Arc::new(TaskCell::new());
    let item = QueuedItem {
        order,
        task: Box::new(ScheduledTask {
            cell: Arc::clone(&cell),
            work,
        }),
    };
    let handle = TaskHandle {
        cell,
        order,
        scheduler,
    };
    (item, handle)
}

/// Result and cancellation handle for a scheduled task.
///
/// [`get`](Self::get) and [`get_timeout`](Self::get_timeout) may be called
/// any number of times, from any thread holding a reference; each returns a
/// clone of the stored value or the same failure.
pub struct TaskHandle<V> {
    cell: Arc<TaskCell<V>>,
    order: OrderedHandle,
    scheduler: Weak<dyn Unschedule>,
}

impl<V: Clone> TaskHandle<V> {
    /// Block until the task finishes and return its outcome.
    pub fn get(&self) -> Result<V> {
        let mut slot = self.cell.lock();
        while !slot.state().is_finished() {
            slot = self
                .cell
                .finished
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
        slot.outcome()
    }

    /// Like [`get`](Self::get), giving up with [`Error::Timeout`] after
    /// `timeout`. A timeout leaves the task untouched.
    pub fn get_timeout(&self, timeout: Duration) -> Result<V> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return self.get();
        };

        let mut slot = self.cell.lock();
        while !slot.state().is_finished() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout(timeout));
            }
            slot = match self.cell.finished.wait_timeout(slot, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        slot.outcome()
    }
}

impl<V> TaskHandle<V> {
    /// Cancel the task.
    ///
    /// A pending task is removed from the queue and never runs. A running
    /// task is only affected when `interrupt_if_running` is set: its handle
    /// turns cancelled, [`is_interrupted`] starts returning `true` inside the
    /// body, and whatever it eventually returns is dropped. Returns `false`
    /// when nothing changed.
    pub fn cancel(&self, interrupt_if_running: bool) -> bool {
        let mut slot = self.cell.lock();
        let was = slot.state();
        match was {
            TaskState::Pending => *slot = Slot::Cancelled,
            TaskState::Running if interrupt_if_running => {
                *slot = Slot::Cancelled;
                self.cell.interrupt.store(true, Ordering::Release);
            }
            _ => return false,
        }
        drop(slot);
        self.cell.finished.notify_all();

        let dequeued = was == TaskState::Pending
            && self
                .scheduler
                .upgrade()
                .is_some_and(|scheduler| scheduler.unschedule(&self.order));
        tracing::debug!(
            event = "scheduler.task.cancel",
            order = %self.order,
            was = ?was,
            dequeued,
            "Task cancelled"
        );
        true
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state().is_finished()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state() == TaskState::Cancelled
    }

    #[must_use]
    pub fn state(&self) -> TaskState {
        self.cell.lock().state()
    }

    /// The ordering key this task was stamped with.
    #[must_use]
    pub const fn order(&self) -> &OrderedHandle {
        &self.order
    }
}

impl<V> fmt::Debug for TaskHandle<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("order", &self.order)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
