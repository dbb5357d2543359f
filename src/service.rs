//! The scheduling façade: stamps submissions, feeds the queue and owns the
//! single consumer thread.
//!
//! # Invariants
//!
//! - Exactly one thread ever executes task bodies.
//! - Tasks run in ascending [`OrderedHandle`] order among those queued when
//!   the consumer picks its next item.
//! - A task failure or panic is stored in its handle and never stops the
//!   consumer.
//! - After `shutdown()` no new task is accepted and, under
//!   [`ShutdownPolicy::Drain`], every queued task still runs before the
//!   service reports terminated.

use crate::clock::{Clock, WallClock, delay_ms, to_epoch_ms};
use crate::config::{SchedulerConfig, ShutdownPolicy};
use crate::delay_queue::{PriorityWaitQueue, QueueTelemetry, Unschedule};
use crate::error::{Error, Result};
use crate::handle::{self, QueuedItem, RunOutcome, TaskHandle};
use crate::ordering::{OrderedHandle, SeqCounter};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Lifecycle of the consumer thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Running,
    ShuttingDown,
    Terminated,
}

/// Service counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    pub scheduled: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub pending: usize,
    pub queue: QueueTelemetry,
}

#[derive(Debug, Default)]
struct Counters {
    scheduled: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn record(&self, outcome: RunOutcome) {
        let counter = match outcome {
            RunOutcome::Completed => &self.completed,
            RunOutcome::Failed | RunOutcome::Panicked => &self.failed,
            RunOutcome::Skipped | RunOutcome::Discarded => &self.cancelled,
        };
        Self::bump(counter, 1);
    }
}

struct Inner<C: Clock> {
    queue: PriorityWaitQueue<QueuedItem, C>,
    seq: SeqCounter,
    accepting: AtomicBool,
    stop_now: AtomicBool,
    config: SchedulerConfig,
    lifecycle: Mutex<Lifecycle>,
    terminated: Condvar,
    counters: Counters,
}

impl<C: Clock> Inner<C> {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin_shutdown(&self) {
        let mut lifecycle = self.lifecycle();
        if *lifecycle == Lifecycle::Running {
            *lifecycle = Lifecycle::ShuttingDown;
        }
    }

    fn mark_terminated(&self) {
        *self.lifecycle() = Lifecycle::Terminated;
        self.terminated.notify_all();
    }

    /// Cancel and drop everything still queued. Returns how many handles
    /// turned cancelled.
    fn cancel_queued(&self) -> usize {
        let cancelled = self
            .queue
            .drain()
            .into_iter()
            .filter(|(_, item)| item.cancel())
            .count();
        Counters::bump(
            &self.counters.cancelled,
            u64::try_from(cancelled).unwrap_or(u64::MAX),
        );
        cancelled
    }

    fn execute(&self, item: QueuedItem) {
        let order = *item.order();
        tracing::trace!(
            event = "scheduler.task.execute",
            %order,
            now_ms = self.queue.clock().now_ms(),
            "Executing task"
        );

        // Counted under the task's cell lock, so a caller woken by `get`
        // already sees the updated stats.
        item.run_observed(&|outcome| self.counters.record(outcome));
    }
}

impl<C: Clock> Unschedule for Inner<C> {
    fn unschedule(&self, order: &OrderedHandle) -> bool {
        let removed = self.queue.unschedule(order);
        if removed {
            Counters::bump(&self.counters.cancelled, 1);
        }
        removed
    }
}

fn consumer_loop<C: Clock>(inner: &Inner<C>) {
    tracing::debug!(event = "scheduler.consumer.start", "Consumer started");
    loop {
        match inner.queue.take_next_due() {
            Ok(Some(item)) => inner.execute(item),
            Ok(None) => break,
            Err(err) => {
                if inner.stop_now.load(Ordering::Acquire) {
                    break;
                }
                tracing::debug!(
                    event = "scheduler.consumer.wake",
                    error = %err,
                    "Consumer wait interrupted, resuming"
                );
            }
        }
    }
    inner.mark_terminated();
    tracing::info!(
        event = "scheduler.terminated",
        completed = inner.counters.completed.load(Ordering::Relaxed),
        failed = inner.counters.failed.load(Ordering::Relaxed),
        cancelled = inner.counters.cancelled.load(Ordering::Relaxed),
        "Consumer stopped"
    );
}

/// Single-threaded delayed-task scheduler.
///
/// Tasks run one at a time on a dedicated thread, ordered by scheduled
/// time, then received time, then submission sequence.
pub struct ScheduleService<C: Clock = WallClock> {
    inner: Arc<Inner<C>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl ScheduleService<WallClock> {
    /// Start a service with default configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(SchedulerConfig::default())
    }

    /// Start a service configured from `ORDSCHED_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::with_config(SchedulerConfig::from_env())
    }

    pub fn with_config(config: SchedulerConfig) -> Result<Self> {
        Self::with_clock(WallClock, config)
    }
}

impl<C: Clock> ScheduleService<C> {
    /// Start a service reading "now" from `clock`.
    pub fn with_clock(clock: C, config: SchedulerConfig) -> Result<Self> {
        config.validate()?;
        let inner = Arc::new(Inner {
            queue: PriorityWaitQueue::with_clock(clock),
            seq: SeqCounter::new(),
            accepting: AtomicBool::new(true),
            stop_now: AtomicBool::new(false),
            config,
            lifecycle: Mutex::new(Lifecycle::Running),
            terminated: Condvar::new(),
            counters: Counters::default(),
        });

        let worker = Arc::clone(&inner);
        let consumer = thread::Builder::new()
            .name(inner.config.thread_name.clone())
            .spawn(move || consumer_loop(&worker))?;

        tracing::debug!(
            event = "scheduler.start",
            thread = %inner.config.thread_name,
            policy = ?inner.config.shutdown_policy,
            "Scheduler started"
        );

        Ok(Self {
            inner,
            consumer: Mutex::new(Some(consumer)),
        })
    }

    /// Run `task` at `at`, with "now" read from the service clock.
    pub fn schedule<V, F>(&self, at: DateTime<Utc>, task: F) -> Result<TaskHandle<V>>
    where
        V: Send + 'static,
        F: FnOnce() -> anyhow::Result<V> + Send + 'static,
    {
        self.schedule_at_ms(to_epoch_ms(at), None, task)
    }

    /// Run `task` at `at`, treating `now` as the time the call was received.
    ///
    /// Lets tests pin received times instead of racing the real clock.
    pub fn schedule_with_now<V, F>(
        &self,
        at: DateTime<Utc>,
        task: F,
        now: DateTime<Utc>,
    ) -> Result<TaskHandle<V>>
    where
        V: Send + 'static,
        F: FnOnce() -> anyhow::Result<V> + Send + 'static,
    {
        self.schedule_at_ms(to_epoch_ms(at), Some(to_epoch_ms(now)), task)
    }

    /// Millisecond-level entry point behind [`schedule`](Self::schedule).
    ///
    /// `received_ms` defaults to the clock's current time.
    pub fn schedule_at_ms<V, F>(
        &self,
        target_ms: i64,
        received_ms: Option<i64>,
        task: F,
    ) -> Result<TaskHandle<V>>
    where
        V: Send + 'static,
        F: FnOnce() -> anyhow::Result<V> + Send + 'static,
    {
        let received_ms = received_ms.unwrap_or_else(|| self.inner.queue.clock().now_ms());
        if !self.inner.accepting.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }

        let order = OrderedHandle::stamp(target_ms, received_ms, &self.inner.seq);
        let weak = Arc::downgrade(&self.inner);
        let scheduler: Weak<dyn Unschedule> = weak;
        let (item, handle) = handle::bind(order, task, scheduler);
        self.inner.queue.insert(order, item)?;
        Counters::bump(&self.inner.counters.scheduled, 1);

        tracing::trace!(
            event = "scheduler.task.enqueue",
            %order,
            delay_ms = delay_ms(target_ms, received_ms),
            "Task scheduled"
        );
        Ok(handle)
    }

    /// Stop accepting new tasks.
    ///
    /// Under [`ShutdownPolicy::Drain`] queued tasks keep running in order;
    /// under [`ShutdownPolicy::DiscardPending`] they are cancelled. The
    /// consumer exits once the queue is empty. Idempotent.
    pub fn shutdown(&self) {
        let first = self.inner.accepting.swap(false, Ordering::AcqRel);
        self.inner.begin_shutdown();
        self.inner.queue.shutdown();

        let discarded = match self.inner.config.shutdown_policy {
            ShutdownPolicy::Drain => 0,
            ShutdownPolicy::DiscardPending => self.inner.cancel_queued(),
        };

        if first {
            tracing::info!(
                event = "scheduler.shutdown",
                policy = ?self.inner.config.shutdown_policy,
                pending = self.inner.queue.len(),
                discarded,
                "Scheduler shutting down"
            );
        }
    }

    /// Stop accepting, cancel every queued task and wake the consumer so it
    /// exits without waiting on a far-future head. A task already running
    /// finishes. Returns the number of tasks cancelled.
    pub fn shutdown_now(&self) -> usize {
        self.inner.accepting.store(false, Ordering::Release);
        self.inner.stop_now.store(true, Ordering::Release);
        self.inner.begin_shutdown();
        self.inner.queue.shutdown();
        let cancelled = self.inner.cancel_queued();
        self.inner.queue.interrupt();

        tracing::info!(
            event = "scheduler.shutdown_now",
            cancelled,
            "Scheduler stopping immediately"
        );
        cancelled
    }

    /// Wait up to `timeout` for the consumer to exit. Returns `true` once it
    /// has terminated.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut lifecycle = self.inner.lifecycle();
        while *lifecycle != Lifecycle::Terminated {
            let remaining = deadline.map_or(Duration::MAX, |deadline| {
                deadline.saturating_duration_since(Instant::now())
            });
            if remaining.is_zero() {
                return false;
            }
            lifecycle = match self.inner.terminated.wait_timeout(lifecycle, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        drop(lifecycle);

        let consumer = self
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(consumer) = consumer {
            if consumer.join().is_err() {
                tracing::warn!(event = "scheduler.consumer.join", "Consumer thread panicked");
            }
        }
        true
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        !self.inner.accepting.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.lifecycle() == Lifecycle::Terminated
    }

    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        *self.inner.lifecycle()
    }

    /// Tasks queued and not yet taken by the consumer.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.queue.len()
    }

    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        let counters = &self.inner.counters;
        let queue = self.inner.queue.snapshot();
        SchedulerStats {
            scheduled: counters.scheduled.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            cancelled: counters.cancelled.load(Ordering::Relaxed),
            pending: queue.depth,
            queue,
        }
    }

    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn clock(&self) -> &C {
        self.inner.queue.clock()
    }

    /// Wake the consumer so it re-reads the clock. Only needed with a
    /// manually driven clock.
    pub fn notify_clock_changed(&self) {
        self.inner.queue.recheck();
    }
}

impl<C: Clock> Drop for ScheduleService<C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<C: Clock> fmt::Debug for ScheduleService<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduleService")
            .field("lifecycle", &self.lifecycle())
            .field("pending", &self.pending_count())
            .field("next_seq", &self.inner.seq.peek())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}
