//! Delay-aware priority queue with a single blocking consumer.
//!
//! Items are keyed by [`OrderedHandle`] and kept in a `BTreeMap`, so the head
//! is always the smallest handle and removal of an arbitrary not-yet-taken
//! item is `O(log n)`. An item is *due* once its scheduled time is at or
//! before the clock's "now"; [`PriorityWaitQueue::take_next_due`] never hands
//! out an item before that point.
//!
//! The consumer blocks on a `Condvar` with a timeout equal to the head's
//! remaining delay. Every wake (insert of a new head, removal of the head,
//! shutdown, timeout or spurious) re-reads the head and recomputes the delay
//! before deciding anything.

use crate::clock::{Clock, WallClock, delay_ms};
use crate::error::{Error, Result};
use crate::ordering::OrderedHandle;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Removal seam used by task handles to pull their item out of a queue
/// without knowing the queue's item or clock types.
pub trait Unschedule: Send + Sync {
    /// Remove the item keyed by `order`. Returns `false` if it was already
    /// taken or removed.
    fn unschedule(&self, order: &OrderedHandle) -> bool;
}

/// Point-in-time queue counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueTelemetry {
    /// Items currently queued.
    pub depth: usize,
    /// Largest depth observed since creation.
    pub max_depth_seen: usize,
    /// Successful inserts.
    pub inserted_total: u64,
    /// Items removed without being taken (cancel, drain).
    pub removed_total: u64,
    /// Items handed to the consumer as due.
    pub taken_total: u64,
    /// Scheduled time of the head, if any.
    pub next_deadline_ms: Option<i64>,
    /// Whether inserts are rejected.
    pub shutdown: bool,
}

struct QueueState<T> {
    items: BTreeMap<OrderedHandle, T>,
    shutdown: bool,
    interrupted: bool,
    max_depth_seen: usize,
    inserted_total: u64,
    removed_total: u64,
    taken_total: u64,
}

impl<T> QueueState<T> {
    const fn new() -> Self {
        Self {
            items: BTreeMap::new(),
            shutdown: false,
            interrupted: false,
            max_depth_seen: 0,
            inserted_total: 0,
            removed_total: 0,
            taken_total: 0,
        }
    }

    fn head(&self) -> Option<OrderedHandle> {
        self.items.first_key_value().map(|(order, _)| *order)
    }
}

/// Unbounded, thread-safe min-priority queue gated on item due time.
pub struct PriorityWaitQueue<T, C: Clock = WallClock> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
    clock: C,
}

impl<T> PriorityWaitQueue<T, WallClock> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(WallClock)
    }
}

impl<T> Default for PriorityWaitQueue<T, WallClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, C: Clock> PriorityWaitQueue<T, C> {
    #[must_use]
    pub fn with_clock(clock: C) -> Self {
        Self {
            state: Mutex::new(QueueState::new()),
            available: Condvar::new(),
            clock,
        }
    }

    /// The clock used to decide whether the head is due.
    pub const fn clock(&self) -> &C {
        &self.clock
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert an item. Wakes the consumer if the item is the new head.
    ///
    /// Fails with [`Error::Shutdown`] once [`shutdown`](Self::shutdown) has
    /// been called.
    pub fn insert(&self, order: OrderedHandle, item: T) -> Result<()> {
        let mut state = self.lock();
        if state.shutdown {
            return Err(Error::Shutdown);
        }

        let new_head = state.head().is_none_or(|head| order < head);
        state.items.insert(order, item);
        state.inserted_total = state.inserted_total.saturating_add(1);
        state.max_depth_seen = state.max_depth_seen.max(state.items.len());
        let depth = state.items.len();
        drop(state);

        tracing::trace!(
            event = "scheduler.queue.insert",
            %order,
            depth,
            new_head,
            "Item queued"
        );

        if new_head {
            self.available.notify_all();
        }
        Ok(())
    }

    /// Block until the head is due, then remove and return it.
    ///
    /// Returns `Ok(None)` once the queue is shut down and empty, and
    /// `Err(Error::Interrupted)` if [`interrupt`](Self::interrupt) is called
    /// while (or before) waiting.
    pub fn take_next_due(&self) -> Result<Option<T>> {
        let mut state = self.lock();
        loop {
            if state.interrupted {
                state.interrupted = false;
                tracing::debug!(event = "scheduler.queue.interrupted", "Wait interrupted");
                return Err(Error::Interrupted);
            }

            let Some(head) = state.head() else {
                if state.shutdown {
                    return Ok(None);
                }
                tracing::trace!(event = "scheduler.queue.wait", "Queue empty, parking");
                state = self
                    .available
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
                continue;
            };

            let now = self.clock.now_ms();
            let delay = delay_ms(head.scheduled_ms, now);
            if delay == 0 {
                if let Some((order, item)) = state.items.pop_first() {
                    state.taken_total = state.taken_total.saturating_add(1);
                    tracing::trace!(
                        event = "scheduler.queue.take",
                        %order,
                        now_ms = now,
                        "Head due"
                    );
                    return Ok(Some(item));
                }
                continue;
            }

            tracing::trace!(
                event = "scheduler.queue.wait",
                head = %head,
                delay_ms = delay,
                "Waiting for head"
            );
            state = match self
                .available
                .wait_timeout(state, Duration::from_millis(delay))
            {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Remove and return the head if it is due, without blocking.
    pub fn try_take_due(&self) -> Option<T> {
        let mut state = self.lock();
        let head = state.head()?;
        if delay_ms(head.scheduled_ms, self.clock.now_ms()) > 0 {
            return None;
        }
        let (_, item) = state.items.pop_first()?;
        state.taken_total = state.taken_total.saturating_add(1);
        Some(item)
    }

    /// Remove a specific not-yet-taken item.
    pub fn remove(&self, order: &OrderedHandle) -> Option<T> {
        let mut state = self.lock();
        let was_head = state.head().as_ref() == Some(order);
        let item = state.items.remove(order)?;
        state.removed_total = state.removed_total.saturating_add(1);
        drop(state);

        tracing::trace!(event = "scheduler.queue.remove", %order, was_head, "Item removed");
        if was_head {
            self.available.notify_all();
        }
        Some(item)
    }

    /// Stop accepting inserts and wake the consumer. Queued items stay and
    /// keep draining in order.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.shutdown = true;
        let depth = state.items.len();
        drop(state);
        tracing::debug!(event = "scheduler.queue.shutdown", depth, "Queue closed");
        self.available.notify_all();
    }

    /// Make the current or next blocking [`take_next_due`](Self::take_next_due)
    /// return [`Error::Interrupted`].
    pub fn interrupt(&self) {
        self.lock().interrupted = true;
        self.available.notify_all();
    }

    /// Wake the consumer so it re-reads the clock. Needed after moving a
    /// manually driven clock forward.
    pub fn recheck(&self) {
        let _guard = self.lock();
        self.available.notify_all();
    }

    /// Remove every queued item, in order.
    pub fn drain(&self) -> Vec<(OrderedHandle, T)> {
        let mut state = self.lock();
        let items = std::mem::take(&mut state.items);
        state.removed_total = state
            .removed_total
            .saturating_add(u64::try_from(items.len()).unwrap_or(u64::MAX));
        drop(state);
        self.available.notify_all();
        items.into_iter().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }

    /// Scheduled time of the head, if any.
    #[must_use]
    pub fn next_deadline_ms(&self) -> Option<i64> {
        self.lock().head().map(|head| head.scheduled_ms)
    }

    /// Milliseconds until the head is due, if any.
    #[must_use]
    pub fn time_until_next_ms(&self) -> Option<u64> {
        self.next_deadline_ms()
            .map(|deadline| delay_ms(deadline, self.clock.now_ms()))
    }

    #[must_use]
    pub fn snapshot(&self) -> QueueTelemetry {
        let state = self.lock();
        QueueTelemetry {
            depth: state.items.len(),
            max_depth_seen: state.max_depth_seen,
            inserted_total: state.inserted_total,
            removed_total: state.removed_total,
            taken_total: state.taken_total,
            next_deadline_ms: state.head().map(|head| head.scheduled_ms),
            shutdown: state.shutdown,
        }
    }
}

impl<T: Send, C: Clock> Unschedule for PriorityWaitQueue<T, C> {
    fn unschedule(&self, order: &OrderedHandle) -> bool {
        self.remove(order).is_some()
    }
}

impl<T, C: Clock> fmt::Debug for PriorityWaitQueue<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("PriorityWaitQueue")
            .field("depth", &state.items.len())
            .field("head", &state.head())
            .field("shutdown", &state.shutdown)
            .field("interrupted", &state.interrupted)
            .finish_non_exhaustive()
    }
}
