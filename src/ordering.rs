//! Total ordering of scheduled tasks.
//!
//! Every submission is stamped with an [`OrderedHandle`]:
//! `(scheduled_ms, received_ms, seq)`, compared lexicographically and
//! ascending. The sequence number is allocated once, when the handle is
//! built, so two submissions with identical timestamps are ordered by the
//! moment their handles were constructed rather than by who won the race to
//! the queue lock.
//!
//! # Invariants
//!
//! - No two handles from one [`SeqCounter`] compare equal.
//! - With equal scheduled and received times, lower `seq` orders first.

use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{self, AtomicU64};

/// Monotonically increasing sequence number for deterministic ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Seq(u64);

impl Seq {
    /// Create the initial sequence value.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Wrap a raw value, e.g. one read back from a log.
    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Get the next sequence value.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Get the raw value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq:{}", self.0)
    }
}

/// Instance-owned source of [`Seq`] values.
///
/// Each `ScheduleService` owns one, so independent services never share
/// sequence space.
#[derive(Debug, Default)]
pub struct SeqCounter {
    next: AtomicU64,
}

impl SeqCounter {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(0),
        }
    }

    /// Allocate the next sequence value. Safe from any thread.
    pub fn allocate(&self) -> Seq {
        Seq(self.next.fetch_add(1, atomic::Ordering::SeqCst))
    }

    /// The value the next call to [`allocate`](Self::allocate) will return.
    #[must_use]
    pub fn peek(&self) -> Seq {
        Seq(self.next.load(atomic::Ordering::SeqCst))
    }
}

/// Ordering key attached to every queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OrderedHandle {
    /// Requested execution time, epoch millis.
    pub scheduled_ms: i64,
    /// Time the scheduling call was accepted, epoch millis.
    pub received_ms: i64,
    /// Final tie-break.
    pub seq: Seq,
}

impl OrderedHandle {
    /// Build a handle, allocating its sequence number from `counter`.
    pub fn stamp(scheduled_ms: i64, received_ms: i64, counter: &SeqCounter) -> Self {
        Self::new(scheduled_ms, received_ms, counter.allocate())
    }

    #[must_use]
    pub const fn new(scheduled_ms: i64, received_ms: i64, seq: Seq) -> Self {
        Self {
            scheduled_ms,
            received_ms,
            seq,
        }
    }
}

impl PartialOrd for OrderedHandle {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedHandle {
    fn cmp(&self, other: &Self) -> Ordering {
        self.scheduled_ms
            .cmp(&other.scheduled_ms)
            .then_with(|| self.received_ms.cmp(&other.received_ms))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl fmt::Display for OrderedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "at={} received={} {}",
            self.scheduled_ms, self.received_ms, self.seq
        )
    }
}
