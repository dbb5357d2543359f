//! Shared helpers for the scheduler integration tests.

#![allow(dead_code)]

pub mod logging;

pub use logging::init_test_logging;

use ordsched::{Clock, ScheduleService, TaskHandle, TaskState, WallClock};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Upper bound for any blocking wait in these tests.
pub const WAIT: Duration = Duration::from_secs(30);

pub fn now_ms() -> i64 {
    WallClock.now_ms()
}

/// A task that occupies the consumer thread until released.
///
/// Holding the gate lets a test queue a whole batch before the consumer can
/// pick anything, so the observed order depends only on the ordering keys.
pub struct Gate {
    release: Sender<()>,
    handle: TaskHandle<()>,
}

impl Gate {
    pub fn hold(service: &ScheduleService) -> Self {
        let (release, blocked) = mpsc::channel::<()>();
        let handle = service
            .schedule_at_ms(i64::MIN, None, move || {
                blocked.recv()?;
                Ok(())
            })
            .expect("schedule gate");

        let deadline = Instant::now() + WAIT;
        while handle.state() != TaskState::Running {
            assert!(Instant::now() < deadline, "gate never started");
            std::thread::sleep(Duration::from_millis(1));
        }
        Self { release, handle }
    }

    pub fn release(self) {
        self.release.send(()).expect("release gate");
        self.handle.get_timeout(WAIT).expect("gate finished");
    }
}

/// Shared execution log; each recorded task appends its label when it runs.
#[derive(Clone)]
pub struct ExecLog<T> {
    entries: Arc<Mutex<Vec<T>>>,
}

impl<T: Clone + Send + 'static> ExecLog<T> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A task body that records `label`.
    pub fn record(&self, label: T) -> impl FnOnce() -> anyhow::Result<()> + Send + 'static {
        let entries = Arc::clone(&self.entries);
        move || {
            entries.lock().expect("lock log").push(label);
            Ok(())
        }
    }

    pub fn entries(&self) -> Vec<T> {
        self.entries.lock().expect("lock log").clone()
    }
}
