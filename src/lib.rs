//! Single-threaded delayed-task scheduler with deterministic ordering.
//!
//! Tasks are submitted with a target wall-clock time and run one at a time
//! on a dedicated consumer thread. Selection is a total order over
//! [`OrderedHandle`]s:
//!
//! 1. earlier scheduled time first,
//! 2. then earlier received time (when the `schedule` call was accepted),
//! 3. then lower submission sequence number.
//!
//! ```no_run
//! use chrono::{Duration, Utc};
//! use ordsched::ScheduleService;
//!
//! # fn main() -> ordsched::Result<()> {
//! let service = ScheduleService::new()?;
//! let later = service.schedule(Utc::now() + Duration::milliseconds(200), || Ok("a"))?;
//! let sooner = service.schedule(Utc::now() + Duration::milliseconds(100), || Ok("b"))?;
//! assert_eq!(sooner.get()?, "b");
//! assert_eq!(later.get()?, "a");
//! service.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod delay_queue;
pub mod error;
pub mod handle;
pub mod ordering;
pub mod service;

pub use clock::{Clock, DeterministicClock, WallClock};
pub use config::{SchedulerConfig, ShutdownPolicy};
pub use delay_queue::{PriorityWaitQueue, QueueTelemetry};
pub use error::{Error, Result};
pub use handle::{TaskHandle, TaskState, is_interrupted};
pub use ordering::{OrderedHandle, Seq, SeqCounter};
pub use service::{Lifecycle, ScheduleService, SchedulerStats};
