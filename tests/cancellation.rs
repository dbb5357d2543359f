mod common;

use common::{ExecLog, Gate, WAIT, init_test_logging, now_ms};
use ordsched::{Error, ScheduleService, TaskHandle, TaskState, is_interrupted};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::time::{Duration, Instant};

#[test]
fn cancelled_task_never_runs_and_others_keep_order() {
    init_test_logging();
    let service = ScheduleService::new().expect("start");
    let log = ExecLog::new();
    let base = now_ms() - 1_000;

    let gate = Gate::hold(&service);
    let first = service
        .schedule_at_ms(base, None, log.record("first"))
        .expect("schedule");
    let doomed = service
        .schedule_at_ms(base + 1, None, log.record("doomed"))
        .expect("schedule");
    let last = service
        .schedule_at_ms(base + 2, None, log.record("last"))
        .expect("schedule");

    assert!(doomed.cancel(false));
    assert!(doomed.is_cancelled());
    assert!(doomed.is_done());
    assert_eq!(service.pending_count(), 2);
    gate.release();

    first.get_timeout(WAIT).expect("first");
    last.get_timeout(WAIT).expect("last");
    assert!(matches!(doomed.get(), Err(Error::Cancelled)));
    assert_eq!(log.entries(), vec!["first", "last"]);
}

#[test]
fn cancel_before_delay_elapses() {
    init_test_logging();
    let service = ScheduleService::new().expect("start");
    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);

    let handle = service
        .schedule_at_ms(now_ms() + 100, None, move || {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        })
        .expect("schedule");
    assert!(handle.cancel(true));

    std::thread::sleep(Duration::from_millis(200));
    assert!(!ran.load(Ordering::SeqCst));
    assert!(matches!(handle.get_timeout(WAIT), Err(Error::Cancelled)));
    assert_eq!(service.stats().cancelled, 1);
}

#[test]
fn cancel_after_completion_is_a_no_op() {
    init_test_logging();
    let service = ScheduleService::new().expect("start");
    let handle = service
        .schedule_at_ms(now_ms(), None, || Ok("done"))
        .expect("schedule");

    while !handle.is_done() {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(!handle.cancel(true));
    assert_eq!(handle.state(), TaskState::Done);
    assert_eq!(handle.get().expect("value"), "done");
    assert_eq!(handle.get().expect("value again"), "done");
    assert_eq!(handle.state(), TaskState::Done);
}

#[test]
fn every_waiter_sees_the_same_outcome() {
    init_test_logging();
    let service = ScheduleService::new().expect("start");
    let gate = Gate::hold(&service);
    let handle = Arc::new(
        service
            .schedule_at_ms(now_ms(), None, || Ok(String::from("answer")))
            .expect("schedule"),
    );
    let failed: Arc<TaskHandle<()>> = Arc::new(
        service
            .schedule_at_ms(now_ms(), None, || anyhow::bail!("no answer"))
            .expect("schedule"),
    );

    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let handle = Arc::clone(&handle);
            let failed = Arc::clone(&failed);
            std::thread::spawn(move || {
                let failure = failed.get_timeout(WAIT).map_err(|err| err.to_string());
                (handle.get_timeout(WAIT).expect("value"), failure)
            })
        })
        .collect();
    gate.release();

    for waiter in waiters {
        let (value, failure) = waiter.join().expect("waiter join");
        assert_eq!(value, "answer");
        assert_eq!(failure, Err("Task failed: no answer".to_string()));
    }
    assert_eq!(handle.get().expect("value"), "answer");
}

#[test]
fn running_task_ignores_cancel_without_interrupt() {
    init_test_logging();
    let service = ScheduleService::new().expect("start");
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let handle = service
        .schedule_at_ms(now_ms(), None, move || {
            started_tx.send(())?;
            release_rx.recv()?;
            Ok(5)
        })
        .expect("schedule");

    started_rx.recv_timeout(WAIT).expect("started");
    assert!(!handle.cancel(false));
    assert_eq!(handle.state(), TaskState::Running);

    release_tx.send(()).expect("release");
    assert_eq!(handle.get_timeout(WAIT).expect("value"), 5);
}

#[test]
fn interrupting_a_running_task_is_observable_inside_the_body() {
    init_test_logging();
    let service = ScheduleService::new().expect("start");
    let (started_tx, started_rx) = mpsc::channel();
    let saw_interrupt = Arc::new(AtomicBool::new(false));
    let saw = Arc::clone(&saw_interrupt);

    let handle = service
        .schedule_at_ms(now_ms(), None, move || {
            assert!(!is_interrupted());
            started_tx.send(())?;
            let deadline = Instant::now() + WAIT;
            while !is_interrupted() {
                anyhow::ensure!(Instant::now() < deadline, "never interrupted");
                std::thread::sleep(Duration::from_millis(1));
            }
            saw.store(true, Ordering::SeqCst);
            Ok(())
        })
        .expect("schedule");

    started_rx.recv_timeout(WAIT).expect("started");
    assert!(handle.cancel(true));
    assert!(matches!(handle.get(), Err(Error::Cancelled)));

    // The consumer moves on once the body returns.
    let after = service
        .schedule_at_ms(now_ms(), None, || Ok(is_interrupted()))
        .expect("schedule");
    assert!(!after.get_timeout(WAIT).expect("value"));
    assert!(saw_interrupt.load(Ordering::SeqCst));
    assert!(!is_interrupted());
}

#[test]
fn get_timeout_leaves_the_task_scheduled() {
    init_test_logging();
    let service = ScheduleService::new().expect("start");
    let handle = service
        .schedule_at_ms(now_ms() + 150, None, || Ok(3))
        .expect("schedule");

    assert!(matches!(
        handle.get_timeout(Duration::from_millis(10)),
        Err(Error::Timeout(_))
    ));
    assert_eq!(handle.state(), TaskState::Pending);
    assert_eq!(handle.get_timeout(WAIT).expect("value"), 3);
}

#[test]
fn handle_outlives_service() {
    init_test_logging();
    let handle = {
        let service = ScheduleService::new().expect("start");
        service
            .schedule_at_ms(now_ms() + 3_600_000, None, || Ok(()))
            .expect("schedule")
    };
    assert!(handle.cancel(false));
    assert!(handle.is_cancelled());
}
