use super::*;
use crossbeam_channel::unbounded;
use std::time::Duration;

fn pool(threads: usize, backlog: usize) -> Executor {
    Executor::with_capacity(Arc::new(InterruptService::new()), threads, backlog)
}

#[test]
fn submit_and_join() {
    let executor = pool(2, 16);
    let handle = executor.submit(|| 40 + 2);
    assert_eq!(handle.join().unwrap(), 42);
    executor.shutdown(Duration::from_secs(1));
}

#[test]
fn nested_submissions_do_not_deadlock() {
    // a plain 3-thread pool starves itself on this chain
    fn chain(executor: &Arc<Executor>, depth: u32) -> u32 {
        let mut value = 1;
        if depth > 1 {
            let nested = Arc::clone(executor);
            let handle = executor.submit(move || chain(&nested, depth - 1));
            value += handle.join().unwrap();
        }
        value
    }
    let executor = Arc::new(pool(3, 300));
    let nested = Arc::clone(&executor);
    let handle = executor.submit(move || chain(&nested, 7));
    assert_eq!(handle.join().unwrap(), 7);
    executor.shutdown(Duration::from_secs(1));
}

#[test]
fn panics_propagate_to_join() {
    let executor = pool(1, 16);
    let handle = executor.submit(|| panic!("boom"));
    match handle.join() {
        Err(JoinError::Panicked(message)) => assert!(message.contains("boom")),
        other => panic!("unexpected outcome: {other:?}"),
    }
    // the worker survives the panic
    assert_eq!(executor.submit(|| 7).join().unwrap(), 7);
    executor.shutdown(Duration::from_secs(1));
}

#[test]
fn saturated_backlog_runs_on_the_caller() {
    let executor = pool(1, 1);
    let (started_tx, started_rx) = unbounded();
    let (release_tx, release_rx) = unbounded::<()>();
    let blocker = executor.submit(move || {
        started_tx.send(()).unwrap();
        release_rx.recv().unwrap();
    });
    started_rx.recv().unwrap();
    // the single worker is parked in the blocker; this one fills the backlog
    let filler = executor.submit(|| ());
    let caller = thread::current().id();
    let inline = executor.submit(move || thread::current().id());
    assert_eq!(inline.join().unwrap(), caller);
    release_tx.send(()).unwrap();
    blocker.join().unwrap();
    filler.join().unwrap();
    executor.shutdown(Duration::from_secs(1));
}

#[test]
fn join_timeout_expires() {
    let executor = pool(1, 16);
    let (started_tx, started_rx) = unbounded();
    let (release_tx, release_rx) = unbounded::<()>();
    let slow = executor.submit(move || {
        started_tx.send(()).unwrap();
        release_rx.recv().unwrap();
        5
    });
    started_rx.recv().unwrap();
    match slow.join_timeout(Duration::from_millis(50)) {
        Err(JoinError::TimedOut) => {}
        other => panic!("unexpected outcome: {other:?}"),
    }
    release_tx.send(()).unwrap();
    executor.shutdown(Duration::from_secs(1));
}

#[test]
fn shutdown_cancels_tasks_that_never_ran() {
    let executor = pool(1, 8);
    let (started_tx, started_rx) = unbounded();
    let (release_tx, release_rx) = unbounded::<()>();
    let blocker = executor.submit(move || {
        started_tx.send(()).unwrap();
        release_rx.recv().unwrap();
    });
    started_rx.recv().unwrap();
    let queued = executor.submit(|| 1);
    executor.shutdown(Duration::from_millis(50));
    match queued.join() {
        Err(JoinError::Cancelled) => {}
        other => panic!("unexpected outcome: {other:?}"),
    }
    release_tx.send(()).unwrap();
    blocker.join().unwrap();
}
