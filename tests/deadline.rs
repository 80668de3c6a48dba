use enviro::{DeadlineRegistry, FaultHandler, Worker};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    done()
}

#[test]
fn test_earlier_deadline_fires_first() {
    let registry = DeadlineRegistry::new();
    let worker = Worker::current();
    let handler = FaultHandler::logging();
    let order = Arc::new(Mutex::new(Vec::new()));

    let late = Arc::clone(&order);
    registry.schedule(&worker, &handler, Duration::from_millis(50), move || {
        late.lock().unwrap().push("late")
    });

    let early = Arc::clone(&order);
    registry.schedule(&worker, &handler, Duration::from_millis(10), move || {
        early.lock().unwrap().push("early")
    });

    assert!(wait_until(Duration::from_secs(2), || order.lock().unwrap().len() == 2));
    assert_eq!(*order.lock().unwrap(), ["early", "late"]);
}

#[test]
fn test_cancel_after_fire_is_noop() {
    let registry = DeadlineRegistry::new();
    let fired = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&fired);
    let handle = registry.schedule(
        &Worker::current(),
        &FaultHandler::logging(),
        Duration::from_millis(5),
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        },
    );

    assert!(wait_until(Duration::from_secs(2), || fired.load(Ordering::SeqCst) == 1));

    assert!(!handle.is_pending());
    assert!(!handle.cancel(), "Cancelling a fired deadline should be a no-op");
    (handle.into_cancel())();

    thread::sleep(Duration::from_millis(20));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn test_cancelled_deadline_never_fires() {
    let registry = DeadlineRegistry::new();
    let fired = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&fired);
    let handle = registry.schedule(
        &Worker::current(),
        &FaultHandler::logging(),
        Duration::from_millis(30),
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        },
    );

    assert!(handle.is_pending());
    assert!(handle.cancel());
    assert!(!handle.cancel());
    assert_eq!(registry.pending(), 0);

    thread::sleep(Duration::from_millis(80));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn test_request_interruption_interrupts_worker() {
    let registry = DeadlineRegistry::new();
    let (tx, rx) = mpsc::channel();

    let target = thread::spawn(move || {
        tx.send(Worker::current()).unwrap();
        thread::park_timeout(Duration::from_secs(5));
    });

    let worker = rx.recv().unwrap();
    registry.request_interruption(&worker, Duration::from_millis(10));

    assert!(wait_until(Duration::from_secs(2), || worker.is_interrupted()));
    target.join().unwrap();
}

#[test]
fn test_panicking_deadline_reports_to_handler() {
    let registry = DeadlineRegistry::new();
    let faults = Arc::new(AtomicUsize::new(0));

    let sink = Arc::clone(&faults);
    let handler = FaultHandler::new(move |_, _| {
        sink.fetch_add(1, Ordering::SeqCst);
    });

    let worker = Worker::current();
    registry.schedule(&worker, &handler, Duration::from_millis(5), || panic!("deadline"));

    assert!(wait_until(Duration::from_secs(2), || faults.load(Ordering::SeqCst) == 1));
}

#[test]
fn test_schedule_after_shutdown_is_abandoned() {
    let registry = DeadlineRegistry::new();
    registry.shutdown();

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    let handle = registry.schedule(
        &Worker::current(),
        &FaultHandler::logging(),
        Duration::ZERO,
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        },
    );

    assert!(!handle.is_pending());
    assert!(!registry.is_armed());

    thread::sleep(Duration::from_millis(20));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn test_same_bucket_fires_all_in_order_despite_panic() {
    let registry = DeadlineRegistry::new();
    let worker = Worker::current();
    let order = Arc::new(Mutex::new(Vec::new()));
    let faults = Arc::new(AtomicUsize::new(0));

    let sink = Arc::clone(&faults);
    let handler = FaultHandler::new(move |_, _| {
        sink.fetch_add(1, Ordering::SeqCst);
    });

    let first = Arc::clone(&order);
    registry.schedule(&worker, &handler, Duration::from_millis(20), move || {
        first.lock().unwrap().push("first")
    });
    registry.schedule(&worker, &handler, Duration::from_millis(20), || panic!("second"));
    let third = Arc::clone(&order);
    registry.schedule(&worker, &handler, Duration::from_millis(20), move || {
        third.lock().unwrap().push("third")
    });

    assert!(wait_until(Duration::from_secs(2), || order.lock().unwrap().len() == 2));
    assert_eq!(*order.lock().unwrap(), ["first", "third"]);
    assert!(wait_until(Duration::from_secs(2), || faults.load(Ordering::SeqCst) == 1));

    thread::sleep(Duration::from_millis(20));
    assert_eq!(faults.load(Ordering::SeqCst), 1);
}

#[test]
fn test_panicking_handler_keeps_deadline_worker_alive() {
    let registry = DeadlineRegistry::new();
    let worker = Worker::current();
    let fired = Arc::new(AtomicUsize::new(0));

    let handler = FaultHandler::new(|_, _| panic!("handler failed"));
    registry.schedule(&worker, &handler, Duration::ZERO, || panic!("action failed"));

    let counter = Arc::clone(&fired);
    registry.schedule(&worker, &handler, Duration::from_millis(5), move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    assert!(wait_until(Duration::from_secs(2), || fired.load(Ordering::SeqCst) == 1));
    assert_eq!(registry.pending(), 0);
}

#[test]
fn test_unbounded_delay_registers_without_firing() {
    let registry = DeadlineRegistry::new();
    let fired = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&fired);
    let handle = registry.schedule(
        &Worker::current(),
        &FaultHandler::logging(),
        Duration::MAX,
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        },
    );

    assert!(handle.is_pending());
    thread::sleep(Duration::from_millis(20));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert!(handle.cancel());
}
