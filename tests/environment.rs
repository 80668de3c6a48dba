use enviro::{ConcurrencyService, EnvironmentRegistry, Fault, FaultHandler, Priority, Worker};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

fn service() -> ConcurrencyService {
    ConcurrencyService::builder()
        .multithreaded(true)
        .build()
        .unwrap()
}

#[test]
fn test_same_key_returns_same_environment() {
    let registry = EnvironmentRegistry::default();
    let worker = Worker::current();
    let handler = FaultHandler::logging();

    let first = registry.get(&worker, &handler);
    let second = registry.get(&worker, &handler);

    assert!(Arc::ptr_eq(&first, &second), "Same key should yield the same environment");
}

#[test]
fn test_distinct_handlers_get_distinct_environments() {
    let registry = EnvironmentRegistry::default();
    let worker = Worker::current();

    let a = registry.get(&worker, &FaultHandler::new(|_, _| {}));
    let b = registry.get(&worker, &FaultHandler::new(|_, _| {}));

    assert!(!Arc::ptr_eq(&a, &b));
    assert_eq!(registry.len(), 2);
}

#[test]
fn test_queues_run_in_fifo_order() {
    let service = service();
    let order = Arc::new(Mutex::new(Vec::new()));

    for i in 1..=3 {
        let order = Arc::clone(&order);
        service.run_deferred(move || order.lock().unwrap().push(format!("d{i}")));
    }
    for i in 1..=3 {
        let order = Arc::clone(&order);
        service.run_eventually(move || order.lock().unwrap().push(format!("e{i}")));
    }

    assert!(service.flush(&Worker::current(), Duration::from_secs(5)));
    assert_eq!(
        *order.lock().unwrap(),
        ["d1", "d2", "d3", "e1", "e2", "e3"],
        "Deferred actions run before eventually actions, each in push order"
    );
}

#[test]
fn test_flush_drains_hundred_deferred_actions() {
    let service = service();
    let ran = Arc::new(AtomicUsize::new(0));

    for _ in 0..100 {
        let ran = Arc::clone(&ran);
        service.run_deferred(move || {
            ran.fetch_add(1, Ordering::SeqCst);
        });
    }

    assert!(service.flush(&Worker::current(), Duration::from_secs(5)));
    assert_eq!(ran.load(Ordering::SeqCst), 100);

    let pending = service.current_environment().pending();
    assert_eq!(pending.deferred, 0);
    assert_eq!(pending.eventually, 0);
    assert_eq!(pending.finally, 0);
}

#[test]
fn test_deferred_pushed_while_draining_runs_in_same_flush() {
    let service = service();
    let ran = Arc::new(AtomicUsize::new(0));

    let inner_service = service.clone();
    let inner_ran = Arc::clone(&ran);
    service.run_eventually(move || {
        inner_service.run_deferred(move || {
            inner_ran.fetch_add(1, Ordering::SeqCst);
        });
    });

    assert!(service.flush(&Worker::current(), Duration::from_secs(5)));
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn test_maybe_shutdown_destroys_idle_environment() {
    let registry = EnvironmentRegistry::default();
    let worker = Worker::current();
    let handler = FaultHandler::logging();

    let env = registry.get(&worker, &handler);
    assert!(env.maybe_shutdown(), "Idle environment should be destroyed");
    assert!(env.is_destroyed());

    let fresh = registry.get(&worker, &handler);
    assert!(!Arc::ptr_eq(&env, &fresh), "Lookup after destroy should create a new environment");
    assert!(!fresh.is_destroyed());
}

#[test]
fn test_maybe_shutdown_keeps_busy_environment() {
    let registry = EnvironmentRegistry::default();
    let env = registry.get(&Worker::current(), &FaultHandler::logging());

    env.push_eventually(|| {});

    assert!(!env.maybe_shutdown());
    assert!(!env.is_destroyed());
}

#[test]
fn test_finally_runs_once_on_destroy() {
    let registry = EnvironmentRegistry::default();
    let env = registry.get(&Worker::current(), &FaultHandler::logging());
    let ran = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&ran);
    env.push_finally(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    assert!(env.destroy(Duration::from_secs(1)));
    assert!(env.destroy(Duration::from_secs(1)));
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn test_push_after_destroy_is_discarded() {
    let registry = EnvironmentRegistry::default();
    let env = registry.get(&Worker::current(), &FaultHandler::logging());
    env.destroy(Duration::ZERO);

    let ran = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ran);
    env.push_deferred(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    assert!(env.pending().is_idle());
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[test]
fn test_monitors_fire_by_priority() {
    let registry = EnvironmentRegistry::default();
    let env = registry.get(&Worker::current(), &FaultHandler::logging());
    let order = Arc::new(Mutex::new(Vec::new()));

    for (priority, label) in [
        (Priority::Low, "low"),
        (Priority::High, "high"),
        (Priority::Medium, "medium"),
    ] {
        let order = Arc::clone(&order);
        env.monitor(priority, || true, move || order.lock().unwrap().push(label));
    }

    assert_eq!(env.poll_monitors(), 3);
    assert_eq!(*order.lock().unwrap(), ["high", "medium", "low"]);
    assert_eq!(env.pending().monitors, 0);
}

#[test]
fn test_panicking_action_goes_to_fault_handler() {
    let faults = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&faults);
    let handler = FaultHandler::new(move |_, fault| sink.lock().unwrap().push(fault.clone()));

    let registry = EnvironmentRegistry::default();
    let env = registry.get(&Worker::current(), &handler);

    env.push_deferred(|| panic!("boom"));
    assert!(env.flush(Duration::from_secs(1)));

    assert_eq!(
        *faults.lock().unwrap(),
        [Fault::Panicked {
            message: "boom".to_owned()
        }]
    );
}

#[test]
fn test_terminated_worker_reported_at_creation() {
    let service = service();
    let worker = service.spawn(|| {}).unwrap();
    worker.join();

    let faults = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&faults);
    let handler = FaultHandler::new(move |_, fault| sink.lock().unwrap().push(fault.clone()));

    let env = service.environments().get(&worker, &handler);

    assert!(!env.is_destroyed(), "Creation should not fail");
    assert_eq!(*faults.lock().unwrap(), [Fault::Terminated]);
}

#[test]
fn test_environment_start_time_is_stable() {
    let service = service();
    let current = Worker::current();

    let first = service.environment_start_time(&current);
    let second = service.environment_start_time(&current);

    assert_eq!(first, second);
}

#[test]
fn test_exited_thread_environment_is_swept() {
    let service = service();
    let ran = Arc::new(AtomicUsize::new(0));

    let (tx, rx) = mpsc::channel();
    let remote = service.clone();
    let counter = Arc::clone(&ran);
    thread::spawn(move || {
        remote.run_deferred(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        tx.send(Worker::current()).unwrap();
    })
    .join()
    .unwrap();

    let foreign = rx.recv().unwrap();
    assert!(foreign.join_timeout(Duration::from_secs(5)));
    assert!(service.environments().find(&foreign).is_some());

    let current = service.current_environment();

    assert!(service.environments().find(&foreign).is_none());
    assert_eq!(service.environments().len(), 1);
    assert!(Arc::ptr_eq(&current, &service.current_environment()));
    assert_eq!(ran.load(Ordering::SeqCst), 0, "Deferred work of an exited thread is discarded");
}
