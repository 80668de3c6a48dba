use enviro::{ConcurrencyService, Worker};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn service() -> ConcurrencyService {
    ConcurrencyService::builder()
        .multithreaded(true)
        .build()
        .unwrap()
}

#[test]
fn test_flush_times_out_on_slow_member() {
    let service = service();

    let sleeper = service.clone();
    let worker = service
        .spawn(move || {
            sleeper.try_sleep(Duration::from_secs(10));
        })
        .unwrap();

    let start = Instant::now();
    let drained = service.flush(&Worker::current(), Duration::from_millis(50));

    assert!(!drained, "Flush should report the timeout");
    assert!(start.elapsed() < Duration::from_secs(5));

    worker.interrupt();
    assert!(worker.join_timeout(Duration::from_secs(5)));
}

#[test]
fn test_flush_joins_finished_members() {
    let service = service();
    let ran = Arc::new(AtomicUsize::new(0));

    for _ in 0..4 {
        let ran = Arc::clone(&ran);
        service
            .spawn(move || {
                thread::sleep(Duration::from_millis(10));
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    assert!(service.flush(&Worker::current(), Duration::from_secs(5)));
    assert_eq!(ran.load(Ordering::SeqCst), 4);
    assert!(service.current_environment().threads().is_empty());
}

#[test]
fn test_cross_worker_flush_returns_false() {
    let service = service();

    let inner = service.clone();
    let worker = service
        .spawn(move || {
            inner.run_eventually(|| {});
            inner.try_sleep(Duration::from_millis(50));
        })
        .unwrap();

    thread::sleep(Duration::from_millis(10));
    assert!(!service.flush(&worker, Duration::from_secs(1)));

    assert!(worker.join_timeout(Duration::from_secs(5)));
}

#[test]
fn test_flush_without_environment_succeeds() {
    let service = service();
    let worker = Worker::current();

    assert!(service.flush(&worker, Duration::ZERO));
}

#[test]
fn test_flush_times_out_on_slow_queued_action() {
    let service = service();
    service.run_deferred(|| thread::sleep(Duration::from_millis(300)));

    let start = Instant::now();
    let drained = service.flush(&Worker::current(), Duration::from_millis(50));

    assert!(!drained, "An action finishing after the deadline should fail the flush");
    assert!(start.elapsed() >= Duration::from_millis(300));
}

#[test]
fn test_flush_with_unbounded_timeout() {
    let service = service();
    let ran = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&ran);
    service.run_deferred(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    assert!(service.flush(&Worker::current(), Duration::MAX));
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}
