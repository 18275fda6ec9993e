use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use strata::db::{ConnectionPool, PoolSettings};
use strata::MemoryError;
use tempfile::TempDir;

fn open_pool(tmp: &TempDir, max: usize, timeout_ms: u64) -> ConnectionPool {
    ConnectionPool::open(
        tmp.path().join("pool.db"),
        PoolSettings {
            max_connections: max,
            acquire_timeout: Duration::from_millis(timeout_ms),
            idle_timeout: Duration::from_secs(300),
        },
    )
    .unwrap()
}

#[test]
fn third_acquire_waits_for_a_release() {
    let tmp = TempDir::new().unwrap();
    let pool = open_pool(&tmp, 2, 5000);

    let first = pool.acquire().unwrap();
    let second = pool.acquire().unwrap();
    assert_eq!(pool.stats().in_use, 2);

    let waiter_pool = pool.clone();
    let waiter = std::thread::spawn(move || {
        let started = Instant::now();
        let lease = waiter_pool.acquire().unwrap();
        (lease.id(), started.elapsed())
    });

    std::thread::sleep(Duration::from_millis(150));
    let released_id = first.id();
    pool.release(first);

    let (id, waited) = waiter.join().unwrap();
    assert_eq!(id, released_id, "the released connection is handed over");
    assert!(waited >= Duration::from_millis(100), "waited only {waited:?}");
    drop(second);
}

#[test]
fn exhausted_pool_times_out() {
    let tmp = TempDir::new().unwrap();
    let pool = open_pool(&tmp, 1, 50);

    let _held = pool.acquire().unwrap();
    let err = pool.acquire().unwrap_err();
    assert!(matches!(
        err,
        MemoryError::PoolExhausted {
            max_connections: 1,
            ..
        }
    ));
    assert!(err.is_retryable());
}

#[test]
fn concurrent_leases_stay_bounded_and_exclusive() {
    let tmp = TempDir::new().unwrap();
    let pool = open_pool(&tmp, 3, 10_000);
    let held: Arc<Mutex<HashSet<u64>>> = Arc::new(Mutex::new(HashSet::new()));
    let in_use = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let pool = pool.clone();
            let held = Arc::clone(&held);
            let in_use = Arc::clone(&in_use);
            let peak = Arc::clone(&peak);
            std::thread::spawn(move || {
                for _ in 0..25 {
                    let lease = pool.acquire().unwrap();
                    assert!(
                        held.lock().unwrap().insert(lease.id()),
                        "connection {} leased twice",
                        lease.id()
                    );
                    let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);

                    lease.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)).unwrap();

                    in_use.fetch_sub(1, Ordering::SeqCst);
                    held.lock().unwrap().remove(&lease.id());
                    drop(lease);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 3);
    let stats = pool.stats();
    assert_eq!(stats.in_use, 0);
    assert!(stats.open <= 3);
}

#[test]
fn closed_pool_rejects_acquire() {
    let tmp = TempDir::new().unwrap();
    let pool = open_pool(&tmp, 2, 1000);
    let lease = pool.acquire().unwrap();

    pool.close_all();
    assert!(pool.is_closed());
    assert!(matches!(pool.acquire(), Err(MemoryError::PoolClosed)));

    // a lease returned after close is discarded rather than pooled
    drop(lease);
    assert_eq!(pool.stats().idle, 0);
}
