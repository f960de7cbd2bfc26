//! Admission queue tests: the concurrency bound, FIFO fairness, and the
//! drain-on-stop lifecycle.

use cryorun::{AdmissionQueue, Error, QueueState};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

// =============================================================================
// Concurrency Bound
// =============================================================================

#[tokio::test]
async fn at_most_k_operations_in_flight() {
    let queue = Arc::new(AdmissionQueue::new(3).unwrap());
    queue.start().unwrap();

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..12 {
        let queue = Arc::clone(&queue);
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        handles.push(tokio::spawn(async move {
            queue
                .with(async {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert!(peak.load(Ordering::SeqCst) <= 3, "admission bound exceeded");
    assert!(peak.load(Ordering::SeqCst) > 0);
}

// =============================================================================
// FIFO Fairness
// =============================================================================

#[tokio::test]
async fn waiters_resume_in_call_order() {
    let queue = Arc::new(AdmissionQueue::new(1).unwrap());
    queue.start().unwrap();

    // Hold the only slot so every subsequent acquire queues up.
    let gate = queue.acquire().await.unwrap();

    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for i in 0..5 {
        let queue = Arc::clone(&queue);
        let order = Arc::clone(&order);
        handles.push(tokio::spawn(async move {
            let permit = queue.acquire().await.unwrap();
            order.lock().unwrap().push(i);
            drop(permit);
        }));
        // Let the spawned task reach its acquire before the next spawns.
        tokio::task::yield_now().await;
    }

    drop(gate);
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}

// =============================================================================
// Drain on Stop
// =============================================================================

#[tokio::test]
async fn stop_waits_for_in_flight_work() {
    let queue = Arc::new(AdmissionQueue::new(2).unwrap());
    queue.start().unwrap();

    let (release_tx, release_rx) = oneshot::channel::<()>();
    let worker = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            queue
                .with(async {
                    let _ = release_rx.await;
                    Ok(())
                })
                .await
        })
    };
    // Make sure the worker holds its slot before stopping.
    tokio::task::yield_now().await;

    let stopper = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move { queue.stop().await })
    };

    // stop() must not resolve while the worker holds a slot.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!stopper.is_finished(), "stop resolved before drain");
    assert_eq!(queue.state(), QueueState::Stopping);

    release_tx.send(()).unwrap();
    worker.await.unwrap().unwrap();
    stopper.await.unwrap().unwrap();
    assert_eq!(queue.state(), QueueState::Stopped);
}

#[tokio::test]
async fn pending_acquire_is_served_before_stop_resolves() {
    let queue = Arc::new(AdmissionQueue::new(1).unwrap());
    queue.start().unwrap();

    let held = queue.acquire().await.unwrap();

    let waiter_done = Arc::new(AtomicUsize::new(0));
    let waiter = {
        let queue = Arc::clone(&queue);
        let waiter_done = Arc::clone(&waiter_done);
        tokio::spawn(async move {
            let permit = queue.acquire().await.unwrap();
            waiter_done.store(1, Ordering::SeqCst);
            drop(permit);
        })
    };
    tokio::task::yield_now().await;

    let stopper = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move { queue.stop().await })
    };
    tokio::task::yield_now().await;

    drop(held);
    waiter.await.unwrap();
    stopper.await.unwrap().unwrap();

    // The pre-existing acquire resolved (FIFO put it ahead of the drain).
    assert_eq!(waiter_done.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn no_admission_after_stop() {
    let queue = Arc::new(AdmissionQueue::new(1).unwrap());
    queue.start().unwrap();
    queue.stop().await.unwrap();

    assert!(matches!(
        queue.acquire().await,
        Err(Error::QueueClosed { .. })
    ));
}

// =============================================================================
// Lifecycle Misuse
// =============================================================================

#[tokio::test]
async fn stop_before_start_is_lifecycle_error() {
    let queue = AdmissionQueue::new(1).unwrap();
    assert!(matches!(queue.stop().await, Err(Error::Lifecycle { .. })));
}

#[tokio::test]
async fn stop_twice_is_lifecycle_error() {
    let queue = AdmissionQueue::new(1).unwrap();
    queue.start().unwrap();
    queue.stop().await.unwrap();
    assert!(matches!(queue.stop().await, Err(Error::Lifecycle { .. })));
}

#[tokio::test]
async fn restart_after_stop_is_lifecycle_error() {
    let queue = AdmissionQueue::new(1).unwrap();
    queue.start().unwrap();
    queue.stop().await.unwrap();
    assert!(matches!(queue.start(), Err(Error::Lifecycle { .. })));
}
