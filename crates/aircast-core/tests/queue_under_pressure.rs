// Cross-thread behavior of the queue/pool pair: a producer that outruns the
// consumer tenfold must neither grow the heap nor reorder what the consumer
// observes, and cancelling the scope must unwind everything promptly.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use aircast_core::{BoundedQueue, CancelToken, PopError, Pool};

#[derive(Debug)]
struct Shell(u64);

fn make() -> Shell {
    Shell(0)
}

fn recycle(shell: &mut Shell) {
    shell.0 = 0;
}

const CAPACITY: usize = 16;

#[test]
fn overrun_producer_stays_bounded_and_ordered() {
    let queue = BoundedQueue::with_capacity(CAPACITY, Pool::new(make, recycle));
    let cancel = CancelToken::new();

    let producer = {
        let queue = Arc::clone(&queue);
        let cancel = cancel.clone();
        thread::spawn(move || {
            let mut sequence = 0u64;
            while !cancel.is_cancelled() {
                let mut shell = queue.acquire();
                shell.0 = sequence;
                sequence += 1;
                if queue.push(shell).is_err() {
                    break;
                }
                // Roughly 10x the consumer's drain rate.
                thread::sleep(Duration::from_micros(100));
            }
            sequence
        })
    };

    let consumer = {
        let queue = Arc::clone(&queue);
        let cancel = cancel.clone();
        thread::spawn(move || {
            let mut last_seen = None::<u64>;
            let mut received = 0u64;
            loop {
                match queue.pop(Duration::from_millis(10), &cancel) {
                    Ok(shell) => {
                        if let Some(previous) = last_seen {
                            // Drops show up as gaps, never reorders.
                            assert!(shell.0 > previous, "reorder: {} after {previous}", shell.0);
                        }
                        last_seen = Some(shell.0);
                        received += 1;
                        queue.release(shell);
                        thread::sleep(Duration::from_millis(1));
                    }
                    Err(PopError::TimedOut) => continue,
                    Err(_) => break,
                }
            }
            received
        })
    };

    thread::sleep(Duration::from_millis(500));

    // Live shells never exceed capacity plus the workers' in-flight ones.
    assert!(
        queue.pool().allocated() <= CAPACITY + 2,
        "pool grew to {}",
        queue.pool().allocated()
    );

    cancel.cancel();
    let produced = producer.join().unwrap();
    let received = consumer.join().unwrap();

    assert!(received >= 1, "consumer starved");
    assert!(produced > received, "producer was supposed to outrun the consumer");
}

#[test]
fn cancellation_unwinds_blocked_workers_quickly() {
    let queue: Arc<BoundedQueue<Shell>> =
        BoundedQueue::with_capacity(CAPACITY, Pool::new(make, recycle));
    let cancel = CancelToken::new();

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            thread::spawn(move || loop {
                match queue.pop(Duration::from_millis(50), &cancel) {
                    Ok(shell) => queue.release(shell),
                    Err(PopError::TimedOut) => continue,
                    Err(_) => break,
                }
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(100));
    let stop_started = Instant::now();
    cancel.cancel();
    for worker in workers {
        worker.join().unwrap();
    }
    assert!(
        stop_started.elapsed() < Duration::from_secs(2),
        "shutdown overran the deadline"
    );

    queue.close();
    assert!(queue.is_closed());
    assert_eq!(queue.len(), 0);
}
