// crates/aircast-core/src/queue.rs
//
// Bounded FIFO of pool-backed shells between two pipeline stages.
//
// The producer is never throttled: under sustained pressure the queue sheds
// the oldest waiting shell (and, if the slot is stolen again before the
// retry, the incoming one) back into the pool. Consumers see a gap, never a
// reorder.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::trace;

use crate::cancel::CancelToken;
use crate::error::{PopError, QueueClosed};
use crate::pool::Pool;

pub struct BoundedQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    pool: Arc<Pool<T>>,
    closed: AtomicBool,
}

impl<T: Send> BoundedQueue<T> {
    pub fn with_capacity(capacity: usize, pool: Arc<Pool<T>>) -> Arc<Self> {
        let (tx, rx) = bounded(capacity.max(1));
        Arc::new(Self {
            tx,
            rx,
            pool,
            closed: AtomicBool::new(false),
        })
    }

    /// Deliver `shell`, shedding the oldest waiting element when full.
    ///
    /// Returns `Err(QueueClosed)` only after `close()`; a shed element is a
    /// success from the producer's point of view (the system is degraded but
    /// continues). In every branch the shell ends up owned by exactly one
    /// place: the queue or the pool.
    pub fn push(&self, shell: T) -> Result<(), QueueClosed> {
        if self.closed.load(Ordering::Acquire) {
            self.pool.release(shell);
            return Err(QueueClosed);
        }

        match self.tx.try_send(shell) {
            Ok(()) => Ok(()),
            Err(TrySendError::Disconnected(shell)) => {
                self.pool.release(shell);
                Err(QueueClosed)
            }
            Err(TrySendError::Full(shell)) => {
                // Drop the oldest waiting shell to make room, then retry once.
                if let Ok(oldest) = self.rx.try_recv() {
                    self.pool.release(oldest);
                }
                match self.tx.try_send(shell) {
                    Ok(()) => Ok(()),
                    Err(TrySendError::Full(shell)) => {
                        // The freed slot was stolen; shed the newcomer instead.
                        trace!("queue still full after shedding, dropping newest");
                        self.pool.release(shell);
                        Ok(())
                    }
                    Err(TrySendError::Disconnected(shell)) => {
                        self.pool.release(shell);
                        Err(QueueClosed)
                    }
                }
            }
        }
    }

    /// Wait up to `deadline` for a shell.
    pub fn pop(&self, deadline: Duration, cancel: &CancelToken) -> Result<T, PopError> {
        if cancel.is_cancelled() {
            return Err(PopError::Cancelled);
        }
        if self.closed.load(Ordering::Acquire) && self.rx.is_empty() {
            return Err(PopError::Closed);
        }
        match self.rx.recv_timeout(deadline) {
            Ok(shell) => Ok(shell),
            Err(RecvTimeoutError::Disconnected) => Err(PopError::Closed),
            Err(RecvTimeoutError::Timeout) => {
                if cancel.is_cancelled() {
                    Err(PopError::Cancelled)
                } else if self.closed.load(Ordering::Acquire) && self.rx.is_empty() {
                    Err(PopError::Closed)
                } else {
                    Err(PopError::TimedOut)
                }
            }
        }
    }

    /// Acquire a cleared shell from the backing pool.
    pub fn acquire(&self) -> T {
        self.pool.acquire()
    }

    /// Return a shell to the backing pool.
    pub fn release(&self, shell: T) {
        self.pool.release(shell)
    }

    pub fn pool(&self) -> &Arc<Pool<T>> {
        &self.pool
    }

    /// Current depth. Advisory only.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Drain residual shells into the pool, mark the queue closed and release
    /// the pool's shelf. Idempotent; later pushes are rejected.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        while let Ok(shell) = self.rx.try_recv() {
            self.pool.release(shell);
        }
        self.pool.drain();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[derive(Debug, PartialEq)]
    struct Shell(u64);

    fn make() -> Shell {
        Shell(0)
    }

    fn recycle(shell: &mut Shell) {
        shell.0 = 0;
    }

    fn queue(capacity: usize) -> Arc<BoundedQueue<Shell>> {
        BoundedQueue::with_capacity(capacity, Pool::new(make, recycle))
    }

    fn tagged(q: &BoundedQueue<Shell>, tag: u64) -> Shell {
        let mut shell = q.acquire();
        shell.0 = tag;
        shell
    }

    #[test]
    fn fifo_order_without_pressure() {
        let q = queue(4);
        let none = CancelToken::new();
        for i in 1..=4 {
            q.push(tagged(&q, i)).unwrap();
        }
        for i in 1..=4 {
            let shell = q.pop(Duration::from_millis(10), &none).unwrap();
            assert_eq!(shell.0, i);
            q.release(shell);
        }
    }

    #[test]
    fn full_queue_sheds_oldest_not_newest() {
        let q = queue(3);
        let none = CancelToken::new();
        for i in 1..=3 {
            q.push(tagged(&q, i)).unwrap();
        }
        // Queue holds [1, 2, 3]; this push evicts 1.
        q.push(tagged(&q, 4)).unwrap();

        let seen: Vec<u64> = (0..3)
            .map(|_| {
                let s = q.pop(Duration::from_millis(10), &none).unwrap();
                let tag = s.0;
                q.release(s);
                tag
            })
            .collect();
        // A gap, never a reorder.
        assert_eq!(seen, vec![2, 3, 4]);
    }

    #[test]
    fn sustained_pressure_keeps_allocation_bounded() {
        let q = queue(8);
        let none = CancelToken::new();
        for i in 0..1000u64 {
            q.push(tagged(&q, i)).unwrap();
        }
        // Every shed shell went back to the pool: live shells are bounded by
        // the queue capacity plus the pool shelf.
        assert!(q.pool().allocated() <= 8 + 1);

        // Observed tags stay monotonic across the drops.
        let mut last = 0;
        while let Ok(shell) = q.pop(Duration::from_millis(1), &none) {
            assert!(shell.0 >= last);
            last = shell.0;
            q.release(shell);
        }
    }

    #[test]
    fn pop_times_out_when_empty() {
        let q = queue(2);
        let none = CancelToken::new();
        assert_eq!(
            q.pop(Duration::from_millis(5), &none),
            Err(PopError::TimedOut)
        );
    }

    #[test]
    fn pop_reports_cancellation() {
        let q = queue(2);
        let cancel = CancelToken::new();
        cancel.cancel();
        assert_eq!(
            q.pop(Duration::from_millis(5), &cancel),
            Err(PopError::Cancelled)
        );
    }

    #[test]
    fn close_drains_residuals_and_rejects_pushes() {
        let q = queue(4);
        let none = CancelToken::new();
        q.push(tagged(&q, 1)).unwrap();
        q.push(tagged(&q, 2)).unwrap();

        q.close();
        assert_eq!(q.len(), 0);
        assert_eq!(q.pool().idle(), 0); // close drained the shelf too

        assert_eq!(q.push(Shell(3)), Err(QueueClosed));
        assert_eq!(
            q.pop(Duration::from_millis(5), &none),
            Err(PopError::Closed)
        );

        // Idempotent.
        q.close();
    }

    #[test]
    fn pop_unblocks_across_threads() {
        let q = queue(2);
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                let none = CancelToken::new();
                q.pop(Duration::from_secs(2), &none).map(|s| s.0)
            })
        };
        thread::sleep(Duration::from_millis(20));
        q.push(tagged(&q, 7)).unwrap();
        assert_eq!(consumer.join().unwrap(), Ok(7));
    }
}
