// crates/aircast-core/src/pool.rs
//
// Free-list store of reusable buffer shells. A "shell" is a cheap handle
// whose payload is reference-counted by the media library; `recycle` must
// unref the payload and leave the allocation reusable.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Unbounded free-list of cleared shells.
///
/// `acquire()` returns a cleared shell, allocating a fresh one when the shelf
/// is empty. `release()` recycles the shell's payload and shelves it for
/// reuse. The `allocated`/`idle` counters exist so tests can assert the pool
/// balance invariant: every shell handed out is eventually released, enqueued
/// into exactly one queue, or retained by a codec that releases it later.
pub struct Pool<T> {
    make: fn() -> T,
    recycle: fn(&mut T),
    shelf: Mutex<Vec<T>>,
    allocated: AtomicUsize,
}

impl<T> Pool<T> {
    pub fn new(make: fn() -> T, recycle: fn(&mut T)) -> Arc<Self> {
        Arc::new(Self {
            make,
            recycle,
            shelf: Mutex::new(Vec::new()),
            allocated: AtomicUsize::new(0),
        })
    }

    /// Pop a cleared shell off the shelf, or allocate a fresh one.
    pub fn acquire(&self) -> T {
        if let Some(shell) = self.shelf.lock().pop() {
            return shell;
        }
        self.allocated.fetch_add(1, Ordering::Relaxed);
        (self.make)()
    }

    /// Recycle `shell`'s payload and shelve it for the next `acquire`.
    pub fn release(&self, mut shell: T) {
        (self.recycle)(&mut shell);
        self.shelf.lock().push(shell);
    }

    /// Drop every shelved shell. Called when the owning queue closes.
    pub fn drain(&self) {
        let dropped = {
            let mut shelf = self.shelf.lock();
            let n = shelf.len();
            shelf.clear();
            n
        };
        self.allocated.fetch_sub(dropped, Ordering::Relaxed);
    }

    /// Total shells currently alive (shelved or in flight).
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Shells sitting on the shelf right now.
    pub fn idle(&self) -> usize {
        self.shelf.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static RECYCLED: AtomicUsize = AtomicUsize::new(0);

    #[derive(Debug, PartialEq)]
    struct Shell(u64);

    fn make() -> Shell {
        Shell(0)
    }

    fn recycle(shell: &mut Shell) {
        shell.0 = 0;
        RECYCLED.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn acquire_allocates_then_reuses() {
        let pool = Pool::new(make, recycle);
        let a = pool.acquire();
        assert_eq!(pool.allocated(), 1);
        pool.release(a);
        assert_eq!(pool.idle(), 1);

        let _b = pool.acquire();
        // Reuse, not a fresh allocation.
        assert_eq!(pool.allocated(), 1);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn release_recycles_payload() {
        let pool = Pool::new(make, recycle);
        let before = RECYCLED.load(Ordering::Relaxed);
        let mut shell = pool.acquire();
        shell.0 = 42;
        pool.release(shell);
        // Other tests recycle too; the counter only ever grows.
        assert!(RECYCLED.load(Ordering::Relaxed) > before);
        assert_eq!(pool.acquire().0, 0);
    }

    #[test]
    fn drain_empties_shelf() {
        let pool = Pool::new(make, recycle);
        let (a, b) = (pool.acquire(), pool.acquire());
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.idle(), 2);
        pool.drain();
        assert_eq!(pool.idle(), 0);
        assert_eq!(pool.allocated(), 0);
    }
}
