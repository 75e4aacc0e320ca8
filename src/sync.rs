//! Process-shared readers-writer spinlock
//!
//! Locks that live inside a shared mapping cannot carry process-local
//! state (waiter queues, thread parking), so this module implements a
//! readers-writer lock as a single `AtomicI32` counter: `0` free, `> 0`
//! the number of active readers, `-1` an exclusive writer. The all-zero
//! bit pattern is the unlocked state, which makes zero-initialized shared
//! memory a valid lock with no construction step.
//!
//! Acquire ordering on lock and Release ordering on unlock provide the
//! visibility contract the map relies on: every write made before a
//! write-unlock is visible to any thread (in any process) that
//! subsequently takes the lock.

use std::hint;
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread;

/// Counter value while a writer holds the lock
const WRITER: i32 = -1;

/// Pure CPU spins before yielding the thread to the scheduler
const SPIN_BEFORE_YIELD: u32 = 128;

/// A readers-writer spinlock safe to place in shared memory.
///
/// Readers and writers from any process mapping the same bytes contend on
/// the one atomic word. There is no fairness policy beyond what the
/// compare-exchange loop provides; writers can be starved by a stream of
/// readers, matching the underlying runtime primitive this models.
#[repr(transparent)]
#[derive(Debug)]
pub struct RwSpinLock {
    cnt: AtomicI32,
}

impl RwSpinLock {
    /// Create an unlocked lock
    pub const fn new() -> Self {
        Self {
            cnt: AtomicI32::new(0),
        }
    }

    /// Acquire the lock for shared read access, spinning until granted
    pub fn read_lock(&self) -> ReadGuard<'_> {
        let mut spins = 0u32;
        loop {
            let cnt = self.cnt.load(Ordering::Relaxed);
            if cnt >= 0
                && self
                    .cnt
                    .compare_exchange_weak(cnt, cnt + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return ReadGuard { lock: self };
            }
            Self::backoff(&mut spins);
        }
    }

    /// Acquire the lock for exclusive write access, spinning until granted
    pub fn write_lock(&self) -> WriteGuard<'_> {
        let mut spins = 0u32;
        loop {
            if self
                .cnt
                .compare_exchange_weak(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return WriteGuard { lock: self };
            }
            Self::backoff(&mut spins);
        }
    }

    /// Try to acquire read access without spinning
    pub fn try_read_lock(&self) -> Option<ReadGuard<'_>> {
        let cnt = self.cnt.load(Ordering::Relaxed);
        if cnt >= 0
            && self
                .cnt
                .compare_exchange(cnt, cnt + 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        {
            Some(ReadGuard { lock: self })
        } else {
            None
        }
    }

    /// Try to acquire write access without spinning
    pub fn try_write_lock(&self) -> Option<WriteGuard<'_>> {
        if self
            .cnt
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(WriteGuard { lock: self })
        } else {
            None
        }
    }

    #[inline]
    fn backoff(spins: &mut u32) {
        *spins += 1;
        if *spins < SPIN_BEFORE_YIELD {
            hint::spin_loop();
        } else {
            *spins = 0;
            thread::yield_now();
        }
    }
}

impl Default for RwSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for shared read access
#[must_use = "the lock is released when the guard is dropped"]
pub struct ReadGuard<'a> {
    lock: &'a RwSpinLock,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.cnt.fetch_sub(1, Ordering::Release);
    }
}

/// RAII guard for exclusive write access
#[must_use = "the lock is released when the guard is dropped"]
pub struct WriteGuard<'a> {
    lock: &'a RwSpinLock,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.cnt.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_read_lock_is_shared() {
        let lock = RwSpinLock::new();
        let r1 = lock.read_lock();
        let r2 = lock.read_lock();
        assert!(lock.try_write_lock().is_none());
        drop(r1);
        assert!(lock.try_write_lock().is_none());
        drop(r2);
        assert!(lock.try_write_lock().is_some());
    }

    #[test]
    fn test_write_lock_is_exclusive() {
        let lock = RwSpinLock::new();
        let w = lock.write_lock();
        assert!(lock.try_read_lock().is_none());
        assert!(lock.try_write_lock().is_none());
        drop(w);
        assert!(lock.try_read_lock().is_some());
    }

    #[test]
    fn test_zero_bytes_are_unlocked() {
        // The lock must be usable on memory that was only ever zeroed.
        let zeroed: RwSpinLock = unsafe { std::mem::zeroed() };
        drop(zeroed.write_lock());
        drop(zeroed.read_lock());
    }

    #[test]
    fn test_contended_counter() {
        const THREADS: usize = 8;
        const ITERS: usize = 10_000;

        struct Shared {
            lock: RwSpinLock,
            value: std::cell::UnsafeCell<u64>,
        }
        unsafe impl Sync for Shared {}

        let shared = Arc::new(Shared {
            lock: RwSpinLock::new(),
            value: std::cell::UnsafeCell::new(0),
        });

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || {
                    for _ in 0..ITERS {
                        let _w = shared.lock.write_lock();
                        unsafe { *shared.value.get() += 1 };
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let _r = shared.lock.read_lock();
        assert_eq!(unsafe { *shared.value.get() }, (THREADS * ITERS) as u64);
    }
}
