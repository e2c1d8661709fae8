//! Kernel Mutex (KMUTEX)
//!
//! Mutexes provide mutual exclusion with ownership tracking.
//! Unlike spinlocks, a mutex:
//! - Tracks which thread owns it
//! - Supports recursive acquisition by the same thread
//! - Must be released by the owning thread
//!
//! # Recursive Acquisition
//!
//! If a thread already owns a mutex and tries to acquire it again,
//! the recursion count is incremented. The mutex is only released
//! when the recursion count reaches zero. Callers that defer work to
//! the final release (the translation map flushes its invalidation
//! batch there) ask [`KMutex::depth`] or [`KMutexGuard::is_outermost`].
//!
//! # Protected Data
//!
//! The data is only reachable through a guard, and guards are tied to the
//! acquiring thread (`!Send`). Because the same thread may hold several
//! guards at once, the guard hands out `&T`; use a `RefCell` for interior
//! mutation.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::marker::PhantomData;
use core::ops::Deref;
use core::sync::atomic::{AtomicU64, Ordering};

use super::bugcheck::{codes, ke_bugcheck_ex};
use super::cpu::ThreadId;

/// Kernel Mutex
pub struct KMutex<T> {
    /// Owning thread id, 0 when free
    owner: AtomicU64,
    /// Recursion count, only touched by the owner
    recursion_count: UnsafeCell<u32>,
    data: UnsafeCell<T>,
}

// Safety: the data is only reachable by the owning thread while it holds the
// mutex, so sharing the mutex is sound whenever the data may move threads.
unsafe impl<T: Send> Sync for KMutex<T> {}
unsafe impl<T: Send> Send for KMutex<T> {}

impl<T> KMutex<T> {
    pub const fn new(data: T) -> Self {
        Self {
            owner: AtomicU64::new(0),
            recursion_count: UnsafeCell::new(0),
            data: UnsafeCell::new(data),
        }
    }

    /// Owning thread, if any
    #[inline]
    pub fn owner(&self) -> Option<ThreadId> {
        ThreadId::new(self.owner.load(Ordering::Acquire))
    }

    /// Check if the mutex is owned
    #[inline]
    pub fn is_owned(&self) -> bool {
        self.owner.load(Ordering::Acquire) != 0
    }

    #[inline]
    pub fn is_owned_by(&self, thread: ThreadId) -> bool {
        self.owner.load(Ordering::Acquire) == thread.as_u64()
    }

    /// Recursion depth held by `thread` (0 if it does not own the mutex)
    pub fn depth(&self, thread: ThreadId) -> u32 {
        if self.is_owned_by(thread) {
            // Safety: only the owner reads or writes the count
            unsafe { *self.recursion_count.get() }
        } else {
            0
        }
    }

    /// Acquire the mutex without producing a guard
    ///
    /// Spins while another thread owns it. Re-acquisition by the owner
    /// increments the recursion count. Returns the new depth.
    pub fn acquire_raw(&self, thread: ThreadId) -> u32 {
        let me = thread.as_u64();
        if self.owner.load(Ordering::Acquire) == me {
            // Safety: we are the owner
            unsafe {
                *self.recursion_count.get() += 1;
                return *self.recursion_count.get();
            }
        }

        while self
            .owner
            .compare_exchange_weak(0, me, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.owner.load(Ordering::Relaxed) != 0 {
                spin_loop();
            }
        }

        // Safety: we just became the owner
        unsafe {
            *self.recursion_count.get() = 1;
        }
        1
    }

    /// Try to acquire the mutex without spinning
    pub fn try_acquire_raw(&self, thread: ThreadId) -> Option<u32> {
        let me = thread.as_u64();
        if self.owner.load(Ordering::Acquire) == me {
            return Some(self.acquire_raw(thread));
        }
        if self
            .owner
            .compare_exchange(0, me, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            // Safety: we just became the owner
            unsafe {
                *self.recursion_count.get() = 1;
            }
            Some(1)
        } else {
            None
        }
    }

    /// Release one level of ownership. Returns the remaining depth.
    ///
    /// Releasing a mutex the thread does not own is a fatal error.
    pub fn release_raw(&self, thread: ThreadId) -> u32 {
        if !self.is_owned_by(thread) {
            ke_bugcheck_ex(
                codes::THREAD_NOT_MUTEX_OWNER,
                self as *const _ as u64,
                thread.as_u64(),
                self.owner.load(Ordering::Relaxed),
                0,
            );
        }

        // Safety: we are the owner
        let remaining = unsafe {
            let count = &mut *self.recursion_count.get();
            *count -= 1;
            *count
        };

        if remaining == 0 {
            self.owner.store(0, Ordering::Release);
        }
        remaining
    }

    /// Acquire the mutex and return a guard releasing one level on drop
    pub fn acquire(&self, thread: ThreadId) -> KMutexGuard<'_, T> {
        let depth = self.acquire_raw(thread);
        KMutexGuard {
            mutex: self,
            thread,
            depth,
            _not_send: PhantomData,
        }
    }

    pub fn try_acquire(&self, thread: ThreadId) -> Option<KMutexGuard<'_, T>> {
        self.try_acquire_raw(thread).map(|depth| KMutexGuard {
            mutex: self,
            thread,
            depth,
            _not_send: PhantomData,
        })
    }

    /// Exclusive access through a unique borrow, no locking needed
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

/// Scoped ownership of a [`KMutex`]
pub struct KMutexGuard<'a, T> {
    mutex: &'a KMutex<T>,
    thread: ThreadId,
    depth: u32,
    _not_send: PhantomData<*const ()>,
}

impl<T> KMutexGuard<'_, T> {
    /// True if this guard performed the first (non-recursive) acquisition
    #[inline]
    pub fn is_outermost(&self) -> bool {
        self.depth == 1
    }

    #[inline]
    pub fn thread(&self) -> ThreadId {
        self.thread
    }
}

impl<T> Deref for KMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard proves the current thread owns the mutex
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> Drop for KMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.release_raw(self.thread);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::RefCell;
    use std::sync::Arc;

    fn tid(raw: u64) -> ThreadId {
        ThreadId::new(raw).unwrap()
    }

    #[test]
    fn test_recursive_acquire() {
        let mutex = KMutex::new(RefCell::new(0u32));
        let t = tid(1);

        let outer = mutex.acquire(t);
        assert!(outer.is_outermost());
        {
            let inner = mutex.acquire(t);
            assert!(!inner.is_outermost());
            assert_eq!(mutex.depth(t), 2);
            *inner.borrow_mut() += 1;
        }
        assert_eq!(mutex.depth(t), 1);
        assert_eq!(*outer.borrow(), 1);
        drop(outer);
        assert!(!mutex.is_owned());
    }

    #[test]
    fn test_try_acquire_other_thread_fails() {
        let mutex = KMutex::new(());
        let _held = mutex.acquire(tid(1));
        assert!(mutex.try_acquire(tid(2)).is_none());
        assert!(mutex.try_acquire(tid(1)).is_some());
        assert_eq!(mutex.owner(), Some(tid(1)));
    }

    #[test]
    #[should_panic]
    fn test_release_by_non_owner_bugchecks() {
        let mutex = KMutex::new(());
        mutex.acquire_raw(tid(1));
        mutex.release_raw(tid(2));
    }

    #[test]
    fn test_mutual_exclusion_across_threads() {
        let mutex = Arc::new(KMutex::new(RefCell::new(0u64)));
        let handles: Vec<_> = (1..=4u64)
            .map(|n| {
                let mutex = mutex.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let guard = mutex.acquire(tid(n));
                        *guard.borrow_mut() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*mutex.acquire(tid(9)).borrow(), 4000);
    }
}
