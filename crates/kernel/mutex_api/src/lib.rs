//! A raw lock API.
//!
//! Lock strategies implement [`RawMutex`] so that the data-owning lock types
//! built on top of them do not care which strategy the build selected.
#![no_std]

/// A raw mutual exclusion primitive that protects no data by itself.
///
/// # Safety
///
/// Between a successful [`lock`](RawMutex::lock) or
/// [`try_lock`](RawMutex::try_lock) and the matching
/// [`unlock`](RawMutex::unlock), no other `lock` or `try_lock` may succeed.
pub unsafe trait RawMutex {
    /// An unlocked instance.
    const INIT: Self;

    /// Acquires the lock, waiting as long as needed.
    fn lock(&self);

    /// Attempts to acquire the lock once.
    ///
    /// Returns `true` if the lock was acquired.
    #[must_use]
    fn try_lock(&self) -> bool;

    /// Releases the lock.
    ///
    /// # Safety
    ///
    /// The lock must be held by the caller's context.
    unsafe fn unlock(&self);

    /// Returns `true` if someone holds the lock.
    fn is_locked(&self) -> bool;
}

#[cfg(test)]
mod tests {
    extern crate std;

    use core::sync::atomic::{AtomicBool, Ordering};
    use std::{sync::Arc, thread, vec::Vec};

    use super::*;

    struct TestSpin(AtomicBool);

    unsafe impl RawMutex for TestSpin {
        const INIT: Self = Self(AtomicBool::new(false));

        fn lock(&self) {
            while !self.try_lock() {
                core::hint::spin_loop();
            }
        }

        fn try_lock(&self) -> bool {
            !self.0.swap(true, Ordering::Acquire)
        }

        unsafe fn unlock(&self) {
            self.0.store(false, Ordering::Release);
        }

        fn is_locked(&self) -> bool {
            self.0.load(Ordering::Relaxed)
        }
    }

    #[test]
    fn try_lock_fails_while_held() {
        let raw = TestSpin::INIT;
        assert!(raw.try_lock());
        assert!(raw.is_locked());
        assert!(!raw.try_lock());
        unsafe { raw.unlock() };
        assert!(!raw.is_locked());
    }

    #[test]
    fn lock_excludes_other_threads() {
        let raw = Arc::new(TestSpin::INIT);
        let inside = Arc::new(AtomicBool::new(false));
        let handles = (0..4)
            .map(|_| {
                let raw = Arc::clone(&raw);
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        raw.lock();
                        assert!(!inside.swap(true, Ordering::Relaxed));
                        inside.store(false, Ordering::Relaxed);
                        unsafe { raw.unlock() };
                    }
                })
            })
            .collect::<Vec<_>>();
        for h in handles {
            h.join().unwrap();
        }
    }
}
