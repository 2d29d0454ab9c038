use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU64, Ordering},
};

use spindle_abi::SynchFlags;

use super::Semaphore;
use crate::{Kernel, KernelError, arch::Arch, proc::ThreadId};

/// Sleeping mutual exclusion lock.
///
/// A binary [`Semaphore`] plus the identity of the holder. Unlocking from a
/// thread other than the holder is a fatal error.
pub struct Mutex<T> {
    sem: Semaphore,
    /// Raw id of the holder; `0` when unlocked or held outside of a thread.
    owner: AtomicU64,
    value: UnsafeCell<T>,
}

unsafe impl<T> Sync for Mutex<T> where T: Send {}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            sem: Semaphore::new(1),
            owner: AtomicU64::new(0),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquires the mutex, sleeping as long as needed.
    pub fn lock<'a, A: Arch>(&'a self, kernel: &'a Kernel<A>) -> MutexGuard<'a, A, T> {
        self.lock_timeout(kernel, 0, SynchFlags::empty())
            .unwrap_or_else(|e| panic!("mutex lock without timeout failed: {e}"))
    }

    /// Acquires the mutex, sleeping at most `usec` microseconds.
    ///
    /// Takes the same arguments as [`WaitQueue::sleep_timeout()`].
    ///
    /// [`WaitQueue::sleep_timeout()`]: super::WaitQueue::sleep_timeout
    pub fn lock_timeout<'a, A: Arch>(
        &'a self,
        kernel: &'a Kernel<A>,
        usec: u64,
        flags: SynchFlags,
    ) -> Result<MutexGuard<'a, A, T>, KernelError> {
        self.sem.down_timeout(kernel, usec, flags)?;
        Ok(self.acquired(kernel))
    }

    /// Acquires the mutex if it is free.
    pub fn try_lock<'a, A: Arch>(
        &'a self,
        kernel: &'a Kernel<A>,
    ) -> Result<MutexGuard<'a, A, T>, KernelError> {
        self.lock_timeout(kernel, 0, SynchFlags::NON_BLOCKING)
    }

    fn acquired<'a, A: Arch>(&'a self, kernel: &'a Kernel<A>) -> MutexGuard<'a, A, T> {
        let owner = kernel.current_thread().map_or(0, ThreadId::to_raw);
        self.owner.store(owner, Ordering::Relaxed);
        MutexGuard {
            mutex: self,
            kernel,
        }
    }

    pub fn is_locked<A: Arch>(&self, kernel: &Kernel<A>) -> bool {
        self.sem.count(kernel) == 0
    }

    /// Thread holding the mutex, if any.
    pub fn owner(&self) -> Option<ThreadId> {
        match self.owner.load(Ordering::Relaxed) {
            0 => None,
            raw => Some(ThreadId::from_raw(raw)),
        }
    }

    fn unlock<A: Arch>(&self, kernel: &Kernel<A>) {
        let me = kernel.current_thread().map_or(0, ThreadId::to_raw);
        let owner = self.owner.swap(0, Ordering::Relaxed);
        assert_eq!(
            owner, me,
            "mutex unlocked by thread {me:#x} but owned by {owner:#x}"
        );
        self.sem.up(kernel);
    }

    /// Releases the mutex without a guard.
    ///
    /// # Safety
    ///
    /// The caller must own the mutex and have forgotten its guard.
    ///
    /// # Panics
    ///
    /// Panics if the mutex is not locked.
    pub unsafe fn force_unlock<A: Arch>(&self, kernel: &Kernel<A>) {
        assert!(self.is_locked(kernel), "unlocking an unlocked mutex");
        self.unlock(kernel);
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

pub struct MutexGuard<'a, A: Arch, T> {
    mutex: &'a Mutex<T>,
    kernel: &'a Kernel<A>,
}

unsafe impl<A: Arch, T> Sync for MutexGuard<'_, A, T> where T: Sync {}

impl<'a, A: Arch, T> MutexGuard<'a, A, T> {
    pub(crate) fn mutex(&self) -> &'a Mutex<T> {
        self.mutex
    }

    pub(crate) fn kernel(&self) -> &'a Kernel<A> {
        self.kernel
    }
}

impl<A: Arch, T> Drop for MutexGuard<'_, A, T> {
    fn drop(&mut self) {
        self.mutex.unlock(self.kernel);
    }
}

impl<A: Arch, T> Deref for MutexGuard<'_, A, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.mutex.value.get() }
    }
}

impl<A: Arch, T> DerefMut for MutexGuard<'_, A, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.mutex.value.get() }
    }
}

#[cfg(test)]
mod tests {
    use core::time::Duration;
    use std::{boxed::Box, sync::Arc, vec::Vec};

    use spindle_abi::CpuId;

    use super::*;
    use crate::{ThreadBuilder, ThreadState, test_util};

    #[test]
    fn try_lock_fails_while_held() {
        let k = test_util::kernel(1);
        test_util::bind(0);
        let m = Mutex::new(5);
        let guard = m.lock(k);
        assert!(m.is_locked(k));
        assert!(matches!(m.try_lock(k), Err(KernelError::WouldBlock)));
        drop(guard);
        assert!(!m.is_locked(k));
        assert_eq!(*m.try_lock(k).unwrap(), 5);
    }

    #[test]
    #[should_panic = "mutex unlocked by thread"]
    fn unlock_by_other_thread_panics() {
        let k = test_util::kernel(1);
        test_util::bind(0);
        let m = Mutex::new(());
        let guard = m.lock(k);
        let other = test_util::create_thread(k, "other");
        let ipl = k.interrupts_disable();
        k.cpu(CpuId::new(0)).set_current(&ipl, Some(other));
        drop(ipl);
        drop(guard);
    }

    #[test]
    fn contended_counter_is_exact() {
        const THREADS: usize = 8;
        const ITERATIONS: usize = 1000;
        let k = test_util::kernel(4);
        let total = test_util::run_in_kernel(k, |k| {
            let counter: &'static Mutex<usize> = Box::leak(Box::new(Mutex::new(0)));
            let tids = (0..THREADS)
                .map(|i| {
                    ThreadBuilder::new("adder")
                        .cpu(CpuId::new(i % k.cpu_active()))
                        .spawn(k, move || {
                            for n in 0..ITERATIONS {
                                let mut value = counter.lock(k);
                                let read = *value;
                                if n % 100 == 0 {
                                    k.thread_yield();
                                }
                                *value = read + 1;
                            }
                        })
                        .unwrap()
                })
                .collect::<Vec<_>>();
            for tid in tids {
                k.thread_join(tid).unwrap();
            }
            *counter.lock(k)
        });
        assert_eq!(total, THREADS * ITERATIONS);
    }

    #[test]
    fn unlock_readies_waiter_at_once() {
        let k = test_util::kernel(1);
        let state = test_util::run_in_kernel(k, |k| {
            let m: &'static Mutex<u32> = Box::leak(Box::new(Mutex::new(0)));
            let guard = m.lock(k);
            let waiter = ThreadBuilder::new("waiter")
                .spawn(k, move || *m.lock(k) += 1)
                .unwrap();
            while k.thread_info(waiter).unwrap().state != ThreadState::Sleeping {
                k.thread_yield();
            }
            drop(guard);
            let state = k.thread_info(waiter).unwrap().state;
            k.thread_join(waiter).unwrap();
            assert_eq!(*m.lock(k), 1);
            state
        });
        assert_eq!(state, ThreadState::Ready);
    }

    #[test]
    fn lock_times_out() {
        let k = test_util::kernel(1);
        k.arch().start_ticker(Duration::from_millis(1));
        let (rc, owner_kept) = test_util::run_in_kernel(k, |k| {
            let m: &'static Mutex<()> = Box::leak(Box::new(Mutex::new(())));
            let guard = m.lock(k);
            let result = Arc::new(test_util::Slot::new());
            let out = Arc::clone(&result);
            let tid = ThreadBuilder::new("impatient")
                .spawn(k, move || {
                    out.put(m.lock_timeout(k, 20_000, SynchFlags::empty()).map(drop));
                })
                .unwrap();
            k.thread_join(tid).unwrap();
            let owner_kept = m.owner() == k.current_thread();
            drop(guard);
            (result.take(), owner_kept)
        });
        k.arch().stop_ticker();
        assert_eq!(rc, Some(Err(KernelError::Timeout)));
        assert!(owner_kept);
    }
}
