use spindle_abi::SynchFlags;

use super::{MutexGuard, SleepOutcome, WaitQueue, WakeupMode};
use crate::{Kernel, KernelError, arch::Arch};

/// Condition variable used together with a [`Mutex`](super::Mutex).
///
/// Unlike a plain wait queue it never remembers a signal nobody waited for.
pub struct CondVar {
    wq: WaitQueue,
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}

impl CondVar {
    pub const fn new() -> Self {
        Self {
            wq: WaitQueue::new(),
        }
    }

    /// Releases the mutex, waits for a signal and reacquires the mutex.
    pub fn wait<'a, A: Arch, T>(&self, guard: MutexGuard<'a, A, T>) -> MutexGuard<'a, A, T> {
        let (guard, rc) = self.wait_timeout(guard, 0, SynchFlags::empty());
        rc.unwrap_or_else(|e| panic!("condition wait without timeout failed: {e}"));
        guard
    }

    /// Like [`wait()`](Self::wait), giving up after `usec` microseconds.
    ///
    /// The mutex is reacquired whatever the outcome.
    pub fn wait_timeout<'a, A: Arch, T>(
        &self,
        guard: MutexGuard<'a, A, T>,
        usec: u64,
        flags: SynchFlags,
    ) -> (MutexGuard<'a, A, T>, Result<SleepOutcome, KernelError>) {
        let mutex = guard.mutex();
        let kernel = guard.kernel();

        let ipl = kernel.interrupts_disable();
        let mut inner = self.wq.lock_inner(&ipl);
        inner.set_missed_wakeups(0);
        // Signals are sent under the queue lock; none gets lost in between.
        drop(guard);
        let rc = self.wq.sleep_locked(kernel, &ipl, inner, usec, flags);
        drop(ipl);

        (mutex.lock(kernel), rc)
    }

    /// Wakes one waiter.
    pub fn signal<A: Arch>(&self, kernel: &Kernel<A>) {
        self.wq.wakeup(kernel, WakeupMode::First);
    }

    /// Wakes all waiters.
    pub fn broadcast<A: Arch>(&self, kernel: &Kernel<A>) {
        self.wq.wakeup(kernel, WakeupMode::All);
    }
}
