//! Wait queues.
//!
//! A wait queue is a FIFO of sleeping threads plus a count of wakeups that
//! found nobody to wake. The count makes a wakeup that races ahead of the
//! matching sleep harmless: the sleep consumes it and returns at once.

use core::ptr::NonNull;

use arrayvec::ArrayVec;
use spindle_abi::SynchFlags;
use spindle_kernel_params::NTHREAD;

use super::{SpinLock, SpinLockGuard};
use crate::{
    Kernel, KernelError,
    arch::Arch,
    interrupt::InterruptGuard,
    proc::{ThreadId, ThreadLink, ThreadState, WakeReason},
    time::TimeoutId,
};

/// How a successful sleep ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    /// A missed wakeup was consumed; the caller never slept.
    Atomic,
    /// The caller slept and was woken up.
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeupMode {
    /// Wake the longest sleeping thread.
    First,
    /// Wake every sleeping thread.
    All,
}

pub struct WaitQueue {
    inner: SpinLock<WaitQueueInner>,
}

pub(crate) struct WaitQueueInner {
    sleepers: ArrayVec<ThreadId, NTHREAD>,
    missed_wakeups: usize,
}

impl WaitQueueInner {
    pub(crate) fn first(&self) -> Option<ThreadId> {
        self.sleepers.first().copied()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.sleepers.is_empty()
    }

    pub(crate) fn missed_wakeups(&self) -> usize {
        self.missed_wakeups
    }

    /// Consumes a missed wakeup, if any.
    pub(crate) fn take_missed_wakeup(&mut self) -> bool {
        if self.missed_wakeups == 0 {
            return false;
        }
        self.missed_wakeups -= 1;
        true
    }

    pub(crate) fn set_missed_wakeups(&mut self, count: usize) {
        self.missed_wakeups = count;
    }

    fn pop_front(&mut self) -> Option<ThreadId> {
        (!self.sleepers.is_empty()).then(|| self.sleepers.remove(0))
    }

    fn remove(&mut self, tid: ThreadId) -> bool {
        let Some(pos) = self.sleepers.iter().position(|t| *t == tid) else {
            return false;
        };
        self.sleepers.remove(pos);
        true
    }
}

/// Address of the wait queue a thread sleeps in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WaitQueueRef(NonNull<WaitQueue>);

unsafe impl Send for WaitQueueRef {}
unsafe impl Sync for WaitQueueRef {}

impl WaitQueueRef {
    fn new(wq: &WaitQueue) -> Self {
        Self(NonNull::from(wq))
    }

    pub(crate) fn addr(self) -> usize {
        self.0.as_ptr().addr()
    }

    /// # Safety
    ///
    /// A thread linked to the queue must be locked by the caller, which
    /// keeps the queue alive.
    unsafe fn get<'a>(self) -> &'a WaitQueue {
        unsafe { self.0.as_ref() }
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self::with_missed_wakeups(0)
    }

    pub(crate) const fn with_missed_wakeups(count: usize) -> Self {
        Self {
            inner: SpinLock::new(
                "waitq",
                WaitQueueInner {
                    sleepers: ArrayVec::new_const(),
                    missed_wakeups: count,
                },
            ),
        }
    }

    pub(crate) fn lock_inner<'a, A: Arch>(
        &'a self,
        ipl: &'a InterruptGuard<'_, A>,
    ) -> SpinLockGuard<'a, WaitQueueInner> {
        self.inner.lock(ipl)
    }

    pub(crate) fn try_lock_inner<'a, A: Arch>(
        &'a self,
        ipl: &'a InterruptGuard<'_, A>,
    ) -> Option<SpinLockGuard<'a, WaitQueueInner>> {
        self.inner.try_lock(ipl)
    }

    /// Sleeps until woken up.
    pub fn sleep<A: Arch>(&self, kernel: &Kernel<A>) -> Result<SleepOutcome, KernelError> {
        self.sleep_timeout(kernel, 0, SynchFlags::empty())
    }

    /// Sleeps until woken up or until `usec` microseconds pass.
    ///
    /// `usec == 0` means no timeout. With [`SynchFlags::NON_BLOCKING`] and
    /// no timeout, the call fails with [`KernelError::WouldBlock`] instead
    /// of sleeping.
    pub fn sleep_timeout<A: Arch>(
        &self,
        kernel: &Kernel<A>,
        usec: u64,
        flags: SynchFlags,
    ) -> Result<SleepOutcome, KernelError> {
        let ipl = kernel.interrupts_disable();
        let inner = self.inner.lock(&ipl);
        self.sleep_locked(kernel, &ipl, inner, usec, flags)
    }

    /// Second half of a sleep whose caller has locked the queue.
    ///
    /// Other locks of the caller may be released before this call: the
    /// queue lock alone keeps a wakeup from getting lost.
    pub(crate) fn sleep_locked<'a, A: Arch>(
        &'a self,
        kernel: &Kernel<A>,
        ipl: &'a InterruptGuard<'_, A>,
        mut inner: SpinLockGuard<'a, WaitQueueInner>,
        usec: u64,
        flags: SynchFlags,
    ) -> Result<SleepOutcome, KernelError> {
        if inner.take_missed_wakeup() {
            return Ok(SleepOutcome::Atomic);
        }
        if flags.contains(SynchFlags::NON_BLOCKING) && usec == 0 {
            return Err(KernelError::WouldBlock);
        }
        kernel.block_current(ipl, self, inner, usec)
    }

    /// Wakes sleeping threads.
    ///
    /// A wakeup finding nobody is remembered for the next sleeper.
    pub fn wakeup<A: Arch>(&self, kernel: &Kernel<A>, mode: WakeupMode) {
        let ipl = kernel.interrupts_disable();
        let mut inner = self.inner.lock(&ipl);
        self.wakeup_locked(kernel, &ipl, &mut inner, mode);
    }

    pub(crate) fn wakeup_locked<A: Arch>(
        &self,
        kernel: &Kernel<A>,
        ipl: &InterruptGuard<'_, A>,
        inner: &mut WaitQueueInner,
        mode: WakeupMode,
    ) {
        let mut woken = 0;
        loop {
            let Some(tid) = inner.pop_front() else {
                if woken == 0 {
                    inner.missed_wakeups += 1;
                }
                return;
            };
            woken += 1;
            kernel.wake_sleeper(ipl, tid, self, WakeReason::Woken);
            if mode == WakeupMode::First {
                return;
            }
        }
    }

    /// Tears the queue down, interrupting its sleepers.
    ///
    /// # Panics
    ///
    /// Panics if threads sleep in the queue, unless `force` is set.
    pub fn destroy<A: Arch>(&self, kernel: &Kernel<A>, force: bool) {
        let ipl = kernel.interrupts_disable();
        let mut inner = self.inner.lock(&ipl);
        assert!(
            force || inner.is_empty(),
            "destroying wait queue with {} sleeper(s)",
            inner.sleepers.len()
        );
        while let Some(tid) = inner.pop_front() {
            kernel.wake_sleeper(&ipl, tid, self, WakeReason::Interrupted);
        }
        inner.missed_wakeups = 0;
    }

    pub(crate) fn reset<A: Arch>(&self, ipl: &InterruptGuard<'_, A>) {
        let mut inner = self.inner.lock(ipl);
        assert!(inner.is_empty(), "resetting wait queue with sleepers");
        inner.missed_wakeups = 0;
    }

    pub fn missed_wakeups<A: Arch>(&self, kernel: &Kernel<A>) -> usize {
        let ipl = kernel.interrupts_disable();
        self.inner.lock(&ipl).missed_wakeups
    }

    /// Number of threads sleeping in the queue.
    pub fn sleepers<A: Arch>(&self, kernel: &Kernel<A>) -> usize {
        let ipl = kernel.interrupts_disable();
        self.inner.lock(&ipl).sleepers.len()
    }
}

impl Drop for WaitQueue {
    fn drop(&mut self) {
        assert!(
            self.inner.get_mut().is_empty(),
            "wait queue dropped with sleepers"
        );
    }
}

fn sleep_timed_out<A: Arch>(kernel: &Kernel<A>, ipl: &InterruptGuard<'_, A>, id: TimeoutId, arg: u64) {
    kernel.sleep_timeout_expired(ipl, ThreadId::from_raw(arg), id);
}

impl<A: Arch> Kernel<A> {
    /// Links the current thread to `wq` and switches away.
    fn block_current<'a>(
        &self,
        ipl: &'a InterruptGuard<'_, A>,
        wq: &'a WaitQueue,
        mut inner: SpinLockGuard<'a, WaitQueueInner>,
        usec: u64,
    ) -> Result<SleepOutcome, KernelError> {
        let tid = self.expect_current_thread(ipl);
        let mut shared = self.threads.slot(tid).shared.lock(ipl);

        shared.sleep_timeout = None;
        if usec > 0 {
            let id = self.timeout_register(ipl, usec, sleep_timed_out::<A>, tid.to_raw())?;
            shared.sleep_timeout = Some(id);
        }

        inner.sleepers.push(tid);
        shared.link = ThreadLink::WaitQueue(WaitQueueRef::new(wq));
        shared.state = ThreadState::Sleeping;
        shared.wake_reason = None;
        drop(inner);

        self.sched(ipl, &mut shared);

        match shared.wake_reason.take() {
            Some(WakeReason::Woken) => Ok(SleepOutcome::Blocked),
            Some(WakeReason::TimedOut) => Err(KernelError::Timeout),
            Some(WakeReason::Interrupted) => Err(KernelError::Interrupted),
            None => panic!("thread {tid} resumed without a wakeup"),
        }
    }

    /// Unlinks `tid`, taken off `wq` by the caller, and readies it.
    fn wake_sleeper(
        &self,
        ipl: &InterruptGuard<'_, A>,
        tid: ThreadId,
        wq: &WaitQueue,
        reason: WakeReason,
    ) {
        let mut shared = self.threads.slot(tid).shared.lock(ipl);
        assert_eq!(
            shared.link,
            ThreadLink::WaitQueue(WaitQueueRef::new(wq)),
            "thread {tid} woken from a queue it does not sleep in"
        );
        shared.link = ThreadLink::Unlinked;
        if let Some(id) = shared.sleep_timeout {
            // If this fails, the handler is already running and clears the
            // field itself.
            if self.timeout_unregister(ipl, id) {
                shared.sleep_timeout = None;
            }
        }
        shared.wake_reason = Some(reason);
        drop(shared);
        self.thread_ready(ipl, tid);
    }

    /// Ends the sleep of `tid` when its timeout `id` fires.
    fn sleep_timeout_expired(&self, ipl: &InterruptGuard<'_, A>, tid: ThreadId, id: TimeoutId) {
        loop {
            let Ok(mut shared) = self.threads.lock(ipl, tid) else {
                return;
            };
            if shared.sleep_timeout != Some(id) {
                // Fired for a sleep that has already ended.
                return;
            }
            let ThreadLink::WaitQueue(wq) = shared.link else {
                // Woken while this handler was on its way.
                shared.sleep_timeout = None;
                return;
            };

            let wq = unsafe { wq.get() };
            // Wait queue locks nest outside thread locks.
            let Some(mut inner) = wq.try_lock_inner(ipl) else {
                drop(shared);
                A::spin_hint();
                continue;
            };
            assert!(inner.remove(tid), "thread {tid} missing from its wait queue");
            drop(inner);

            shared.link = ThreadLink::Unlinked;
            shared.sleep_timeout = None;
            shared.wake_reason = Some(WakeReason::TimedOut);
            drop(shared);
            self.thread_ready(ipl, tid);
            return;
        }
    }
}
