//! Thread lifecycle.

use alloc::boxed::Box;

use arrayvec::ArrayString;
use spindle_abi::{CpuId, SynchFlags, TaskId};
use spindle_kernel_params::THREAD_NAME_LEN;

use super::{ThreadFlags, ThreadId, ThreadShared, ThreadState};
use crate::{
    Kernel, KernelError,
    arch::Arch,
    interrupt::InterruptGuard,
    sync::{SleepOutcome, SpinLockGuard, WaitQueue, WakeupMode},
};

/// Why a sleeping thread was resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WakeReason {
    Woken,
    TimedOut,
    Interrupted,
}

/// Builder for kernel threads.
#[derive(Debug, Clone)]
pub struct ThreadBuilder<'n> {
    name: &'n str,
    cpu: Option<CpuId>,
    flags: ThreadFlags,
    detached: bool,
    task: TaskId,
}

impl<'n> ThreadBuilder<'n> {
    #[must_use]
    pub fn new(name: &'n str) -> Self {
        Self {
            name,
            cpu: None,
            flags: ThreadFlags::empty(),
            detached: false,
            task: TaskId::KERNEL,
        }
    }

    /// Places the new thread on `cpu`.
    ///
    /// Only the first time the thread is readied is affected.
    #[must_use]
    pub fn cpu(mut self, cpu: CpuId) -> Self {
        self.cpu = Some(cpu);
        self
    }

    /// Restricts the thread to `cpu`.
    #[must_use]
    pub fn wired(mut self, cpu: CpuId) -> Self {
        self.cpu = Some(cpu);
        self.flags.insert(ThreadFlags::WIRED);
        self
    }

    /// Detached threads are destroyed as soon as they exit.
    #[must_use]
    pub fn detached(mut self, detached: bool) -> Self {
        self.detached = detached;
        self
    }

    #[must_use]
    pub fn task(mut self, task: TaskId) -> Self {
        self.task = task;
        self
    }

    #[must_use]
    pub fn uspace(mut self) -> Self {
        self.flags.insert(ThreadFlags::USPACE);
        self
    }

    /// Creates the thread in the `Entering` state.
    ///
    /// It does not run until passed to [`Kernel::thread_ready()`].
    pub fn create<A, F>(self, kernel: &'static Kernel<A>, f: F) -> Result<ThreadId, KernelError>
    where
        A: Arch,
        F: FnOnce() + Send + 'static,
    {
        kernel.thread_create(self, f)
    }

    /// Creates the thread and makes it ready.
    pub fn spawn<A, F>(self, kernel: &'static Kernel<A>, f: F) -> Result<ThreadId, KernelError>
    where
        A: Arch,
        F: FnOnce() + Send + 'static,
    {
        let tid = kernel.thread_create(self, f)?;
        let ipl = kernel.interrupts_disable();
        kernel.thread_ready(&ipl, tid);
        Ok(tid)
    }
}

fn truncated_name(name: &str) -> ArrayString<THREAD_NAME_LEN> {
    let mut s = ArrayString::new();
    for c in name.chars() {
        if s.try_push(c).is_err() {
            break;
        }
    }
    s
}

impl<A: Arch> Kernel<A> {
    fn thread_create<F>(&'static self, builder: ThreadBuilder<'_>, f: F) -> Result<ThreadId, KernelError>
    where
        F: FnOnce() + Send + 'static,
    {
        if builder
            .cpu
            .is_some_and(|cpu| cpu.as_index() >= self.cpu_active)
        {
            return Err(KernelError::InvalidArgument);
        }

        let ipl = self.interrupts_disable();
        let (tid, mut shared) = self.threads.alloc(&ipl)?;
        shared.name = truncated_name(builder.name);
        shared.task = builder.task;
        shared.flags = builder.flags;
        shared.cpu = builder.cpu;
        shared.detached = builder.detached;
        drop(shared);
        drop(ipl);

        let context = self
            .arch
            .spawn_context(builder.name, Box::new(move || self.thread_start(tid, f)));
        // Still `Entering`: no scheduler looks at the slot.
        unsafe { self.threads.slot(tid).set_context(Some(context)) };

        log::debug!("thread {tid} ({}) created", builder.name);
        Ok(tid)
    }

    /// First code run by every thread.
    fn thread_start<F>(&self, tid: ThreadId, f: F)
    where
        F: FnOnce(),
    {
        // The scheduler loop switched here holding our lock; there is no
        // guard on this stack to release it.
        let ipl = self.interrupts_disable();
        unsafe { self.threads.slot(tid).shared.force_unlock(&ipl) };
        drop(ipl);
        self.interrupts_enable();

        f();

        self.thread_exit();
    }

    /// Terminates the calling thread.
    pub fn thread_exit(&self) -> ! {
        loop {
            let ipl = self.interrupts_disable();
            let tid = self.expect_current_thread(&ipl);
            let mut shared = self.threads.slot(tid).shared.lock(&ipl);
            if shared.sleep_timeout.is_some() {
                // A timeout handler may still be on its way to us.
                drop(shared);
                drop(ipl);
                A::spin_hint();
                continue;
            }

            log::debug!("thread {tid} exiting");
            shared.state = ThreadState::Exiting;
            self.sched(&ipl, &mut shared);
            unreachable!("exited thread {tid} was resumed");
        }
    }

    /// Called by the scheduler loop once an exiting thread has left its
    /// context for good.
    pub(crate) fn thread_retire<'a>(
        &'a self,
        ipl: &'a InterruptGuard<'_, A>,
        mut shared: SpinLockGuard<'a, ThreadShared>,
    ) {
        if shared.detached {
            self.thread_destroy(ipl, shared);
            return;
        }

        let slot = self.threads.slot(shared.tid());
        loop {
            // Wait queue locks nest outside thread locks; only try it while
            // holding ours.
            if let Some(mut joiners) = slot.join_wq.try_lock_inner(ipl) {
                slot.join_wq
                    .wakeup_locked(self, ipl, &mut joiners, WakeupMode::First);
                break;
            }
            drop(shared);
            A::spin_hint();
            shared = slot.shared.lock(ipl);
        }
        shared.state = ThreadState::Lingering;
    }

    fn thread_destroy(&self, ipl: &InterruptGuard<'_, A>, mut shared: SpinLockGuard<'_, ThreadShared>) {
        let tid = shared.tid();
        assert!(
            matches!(shared.state, ThreadState::Exiting | ThreadState::Lingering),
            "destroying thread {tid} in state {}",
            shared.state
        );
        let slot = self.threads.slot(tid);
        slot.join_wq.reset(ipl);
        // The context is not running: the thread has switched away for the
        // last time.
        unsafe { slot.set_context(None) };
        *shared = ThreadShared::free();
        log::debug!("thread {tid} destroyed");
    }

    /// Waits for `tid` to exit.
    ///
    /// The thread must not be detached.
    pub fn thread_join_timeout(
        &self,
        tid: ThreadId,
        usec: u64,
        flags: SynchFlags,
    ) -> Result<SleepOutcome, KernelError> {
        let ipl = self.interrupts_disable();
        if self.current_thread_locked(&ipl) == Some(tid) {
            return Err(KernelError::InvalidArgument);
        }
        let shared = self.threads.lock(&ipl, tid)?;
        assert!(!shared.detached, "joining detached thread {tid}");
        drop(shared);
        drop(ipl);

        self.threads
            .slot(tid)
            .join_wq
            .sleep_timeout(self, usec, flags)
    }

    /// Waits for `tid` to exit and destroys it.
    pub fn thread_join(&self, tid: ThreadId) -> Result<(), KernelError> {
        self.thread_join_timeout(tid, 0, SynchFlags::empty())?;
        self.thread_detach(tid)
    }

    /// Lets `tid` be destroyed as soon as it exits.
    ///
    /// A thread that has already exited is destroyed right away.
    pub fn thread_detach(&self, tid: ThreadId) -> Result<(), KernelError> {
        let ipl = self.interrupts_disable();
        let mut shared = self.threads.lock(&ipl, tid)?;
        assert!(!shared.detached, "thread {tid} detached twice");
        if shared.state == ThreadState::Lingering {
            self.thread_destroy(&ipl, shared);
        } else {
            shared.detached = true;
        }
        Ok(())
    }

    /// Puts the calling thread to sleep for at least `usec` microseconds.
    ///
    /// Fails with [`KernelError::NoFreeTimeout`], without sleeping, when
    /// the CPU has no timeout left to wake the thread.
    pub fn thread_usleep(&self, usec: u64) -> Result<(), KernelError> {
        let wq = WaitQueue::new();
        // Nobody else knows the queue; only the timeout ends the sleep.
        match wq.sleep_timeout(self, usec, SynchFlags::NON_BLOCKING) {
            Ok(_) | Err(KernelError::Timeout) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn thread_sleep(&self, sec: u32) -> Result<(), KernelError> {
        self.thread_usleep(u64::from(sec) * 1_000_000)
    }
}
