//! Reader/writer lock.
//!
//! The `exclusive` semaphore is held either by one writer or collectively
//! by all readers inside; `readers_in` counts the latter. A reader arriving
//! while other readers are inside joins them unless somebody is queued on
//! `exclusive`. Whoever releases the lock hands it to the head of the queue:
//! a writer, or the run of readers at the head, for whom it raises
//! `readers_in` before waking them.
//!
//! Readers that are already inside never wait for a queued writer, so a
//! steady stream of overlapping readers arriving while the queue is empty
//! keeps writers out.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
};

use spindle_abi::SynchFlags;

use super::{Semaphore, SleepOutcome, SpinLock, WakeupMode, wait_queue::WaitQueueInner};
use crate::{Kernel, KernelError, arch::Arch, interrupt::InterruptGuard, proc::ThreadId};

/// What a thread sleeping on an rwlock is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RwLockRole {
    None,
    Reader,
    Writer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LetIn {
    /// Only readers, and only if readers hold the lock.
    ReadersOnly,
    /// Whoever heads the queue.
    All,
}

struct RwState {
    readers_in: usize,
}

pub struct RwLock<T> {
    state: SpinLock<RwState>,
    exclusive: Semaphore,
    value: UnsafeCell<T>,
}

unsafe impl<T> Sync for RwLock<T> where T: Send + Sync {}

impl<T: Default> Default for RwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> RwLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            state: SpinLock::new("rwlock", RwState { readers_in: 0 }),
            exclusive: Semaphore::new(1),
            value: UnsafeCell::new(value),
        }
    }

    pub fn read<'a, A: Arch>(&'a self, kernel: &'a Kernel<A>) -> RwLockReadGuard<'a, A, T> {
        self.read_timeout(kernel, 0, SynchFlags::empty())
            .unwrap_or_else(|e| panic!("rwlock read without timeout failed: {e}"))
    }

    pub fn write<'a, A: Arch>(&'a self, kernel: &'a Kernel<A>) -> RwLockWriteGuard<'a, A, T> {
        self.write_timeout(kernel, 0, SynchFlags::empty())
            .unwrap_or_else(|e| panic!("rwlock write without timeout failed: {e}"))
    }

    pub fn try_read<'a, A: Arch>(
        &'a self,
        kernel: &'a Kernel<A>,
    ) -> Result<RwLockReadGuard<'a, A, T>, KernelError> {
        self.read_timeout(kernel, 0, SynchFlags::NON_BLOCKING)
    }

    pub fn try_write<'a, A: Arch>(
        &'a self,
        kernel: &'a Kernel<A>,
    ) -> Result<RwLockWriteGuard<'a, A, T>, KernelError> {
        self.write_timeout(kernel, 0, SynchFlags::NON_BLOCKING)
    }

    /// Acquires the lock for writing.
    ///
    /// Takes the same arguments as [`WaitQueue::sleep_timeout()`].
    ///
    /// [`WaitQueue::sleep_timeout()`]: super::WaitQueue::sleep_timeout
    pub fn write_timeout<'a, A: Arch>(
        &'a self,
        kernel: &'a Kernel<A>,
        usec: u64,
        flags: SynchFlags,
    ) -> Result<RwLockWriteGuard<'a, A, T>, KernelError> {
        {
            let ipl = kernel.interrupts_disable();
            kernel.set_rwlock_role(&ipl, RwLockRole::Writer);
        }
        let rc = self.exclusive.down_timeout(kernel, usec, flags);
        let ipl = kernel.interrupts_disable();
        kernel.set_rwlock_role(&ipl, RwLockRole::None);

        if let Err(e) = rc {
            // Readers queued behind us may be able to join the ones inside.
            let mut state = self.state.lock(&ipl);
            if state.readers_in > 0 {
                self.let_others_in(kernel, &ipl, &mut state, LetIn::ReadersOnly);
            }
            return Err(e);
        }
        Ok(RwLockWriteGuard { lock: self, kernel })
    }

    /// Acquires the lock for reading.
    ///
    /// Takes the same arguments as [`WaitQueue::sleep_timeout()`].
    ///
    /// [`WaitQueue::sleep_timeout()`]: super::WaitQueue::sleep_timeout
    pub fn read_timeout<'a, A: Arch>(
        &'a self,
        kernel: &'a Kernel<A>,
        usec: u64,
        flags: SynchFlags,
    ) -> Result<RwLockReadGuard<'a, A, T>, KernelError> {
        let ipl = kernel.interrupts_disable();
        let mut state = self.state.lock(&ipl);
        let wq = self.exclusive.wait_queue();
        let mut inner = wq.lock_inner(&ipl);

        if inner.take_missed_wakeup() {
            // `exclusive` was free.
            state.readers_in += 1;
            return Ok(RwLockReadGuard { lock: self, kernel });
        }
        if state.readers_in > 0 && inner.is_empty() {
            // Readers are inside and no writer waits.
            state.readers_in += 1;
            return Ok(RwLockReadGuard { lock: self, kernel });
        }

        kernel.set_rwlock_role(&ipl, RwLockRole::Reader);
        drop(state);
        let rc = wq.sleep_locked(kernel, &ipl, inner, usec, flags);
        kernel.set_rwlock_role(&ipl, RwLockRole::None);

        match rc? {
            // Admitted by the releaser, which counted us in.
            SleepOutcome::Blocked => {}
            SleepOutcome::Atomic => unreachable!("rwlock wakeup consumed under the queue lock"),
        }
        Ok(RwLockReadGuard { lock: self, kernel })
    }

    fn read_unlock<A: Arch>(&self, kernel: &Kernel<A>) {
        let ipl = kernel.interrupts_disable();
        let mut state = self.state.lock(&ipl);
        assert!(state.readers_in > 0, "rwlock read-unlocked with no reader inside");
        state.readers_in -= 1;
        if state.readers_in == 0 {
            self.let_others_in(kernel, &ipl, &mut state, LetIn::All);
        }
    }

    fn write_unlock<A: Arch>(&self, kernel: &Kernel<A>) {
        let ipl = kernel.interrupts_disable();
        let mut state = self.state.lock(&ipl);
        self.let_others_in(kernel, &ipl, &mut state, LetIn::All);
    }

    /// Passes `exclusive` to the head of its queue, or releases it.
    fn let_others_in<A: Arch>(
        &self,
        kernel: &Kernel<A>,
        ipl: &InterruptGuard<'_, A>,
        state: &mut RwState,
        mode: LetIn,
    ) {
        let wq = self.exclusive.wait_queue();
        let mut inner = wq.lock_inner(ipl);
        let mut head = leading_role(kernel, ipl, &inner);
        loop {
            if mode == LetIn::ReadersOnly && head != Some(RwLockRole::Reader) {
                break;
            }
            if head == Some(RwLockRole::Reader) {
                state.readers_in += 1;
            }
            // With nobody queued, this frees `exclusive`.
            wq.wakeup_locked(kernel, ipl, &mut inner, WakeupMode::First);

            let woke_reader = head == Some(RwLockRole::Reader);
            head = leading_role(kernel, ipl, &inner);
            if !(woke_reader && head == Some(RwLockRole::Reader)) {
                break;
            }
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }

    /// Number of readers inside.
    pub fn readers<A: Arch>(&self, kernel: &Kernel<A>) -> usize {
        let ipl = kernel.interrupts_disable();
        self.state.lock(&ipl).readers_in
    }
}

fn leading_role<A: Arch>(
    kernel: &Kernel<A>,
    ipl: &InterruptGuard<'_, A>,
    inner: &WaitQueueInner,
) -> Option<RwLockRole> {
    inner
        .first()
        .map(|tid| kernel.rwlock_role(ipl, tid))
}

impl<A: Arch> Kernel<A> {
    fn set_rwlock_role(&self, ipl: &InterruptGuard<'_, A>, role: RwLockRole) {
        if let Some(tid) = self.current_thread_locked(ipl) {
            self.threads.slot(tid).shared.lock(ipl).rwlock_role = role;
        }
    }

    fn rwlock_role(&self, ipl: &InterruptGuard<'_, A>, tid: ThreadId) -> RwLockRole {
        self.threads.slot(tid).shared.lock(ipl).rwlock_role
    }
}

pub struct RwLockReadGuard<'a, A: Arch, T> {
    lock: &'a RwLock<T>,
    kernel: &'a Kernel<A>,
}

impl<A: Arch, T> Drop for RwLockReadGuard<'_, A, T> {
    fn drop(&mut self) {
        self.lock.read_unlock(self.kernel);
    }
}

impl<A: Arch, T> Deref for RwLockReadGuard<'_, A, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.value.get() }
    }
}

pub struct RwLockWriteGuard<'a, A: Arch, T> {
    lock: &'a RwLock<T>,
    kernel: &'a Kernel<A>,
}

impl<A: Arch, T> Drop for RwLockWriteGuard<'_, A, T> {
    fn drop(&mut self) {
        self.lock.write_unlock(self.kernel);
    }
}

impl<A: Arch, T> Deref for RwLockWriteGuard<'_, A, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.value.get() }
    }
}

impl<A: Arch, T> DerefMut for RwLockWriteGuard<'_, A, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.value.get() }
    }
}
