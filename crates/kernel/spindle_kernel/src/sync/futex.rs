//! Futexes.
//!
//! A [`Futex`] is a counting semaphore whose count lives in a word the user
//! can update atomically. Only when the count says somebody has to sleep, or
//! be woken, does the kernel get involved: it maps the word's address to a
//! wait queue of the [`FutexTable`] for as long as the address has users.

use core::sync::atomic::{AtomicIsize, Ordering};

use spindle_abi::{SynchFlags, error::Errno};
use spindle_kernel_params::NFUTEX;

use super::{SleepOutcome, SpinLock, WaitQueue, WakeupMode};
use crate::{Kernel, KernelError, arch::Arch, interrupt::InterruptGuard};

/// User-side futex word.
///
/// A positive count is the number of free units; a negative one is minus
/// the number of threads asleep or on their way to sleep.
pub struct Futex {
    count: AtomicIsize,
}

impl Futex {
    pub const fn new(count: isize) -> Self {
        Self {
            count: AtomicIsize::new(count),
        }
    }

    /// Address identifying the futex to the kernel.
    pub fn address(&self) -> usize {
        core::ptr::from_ref(&self.count).addr()
    }

    pub fn value(&self) -> isize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn down<A: Arch>(&self, kernel: &Kernel<A>) -> Result<SleepOutcome, Errno> {
        self.down_timeout(kernel, 0, SynchFlags::empty())
    }

    /// Takes one unit, sleeping in the kernel if none is free.
    ///
    /// A failed sleep leaves the count decremented; the wakeup sent for it by
    /// a later [`up()`](Self::up) is then kept by the kernel queue for the
    /// next sleeper.
    pub fn down_timeout<A: Arch>(
        &self,
        kernel: &Kernel<A>,
        usec: u64,
        flags: SynchFlags,
    ) -> Result<SleepOutcome, Errno> {
        if self.count.fetch_sub(1, Ordering::SeqCst) > 0 {
            return Ok(SleepOutcome::Atomic);
        }
        kernel.futex_sleep(self.address(), usec, flags)
    }

    /// Takes one unit if one is free; never enters the kernel.
    pub fn try_down(&self) -> bool {
        self.count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| (c > 0).then(|| c - 1))
            .is_ok()
    }

    pub fn up<A: Arch>(&self, kernel: &Kernel<A>) -> Result<(), Errno> {
        if self.count.fetch_add(1, Ordering::SeqCst) < 0 {
            kernel.futex_wakeup(self.address())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct FutexSlot {
    /// Futex address, `None` while the slot is free.
    addr: Option<usize>,
    /// Threads inside `futex_sleep()` or `futex_wakeup()` for `addr`.
    users: usize,
}

/// Kernel wait queues of contended futexes.
pub(crate) struct FutexTable {
    index: SpinLock<[FutexSlot; NFUTEX]>,
    queues: [WaitQueue; NFUTEX],
}

impl FutexTable {
    pub(crate) fn new() -> Self {
        Self {
            index: SpinLock::new(
                "futex",
                [FutexSlot {
                    addr: None,
                    users: 0,
                }; NFUTEX],
            ),
            queues: core::array::from_fn(|_| WaitQueue::new()),
        }
    }

    /// Finds or allocates the queue of `addr` and registers a user of it.
    fn get<A: Arch>(&self, ipl: &InterruptGuard<'_, A>, addr: usize) -> Result<usize, KernelError> {
        let mut index = self.index.lock(ipl);
        let slot = index
            .iter()
            .position(|s| s.addr == Some(addr))
            .or_else(|| index.iter().position(|s| s.addr.is_none()))
            .ok_or_else(|| {
                log::warn!("futex table full");
                KernelError::NoFreeFutex
            })?;
        index[slot].addr = Some(addr);
        index[slot].users += 1;
        Ok(slot)
    }

    /// Drops a user of queue `slot`, freeing it once idle.
    ///
    /// A queue holding a wakeup nobody consumed yet is kept.
    fn put<A: Arch>(&self, ipl: &InterruptGuard<'_, A>, slot: usize) {
        let mut index = self.index.lock(ipl);
        let entry = &mut index[slot];
        entry.users -= 1;
        if entry.users > 0 {
            return;
        }
        let wq = self.queues[slot].lock_inner(ipl);
        if wq.is_empty() && wq.missed_wakeups() == 0 {
            entry.addr = None;
        }
    }

    fn in_use<A: Arch>(&self, ipl: &InterruptGuard<'_, A>) -> usize {
        self.index
            .lock(ipl)
            .iter()
            .filter(|s| s.addr.is_some())
            .count()
    }
}

impl<A: Arch> Kernel<A> {
    /// Sleeps on the futex at `addr`.
    pub fn futex_sleep(&self, addr: usize, usec: u64, flags: SynchFlags) -> Result<SleepOutcome, Errno> {
        let slot = self.futexes.get(&self.interrupts_disable(), addr)?;
        let rc = self.futexes.queues[slot].sleep_timeout(self, usec, flags);
        self.futexes.put(&self.interrupts_disable(), slot);
        rc.map_err(Errno::from)
    }

    /// Wakes one thread sleeping on the futex at `addr`.
    pub fn futex_wakeup(&self, addr: usize) -> Result<(), Errno> {
        let slot = self.futexes.get(&self.interrupts_disable(), addr)?;
        self.futexes.queues[slot].wakeup(self, WakeupMode::First);
        self.futexes.put(&self.interrupts_disable(), slot);
        Ok(())
    }

    /// Number of futex addresses holding a kernel queue.
    pub fn futexes_in_use(&self) -> usize {
        self.futexes.in_use(&self.interrupts_disable())
    }
}
