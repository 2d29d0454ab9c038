//! Threads and their scheduling.

use core::{
    cell::UnsafeCell,
    fmt,
    sync::atomic::{AtomicU32, Ordering},
};

use arrayvec::ArrayString;
use bitflags::bitflags;
use spindle_abi::{CpuId, TaskId};
use spindle_kernel_params::{NTHREAD, THREAD_NAME_LEN};
use strum::IntoStaticStr;

pub use self::thread::ThreadBuilder;
pub(crate) use self::{run_queue::RunQueue, thread::WakeReason};
use crate::{
    Kernel, KernelError,
    arch::Arch,
    interrupt::InterruptGuard,
    sync::{SpinLock, SpinLockGuard, WaitQueue, rw_lock::RwLockRole, wait_queue::WaitQueueRef},
    time::TimeoutId,
};

mod load_balance;
mod run_queue;
mod scheduler;
mod thread;

/// Identifier of a thread.
///
/// Names a slot of the thread table together with the incarnation living
/// in it, so identifiers of destroyed threads never match a new thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId {
    slot: u32,
    serial: u32,
}

impl ThreadId {
    fn new(slot: usize, serial: u32) -> Self {
        let slot = u32::try_from(slot).unwrap_or_else(|_| panic!("thread slot {slot} too large"));
        Self { slot, serial }
    }

    /// Number unique among the threads created so far.
    #[must_use]
    pub const fn serial(self) -> u32 {
        self.serial
    }

    pub(crate) const fn slot(self) -> usize {
        self.slot as usize
    }

    /// Packs the identifier into a non-zero word.
    pub(crate) const fn to_raw(self) -> u64 {
        ((self.slot as u64) << 32) | self.serial as u64
    }

    #[expect(clippy::cast_possible_truncation)]
    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self {
            slot: (raw >> 32) as u32,
            serial: raw as u32,
        }
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.serial, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub enum ThreadState {
    /// The slot holds no thread.
    Invalid,
    Running,
    Sleeping,
    Ready,
    /// Created, or taken off a run queue, and not yet readied.
    Entering,
    Exiting,
    /// Exited; waits for being joined or detached.
    Lingering,
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.into())
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ThreadFlags: u32 {
        /// The thread runs on one CPU only.
        const WIRED = 1 << 0;
        /// Migrated by the load balancer and not run since.
        const STOLEN = 1 << 1;
        /// The thread runs user code.
        const USPACE = 1 << 2;
    }
}

/// Where a thread is linked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ThreadLink {
    Unlinked,
    RunQueue { cpu: CpuId, band: usize },
    WaitQueue(WaitQueueRef),
}

/// Thread state protected by the thread lock.
pub(crate) struct ThreadShared {
    pub(crate) id: Option<ThreadId>,
    pub(crate) name: ArrayString<THREAD_NAME_LEN>,
    pub(crate) task: TaskId,
    pub(crate) state: ThreadState,
    pub(crate) flags: ThreadFlags,
    /// Band the thread was last picked from; `-1` after a sleep.
    pub(crate) priority: isize,
    /// Remaining quantum in clock ticks.
    pub(crate) ticks: u64,
    /// Last CPU the thread ran on, or the one it is placed on or wired to.
    pub(crate) cpu: Option<CpuId>,
    pub(crate) link: ThreadLink,
    pub(crate) detached: bool,
    pub(crate) sleep_timeout: Option<TimeoutId>,
    pub(crate) wake_reason: Option<WakeReason>,
    pub(crate) rwlock_role: RwLockRole,
    pub(crate) cycles: u64,
    pub(crate) last_cycle: u64,
}

impl ThreadShared {
    const fn free() -> Self {
        Self {
            id: None,
            name: ArrayString::new_const(),
            task: TaskId::KERNEL,
            state: ThreadState::Invalid,
            flags: ThreadFlags::empty(),
            priority: -1,
            ticks: 0,
            cpu: None,
            link: ThreadLink::Unlinked,
            detached: false,
            sleep_timeout: None,
            wake_reason: None,
            rwlock_role: RwLockRole::None,
            cycles: 0,
            last_cycle: 0,
        }
    }

    #[track_caller]
    pub(crate) fn tid(&self) -> ThreadId {
        self.id.unwrap_or_else(|| panic!("thread slot is free"))
    }

    /// Charges the cycles run since the last call.
    pub(crate) fn update_accounting(&mut self, now: u64) {
        self.cycles += now.saturating_sub(self.last_cycle);
        self.last_cycle = now;
    }
}

pub(crate) struct ThreadSlot<A: Arch> {
    pub(crate) shared: SpinLock<ThreadShared>,
    context: UnsafeCell<Option<A::Context>>,
    pub(crate) join_wq: WaitQueue,
}

unsafe impl<A: Arch> Sync for ThreadSlot<A> {}

impl<A: Arch> ThreadSlot<A> {
    fn new() -> Self {
        Self {
            shared: SpinLock::new("thread", ThreadShared::free()),
            context: UnsafeCell::new(None),
            join_wq: WaitQueue::new(),
        }
    }

    /// Returns the saved context of the thread.
    ///
    /// # Safety
    ///
    /// The thread lock must be held, or the thread must be the caller.
    pub(crate) unsafe fn context(&self) -> &A::Context {
        unsafe { (*self.context.get()).as_ref() }
            .unwrap_or_else(|| panic!("thread has no context"))
    }

    /// # Safety
    ///
    /// The slot must be `Entering` and not yet visible to any scheduler.
    unsafe fn set_context(&self, context: Option<A::Context>) {
        unsafe { *self.context.get() = context }
    }
}

pub(crate) struct ThreadTable<A: Arch> {
    slots: [ThreadSlot<A>; NTHREAD],
    next_serial: AtomicU32,
}

impl<A: Arch> ThreadTable<A> {
    pub(crate) fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| ThreadSlot::new()),
            next_serial: AtomicU32::new(1),
        }
    }

    /// Returns the slot `tid` lives in, without checking the incarnation.
    pub(crate) fn slot(&self, tid: ThreadId) -> &ThreadSlot<A> {
        &self.slots[tid.slot()]
    }

    /// Locks the thread `tid`.
    pub(crate) fn lock<'a>(
        &'a self,
        ipl: &'a InterruptGuard<'_, A>,
        tid: ThreadId,
    ) -> Result<SpinLockGuard<'a, ThreadShared>, KernelError> {
        let slot = self
            .slots
            .get(tid.slot())
            .ok_or(KernelError::ThreadNotFound(tid))?;
        let shared = slot.shared.lock(ipl);
        if shared.id != Some(tid) {
            return Err(KernelError::ThreadNotFound(tid));
        }
        Ok(shared)
    }

    /// Claims a free slot for a new thread in the `Entering` state.
    fn alloc<'a>(
        &'a self,
        ipl: &'a InterruptGuard<'_, A>,
    ) -> Result<(ThreadId, SpinLockGuard<'a, ThreadShared>), KernelError> {
        for (i, slot) in self.slots.iter().enumerate() {
            let mut shared = slot.shared.lock(ipl);
            if shared.state != ThreadState::Invalid {
                continue;
            }
            let tid = ThreadId::new(i, self.next_serial.fetch_add(1, Ordering::Relaxed));
            *shared = ThreadShared::free();
            shared.id = Some(tid);
            shared.state = ThreadState::Entering;
            return Ok((tid, shared));
        }
        Err(KernelError::NoFreeThread)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &ThreadSlot<A>> {
        self.slots.iter()
    }
}

/// Snapshot of a thread's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub name: ArrayString<THREAD_NAME_LEN>,
    pub task: TaskId,
    pub state: ThreadState,
    pub flags: ThreadFlags,
    pub priority: isize,
    pub ticks: u64,
    pub cpu: Option<CpuId>,
    pub detached: bool,
    pub cycles: u64,
}

impl<A: Arch> Kernel<A> {
    /// Returns the thread running on the current CPU.
    pub fn current_thread(&self) -> Option<ThreadId> {
        let ipl = self.interrupts_disable();
        self.current_thread_locked(&ipl)
    }

    pub(crate) fn current_thread_locked(&self, ipl: &InterruptGuard<'_, A>) -> Option<ThreadId> {
        A::cpu_id().and_then(|_| self.current_cpu(ipl).current_thread())
    }

    #[track_caller]
    pub(crate) fn expect_current_thread(&self, ipl: &InterruptGuard<'_, A>) -> ThreadId {
        self.current_thread_locked(ipl)
            .unwrap_or_else(|| panic!("no thread running on this CPU"))
    }

    pub fn thread_info(&self, tid: ThreadId) -> Option<ThreadInfo> {
        let ipl = self.interrupts_disable();
        let shared = self.threads.lock(&ipl, tid).ok()?;
        Some(ThreadInfo {
            id: tid,
            name: shared.name,
            task: shared.task,
            state: shared.state,
            flags: shared.flags,
            priority: shared.priority,
            ticks: shared.ticks,
            cpu: shared.cpu,
            detached: shared.detached,
            cycles: shared.cycles,
        })
    }

    /// Writes a line per live thread.
    pub fn thread_print_list<W: fmt::Write>(&self, w: &mut W) -> fmt::Result {
        let ipl = self.interrupts_disable();
        writeln!(
            w,
            "{:<6} {:<16} {:<9} {:>5} {:>12} {:>4}  waitq",
            "tid", "name", "state", "task", "cycles", "cpu"
        )?;
        for slot in self.threads.iter() {
            let shared = slot.shared.lock(&ipl);
            let Some(tid) = shared.id else { continue };
            write!(
                w,
                "{:<6} {:<16} {:<9} {:>5} {:>12} ",
                tid, shared.name, shared.state, shared.task, shared.cycles
            )?;
            match shared.cpu {
                Some(cpu) => write!(w, "{cpu:>4}")?,
                None => write!(w, "{:>4}", "none")?,
            }
            if let ThreadLink::WaitQueue(wq) = shared.link {
                write!(w, "  {:#x}", wq.addr())?;
            }
            writeln!(w)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::string::String;

    use super::*;
    use crate::test_util;

    #[test]
    fn thread_id_packs_into_word() {
        let tid = ThreadId::new(5, 42);
        assert_ne!(tid.to_raw(), 0);
        assert_eq!(ThreadId::from_raw(tid.to_raw()), tid);
        assert_eq!(std::format!("{tid}"), "42");
    }

    #[test]
    fn stale_ids_are_rejected() {
        let k = test_util::kernel(1);
        let tid = test_util::create_thread(k, "t");
        let stale = ThreadId::new(tid.slot(), tid.serial() + 1000);
        assert!(k.thread_info(tid).is_some());
        assert_eq!(k.thread_info(stale), None);
        assert_eq!(
            k.thread_detach(stale),
            Err(KernelError::ThreadNotFound(stale))
        );
    }

    #[test]
    fn table_runs_out_of_slots() {
        let k = test_util::kernel(1);
        for i in 0..NTHREAD {
            let name = std::format!("t{i}");
            test_util::create_thread(k, &name);
        }
        let ipl = k.interrupts_disable();
        assert!(matches!(
            k.threads.alloc(&ipl),
            Err(KernelError::NoFreeThread)
        ));
    }

    #[test]
    fn print_list_shows_threads() {
        let k = test_util::kernel(1);
        let tid = test_util::create_thread(k, "printer");
        let mut out = String::new();
        k.thread_print_list(&mut out).unwrap();
        let line = out
            .lines()
            .find(|l| l.contains("printer"))
            .unwrap_or_else(|| panic!("no line for {tid} in {out}"));
        assert!(line.starts_with(&std::format!("{tid:<6}")));
        assert!(line.contains("Entering"));
    }
}
