//! Per-CPU timeouts and the clock interrupt.
//!
//! Pending timeouts of a CPU form a delta list: each entry holds the number
//! of ticks remaining after its predecessor expires, so a clock tick only
//! ever touches the head.

use arrayvec::ArrayVec;
use spindle_abi::CpuId;
use spindle_kernel_params::{NTIMEOUT, us2ticks};

use crate::{Kernel, KernelError, arch::Arch, interrupt::InterruptGuard};

mod clock;

/// Identifier of a registered timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeoutId {
    cpu: CpuId,
    serial: u64,
}

impl TimeoutId {
    /// CPU whose clock drives the timeout.
    #[must_use]
    pub fn cpu(self) -> CpuId {
        self.cpu
    }
}

/// Function called when a timeout expires.
///
/// Runs from the clock interrupt of the registering CPU, with interrupts
/// disabled and no timeout queue locked.
pub type TimeoutHandler<A> = fn(&Kernel<A>, &InterruptGuard<'_, A>, TimeoutId, u64);

struct TimeoutEntry<A: Arch> {
    id: TimeoutId,
    delta: u64,
    handler: TimeoutHandler<A>,
    arg: u64,
}

pub(crate) struct Expired<A: Arch> {
    pub(crate) id: TimeoutId,
    pub(crate) handler: TimeoutHandler<A>,
    pub(crate) arg: u64,
}

pub(crate) struct TimeoutQueue<A: Arch> {
    cpu: CpuId,
    next_serial: u64,
    entries: ArrayVec<TimeoutEntry<A>, NTIMEOUT>,
}

impl<A: Arch> TimeoutQueue<A> {
    pub(crate) fn new(cpu: CpuId) -> Self {
        Self {
            cpu,
            next_serial: 1,
            entries: ArrayVec::new(),
        }
    }

    /// Inserts a timeout expiring after `ticks` ticks.
    fn insert(
        &mut self,
        ticks: u64,
        handler: TimeoutHandler<A>,
        arg: u64,
    ) -> Result<TimeoutId, KernelError> {
        if self.entries.is_full() {
            return Err(KernelError::NoFreeTimeout);
        }
        let id = TimeoutId {
            cpu: self.cpu,
            serial: self.next_serial,
        };
        self.next_serial += 1;

        let mut remaining = ticks;
        let mut pos = self.entries.len();
        for (i, entry) in self.entries.iter_mut().enumerate() {
            if remaining < entry.delta {
                entry.delta -= remaining;
                pos = i;
                break;
            }
            remaining -= entry.delta;
        }
        self.entries.insert(
            pos,
            TimeoutEntry {
                id,
                delta: remaining,
                handler,
                arg,
            },
        );
        Ok(id)
    }

    /// Removes `id`; returns `false` if it is not pending.
    fn remove(&mut self, id: TimeoutId) -> bool {
        let Some(pos) = self.entries.iter().position(|e| e.id == id) else {
            return false;
        };
        let entry = self.entries.remove(pos);
        if let Some(next) = self.entries.get_mut(pos) {
            next.delta += entry.delta;
        }
        true
    }

    /// Advances the queue by one tick.
    pub(crate) fn tick(&mut self) {
        if let Some(head) = self.entries.first_mut() {
            head.delta = head.delta.saturating_sub(1);
        }
    }

    /// Takes the head off the queue if it is due.
    pub(crate) fn pop_expired(&mut self) -> Option<Expired<A>> {
        if self.entries.first()?.delta > 0 {
            return None;
        }
        let entry = self.entries.remove(0);
        Some(Expired {
            id: entry.id,
            handler: entry.handler,
            arg: entry.arg,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    fn deltas(&self) -> std::vec::Vec<u64> {
        self.entries.iter().map(|e| e.delta).collect()
    }
}

impl<A: Arch> Kernel<A> {
    /// Arranges for `handler(arg)` to run on the current CPU after `usec`
    /// microseconds, rounded up to whole ticks.
    pub fn timeout_register(
        &self,
        ipl: &InterruptGuard<'_, A>,
        usec: u64,
        handler: TimeoutHandler<A>,
        arg: u64,
    ) -> Result<TimeoutId, KernelError> {
        let cpu = self.current_cpu(ipl);
        let ticks = us2ticks(usec).max(1);
        cpu.timeouts
            .lock(ipl)
            .insert(ticks, handler, arg)
            .inspect_err(|_| log::warn!("cpu{}: out of timeout slots", cpu.id()))
    }

    /// Cancels the timeout `id`.
    ///
    /// Returns `false` if it has already expired or been cancelled; its
    /// handler may then still be running.
    pub fn timeout_unregister(&self, ipl: &InterruptGuard<'_, A>, id: TimeoutId) -> bool {
        self.cpu(id.cpu).timeouts.lock(ipl).remove(id)
    }

    /// Number of timeouts pending on `cpu`.
    pub fn timeouts_pending(&self, cpu: CpuId) -> usize {
        let ipl = self.interrupts_disable();
        self.cpu(cpu).timeouts.lock(&ipl).len()
    }
}
