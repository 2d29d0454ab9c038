//! TLB shootdown.
//!
//! An initiator changing a mapping marks itself inactive, takes the global
//! shootdown lock, posts the invalidation to every other CPU and interrupts
//! them, then waits until no CPU is TLB-active. Each receiver marks itself
//! inactive and passes through the global lock, which blocks it until the
//! initiator has finished the mapping change. Only then does it invalidate
//! and become active again.
//!
//! Messages carry the sequence number of the shootdown posting them; a
//! receiver only processes messages of shootdowns that released the lock
//! before it passed.

use core::sync::atomic::{AtomicUsize, Ordering};

use arrayvec::ArrayVec;
use spindle_abi::{Asid, CpuId};
use spindle_kernel_params::TLB_MESSAGE_QUEUE_LEN;
use strum::FromRepr;

#[cfg(feature = "smp")]
use crate::arch::{CpuSet, IpiVector};
use crate::{
    Kernel,
    arch::Arch,
    cpu::Cpu,
    interrupt::InterruptGuard,
    sync::{SpinLock, SpinLockGuard},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum TlbInvalidateKind {
    All = 0,
    Asid = 1,
    Pages = 2,
}

/// A TLB invalidation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbInvalidate {
    /// Every entry.
    All,
    /// Every entry of one address space.
    Asid(Asid),
    /// `count` pages starting at `page` in one address space.
    Pages { asid: Asid, page: usize, count: usize },
}

impl TlbInvalidate {
    #[must_use]
    pub fn kind(self) -> TlbInvalidateKind {
        match self {
            Self::All => TlbInvalidateKind::All,
            Self::Asid(_) => TlbInvalidateKind::Asid,
            Self::Pages { .. } => TlbInvalidateKind::Pages,
        }
    }

    /// Builds a request from its raw encoding.
    ///
    /// Arguments the kind does not use are ignored.
    ///
    /// # Panics
    ///
    /// Panics on an unknown kind.
    #[must_use]
    pub fn from_raw(kind: u8, asid: Asid, page: usize, count: usize) -> Self {
        match TlbInvalidateKind::from_repr(kind) {
            Some(TlbInvalidateKind::All) => Self::All,
            Some(TlbInvalidateKind::Asid) => Self::Asid(asid),
            Some(TlbInvalidateKind::Pages) => Self::Pages { asid, page, count },
            None => panic!("unknown TLB invalidation kind {kind}"),
        }
    }
}

/// Invalidations posted to one CPU and not yet carried out.
pub(crate) struct TlbMessageQueue {
    messages: ArrayVec<(u64, TlbInvalidate), TLB_MESSAGE_QUEUE_LEN>,
}

impl TlbMessageQueue {
    pub(crate) const fn new() -> Self {
        Self {
            messages: ArrayVec::new_const(),
        }
    }

    /// Queues `op` on behalf of shootdown `seq`.
    ///
    /// A full queue collapses into one invalidation of everything.
    fn post(&mut self, seq: u64, op: TlbInvalidate) {
        if self.messages.is_full() {
            self.messages.clear();
            self.messages.push((seq, TlbInvalidate::All));
            return;
        }
        self.messages.push((seq, op));
    }

    /// Takes the messages of shootdowns up to `last`.
    fn take_finalized(&mut self, last: u64) -> ArrayVec<TlbInvalidate, TLB_MESSAGE_QUEUE_LEN> {
        let mut taken = ArrayVec::new();
        self.messages.retain(|(seq, op)| {
            if *seq > last {
                return true;
            }
            taken.push(*op);
            false
        });
        taken
    }
}

/// Global shootdown state.
pub(crate) struct TlbState {
    /// Held from the start of a shootdown until it is finalized.
    lock: SpinLock<TlbSequence>,
    /// CPUs whose `tlb_active` flag is set.
    active: AtomicUsize,
}

pub(crate) struct TlbSequence {
    /// Sequence number of the latest shootdown.
    last: u64,
}

impl TlbState {
    pub(crate) const fn new() -> Self {
        Self {
            lock: SpinLock::new("tlblock", TlbSequence { last: 0 }),
            active: AtomicUsize::new(0),
        }
    }
}

/// A shootdown in progress.
///
/// Other CPUs stay off their TLBs until this is dropped or
/// [`finalized`](Self::finalize).
#[must_use = "dropping the shootdown finalizes it at once"]
pub struct TlbShootdown<'a, A: Arch> {
    kernel: &'a Kernel<A>,
    cpu: CpuId,
    seq: u64,
    lock: Option<SpinLockGuard<'a, TlbSequence>>,
}

impl<A: Arch> TlbShootdown<'_, A> {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Ends the shootdown, letting the other CPUs invalidate and go on.
    pub fn finalize(self) {}
}

impl<A: Arch> Drop for TlbShootdown<'_, A> {
    fn drop(&mut self) {
        drop(self.lock.take());
        log::trace!("cpu{}: shootdown {} finalized", self.cpu, self.seq);
        self.kernel.set_tlb_active(self.kernel.cpu(self.cpu), true);
    }
}

impl<A: Arch> Kernel<A> {
    pub(crate) fn set_tlb_active(&self, cpu: &Cpu<A>, active: bool) {
        if cpu.tlb_active.swap(active, Ordering::SeqCst) == active {
            return;
        }
        if active {
            self.tlb.active.fetch_add(1, Ordering::SeqCst);
        } else {
            self.tlb.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn tlb_invalidate_local(&self, cpu: &Cpu<A>, op: TlbInvalidate) {
        self.arch.tlb_invalidate(cpu.id(), op);
        cpu.count_tlb_invalidation();
    }

    /// Starts invalidating `op` on every CPU.
    ///
    /// Returns once no CPU uses its TLB. The mapping change goes between
    /// this call and the end of the returned shootdown.
    pub fn tlb_shootdown_start<'a>(
        &'a self,
        ipl: &'a InterruptGuard<'_, A>,
        op: TlbInvalidate,
    ) -> TlbShootdown<'a, A> {
        let cpu = self.current_cpu(ipl);
        self.set_tlb_active(cpu, false);

        let mut lock = self.tlb.lock.lock(ipl);
        lock.last += 1;
        let seq = lock.last;
        log::trace!("cpu{}: shootdown {seq} started: {op:?}", cpu.id());

        #[cfg(feature = "smp")]
        {
            let mut targets = CpuSet::empty();
            for other in self.active_cpus().filter(|c| c.id() != cpu.id()) {
                other.tlb_messages.lock(ipl).post(seq, op);
                targets.insert(other.id());
            }
            if !targets.is_empty() {
                self.arch.send_ipi(targets, IpiVector::TlbShootdown);
            }
        }

        self.tlb_invalidate_local(cpu, op);

        #[cfg(feature = "smp")]
        while self.tlb.active.load(Ordering::SeqCst) != 0 {
            A::spin_hint();
        }

        TlbShootdown {
            kernel: self,
            cpu: cpu.id(),
            seq,
            lock: Some(lock),
        }
    }

    /// Shootdown IPI handler.
    pub(crate) fn tlb_shootdown_ipi_recv(&self, ipl: &InterruptGuard<'_, A>) {
        let cpu = self.current_cpu(ipl);
        self.set_tlb_active(cpu, false);

        // Blocks while a shootdown is in progress.
        let last = self.tlb.lock.lock(ipl).last;

        let ops = cpu.tlb_messages.lock(ipl).take_finalized(last);
        for op in ops {
            self.tlb_invalidate_local(cpu, op);
        }

        self.set_tlb_active(cpu, true);
    }
}
