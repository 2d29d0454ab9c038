//! Portable concurrency core of a small SMP microkernel.
//!
//! The core owns threads, per-CPU run queues, wait queues and the
//! synchronization objects built on them, the clock and its timeouts, the
//! load balancer and TLB shootdown. Everything machine specific goes through
//! the [`Arch`] trait; the `std` feature (and `cargo test`) provides
//! [`arch::host::HostArch`], which runs every CPU and every kernel thread on
//! host threads.
#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

use alloc::boxed::Box;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use spindle_kernel_params::NCPU;

pub use self::{
    arch::Arch,
    error::KernelError,
    proc::{ThreadBuilder, ThreadFlags, ThreadId, ThreadInfo, ThreadState},
    sync::{
        CondVar, Futex, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Semaphore,
        SleepOutcome, SpinLock, SpinLockGuard, WaitQueue, WakeupMode,
    },
    time::TimeoutId,
    tlb::{TlbInvalidate, TlbShootdown},
};
pub use spindle_abi::{Asid, CpuId, SynchFlags, TaskId};
use self::{
    arch::{CpuSet, IpiVector},
    cpu::Cpu,
    interrupt::InterruptGuard,
    proc::ThreadTable,
    sync::{futex::FutexTable, spin_lock::HeldLocks},
    tlb::TlbState,
};

pub mod arch;
pub mod cpu;
pub mod error;
pub mod interrupt;
pub mod proc;
pub mod sync;
pub mod time;
pub mod tlb;

#[cfg(test)]
mod test_util;

/// The kernel instance.
///
/// One instance drives up to [`NCPU`] processors. It is normally placed in
/// a `static` (or leaked) because threads and CPUs refer back to it for
/// their whole life.
pub struct Kernel<A: Arch> {
    arch: A,
    cpu_active: usize,
    cpus: [Cpu<A>; NCPU],
    threads: ThreadTable<A>,
    /// Ready threads summed over all CPUs.
    nrdy: AtomicUsize,
    tlb: TlbState,
    futexes: FutexTable,
    /// Spin locks held per CPU.
    held_locks: HeldLocks,
    halted: AtomicBool,
}

impl<A: Arch> Kernel<A> {
    /// Creates a kernel for the processors `arch` reports.
    ///
    /// # Panics
    ///
    /// Panics if the backend reports no CPU or more than [`NCPU`], or more
    /// than one CPU without the `smp` feature.
    pub fn new(arch: A) -> Self {
        let cpu_active = arch.cpu_count();
        assert!(
            (1..=NCPU).contains(&cpu_active),
            "unsupported number of CPUs: {cpu_active}"
        );
        #[cfg(not(feature = "smp"))]
        assert_eq!(cpu_active, 1, "uniprocessor build started on {cpu_active} CPUs");
        let cpus = core::array::from_fn(|i| Cpu::new(CpuId::new(i), arch.new_context()));
        Self {
            arch,
            cpu_active,
            cpus,
            threads: ThreadTable::new(),
            nrdy: AtomicUsize::new(0),
            tlb: TlbState::new(),
            futexes: FutexTable::new(),
            held_locks: HeldLocks::new(),
            halted: AtomicBool::new(false),
        }
    }

    pub fn arch(&self) -> &A {
        &self.arch
    }

    /// Number of processors taking part in scheduling.
    pub fn cpu_active(&self) -> usize {
        self.cpu_active
    }

    /// Returns the per-CPU state of `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not an active CPU.
    #[track_caller]
    pub fn cpu(&self, id: CpuId) -> &Cpu<A> {
        assert!(id.as_index() < self.cpu_active, "cpu{id} is not active");
        &self.cpus[id.as_index()]
    }

    pub fn active_cpus(&self) -> impl Iterator<Item = &Cpu<A>> {
        self.cpus[..self.cpu_active].iter()
    }

    /// Number of ready threads in all run queues.
    pub fn nrdy(&self) -> usize {
        self.nrdy.load(Ordering::SeqCst)
    }

    /// Returns the CPU the caller runs on.
    #[track_caller]
    pub(crate) fn current_cpu(&self, ipl: &InterruptGuard<'_, A>) -> &Cpu<A> {
        self.cpu(ipl.cpu_id())
    }

    /// Brings the kernel up.
    ///
    /// Creates `kinit` running `init` on CPU 0, one load balancer per CPU on
    /// SMP builds, and starts the scheduler loop of every CPU.
    pub fn boot<F>(&'static self, init: F) -> Result<ThreadId, KernelError>
    where
        F: FnOnce() + Send + 'static,
    {
        log::info!("spindle: booting on {} cpu(s)", self.cpu_active);

        for cpu in self.active_cpus() {
            cpu.set_active(true);
            self.set_tlb_active(cpu, true);
        }

        let kinit = ThreadBuilder::new("kinit")
            .cpu(CpuId::new(0))
            .spawn(self, init)?;

        #[cfg(feature = "smp")]
        if self.cpu_active > 1 {
            for cpu in self.active_cpus() {
                ThreadBuilder::new("kcpulb")
                    .wired(cpu.id())
                    .detached(true)
                    .spawn(self, move || self.kcpulb())?;
            }
        }

        for cpu in self.active_cpus() {
            let id = cpu.id();
            self.arch.start_cpu(
                id,
                cpu.sched_context(),
                Box::new(move || self.scheduler_loop(id)),
            );
        }

        Ok(kinit)
    }

    /// Stops all scheduler loops.
    ///
    /// Each CPU leaves its loop the next time it returns to the scheduler.
    pub fn halt(&self) {
        log::info!("spindle: halting");
        self.halted.store(true, Ordering::SeqCst);
        let mut all = CpuSet::empty();
        for cpu in self.active_cpus() {
            all.insert(cpu.id());
        }
        self.arch.send_ipi(all, IpiVector::Wakeup);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use crate::{arch::host::HostArch, test_util};

    #[test]
    #[should_panic = "unsupported number of CPUs: 0"]
    fn no_cpu_is_rejected() {
        let _ = super::Kernel::new(HostArch::new(0));
    }

    #[cfg(feature = "smp")]
    #[test]
    fn smp_build_takes_several_cpus() {
        assert_eq!(test_util::kernel(2).cpu_active(), 2);
    }

    #[cfg(not(feature = "smp"))]
    #[test]
    #[should_panic = "uniprocessor build started on 2 CPUs"]
    fn uniprocessor_build_rejects_several_cpus() {
        let _ = test_util::kernel(2);
    }
}
