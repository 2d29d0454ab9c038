//! Interface to the machine.

use alloc::boxed::Box;

use spindle_abi::CpuId;
use spindle_kernel_params::NCPU;
use strum::FromRepr;

use crate::tlb::TlbInvalidate;

#[cfg(any(test, feature = "std"))]
pub mod host;

/// Vectors of inter-processor interrupts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum IpiVector {
    /// Run the TLB shootdown handler.
    TlbShootdown = 0xf0,
    /// Leave the idle loop and look at the run queues again.
    Wakeup = 0xf1,
}

/// An interrupt waiting to be delivered to a CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// Clock tick.
    ///
    /// `missed` counts the ticks that arrived while this one was pending.
    Timer { missed: u64 },
    Ipi(IpiVector),
}

/// Set of CPUs addressed by an IPI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuSet(u64);

const _: () = assert!(NCPU <= 64);

impl CpuSet {
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn single(cpu: CpuId) -> Self {
        Self(1 << cpu.as_index())
    }

    pub const fn insert(&mut self, cpu: CpuId) {
        self.0 |= 1 << cpu.as_index();
    }

    #[must_use]
    pub const fn contains(&self, cpu: CpuId) -> bool {
        self.0 & (1 << cpu.as_index()) != 0
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = CpuId> {
        (0..NCPU)
            .map(CpuId::new)
            .filter(move |cpu| self.contains(*cpu))
    }
}

/// Services the portable core needs from the machine.
///
/// Functions without a receiver act on the processor that calls them.
pub trait Arch: Send + Sync + Sized + 'static {
    /// Saved state of a suspended execution context.
    type Context: Send + Sync;

    /// Returns the processor the caller runs on.
    ///
    /// `None` means the caller is outside of any processor. The answer is
    /// only stable while interrupts are disabled.
    fn cpu_id() -> Option<CpuId>;

    fn interrupts_enabled() -> bool;

    /// Disables interrupts, returning whether they were enabled.
    fn interrupts_disable() -> bool;

    fn interrupts_enable();

    /// Hint issued on each round of a busy-wait loop.
    fn spin_hint() {
        core::hint::spin_loop();
    }

    /// Number of processors present.
    fn cpu_count(&self) -> usize;

    fn read_cycle_counter(&self) -> u64;

    fn send_ipi(&self, targets: CpuSet, vector: IpiVector);

    /// Takes the next interrupt pending for `cpu`.
    fn take_pending_interrupt(&self, cpu: CpuId) -> Option<Interrupt>;

    /// Halts `cpu` until an interrupt is pending for it.
    fn cpu_sleep(&self, cpu: CpuId);

    /// Invalidates TLB entries of `cpu`. Called on `cpu` itself.
    fn tlb_invalidate(&self, cpu: CpuId, op: TlbInvalidate);

    /// Creates the context a processor's scheduler loop runs on.
    fn new_context(&self) -> Self::Context;

    /// Creates a context that runs `entry` when first switched to.
    ///
    /// `entry` must never return.
    fn spawn_context(&self, name: &str, entry: Box<dyn FnOnce() + Send>) -> Self::Context;

    /// Saves the running state into `from` and resumes `to`.
    ///
    /// Returns when some processor switches back to `from`.
    ///
    /// # Safety
    ///
    /// `from` must be the context of the caller and interrupts must be
    /// disabled.
    unsafe fn switch_context(&self, from: &Self::Context, to: &Self::Context);

    /// Starts `cpu` running `entry` on `context`.
    fn start_cpu(&self, cpu: CpuId, context: &Self::Context, entry: Box<dyn FnOnce() + Send>);
}
