//! Interrupt masking and delivery.

use core::marker::PhantomData;

use spindle_abi::CpuId;

use crate::{
    Kernel,
    arch::{Arch, Interrupt, IpiVector},
};

/// Token proving that interrupts are disabled on the current CPU.
///
/// Created by [`Kernel::interrupts_disable()`]. Dropping it restores the
/// previous level and, when that level has interrupts enabled, delivers the
/// interrupts that became pending meanwhile.
///
/// Spin locks demand a reference to a guard, so no spin lock can be held
/// with interrupts enabled.
#[must_use]
pub struct InterruptGuard<'k, A: Arch> {
    kernel: &'k Kernel<A>,
    was_enabled: bool,
    _not_send: PhantomData<*const ()>,
}

impl<A: Arch> InterruptGuard<'_, A> {
    pub fn kernel(&self) -> &Kernel<A> {
        self.kernel
    }

    /// Returns the CPU the caller runs on.
    ///
    /// # Panics
    ///
    /// Panics if the caller is outside of any CPU.
    #[track_caller]
    pub fn cpu_id(&self) -> CpuId {
        A::cpu_id().unwrap_or_else(|| panic!("not running on a CPU"))
    }
}

impl<A: Arch> Drop for InterruptGuard<'_, A> {
    fn drop(&mut self) {
        if self.was_enabled {
            self.kernel.interrupts_enable();
        }
    }
}

impl<A: Arch> Kernel<A> {
    /// Disables interrupts on the current CPU.
    pub fn interrupts_disable(&self) -> InterruptGuard<'_, A> {
        let was_enabled = A::interrupts_disable();
        InterruptGuard {
            kernel: self,
            was_enabled,
            _not_send: PhantomData,
        }
    }

    /// Enables interrupts on the current CPU.
    ///
    /// Pending interrupts are handled first, still masked, so none of them
    /// is lost between the check and the enable.
    pub fn interrupts_enable(&self) {
        A::interrupts_disable();
        loop {
            let Some(cpu) = A::cpu_id() else { break };
            let Some(irq) = self.arch.take_pending_interrupt(cpu) else {
                break;
            };
            let ipl = self.interrupts_disable();
            self.handle_interrupt(&ipl, irq);
        }
        A::interrupts_enable();
    }

    /// Gives pending interrupts a chance to run.
    ///
    /// Does nothing when interrupts are disabled.
    pub fn preemption_point(&self) {
        drop(self.interrupts_disable());
    }

    fn handle_interrupt(&self, ipl: &InterruptGuard<'_, A>, irq: Interrupt) {
        match irq {
            Interrupt::Timer { missed } => self.clock(ipl, missed),
            Interrupt::Ipi(IpiVector::TlbShootdown) => self.tlb_shootdown_ipi_recv(ipl),
            Interrupt::Ipi(IpiVector::Wakeup) => {}
        }
    }
}
