use crate::{Kernel, arch::Arch, interrupt::InterruptGuard};

impl<A: Arch> Kernel<A> {
    /// Clock interrupt handler.
    ///
    /// `missed` counts the ticks that elapsed since the previous call
    /// without being delivered. Expires due timeouts and charges the
    /// running thread; a thread whose quantum is used up goes back to
    /// the scheduler.
    pub(crate) fn clock(&self, ipl: &InterruptGuard<'_, A>, missed: u64) {
        let cpu = self.current_cpu(ipl);
        let ticks = missed + 1;

        for _ in 0..ticks {
            cpu.timeouts.lock(ipl).tick();
            loop {
                // Handlers may register or cancel timeouts themselves.
                let next = cpu.timeouts.lock(ipl).pop_expired();
                let Some(expired) = next else { break };
                (expired.handler)(self, ipl, expired.id, expired.arg);
            }
        }

        let current = cpu.current_thread();
        cpu.account_ticks(current.is_some(), ticks);
        {
            let mut local = cpu.local.lock(ipl);
            local.needs_relink = local
                .needs_relink
                .saturating_add(usize::try_from(ticks).unwrap_or(usize::MAX));
        }

        let Some(tid) = current else {
            return;
        };
        let mut shared = self.threads.slot(tid).shared.lock(ipl);
        shared.update_accounting(self.arch.read_cycle_counter());
        shared.ticks = shared.ticks.saturating_sub(ticks);
        if shared.ticks == 0 {
            log::trace!("cpu{}: tid {tid} quantum expired", cpu.id());
            self.sched(ipl, &mut shared);
        }
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicBool, Ordering};
    use std::{sync::Arc, time::Duration};

    use spindle_abi::CpuId;

    use crate::{ThreadBuilder, test_util};

    #[test]
    fn ticks_advance_relink_counter() {
        let k = test_util::kernel(1);
        test_util::bind(0);
        let cpu = k.cpu(CpuId::new(0));
        let ipl = k.interrupts_disable();
        k.clock(&ipl, 0);
        k.clock(&ipl, 3);
        assert_eq!(cpu.local.lock(&ipl).needs_relink, 5);
        assert_eq!(cpu.busy_ticks(), 0);
        assert_eq!(cpu.idle_ticks(), 5);
    }

    #[test]
    fn expired_quantum_preempts_spinning_thread() {
        let k = test_util::kernel(1);
        k.arch().start_ticker(Duration::from_millis(1));
        let done = test_util::run_in_kernel(k, |k| {
            let flag = Arc::new(AtomicBool::new(false));
            let signal = Arc::clone(&flag);
            let spinner = ThreadBuilder::new("spinner")
                .spawn(k, move || {
                    while !flag.load(Ordering::SeqCst) {
                        k.preemption_point();
                    }
                })
                .unwrap();
            let setter = ThreadBuilder::new("setter")
                .spawn(k, move || signal.store(true, Ordering::SeqCst))
                .unwrap();
            k.thread_join(setter).unwrap();
            k.thread_join(spinner).unwrap();
            k.cpu(CpuId::new(0)).busy_ticks() > 0
        });
        k.arch().stop_ticker();
        assert!(done);
    }
}
