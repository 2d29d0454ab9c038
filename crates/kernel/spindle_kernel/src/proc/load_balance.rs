//! SMP load balancing.
//!
//! Every CPU runs a wired `kcpulb` thread. Once per
//! [`LOAD_BALANCE_PERIOD_USEC`] it compares its own ready count with the
//! system average and, when below it, steals ready threads from CPUs above
//! the average, least favored bands first.

use spindle_kernel_params::{LOAD_BALANCE_PERIOD_USEC, RQ_COUNT};

use super::{ThreadFlags, ThreadId, ThreadLink, ThreadState};
use crate::{Kernel, arch::Arch, cpu::Cpu, interrupt::InterruptGuard};

/// Result of one balancing pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Balance {
    /// The CPU holds at least its share of ready threads.
    Satisfied,
    /// Nothing more could be stolen this time.
    Unsatisfied,
}

impl<A: Arch> Kernel<A> {
    /// Body of the per-CPU load balancer thread.
    pub(crate) fn kcpulb(&self) {
        // Victims are searched starting from a rotating CPU.
        let mut rr = 0;
        while !self.is_halted() {
            if let Err(e) = self.thread_usleep(LOAD_BALANCE_PERIOD_USEC) {
                // No timeout to sleep on; back off without spinning.
                log::debug!("kcpulb: cannot sleep: {e}");
                self.thread_yield();
                continue;
            }
            loop {
                if self.balance_once(&mut rr) == Balance::Satisfied {
                    break;
                }
                // Let the threads already here run before trying again.
                let ipl = self.interrupts_disable();
                let busy = self.current_cpu(&ipl).nrdy() > 0;
                drop(ipl);
                if !busy {
                    break;
                }
                self.thread_yield();
            }
        }
    }

    /// Steals threads until this CPU reaches the average load.
    fn balance_once(&self, rr: &mut usize) -> Balance {
        let ipl = self.interrupts_disable();
        let here = self.current_cpu(&ipl);
        let ncpu = self.cpu_active;

        // Counts are read without locks; a stale view only costs a
        // migration more or less.
        let average = self.nrdy() / ncpu + 1;
        let mut count = average.saturating_sub(here.nrdy());
        if count == 0 {
            return Balance::Satisfied;
        }

        for band in (0..RQ_COUNT).rev() {
            for i in 0..ncpu {
                let victim = &self.cpus[(i + *rr) % ncpu];
                if victim.id() == here.id() || victim.nrdy() <= average {
                    continue;
                }
                let Some(tid) = self.steal_from(&ipl, victim, band, average) else {
                    continue;
                };
                log::debug!(
                    "kcpulb{}: tid {tid} cpu{} -> cpu{}, nrdy={}, avg={}",
                    here.id(),
                    victim.id(),
                    here.id(),
                    here.nrdy(),
                    self.nrdy() / ncpu
                );
                self.thread_ready(&ipl, tid);

                count -= 1;
                if count == 0 {
                    return Balance::Satisfied;
                }
                // Spread the next steal over another CPU.
                *rr += 1;
            }
        }
        Balance::Unsatisfied
    }

    /// Unlinks the last migratable thread of `band` on `victim`.
    ///
    /// Gives up if the victim is no longer above `average` once its queue
    /// is locked, or if the band holds only wired or freshly stolen threads.
    fn steal_from(
        &self,
        ipl: &InterruptGuard<'_, A>,
        victim: &Cpu<A>,
        band: usize,
        average: usize,
    ) -> Option<ThreadId> {
        let mut rq = victim.rq[band].lock(ipl);
        if rq.is_empty() || victim.nrdy() <= average {
            return None;
        }

        let index = rq.iter().rposition(|tid| {
            let shared = self.threads.slot(tid).shared.lock(ipl);
            !shared
                .flags
                .intersects(ThreadFlags::WIRED | ThreadFlags::STOLEN)
        })?;
        let tid = rq.remove_at(index);
        victim.dec_nrdy();
        self.dec_nrdy();

        let mut shared = self.threads.slot(tid).shared.lock(ipl);
        assert_eq!(
            shared.link,
            ThreadLink::RunQueue {
                cpu: victim.id(),
                band
            },
            "tid {tid}: run queue link out of sync"
        );
        shared.link = ThreadLink::Unlinked;
        // Keeps it from moving on before it has run here.
        shared.flags.insert(ThreadFlags::STOLEN);
        shared.state = ThreadState::Entering;
        Some(tid)
    }
}

#[cfg(test)]
mod tests {
    use std::vec::Vec;

    use spindle_abi::CpuId;

    use super::*;
    use crate::{proc::ThreadBuilder, test_util};

    fn ready_on<A: Arch>(k: &Kernel<A>, cpu: usize, tid: ThreadId) {
        test_util::bind(cpu);
        let ipl = k.interrupts_disable();
        k.thread_ready(&ipl, tid);
    }

    #[test]
    fn idle_cpu_steals_from_overloaded_one() {
        let k = test_util::kernel(2);
        test_util::bind(0);
        let threads = (0..6)
            .map(|_| test_util::create_thread(k, "busy"))
            .collect::<Vec<_>>();
        for &tid in &threads {
            ready_on(k, 0, tid);
        }

        test_util::bind(1);
        let mut rr = 0;
        // average = 6 / 2 + 1 = 4: cpu1 wants four threads, but cpu0 is no
        // longer above the average after the second steal.
        assert_eq!(k.balance_once(&mut rr), Balance::Unsatisfied);
        assert_eq!(k.cpu(CpuId::new(0)).nrdy(), 4);
        assert_eq!(k.cpu(CpuId::new(1)).nrdy(), 2);
        assert_eq!(k.nrdy(), 6);

        // Threads are taken from the queue tail.
        for &tid in &threads[4..] {
            let info = k.thread_info(tid).unwrap();
            assert!(info.flags.contains(ThreadFlags::STOLEN));
            assert_eq!(info.state, ThreadState::Ready);
        }
        let ipl = k.interrupts_disable();
        assert_eq!(
            k.find_best_thread(&ipl, k.cpu(CpuId::new(0))),
            Some((threads[0], 0))
        );
        assert_eq!(
            k.find_best_thread(&ipl, k.cpu(CpuId::new(1))),
            Some((threads[5], 1))
        );
        let info = k.thread_info(threads[5]).unwrap();
        assert!(!info.flags.contains(ThreadFlags::STOLEN));
    }

    #[test]
    fn balanced_cpu_is_satisfied() {
        let k = test_util::kernel(2);
        test_util::bind(0);
        let a = test_util::create_thread(k, "a");
        let b = test_util::create_thread(k, "b");
        ready_on(k, 0, a);
        ready_on(k, 1, b);
        let mut rr = 0;
        // Below the average, but nobody is above it.
        assert_eq!(k.balance_once(&mut rr), Balance::Unsatisfied);
        assert_eq!(k.cpu(CpuId::new(0)).nrdy(), 1);

        ready_on(k, 1, test_util::create_thread(k, "c"));
        // average = 3 / 2 + 1 = 2, and cpu1 has two.
        assert_eq!(k.balance_once(&mut rr), Balance::Satisfied);
        assert_eq!(k.cpu(CpuId::new(0)).nrdy(), 1);
    }

    #[test]
    fn wired_and_stolen_threads_stay_put() {
        let k = test_util::kernel(3);
        test_util::bind(0);
        let wired = (0..3)
            .map(|_| {
                test_util::create_thread_with(k, ThreadBuilder::new("w").wired(CpuId::new(0)))
            })
            .collect::<Vec<_>>();
        for &tid in &wired {
            ready_on(k, 0, tid);
        }
        test_util::bind(1);
        let mut rr = 0;
        assert_eq!(k.balance_once(&mut rr), Balance::Unsatisfied);
        assert_eq!(k.cpu(CpuId::new(0)).nrdy(), 3);
        assert_eq!(k.cpu(CpuId::new(1)).nrdy(), 0);

        let movable = test_util::create_thread(k, "m");
        ready_on(k, 0, movable);
        test_util::bind(1);
        assert_eq!(k.balance_once(&mut rr), Balance::Unsatisfied);
        assert_eq!(k.cpu(CpuId::new(1)).nrdy(), 1);

        // Not passed on before it has run.
        let ipl = k.interrupts_disable();
        assert_eq!(k.steal_from(&ipl, k.cpu(CpuId::new(1)), 1, 0), None);
        assert_eq!(k.cpu(CpuId::new(1)).nrdy(), 1);
    }
}
