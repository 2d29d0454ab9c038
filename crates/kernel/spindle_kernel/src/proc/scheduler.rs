//! Per-CPU scheduler.
//!
//! Each CPU keeps [`RQ_COUNT`] FIFO run queues. Band 0 is the most favored
//! one; a thread picked from band `i` gets a quantum of
//! `(i + 1) * QUANTUM_BASE_USEC` and comes back one band lower each time it
//! is readied, while sleeping resets it to band 0. Starving threads are
//! pulled up by relinking: after [`NEEDS_RELINK_MAX`] ticks every band below
//! the one just served is merged into its upper neighbour.

use core::fmt;

use spindle_abi::CpuId;
use spindle_kernel_params::{NEEDS_RELINK_MAX, QUANTUM_BASE_USEC, RQ_COUNT, us2ticks};

use super::{ThreadFlags, ThreadId, ThreadLink, ThreadShared, ThreadState};
use crate::{
    Kernel,
    arch::{Arch, CpuSet, IpiVector},
    cpu::Cpu,
    interrupt::InterruptGuard,
    sync::SpinLockGuard,
};

const LOWEST_BAND: isize = RQ_COUNT as isize - 1;

impl<A: Arch> Kernel<A> {
    /// Scheduler loop of `cpu_id`.
    ///
    /// It loops doing:
    ///
    /// - choose a thread to run.
    /// - switch to start running that thread.
    /// - eventually that thread transfers control back to the loop, which
    ///   then acts on the state the thread left in.
    ///
    /// Returns once the kernel is halted.
    pub(crate) fn scheduler_loop(&self, cpu_id: CpuId) {
        let cpu = self.cpu(cpu_id);
        log::info!("cpu{cpu_id}: scheduler started");

        loop {
            // The thread that ran last may have left interrupts off;
            // deliver what arrived meanwhile.
            self.interrupts_enable();
            if self.is_halted() {
                break;
            }

            let ipl = self.interrupts_disable();
            let Some((tid, band)) = self.find_best_thread(&ipl, cpu) else {
                drop(ipl);
                cpu.set_idle(true);
                // A thread readied before the flag was visible sent no IPI.
                if cpu.nrdy() == 0 && !self.is_halted() {
                    self.arch.cpu_sleep(cpu_id);
                }
                cpu.set_idle(false);
                continue;
            };
            self.relink_rq(&ipl, cpu, band);

            let slot = self.threads.slot(tid);
            let mut shared = slot.shared.lock(&ipl);
            shared.state = ThreadState::Running;
            shared.last_cycle = self.arch.read_cycle_counter();
            cpu.set_current(&ipl, Some(tid));
            log::trace!(
                "cpu{cpu_id}: tid {tid} (priority={}, ticks={}, nrdy={})",
                shared.priority,
                shared.ticks,
                cpu.nrdy()
            );

            // The thread releases its lock on resumption and takes it
            // again before switching back.
            unsafe {
                self.arch
                    .switch_context(cpu.sched_context(), slot.context());
            }

            cpu.set_current(&ipl, None);
            self.switched_out(&ipl, shared);
        }

        log::info!("cpu{cpu_id}: scheduler stopped");
    }

    /// Takes the head of the most favored non-empty band.
    pub(crate) fn find_best_thread(
        &self,
        ipl: &InterruptGuard<'_, A>,
        cpu: &Cpu<A>,
    ) -> Option<(ThreadId, usize)> {
        for (band, rq) in cpu.rq.iter().enumerate() {
            let mut rq = rq.lock(ipl);
            let Some(tid) = rq.pop_front() else {
                continue;
            };
            cpu.dec_nrdy();
            self.dec_nrdy();

            let mut shared = self.threads.slot(tid).shared.lock(ipl);
            assert_eq!(
                shared.link,
                ThreadLink::RunQueue { cpu: cpu.id(), band },
                "tid {tid}: run queue link out of sync"
            );
            shared.link = ThreadLink::Unlinked;
            shared.cpu = Some(cpu.id());
            shared.ticks = us2ticks((band as u64 + 1) * QUANTUM_BASE_USEC);
            shared.priority = band as isize;
            // Eligible for migration again once it has run.
            shared.flags.remove(ThreadFlags::STOLEN);
            return Some((tid, band));
        }
        None
    }

    /// Merges band `i + 1` into band `i` for every `i >= start`, if the
    /// CPU has gone long enough without doing so.
    pub(crate) fn relink_rq(&self, ipl: &InterruptGuard<'_, A>, cpu: &Cpu<A>, start: usize) {
        let mut local = cpu.local.lock(ipl);
        if local.needs_relink <= NEEDS_RELINK_MAX {
            return;
        }
        for band in start..RQ_COUNT - 1 {
            let mut lower = core::mem::take(&mut *cpu.rq[band + 1].lock(ipl));
            let mut upper = cpu.rq[band].lock(ipl);
            for tid in lower.iter() {
                let mut shared = self.threads.slot(tid).shared.lock(ipl);
                shared.link = ThreadLink::RunQueue { cpu: cpu.id(), band };
            }
            upper.append(&mut lower);
        }
        local.needs_relink = 0;
    }

    /// Makes `tid` ready to run.
    ///
    /// The thread ages by one band (sleepers restart at band 0) and is
    /// appended to the run queue of the CPU it is wired to or, otherwise,
    /// of the current CPU. New threads honour their placement hint.
    pub fn thread_ready(&self, ipl: &InterruptGuard<'_, A>, tid: ThreadId) {
        let mut shared = self.threads.slot(tid).shared.lock(ipl);
        assert_eq!(shared.id, Some(tid), "readying a stale thread id {tid}");
        assert!(
            !matches!(
                shared.state,
                ThreadState::Ready | ThreadState::Invalid | ThreadState::Lingering
            ),
            "tid {tid}: cannot ready a thread in state {}",
            shared.state
        );
        assert_eq!(
            shared.link,
            ThreadLink::Unlinked,
            "tid {tid}: readied while still linked"
        );

        if shared.priority < LOWEST_BAND {
            shared.priority += 1;
        }
        let band = shared.priority.unsigned_abs();

        let here = A::cpu_id().filter(|cpu| cpu.as_index() < self.cpu_active);
        let target = self.ready_target(&shared, here);

        shared.state = ThreadState::Ready;
        shared.link = ThreadLink::RunQueue { cpu: target, band };
        drop(shared);

        let cpu = self.cpu(target);
        // Counted before the thread becomes visible: whoever pops it
        // decrements under this lock, so the counts never go below zero.
        let mut rq = cpu.rq[band].lock(ipl);
        self.inc_nrdy();
        cpu.inc_nrdy();
        rq.push_back(tid);
        drop(rq);

        if here != Some(target) && cpu.is_idle() {
            self.arch.send_ipi(CpuSet::single(target), IpiVector::Wakeup);
        }
    }

    fn ready_target(&self, shared: &ThreadShared, here: Option<CpuId>) -> CpuId {
        let hint = shared.cpu.filter(|cpu| cpu.as_index() < self.cpu_active);
        if shared.flags.contains(ThreadFlags::WIRED) {
            return hint.unwrap_or_else(|| panic!("wired thread {} has no CPU", shared.tid()));
        }
        let fresh =
            shared.state == ThreadState::Entering && !shared.flags.contains(ThreadFlags::STOLEN);
        let preferred = if fresh { hint.or(here) } else { here.or(hint) };
        preferred.unwrap_or(CpuId::new(0))
    }

    /// Hands the CPU back to the scheduler loop.
    ///
    /// The caller holds its own lock and has set its state; the loop acts
    /// on that state. Returns when the thread is switched back in, with the
    /// lock held again.
    pub(crate) fn sched(&self, ipl: &InterruptGuard<'_, A>, shared: &mut SpinLockGuard<'_, ThreadShared>) {
        assert!(!A::interrupts_enabled(), "sched with interrupts enabled");
        assert_ne!(shared.state, ThreadState::Ready);
        // Only the thread's own lock may cross the switch.
        let held = self.held_locks.count(ipl.cpu_id().as_index());
        assert_eq!(held, 1, "switching away with {held} spin locks held");

        shared.update_accounting(self.arch.read_cycle_counter());

        let slot = self.threads.slot(shared.tid());
        let cpu = self.current_cpu(ipl);
        unsafe {
            self.arch
                .switch_context(slot.context(), cpu.sched_context());
        }
    }

    /// Acts on the state a thread left in when it switched back.
    fn switched_out<'a>(
        &'a self,
        ipl: &'a InterruptGuard<'_, A>,
        mut shared: SpinLockGuard<'a, ThreadShared>,
    ) {
        let tid = shared.tid();
        match shared.state {
            // Preempted or yielded.
            ThreadState::Running => {
                drop(shared);
                self.thread_ready(ipl, tid);
            }
            ThreadState::Sleeping => {
                // Sleepers get the best band when woken.
                shared.priority = -1;
            }
            ThreadState::Exiting => self.thread_retire(ipl, shared),
            state => panic!("tid {tid}: unexpected state {state}"),
        }
    }

    /// Gives up the CPU for one scheduling round.
    pub fn thread_yield(&self) {
        let ipl = self.interrupts_disable();
        let tid = self.expect_current_thread(&ipl);
        let mut shared = self.threads.slot(tid).shared.lock(&ipl);
        self.sched(&ipl, &mut shared);
    }

    pub(crate) fn inc_nrdy(&self) {
        self.nrdy.fetch_add(1, core::sync::atomic::Ordering::SeqCst);
    }

    pub(crate) fn dec_nrdy(&self) {
        self.nrdy.fetch_sub(1, core::sync::atomic::Ordering::SeqCst);
    }

    /// Writes the run queues of every active CPU.
    pub fn sched_print_list<W: fmt::Write>(&self, w: &mut W) -> fmt::Result {
        let ipl = self.interrupts_disable();
        writeln!(w, "nrdy={}", self.nrdy())?;
        for cpu in self.active_cpus() {
            let needs_relink = cpu.local.lock(&ipl).needs_relink;
            writeln!(
                w,
                "cpu{}: nrdy={}, needs_relink={}",
                cpu.id(),
                cpu.nrdy(),
                needs_relink
            )?;
            for (band, rq) in cpu.rq.iter().enumerate() {
                let rq = rq.lock(&ipl);
                if rq.is_empty() {
                    continue;
                }
                write!(w, "\trq[{band}]: ")?;
                for tid in rq.iter() {
                    let shared = self.threads.slot(tid).shared.lock(&ipl);
                    write!(w, "{tid}({}) ", shared.state)?;
                }
                writeln!(w)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicBool, Ordering};
    use std::{string::String, vec::Vec};

    use super::*;
    use crate::{proc::ThreadBuilder, test_util};

    fn set_priority<A: Arch>(k: &Kernel<A>, tid: ThreadId, priority: isize) {
        let ipl = k.interrupts_disable();
        k.threads.slot(tid).shared.lock(&ipl).priority = priority;
    }

    fn band_of<A: Arch>(k: &Kernel<A>, tid: ThreadId) -> Option<usize> {
        let ipl = k.interrupts_disable();
        match k.threads.slot(tid).shared.lock(&ipl).link {
            ThreadLink::RunQueue { band, .. } => Some(band),
            _ => None,
        }
    }

    /// Picks the next thread and pretends it ran out of its quantum.
    fn pick_and_preempt<A: Arch>(k: &Kernel<A>, cpu: &Cpu<A>) -> ThreadId {
        let ipl = k.interrupts_disable();
        let (tid, _) = k.find_best_thread(&ipl, cpu).unwrap();
        k.threads.slot(tid).shared.lock(&ipl).state = ThreadState::Running;
        k.thread_ready(&ipl, tid);
        tid
    }

    #[test]
    fn favored_band_goes_first() {
        for _ in 0..10 {
            let k = test_util::kernel(1);
            test_util::bind(0);
            let a = test_util::create_thread(k, "a");
            let b = test_util::create_thread(k, "b");
            set_priority(k, b, 0);

            let ipl = k.interrupts_disable();
            k.thread_ready(&ipl, b);
            k.thread_ready(&ipl, a);
            assert_eq!(band_of(k, a), Some(0));
            assert_eq!(band_of(k, b), Some(1));
            assert_eq!(k.find_best_thread(&ipl, k.cpu(CpuId::new(0))), Some((a, 0)));
        }
    }

    #[test]
    fn equal_threads_share_the_cpu_round_robin() {
        let k = test_util::kernel(1);
        test_util::bind(0);
        let cpu = k.cpu(CpuId::new(0));
        let threads = (0..5)
            .map(|i| test_util::create_thread(k, &std::format!("t{i}")))
            .collect::<Vec<_>>();
        let ipl = k.interrupts_disable();
        for &tid in &threads {
            k.thread_ready(&ipl, tid);
        }
        drop(ipl);

        let picked = (0..threads.len())
            .map(|_| pick_and_preempt(k, cpu))
            .collect::<Vec<_>>();
        assert_eq!(picked, threads);
        assert_eq!(k.nrdy(), threads.len());
        assert_eq!(cpu.nrdy(), threads.len());
    }

    #[test]
    fn ready_counts_never_underflow() {
        const ROUNDS: usize = 2000;
        let k = test_util::kernel(2);
        let tid = test_util::create_thread_with(k, ThreadBuilder::new("w").wired(CpuId::new(0)));
        let readier_turn = AtomicBool::new(true);

        std::thread::scope(|s| {
            s.spawn(|| {
                test_util::bind(1);
                for _ in 0..ROUNDS {
                    while !readier_turn.load(Ordering::Acquire) {
                        core::hint::spin_loop();
                    }
                    readier_turn.store(false, Ordering::Relaxed);
                    let ipl = k.interrupts_disable();
                    k.thread_ready(&ipl, tid);
                }
            });

            test_util::bind(0);
            let cpu = k.cpu(CpuId::new(0));
            for _ in 0..ROUNDS {
                loop {
                    let ipl = k.interrupts_disable();
                    let picked = k.find_best_thread(&ipl, cpu);
                    // A wrapped counter shows up as a huge value.
                    assert!(k.nrdy() <= 1 && cpu.nrdy() <= 1);
                    if let Some((t, _)) = picked {
                        assert_eq!((k.nrdy(), cpu.nrdy()), (0, 0));
                        k.threads.slot(t).shared.lock(&ipl).state = ThreadState::Running;
                        readier_turn.store(true, Ordering::Release);
                        break;
                    }
                }
            }
        });
    }

    #[test]
    fn priority_ages_and_saturates() {
        let k = test_util::kernel(1);
        test_util::bind(0);
        let cpu = k.cpu(CpuId::new(0));
        let tid = test_util::create_thread(k, "aging");
        let ipl = k.interrupts_disable();
        k.thread_ready(&ipl, tid);
        drop(ipl);

        for expected in 1..RQ_COUNT + 3 {
            pick_and_preempt(k, cpu);
            assert_eq!(band_of(k, tid), Some(expected.min(RQ_COUNT - 1)));
        }
    }

    #[test]
    fn picked_thread_gets_band_quantum() {
        let k = test_util::kernel(1);
        test_util::bind(0);
        let tid = test_util::create_thread(k, "q");
        set_priority(k, tid, 2);
        let ipl = k.interrupts_disable();
        k.thread_ready(&ipl, tid);
        assert_eq!(k.find_best_thread(&ipl, k.cpu(CpuId::new(0))), Some((tid, 3)));
        drop(ipl);
        let info = k.thread_info(tid).unwrap();
        assert_eq!(info.ticks, us2ticks(4 * QUANTUM_BASE_USEC));
        assert_eq!(info.priority, 3);
        assert_eq!(info.cpu, Some(CpuId::new(0)));
    }

    #[test]
    fn relink_pulls_lower_bands_up() {
        let k = test_util::kernel(1);
        test_util::bind(0);
        let cpu = k.cpu(CpuId::new(0));
        let a = test_util::create_thread(k, "a");
        let b = test_util::create_thread(k, "b");
        let c = test_util::create_thread(k, "c");
        set_priority(k, b, 2);
        set_priority(k, c, 4);
        let ipl = k.interrupts_disable();
        k.thread_ready(&ipl, a);
        k.thread_ready(&ipl, b);
        k.thread_ready(&ipl, c);
        assert_eq!(band_of(k, b), Some(3));
        assert_eq!(band_of(k, c), Some(5));

        // Not due yet.
        cpu.local.lock(&ipl).needs_relink = NEEDS_RELINK_MAX;
        k.relink_rq(&ipl, cpu, 0);
        assert_eq!(band_of(k, b), Some(3));

        cpu.local.lock(&ipl).needs_relink = NEEDS_RELINK_MAX + 1;
        k.relink_rq(&ipl, cpu, 0);
        assert_eq!(cpu.local.lock(&ipl).needs_relink, 0);
        assert_eq!(band_of(k, a), Some(0));
        assert_eq!(band_of(k, b), Some(2));
        assert_eq!(band_of(k, c), Some(4));
        assert_eq!(cpu.rq[2].lock(&ipl).len(), 1);
        assert!(cpu.rq[3].lock(&ipl).is_empty());

        // The queues still hand threads out in band order.
        assert_eq!(k.find_best_thread(&ipl, cpu), Some((a, 0)));
        assert_eq!(k.find_best_thread(&ipl, cpu), Some((b, 2)));
        assert_eq!(k.find_best_thread(&ipl, cpu), Some((c, 4)));
        assert_eq!(k.find_best_thread(&ipl, cpu), None);
    }

    #[test]
    fn sleepers_come_back_in_band_zero() {
        let k = test_util::kernel(1);
        test_util::bind(0);
        let tid = test_util::create_thread(k, "sleeper");
        set_priority(k, tid, 7);
        let ipl = k.interrupts_disable();
        let shared = {
            let mut shared = k.threads.slot(tid).shared.lock(&ipl);
            shared.state = ThreadState::Sleeping;
            shared
        };
        k.switched_out(&ipl, shared);
        assert_eq!(k.thread_info(tid).unwrap().priority, -1);
        k.threads.slot(tid).shared.lock(&ipl).state = ThreadState::Entering;
        k.thread_ready(&ipl, tid);
        assert_eq!(band_of(k, tid), Some(0));
    }

    #[test]
    fn wired_and_placed_threads_land_on_their_cpu() {
        let k = test_util::kernel(3);
        test_util::bind(0);
        let wired = test_util::create_thread_with(k, ThreadBuilder::new("w").wired(CpuId::new(2)));
        let placed = test_util::create_thread_with(k, ThreadBuilder::new("p").cpu(CpuId::new(1)));
        let plain = test_util::create_thread(k, "x");
        let ipl = k.interrupts_disable();
        k.thread_ready(&ipl, wired);
        k.thread_ready(&ipl, placed);
        k.thread_ready(&ipl, plain);
        assert_eq!(k.cpu(CpuId::new(0)).nrdy(), 1);
        assert_eq!(k.cpu(CpuId::new(1)).nrdy(), 1);
        assert_eq!(k.cpu(CpuId::new(2)).nrdy(), 1);
        assert_eq!(k.find_best_thread(&ipl, k.cpu(CpuId::new(2))), Some((wired, 0)));

        // Once it has run, a placed thread follows the CPU readying it.
        let (tid, _) = k.find_best_thread(&ipl, k.cpu(CpuId::new(1))).unwrap();
        k.threads.slot(tid).shared.lock(&ipl).state = ThreadState::Running;
        k.thread_ready(&ipl, tid);
        assert_eq!(k.cpu(CpuId::new(0)).nrdy(), 2);
    }

    #[test]
    #[should_panic = "cannot ready a thread in state Ready"]
    fn double_ready_panics() {
        let k = test_util::kernel(1);
        test_util::bind(0);
        let tid = test_util::create_thread(k, "twice");
        let ipl = k.interrupts_disable();
        k.thread_ready(&ipl, tid);
        k.thread_ready(&ipl, tid);
    }

    #[test]
    fn print_list_shows_bands() {
        let k = test_util::kernel(2);
        test_util::bind(0);
        let tid = test_util::create_thread(k, "listed");
        let ipl = k.interrupts_disable();
        k.thread_ready(&ipl, tid);
        drop(ipl);
        let mut out = String::new();
        k.sched_print_list(&mut out).unwrap();
        assert!(out.contains("cpu0: nrdy=1, needs_relink=0"), "{out}");
        assert!(out.contains(&std::format!("\trq[0]: {tid}(Ready) ")), "{out}");
        assert!(out.contains("cpu1: nrdy=0"), "{out}");
    }
}
