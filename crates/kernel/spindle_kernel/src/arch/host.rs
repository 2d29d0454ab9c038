//! Backend running the kernel on host threads.
//!
//! Every CPU and every kernel thread gets its own host thread. Exactly one
//! of the threads attached to a CPU runs at a time: switching contexts
//! hands the CPU over to the target thread and parks the caller until some
//! CPU hands one back. Interrupts are queued per CPU and delivered when the
//! receiving side enables interrupts, or wake it from [`Arch::cpu_sleep`].

use std::{
    boxed::Box,
    cell::Cell,
    collections::VecDeque,
    string::String,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread,
    time::{Duration, Instant},
    vec::Vec,
};

use spindle_abi::CpuId;

use super::{Arch, CpuSet, Interrupt, IpiVector};
use crate::tlb::TlbInvalidate;

thread_local! {
    static CPU: Cell<Option<CpuId>> = const { Cell::new(None) };
    static INTERRUPTS: Cell<bool> = const { Cell::new(false) };
}

pub struct HostArch {
    cpus: Vec<HostCpu>,
    epoch: Instant,
    ticker: Mutex<Option<Arc<Ticker>>>,
}

#[derive(Default)]
struct HostCpu {
    pending: Mutex<Pending>,
    wakeup: Condvar,
    tlb_log: Mutex<Vec<TlbInvalidate>>,
}

#[derive(Default)]
struct Pending {
    timer: u64,
    ipis: VecDeque<IpiVector>,
}

impl Pending {
    fn is_empty(&self) -> bool {
        self.timer == 0 && self.ipis.is_empty()
    }
}

struct Ticker {
    stop: Mutex<bool>,
    cond: Condvar,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl HostArch {
    #[must_use]
    pub fn new(ncpu: usize) -> Self {
        Self {
            cpus: (0..ncpu).map(|_| HostCpu::default()).collect(),
            epoch: Instant::now(),
            ticker: Mutex::new(None),
        }
    }

    /// Makes the calling host thread act as `cpu`, or as no CPU at all.
    ///
    /// Lets code outside of a booted kernel drive per-CPU paths directly.
    pub fn bind_current_thread(cpu: Option<CpuId>) {
        CPU.set(cpu);
    }

    fn host_cpu(&self, cpu: CpuId) -> &HostCpu {
        &self.cpus[cpu.as_index()]
    }

    fn raise(&self, cpu: CpuId, f: impl FnOnce(&mut Pending)) {
        let host = self.host_cpu(cpu);
        f(&mut lock(&host.pending));
        host.wakeup.notify_all();
    }

    /// Queues a clock tick on `cpu`.
    pub fn raise_timer(&self, cpu: CpuId) {
        self.raise(cpu, |pending| pending.timer += 1);
    }

    /// Starts a host thread that ticks every CPU each `period`.
    ///
    /// Replaces the previous ticker, if any.
    pub fn start_ticker(&'static self, period: Duration) {
        self.stop_ticker();
        let ticker = Arc::new(Ticker {
            stop: Mutex::new(false),
            cond: Condvar::new(),
        });
        *lock(&self.ticker) = Some(Arc::clone(&ticker));
        thread::Builder::new()
            .name(String::from("ticker"))
            .spawn(move || {
                let mut stop = lock(&ticker.stop);
                loop {
                    let (next, _) = ticker
                        .cond
                        .wait_timeout(stop, period)
                        .unwrap_or_else(PoisonError::into_inner);
                    stop = next;
                    if *stop {
                        break;
                    }
                    for cpu in 0..self.cpus.len() {
                        self.raise_timer(CpuId::new(cpu));
                    }
                }
            })
            .unwrap_or_else(|e| panic!("cannot spawn ticker thread: {e}"));
    }

    pub fn stop_ticker(&self) {
        if let Some(ticker) = lock(&self.ticker).take() {
            *lock(&ticker.stop) = true;
            ticker.cond.notify_all();
        }
    }

    /// Returns the TLB invalidations `cpu` has carried out so far.
    #[must_use]
    pub fn tlb_log(&self, cpu: CpuId) -> Vec<TlbInvalidate> {
        lock(&self.host_cpu(cpu).tlb_log).clone()
    }
}

/// Execution context backed by a host thread.
pub struct HostContext {
    baton: Arc<Baton>,
}

/// Hand-over point of a context: holds the CPU it has been given.
struct Baton {
    cpu: Mutex<Option<CpuId>>,
    cond: Condvar,
}

impl Baton {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            cpu: Mutex::new(None),
            cond: Condvar::new(),
        })
    }

    fn hand_over(&self, cpu: CpuId) {
        let mut slot = lock(&self.cpu);
        assert!(slot.is_none(), "context resumed twice");
        *slot = Some(cpu);
        self.cond.notify_one();
    }

    fn wait(&self) -> CpuId {
        let mut slot = lock(&self.cpu);
        loop {
            if let Some(cpu) = slot.take() {
                return cpu;
            }
            slot = self
                .cond
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

fn enter_cpu(cpu: CpuId) {
    CPU.set(Some(cpu));
    INTERRUPTS.set(false);
}

impl Arch for HostArch {
    type Context = HostContext;

    fn cpu_id() -> Option<CpuId> {
        CPU.get()
    }

    fn interrupts_enabled() -> bool {
        INTERRUPTS.get()
    }

    fn interrupts_disable() -> bool {
        INTERRUPTS.replace(false)
    }

    fn interrupts_enable() {
        INTERRUPTS.set(true);
    }

    fn spin_hint() {
        thread::yield_now();
    }

    fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    fn read_cycle_counter(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn send_ipi(&self, targets: CpuSet, vector: IpiVector) {
        for cpu in targets.iter() {
            self.raise(cpu, |pending| {
                // Wakeups carry no payload; one pending is enough.
                if vector != IpiVector::Wakeup || !pending.ipis.contains(&vector) {
                    pending.ipis.push_back(vector);
                }
            });
        }
    }

    fn take_pending_interrupt(&self, cpu: CpuId) -> Option<Interrupt> {
        let mut pending = lock(&self.host_cpu(cpu).pending);
        if let Some(vector) = pending.ipis.pop_front() {
            return Some(Interrupt::Ipi(vector));
        }
        if pending.timer > 0 {
            let missed = pending.timer - 1;
            pending.timer = 0;
            return Some(Interrupt::Timer { missed });
        }
        None
    }

    fn cpu_sleep(&self, cpu: CpuId) {
        let host = self.host_cpu(cpu);
        let mut pending = lock(&host.pending);
        while pending.is_empty() {
            pending = host
                .wakeup
                .wait(pending)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn tlb_invalidate(&self, cpu: CpuId, op: TlbInvalidate) {
        lock(&self.host_cpu(cpu).tlb_log).push(op);
    }

    fn new_context(&self) -> Self::Context {
        HostContext {
            baton: Baton::new(),
        }
    }

    fn spawn_context(&self, name: &str, entry: Box<dyn FnOnce() + Send>) -> Self::Context {
        let baton = Baton::new();
        let start = Arc::clone(&baton);
        thread::Builder::new()
            .name(String::from(name))
            .spawn(move || {
                enter_cpu(start.wait());
                drop(start);
                entry();
                unreachable!("kernel thread entry returned");
            })
            .unwrap_or_else(|e| panic!("cannot spawn host thread for {name}: {e}"));
        HostContext { baton }
    }

    unsafe fn switch_context(&self, from: &Self::Context, to: &Self::Context) {
        let cpu = CPU
            .get()
            .unwrap_or_else(|| panic!("context switch outside of a CPU"));
        // `from` may be freed while we are parked; keep our own reference.
        let me = Arc::clone(&from.baton);
        to.baton.hand_over(cpu);
        let cpu = me.wait();
        CPU.set(Some(cpu));
    }

    fn start_cpu(&self, cpu: CpuId, _context: &Self::Context, entry: Box<dyn FnOnce() + Send>) {
        thread::Builder::new()
            .name(format!("cpu{cpu}"))
            .spawn(move || {
                enter_cpu(cpu);
                entry();
            })
            .unwrap_or_else(|e| panic!("cannot spawn host thread for cpu{cpu}: {e}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_ticks_coalesce_into_missed_count() {
        let arch = HostArch::new(2);
        let cpu = CpuId::new(1);
        arch.raise_timer(cpu);
        arch.raise_timer(cpu);
        arch.raise_timer(cpu);
        assert_eq!(
            arch.take_pending_interrupt(cpu),
            Some(Interrupt::Timer { missed: 2 })
        );
        assert_eq!(arch.take_pending_interrupt(cpu), None);
        assert_eq!(arch.take_pending_interrupt(CpuId::new(0)), None);
    }

    #[test]
    fn ipis_are_delivered_before_ticks() {
        let arch = HostArch::new(1);
        let cpu = CpuId::new(0);
        arch.raise_timer(cpu);
        arch.send_ipi(CpuSet::single(cpu), IpiVector::Wakeup);
        arch.send_ipi(CpuSet::single(cpu), IpiVector::Wakeup);
        arch.send_ipi(CpuSet::single(cpu), IpiVector::TlbShootdown);
        assert_eq!(
            arch.take_pending_interrupt(cpu),
            Some(Interrupt::Ipi(IpiVector::Wakeup))
        );
        assert_eq!(
            arch.take_pending_interrupt(cpu),
            Some(Interrupt::Ipi(IpiVector::TlbShootdown))
        );
        assert_eq!(
            arch.take_pending_interrupt(cpu),
            Some(Interrupt::Timer { missed: 0 })
        );
    }

    #[test]
    fn cpu_sleep_returns_once_interrupt_is_pending() {
        let arch: &'static HostArch = Box::leak(Box::new(HostArch::new(1)));
        let cpu = CpuId::new(0);
        let sleeper = thread::spawn(move || arch.cpu_sleep(cpu));
        thread::sleep(Duration::from_millis(10));
        arch.send_ipi(CpuSet::single(cpu), IpiVector::Wakeup);
        sleeper.join().unwrap();
    }

    #[test]
    fn switch_hands_cpu_to_spawned_context() {
        let arch: &'static HostArch = Box::leak(Box::new(HostArch::new(1)));
        let main = Arc::new(arch.new_context());
        let (tx, rx) = std::sync::mpsc::channel();
        let back = Arc::clone(&main);
        let child = Arc::new(std::sync::OnceLock::<HostContext>::new());
        let child_ctx = Arc::clone(&child);
        let ctx = arch.spawn_context(
            "child",
            Box::new(move || {
                tx.send(HostArch::cpu_id()).unwrap();
                unsafe { arch.switch_context(child_ctx.get().unwrap(), &back) };
                loop {
                    thread::park();
                }
            }),
        );
        assert!(child.set(ctx).is_ok());

        HostArch::bind_current_thread(Some(CpuId::new(0)));
        unsafe { arch.switch_context(&main, child.get().unwrap()) };
        assert_eq!(rx.recv().unwrap(), Some(CpuId::new(0)));
        assert_eq!(HostArch::cpu_id(), Some(CpuId::new(0)));
    }
}
