use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use spindle_abi::CpuId;
use spindle_kernel_params::RQ_COUNT;

use crate::{
    arch::Arch,
    interrupt::InterruptGuard,
    proc::{RunQueue, ThreadId},
    sync::SpinLock,
    time::TimeoutQueue,
    tlb::TlbMessageQueue,
};

/// Per-CPU state.
pub struct Cpu<A: Arch> {
    id: CpuId,
    /// Ready threads, one queue per priority band.
    pub(crate) rq: [SpinLock<RunQueue>; RQ_COUNT],
    /// Ready threads in `rq`.
    nrdy: AtomicUsize,
    pub(crate) local: SpinLock<CpuLocal>,
    /// Raw id of the running thread, `0` if none.
    current: AtomicU64,
    active: AtomicBool,
    idle: AtomicBool,
    pub(crate) tlb_active: AtomicBool,
    pub(crate) tlb_messages: SpinLock<TlbMessageQueue>,
    tlb_invalidations: AtomicU64,
    pub(crate) timeouts: SpinLock<TimeoutQueue<A>>,
    busy_ticks: AtomicU64,
    idle_ticks: AtomicU64,
    sched_context: A::Context,
}

/// Scheduler bookkeeping only the CPU itself touches.
#[derive(Debug, Default)]
pub(crate) struct CpuLocal {
    /// Ticks since the run queues were last relinked.
    pub(crate) needs_relink: usize,
}

impl<A: Arch> Cpu<A> {
    pub(crate) fn new(id: CpuId, sched_context: A::Context) -> Self {
        Self {
            id,
            rq: core::array::from_fn(|_| SpinLock::new("rq", RunQueue::default())),
            nrdy: AtomicUsize::new(0),
            local: SpinLock::new("cpu", CpuLocal::default()),
            current: AtomicU64::new(0),
            active: AtomicBool::new(false),
            idle: AtomicBool::new(false),
            tlb_active: AtomicBool::new(false),
            tlb_messages: SpinLock::new("tlb_messages", TlbMessageQueue::new()),
            tlb_invalidations: AtomicU64::new(0),
            timeouts: SpinLock::new("timeouts", TimeoutQueue::new(id)),
            busy_ticks: AtomicU64::new(0),
            idle_ticks: AtomicU64::new(0),
            sched_context,
        }
    }

    pub fn id(&self) -> CpuId {
        self.id
    }

    /// Number of threads in this CPU's run queues.
    pub fn nrdy(&self) -> usize {
        self.nrdy.load(Ordering::SeqCst)
    }

    pub(crate) fn inc_nrdy(&self) {
        self.nrdy.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn dec_nrdy(&self) {
        self.nrdy.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn current_thread(&self) -> Option<ThreadId> {
        match self.current.load(Ordering::Acquire) {
            0 => None,
            raw => Some(ThreadId::from_raw(raw)),
        }
    }

    pub(crate) fn set_current(&self, _ipl: &InterruptGuard<'_, A>, tid: Option<ThreadId>) {
        self.current
            .store(tid.map_or(0, ThreadId::to_raw), Ordering::Release);
    }

    /// `true` once the CPU takes part in scheduling.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// `true` while the CPU sleeps for lack of ready threads.
    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::SeqCst)
    }

    pub(crate) fn set_idle(&self, idle: bool) {
        self.idle.store(idle, Ordering::SeqCst);
    }

    /// `false` while the CPU takes part in a TLB shootdown.
    pub fn tlb_active(&self) -> bool {
        self.tlb_active.load(Ordering::Acquire)
    }

    /// Local TLB invalidations carried out by this CPU.
    pub fn tlb_invalidations(&self) -> u64 {
        self.tlb_invalidations.load(Ordering::Relaxed)
    }

    pub(crate) fn count_tlb_invalidation(&self) {
        self.tlb_invalidations.fetch_add(1, Ordering::Relaxed);
    }

    /// Clock ticks that hit the CPU while it ran a thread.
    pub fn busy_ticks(&self) -> u64 {
        self.busy_ticks.load(Ordering::Relaxed)
    }

    /// Clock ticks that hit the CPU while it ran no thread.
    pub fn idle_ticks(&self) -> u64 {
        self.idle_ticks.load(Ordering::Relaxed)
    }

    pub(crate) fn account_ticks(&self, busy: bool, ticks: u64) {
        let counter = if busy {
            &self.busy_ticks
        } else {
            &self.idle_ticks
        };
        counter.fetch_add(ticks, Ordering::Relaxed);
    }

    pub(crate) fn sched_context(&self) -> &A::Context {
        &self.sched_context
    }
}
