#![no_std]

/// Maximum number of CPUs.
pub const NCPU: usize = 8;

/// Maximum number of threads alive at once.
pub const NTHREAD: usize = 64;

/// Number of priority bands in each CPU's run queue array.
///
/// Band 0 is the most favored one.
pub const RQ_COUNT: usize = 16;

/// Clock ticks per second.
pub const HZ: u64 = 100;

/// Length of one clock tick in microseconds.
pub const TICK_USEC: u64 = 1_000_000 / HZ;

/// Number of ticks after which the run queues get relinked.
pub const NEEDS_RELINK_MAX: usize = (HZ / 2) as usize;

/// Time quantum granted per priority band.
///
/// A thread picked from band `i` may run for `(i + 1) * QUANTUM_BASE_USEC`.
pub const QUANTUM_BASE_USEC: u64 = 10_000;

/// Timeout slots per CPU.
pub const NTIMEOUT: usize = 32;

/// Kernel futex wait queues.
pub const NFUTEX: usize = 32;

/// Pending TLB shootdown messages per CPU.
///
/// When the queue overflows, it is replaced by a single request to
/// invalidate everything.
pub const TLB_MESSAGE_QUEUE_LEN: usize = 10;

/// Interval between two load balancing passes.
pub const LOAD_BALANCE_PERIOD_USEC: u64 = 1_000_000;

/// Maximum length of a thread name.
pub const THREAD_NAME_LEN: usize = 16;

/// Converts microseconds to clock ticks, rounding up.
#[must_use]
pub const fn us2ticks(usec: u64) -> u64 {
    usec.div_ceil(TICK_USEC)
}
