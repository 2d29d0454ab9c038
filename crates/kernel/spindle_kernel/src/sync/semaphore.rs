use spindle_abi::SynchFlags;

use super::{SleepOutcome, WaitQueue, WakeupMode};
use crate::{Kernel, KernelError, arch::Arch};

/// Counting semaphore.
///
/// The count lives in the missed-wakeup counter of the underlying wait
/// queue: `up` on a queue without sleepers is a wakeup nobody consumed.
pub struct Semaphore {
    wq: WaitQueue,
}

impl Semaphore {
    pub const fn new(count: usize) -> Self {
        Self {
            wq: WaitQueue::with_missed_wakeups(count),
        }
    }

    pub fn down<A: Arch>(&self, kernel: &Kernel<A>) -> Result<SleepOutcome, KernelError> {
        self.wq.sleep(kernel)
    }

    /// Takes one unit, sleeping at most `usec` microseconds for it.
    ///
    /// Takes the same arguments as [`WaitQueue::sleep_timeout()`].
    pub fn down_timeout<A: Arch>(
        &self,
        kernel: &Kernel<A>,
        usec: u64,
        flags: SynchFlags,
    ) -> Result<SleepOutcome, KernelError> {
        self.wq.sleep_timeout(kernel, usec, flags)
    }

    /// Takes one unit if available, without sleeping.
    pub fn try_down<A: Arch>(&self, kernel: &Kernel<A>) -> bool {
        self.down_timeout(kernel, 0, SynchFlags::NON_BLOCKING).is_ok()
    }

    pub fn up<A: Arch>(&self, kernel: &Kernel<A>) {
        self.wq.wakeup(kernel, WakeupMode::First);
    }

    /// Units available.
    pub fn count<A: Arch>(&self, kernel: &Kernel<A>) -> usize {
        self.wq.missed_wakeups(kernel)
    }

    pub(crate) fn wait_queue(&self) -> &WaitQueue {
        &self.wq
    }
}
