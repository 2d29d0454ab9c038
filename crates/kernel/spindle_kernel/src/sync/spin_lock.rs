use core::{
    cell::UnsafeCell,
    fmt,
    hint,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use mutex_api::RawMutex;
use spindle_kernel_params::NCPU;

use crate::{arch::Arch, interrupt::InterruptGuard};

/// Lock word spinning on an atomic flag.
pub struct SpinStrategy {
    locked: AtomicBool,
}

unsafe impl RawMutex for SpinStrategy {
    const INIT: Self = Self {
        locked: AtomicBool::new(false),
    };

    fn lock(&self) {
        // `Ordering::Acquire` keeps the critical section's memory
        // references after the lock is taken.
        while self.locked.swap(true, Ordering::Acquire) {
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
    }

    fn try_lock(&self) -> bool {
        !self.locked.swap(true, Ordering::Acquire)
    }

    unsafe fn unlock(&self) {
        // `Ordering::Release` publishes the critical section's stores
        // before the lock is seen free.
        self.locked.store(false, Ordering::Release);
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

/// Lock word of uniprocessor builds.
///
/// Disabled interrupts already exclude everybody else, so the flag only
/// catches recursive locking.
pub struct UpStrategy {
    locked: AtomicBool,
}

unsafe impl RawMutex for UpStrategy {
    const INIT: Self = Self {
        locked: AtomicBool::new(false),
    };

    fn lock(&self) {
        assert!(
            !self.locked.swap(true, Ordering::Relaxed),
            "deadlock: lock taken twice on a uniprocessor"
        );
    }

    fn try_lock(&self) -> bool {
        !self.locked.swap(true, Ordering::Relaxed)
    }

    unsafe fn unlock(&self) {
        self.locked.store(false, Ordering::Relaxed);
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

#[cfg(feature = "smp")]
pub type DefaultStrategy = SpinStrategy;
#[cfg(not(feature = "smp"))]
pub type DefaultStrategy = UpStrategy;

const NO_HOLDER: usize = usize::MAX;
const EXTERNAL_HOLDER: usize = usize::MAX - 1;

fn holder_tag<A: Arch>() -> usize {
    A::cpu_id().map_or(EXTERNAL_HOLDER, |cpu| cpu.as_index())
}

/// Number of spin locks each CPU holds.
///
/// A lock handed over across a context switch is released on the CPU that
/// took it, so the counts balance per CPU.
pub(crate) struct HeldLocks([AtomicUsize; NCPU]);

impl HeldLocks {
    pub(crate) fn new() -> Self {
        Self(core::array::from_fn(|_| AtomicUsize::new(0)))
    }

    pub(crate) fn count(&self, cpu: usize) -> usize {
        self.0[cpu].load(Ordering::Relaxed)
    }

    fn add(&self, tag: usize) {
        if let Some(count) = self.0.get(tag) {
            count.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn sub(&self, tag: usize) {
        if let Some(count) = self.0.get(tag) {
            count.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

/// Busy-waiting lock protecting no data by itself.
///
/// Records the holding CPU, so that taking a lock twice on one CPU, or
/// releasing a lock some other CPU holds, panics instead of hanging.
pub struct RawSpinLock<R = DefaultStrategy> {
    name: &'static str,
    raw: R,
    holder: AtomicUsize,
}

impl<R: RawMutex> RawSpinLock<R> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            raw: R::INIT,
            holder: AtomicUsize::new(NO_HOLDER),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Acquires the lock.
    ///
    /// Loops (spins) until the lock is acquired.
    #[track_caller]
    pub fn acquire<A: Arch>(&self, ipl: &InterruptGuard<'_, A>) {
        let tag = holder_tag::<A>();
        self.assert_not_holding(tag);
        self.raw.lock();
        self.holder.store(tag, Ordering::Relaxed);
        ipl.kernel().held_locks.add(tag);
    }

    #[track_caller]
    pub fn try_acquire<A: Arch>(&self, ipl: &InterruptGuard<'_, A>) -> bool {
        let tag = holder_tag::<A>();
        self.assert_not_holding(tag);
        if !self.raw.try_lock() {
            return false;
        }
        self.holder.store(tag, Ordering::Relaxed);
        ipl.kernel().held_locks.add(tag);
        true
    }

    /// Releases the lock.
    #[track_caller]
    pub fn release<A: Arch>(&self, ipl: &InterruptGuard<'_, A>) {
        let tag = holder_tag::<A>();
        self.release_as(tag);
        ipl.kernel().held_locks.sub(tag);
    }

    #[track_caller]
    fn release_as(&self, tag: usize) {
        let holder = self.holder.load(Ordering::Relaxed);
        assert!(
            self.raw.is_locked() && holder == tag,
            "spinlock {} released by {} but held by {}",
            self.name,
            DisplayHolder(tag),
            DisplayHolder(holder),
        );
        self.holder.store(NO_HOLDER, Ordering::Relaxed);
        unsafe { self.raw.unlock() }
    }

    /// Releases the lock regardless of its holder.
    ///
    /// # Safety
    ///
    /// The lock must be held, and its holder must never touch the
    /// protected data again. It must have been taken on the calling CPU.
    pub unsafe fn force_release<A: Arch>(&self, ipl: &InterruptGuard<'_, A>) {
        self.holder.store(NO_HOLDER, Ordering::Relaxed);
        unsafe { self.raw.unlock() }
        ipl.kernel().held_locks.sub(holder_tag::<A>());
    }

    /// Checks whether this CPU holds the lock.
    pub fn holding<A: Arch>(&self) -> bool {
        A::cpu_id().is_some()
            && self.raw.is_locked()
            && self.holder.load(Ordering::Relaxed) == holder_tag::<A>()
    }

    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    #[track_caller]
    fn assert_not_holding(&self, tag: usize) {
        assert!(
            tag == EXTERNAL_HOLDER
                || !self.raw.is_locked()
                || self.holder.load(Ordering::Relaxed) != tag,
            "spinlock {} acquired twice by {}",
            self.name,
            DisplayHolder(tag),
        );
    }
}

struct DisplayHolder(usize);

impl fmt::Display for DisplayHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            NO_HOLDER => write!(f, "nobody"),
            EXTERNAL_HOLDER => write!(f, "EXTERNAL"),
            cpu => write!(f, "cpu{cpu}"),
        }
    }
}

pub struct SpinLock<T> {
    lock: RawSpinLock,
    value: UnsafeCell<T>,
}

unsafe impl<T> Sync for SpinLock<T> where T: Send {}

impl<T> SpinLock<T> {
    pub const fn new(name: &'static str, value: T) -> Self {
        Self {
            lock: RawSpinLock::new(name),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock.
    ///
    /// Loops (spins) until the lock is acquired. The guard cannot outlive
    /// `ipl`.
    #[track_caller]
    pub fn lock<'a, A: Arch>(&'a self, ipl: &'a InterruptGuard<'_, A>) -> SpinLockGuard<'a, T> {
        self.lock.acquire(ipl);
        SpinLockGuard {
            lock: self,
            held: &ipl.kernel().held_locks,
            tag: holder_tag::<A>,
        }
    }

    #[track_caller]
    pub fn try_lock<'a, A: Arch>(
        &'a self,
        ipl: &'a InterruptGuard<'_, A>,
    ) -> Option<SpinLockGuard<'a, T>> {
        self.lock.try_acquire(ipl).then(|| SpinLockGuard {
            lock: self,
            held: &ipl.kernel().held_locks,
            tag: holder_tag::<A>,
        })
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    pub fn raw(&self) -> &RawSpinLock {
        &self.lock
    }

    /// Releases a lock whose guard was lost across a context switch.
    ///
    /// # Safety
    ///
    /// See [`RawSpinLock::force_release()`].
    pub unsafe fn force_unlock<A: Arch>(&self, ipl: &InterruptGuard<'_, A>) {
        unsafe { self.lock.force_release(ipl) }
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new("anonymous", T::default())
    }
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    held: &'a HeldLocks,
    tag: fn() -> usize,
}

unsafe impl<T> Sync for SpinLockGuard<'_, T> where T: Sync {}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // Counted on the CPU running now, which differs from the acquiring
        // one when the guard crossed a context switch.
        let tag = (self.tag)();
        self.lock.lock.release_as(tag);
        self.held.sub(tag);
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> SpinLockGuard<'_, T> {
    pub fn spinlock(&self) -> &RawSpinLock {
        &self.lock.lock
    }
}
