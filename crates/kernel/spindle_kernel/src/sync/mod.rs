//! Synchronization primitives.
//!
//! Spin locks protect short critical sections with interrupts disabled.
//! Everything else puts the caller to sleep on a [`WaitQueue`].

pub mod cond_var;
pub mod futex;
pub mod mutex;
pub mod rw_lock;
pub mod semaphore;
pub mod spin_lock;
pub mod wait_queue;

pub use self::{
    cond_var::CondVar,
    futex::Futex,
    mutex::{Mutex, MutexGuard},
    rw_lock::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    semaphore::Semaphore,
    spin_lock::{RawSpinLock, SpinLock, SpinLockGuard},
    wait_queue::{SleepOutcome, WaitQueue, WakeupMode},
};
