//! Helpers shared by the unit tests.

use std::{
    boxed::Box,
    sync::{Mutex, mpsc},
    time::Duration,
};

use spindle_abi::CpuId;

use crate::{Kernel, ThreadBuilder, ThreadId, arch::host::HostArch};

/// Builds a kernel for `ncpu` host CPUs.
///
/// The kernel is leaked: threads and CPUs refer to it for as long as the
/// test process lives.
pub(crate) fn kernel(ncpu: usize) -> &'static Kernel<HostArch> {
    Box::leak(Box::new(Kernel::new(HostArch::new(ncpu))))
}

/// Makes the test thread act as `cpu` of a kernel that is not booted.
pub(crate) fn bind(cpu: usize) {
    HostArch::bind_current_thread(Some(CpuId::new(cpu)));
}

/// Creates a thread that never gets to run.
pub(crate) fn create_thread(k: &'static Kernel<HostArch>, name: &str) -> ThreadId {
    create_thread_with(k, ThreadBuilder::new(name))
}

pub(crate) fn create_thread_with(k: &'static Kernel<HostArch>, builder: ThreadBuilder<'_>) -> ThreadId {
    builder.create(k, || {}).unwrap()
}

/// Boots `k`, runs `f` as its init thread and halts the kernel again.
///
/// # Panics
///
/// Panics if `f` does not finish within 30 seconds.
pub(crate) fn run_in_kernel<R, F>(k: &'static Kernel<HostArch>, f: F) -> R
where
    R: Send + 'static,
    F: FnOnce(&'static Kernel<HostArch>) -> R + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    k.boot(move || {
        let _ = tx.send(f(k));
    })
    .unwrap();
    let result = rx
        .recv_timeout(Duration::from_secs(30))
        .unwrap_or_else(|e| panic!("kernel test did not finish: {e}"));
    k.halt();
    result
}

/// One-shot mailbox for results produced by kernel threads.
pub(crate) struct Slot<T>(Mutex<Option<T>>);

impl<T> Slot<T> {
    pub(crate) fn new() -> Self {
        Self(Mutex::new(None))
    }

    pub(crate) fn put(&self, value: T) {
        *self.0.lock().unwrap() = Some(value);
    }

    pub(crate) fn take(&self) -> Option<T> {
        self.0.lock().unwrap().take()
    }
}
