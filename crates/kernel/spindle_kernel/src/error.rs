use spindle_abi::error::Errno;

use crate::proc::ThreadId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    #[error("timed out")]
    Timeout,
    #[error("operation would block")]
    WouldBlock,
    #[error("sleep interrupted")]
    Interrupted,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("no free thread slot")]
    NoFreeThread,
    #[error("no free timeout slot")]
    NoFreeTimeout,
    #[error("no free futex slot")]
    NoFreeFutex,
    #[error("thread {0} not found")]
    ThreadNotFound(ThreadId),
}

impl From<KernelError> for Errno {
    fn from(error: KernelError) -> Self {
        match error {
            KernelError::Timeout => Self::Timeout,
            KernelError::WouldBlock => Self::WouldBlock,
            KernelError::Interrupted => Self::Interrupted,
            KernelError::InvalidArgument => Self::InvalidArgument,
            KernelError::NoFreeThread | KernelError::NoFreeTimeout | KernelError::NoFreeFutex => {
                Self::OutOfMemory
            }
            KernelError::ThreadNotFound(_) => Self::NotFound,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_errno() {
        assert_eq!(Errno::from(KernelError::Timeout), Errno::Timeout);
        assert_eq!(Errno::from(KernelError::WouldBlock), Errno::WouldBlock);
        assert_eq!(Errno::from(KernelError::NoFreeFutex), Errno::OutOfMemory);
        assert_eq!(
            Errno::from(KernelError::Interrupted).to_return_value(),
            -(Errno::Interrupted as isize)
        );
    }
}
