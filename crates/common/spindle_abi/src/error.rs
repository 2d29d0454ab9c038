use strum::FromRepr;

/// Status codes visible to user space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, thiserror::Error)]
#[repr(isize)]
pub enum Errno {
    // ENOENT
    #[error("no such entry")]
    NotFound = 2,
    // EINTR
    #[error("interrupted")]
    Interrupted = 4,
    // EAGAIN
    #[error("resource temporarily unavailable")]
    WouldBlock = 11,
    // ENOMEM
    #[error("cannot allocate memory")]
    OutOfMemory = 12,
    // EINVAL
    #[error("invalid argument")]
    InvalidArgument = 22,
    // ETIMEDOUT
    #[error("timed out")]
    Timeout = 110,
    #[error("unknown error")]
    Unknown = -1,
}

impl Errno {
    /// Encodes the error as a negative return value.
    #[must_use]
    pub const fn to_return_value(self) -> isize {
        match self {
            Self::Unknown => -1,
            _ => -(self as isize),
        }
    }

    /// Decodes a negative return value.
    ///
    /// Returns `None` for non-negative values, which denote success.
    #[must_use]
    pub fn from_return_value(value: isize) -> Option<Self> {
        if value >= 0 {
            return None;
        }
        Some(Self::from_repr(-value).unwrap_or(Self::Unknown))
    }
}
