//! # CINDER Error Handling
//!
//! Error types for the buffer manager and command submission stack.
//!
//! The kernel transport reports failures as raw [`Errno`] values. Each layer
//! maps them onto the [`Error`] taxonomy at the point where it knows what the
//! failed call meant (allocation, import, submission, ...), so callers can
//! match on the category and still inspect the underlying errno.

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// CINDER Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERRNO
// =============================================================================

/// Raw error number reported by the kernel transport
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Errno(i32);

impl Errno {
    /// No such file or directory
    pub const ENOENT: Self = Self(2);
    /// Interrupted system call
    pub const EINTR: Self = Self(4);
    /// I/O error
    pub const EIO: Self = Self(5);
    /// Bad file descriptor
    pub const EBADF: Self = Self(9);
    /// Try again
    pub const EAGAIN: Self = Self(11);
    /// Out of memory
    pub const ENOMEM: Self = Self(12);
    /// Device or resource busy
    pub const EBUSY: Self = Self(16);
    /// Invalid argument
    pub const EINVAL: Self = Self(22);
    /// No space left on device
    pub const ENOSPC: Self = Self(28);
    /// Connection timed out
    pub const ETIMEDOUT: Self = Self(110);

    /// Wrap a raw errno value
    #[inline]
    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    /// Get the raw errno value
    #[inline]
    pub const fn raw(self) -> i32 {
        self.0
    }

    fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::ENOENT => "ENOENT",
            Self::EINTR => "EINTR",
            Self::EIO => "EIO",
            Self::EBADF => "EBADF",
            Self::EAGAIN => "EAGAIN",
            Self::ENOMEM => "ENOMEM",
            Self::EBUSY => "EBUSY",
            Self::EINVAL => "EINVAL",
            Self::ENOSPC => "ENOSPC",
            Self::ETIMEDOUT => "ETIMEDOUT",
            _ => return None,
        })
    }
}

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "Errno({})", name),
            None => write!(f, "Errno({})", self.0),
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", name, self.0),
            None => write!(f, "errno {}", self.0),
        }
    }
}

// =============================================================================
// ERROR ENUM
// =============================================================================

/// CINDER unified error type
///
/// Allocation, import and mapping failures are fatal to the call that hit
/// them. Submission failures are reported but never leave a command stream
/// stuck. `Timeout` is kept apart from `WaitFailed` so a caller can retry a
/// wait that simply ran out of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Generic Errors
    // =========================================================================
    /// Invalid parameter provided (zero size, unknown parameter id, ...)
    InvalidArgument,
    /// Resource not found
    NotFound,
    /// Buffer is still in use by the GPU (non-blocking CPU prepare)
    Busy,
    /// Wait did not complete within the timeout
    Timeout,

    // =========================================================================
    // Memory Errors
    // =========================================================================
    /// Kernel refused to allocate a buffer, or no GPU address was left
    AllocationFailed(Errno),
    /// Importing a buffer by name or descriptor failed
    ImportFailed(Errno),
    /// Publishing a buffer as a global name or descriptor failed
    ExportFailed(Errno),
    /// Mapping a buffer into the process failed
    MappingFailed(Errno),

    // =========================================================================
    // Command Submission Errors
    // =========================================================================
    /// Kernel rejected or failed a command submission
    SubmissionFailed(Errno),
    /// Fence or CPU-prepare wait failed for a reason other than a timeout
    WaitFailed(Errno),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Any other transport failure (parameter query, duplication, ...)
    Transport(Errno),
}

impl Error {
    /// Map the errno of a blocking wait onto the wait outcomes
    pub const fn from_wait(errno: Errno) -> Self {
        match errno {
            Errno::ETIMEDOUT => Error::Timeout,
            Errno::EBUSY => Error::Busy,
            other => Error::WaitFailed(other),
        }
    }

    /// Underlying errno, if the error came from the transport
    pub const fn errno(&self) -> Option<Errno> {
        match *self {
            Self::AllocationFailed(e)
            | Self::ImportFailed(e)
            | Self::ExportFailed(e)
            | Self::MappingFailed(e)
            | Self::SubmissionFailed(e)
            | Self::WaitFailed(e)
            | Self::Transport(e) => Some(e),
            _ => None,
        }
    }

    /// Whether the error is the recoverable "ran out of time" outcome
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Generic
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::NotFound => write!(f, "resource not found"),
            Self::Busy => write!(f, "buffer busy"),
            Self::Timeout => write!(f, "wait timed out"),

            // Memory
            Self::AllocationFailed(e) => write!(f, "buffer allocation failed: {}", e),
            Self::ImportFailed(e) => write!(f, "buffer import failed: {}", e),
            Self::ExportFailed(e) => write!(f, "buffer export failed: {}", e),
            Self::MappingFailed(e) => write!(f, "buffer mapping failed: {}", e),

            // Command
            Self::SubmissionFailed(e) => write!(f, "submission failed: {}", e),
            Self::WaitFailed(e) => write!(f, "wait failed: {}", e),

            // Transport
            Self::Transport(e) => write!(f, "transport error: {}", e),
        }
    }
}

impl core::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_errno_mapping() {
        assert_eq!(Error::from_wait(Errno::ETIMEDOUT), Error::Timeout);
        assert_eq!(Error::from_wait(Errno::EBUSY), Error::Busy);
        assert_eq!(Error::from_wait(Errno::EIO), Error::WaitFailed(Errno::EIO));
        assert!(Error::Timeout.is_timeout());
        assert!(!Error::WaitFailed(Errno::EIO).is_timeout());
    }

    #[test]
    fn test_errno_carried() {
        assert_eq!(Error::AllocationFailed(Errno::ENOMEM).errno(), Some(Errno::ENOMEM));
        assert_eq!(Error::InvalidArgument.errno(), None);
    }

    #[test]
    fn test_display() {
        use alloc::string::ToString;

        assert_eq!(
            Error::SubmissionFailed(Errno::EINVAL).to_string(),
            "submission failed: EINVAL (22)"
        );
        assert_eq!(Errno::new(1234).to_string(), "errno 1234");
    }
}
