//! # Synchronization
//!
//! Completion markers returned by the kernel for each submission.

use core::fmt;

// =============================================================================
// TIMESTAMP
// =============================================================================

/// Completion fence of a submission
///
/// The kernel hands out fences in submission order on a pipe; zero means
/// "nothing submitted yet".
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Timestamp(u32);

impl Timestamp {
    /// No submission recorded
    pub const NONE: Self = Self(0);

    /// Wrap a raw fence value
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw fence value
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Whether a submission was ever recorded
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Wrap-aware "this fence was signalled no later than `other`"
    #[inline]
    pub const fn is_before_or_at(self, other: Timestamp) -> bool {
        (other.0.wrapping_sub(self.0) as i32) >= 0
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
