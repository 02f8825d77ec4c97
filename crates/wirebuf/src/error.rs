//! Error types for resize operations.
//!
//! Hot paths (writes, reads, pushes, pops) report failure through `bool` and
//! `Option` returns; resizes are cold and get a typed error instead.

use thiserror::Error;

/// Errors from `try_resize` on any of the resizable containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ResizeError {
    /// The requested capacity cannot hold the data currently stored.
    #[error("requested capacity {requested} is below the {used} currently in use")]
    BelowUsed {
        /// Bytes or elements currently held.
        used: usize,
        /// The capacity that was requested.
        requested: usize,
    },

    /// The requested capacity equals the current one; nothing to do.
    #[error("requested capacity equals the current capacity")]
    SameCapacity,
}

impl ResizeError {
    /// Returns `true` if retrying with a larger capacity could succeed.
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::BelowUsed { .. })
    }
}
