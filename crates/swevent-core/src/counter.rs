//! Counting call traits.
//!
//! This module defines the [`CounterSyscall`] trait that all counter implementations must
//! implement to issue the call whose side effect increments the kernel counter.

use crate::offset::SweventAttr;
use std::os::fd::RawFd;

/// Trait for issuing one counting call.
///
/// Every successful call increments the 32-bit kernel word selected by the encoded
/// offset inside `attr` and hands back a handle. The handle must stay open for the
/// lifetime of the worker, so implementations never close it and callers never
/// wrap it in an owning type.
///
/// # Associated Types
///
/// * `Error` - The error type returned by a failed call. Must implement [`std::error::Error`].
///
/// # Examples
///
/// See `swevent-perf` for the real call or `swevent-dummy` for a file backed
/// stand-in used in tests.
pub trait CounterSyscall {
    /// The error type returned by a failed call.
    type Error: std::error::Error;

    /// Issues a single counting call.
    ///
    /// This runs inside a freshly forked worker. Implementations should stick to
    /// plain system calls and must not take locks that another thread of the
    /// parent might have held at fork time. That includes the `log` macros: the
    /// installed logger may lock its output.
    ///
    /// # Returns
    ///
    /// Returns the handle that keeps the increment alive.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel refused the call. Workers print the error to
    /// standard error and continue with the rest of their batch.
    fn increment(&self, attr: &SweventAttr) -> Result<RawFd, Self::Error>;
}
