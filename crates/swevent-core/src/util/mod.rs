//! Utility functions and types used throughout the Swevent framework.
//!
//! This module provides:
//! - Constants for the counting call and worker handshake ([`MAX_HANDLES_PER_WORKER`],
//!   [`COMPLETION_MARKER`], etc.)
//! - [`ReadMarker`] trait for reading the completion marker from a worker pipe
//! - Progress reporting utilities ([`NamedProgress`])

mod constants;
mod named_progress;

pub use self::constants::*;
pub use self::named_progress::NamedProgress;

use std::io::{ErrorKind, Read};

/// Trait for reading a fixed size completion marker from a stream.
///
/// Workers signal the end of their batch by writing [`COMPLETION_MARKER`] to their
/// standard output, which is the write end of a pipe owned by the coordinator.
pub trait ReadMarker {
    /// Blocks until `len` bytes were received or the writer went away.
    ///
    /// # Returns
    ///
    /// Returns the bytes received. The result is shorter than `len` if the stream
    /// reached end of file first.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if reading fails for any reason other than an interrupt.
    fn read_marker(&mut self, len: usize) -> std::io::Result<Vec<u8>>;
}

impl<R: Read> ReadMarker for R {
    fn read_marker(&mut self, len: usize) -> std::io::Result<Vec<u8>> {
        let mut out = vec![0; len];
        let mut filled = 0;
        while filled < len {
            match self.read(&mut out[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        out.truncate(filled);
        Ok(out)
    }
}
