//! File backed counter that records every increment.

use std::cell::Cell;
use std::ffi::CString;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use swevent_core::counter::CounterSyscall;
use swevent_core::offset::{EncodedOffset, SweventAttr};
use thiserror::Error;

/// Counter that appends one record per increment to a tally file.
///
/// A record is the encoded offset as four little endian bytes, so the file length
/// divided by four is the number of successful increments. The descriptor used for
/// the append stays open, like the handle of the real call.
pub struct Tally {
    path: CString,
    limit: Option<usize>,
    calls: Cell<usize>,
}

/// Errors of the dummy counter.
#[derive(Debug, Error)]
pub enum TallyError {
    /// Opening or writing the tally file failed.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    /// The path contains a NUL byte.
    #[error("Tally path contains a NUL byte")]
    InvalidPath,
}

/// Size of one record in the tally file
pub const RECORD_SIZE: usize = 4;

impl Tally {
    /// Creates a counter recording into `path`. The file is created on first use.
    ///
    /// # Errors
    ///
    /// Returns [`TallyError::InvalidPath`] if `path` contains a NUL byte.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, TallyError> {
        let path = CString::new(path.as_ref().as_os_str().as_bytes())
            .map_err(|_| TallyError::InvalidPath)?;
        Ok(Tally {
            path,
            limit: None,
            calls: Cell::new(0),
        })
    }

    /// Makes every call after the first `limit` ones of a worker fail.
    ///
    /// Simulates a process running out of handles.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Reads the offsets recorded in the tally file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be read.
    pub fn records(path: impl AsRef<Path>) -> std::io::Result<Vec<EncodedOffset>> {
        let bytes = std::fs::read(path)?;
        Ok(bytes
            .chunks_exact(RECORD_SIZE)
            .map(|c| EncodedOffset::from_raw(u32::from_le_bytes([c[0], c[1], c[2], c[3]])))
            .collect())
    }

    /// Path of the tally file.
    pub fn path(&self) -> PathBuf {
        PathBuf::from(std::ffi::OsStr::from_bytes(self.path.as_bytes()))
    }
}

impl CounterSyscall for Tally {
    type Error = TallyError;

    fn increment(&self, attr: &SweventAttr) -> Result<RawFd, Self::Error> {
        // every worker starts from the spawner's copy, so this counts per worker
        let calls = self.calls.get();
        self.calls.set(calls + 1);
        if self.limit.is_some_and(|limit| calls >= limit) {
            return Err(std::io::Error::from_raw_os_error(libc::EMFILE).into());
        }
        let fd = unsafe {
            libc::open(
                self.path.as_ptr(),
                libc::O_WRONLY | libc::O_APPEND | libc::O_CREAT,
                0o600 as libc::c_uint,
            )
        };
        if fd < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let record = attr.offset().as_u32().to_le_bytes();
        let written =
            unsafe { libc::write(fd, record.as_ptr() as *const libc::c_void, RECORD_SIZE) };
        if written != RECORD_SIZE as isize {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(fd)
    }
}
