//! Worker processes performing batches of counting calls.
//!
//! A worker is a forked child that issues a bounded batch of counting calls, keeps
//! every returned handle open, writes [`COMPLETION_MARKER`] to its standard output and
//! then parks until it is killed. Its standard output is the write end of a pipe whose
//! read end is owned by the coordinator through a [`WorkerHandle`].
//!
//! The kernel keeps the increments alive only as long as the handles are open, so a
//! worker must outlive the caller's follow-up work. Teardown is done by
//! [`WorkerPool::reap`].

use crate::counter::CounterSyscall;
use crate::offset::SweventAttr;
use crate::util::{COMPLETION_MARKER, DEFAULT_GRACE_PERIOD, ReadMarker};
use libc::{STDERR_FILENO, STDOUT_FILENO, pid_t};
use log::{debug, warn};
use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd};
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while creating a worker.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The notification pipe could not be created.
    #[error("Failed to create notification channel: {0}")]
    Channel(#[source] io::Error),
    /// The worker process could not be forked.
    #[error("Failed to fork worker: {0}")]
    Fork(#[source] io::Error),
}

/// Coordinator side of one running worker.
///
/// Owns the read end of the worker's notification pipe until the handshake is done.
/// Later workers inherit every descriptor still open in the coordinator, so the read
/// end must not outlive [`await_marker`](WorkerHandle::await_marker).
#[derive(Debug)]
pub struct WorkerHandle {
    pid: pid_t,
    channel: Option<File>,
}

impl WorkerHandle {
    /// Wraps an already running process and its notification channel.
    pub fn new(pid: pid_t, channel: File) -> Self {
        WorkerHandle {
            pid,
            channel: Some(channel),
        }
    }

    /// Process id of the worker.
    pub fn pid(&self) -> pid_t {
        self.pid
    }

    /// Blocks until the worker wrote its completion marker, then closes the channel.
    ///
    /// # Returns
    ///
    /// Returns `true` if the full marker arrived, `false` if the worker closed its
    /// end of the pipe before that or the channel was already consumed.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if reading from the pipe fails. The channel is closed
    /// in that case too.
    pub fn await_marker(&mut self) -> io::Result<bool> {
        let Some(mut channel) = self.channel.take() else {
            warn!("Worker {} has no channel left to wait on", self.pid);
            return Ok(false);
        };
        let marker = channel.read_marker(COMPLETION_MARKER.len())?;
        if marker != COMPLETION_MARKER {
            warn!(
                "Worker {} closed its channel after {:?} instead of the completion marker",
                self.pid,
                String::from_utf8_lossy(&marker)
            );
            return Ok(false);
        }
        Ok(true)
    }
}

/// Trait for creating workers.
///
/// Implementors start one worker that performs `batch` counting calls with `attr`
/// and return the coordinator's handle to it. The worker must eventually write
/// [`COMPLETION_MARKER`] to the handle's channel.
///
/// [`ForkSpawner`] is the implementation used in practice.
pub trait WorkerSpawner {
    /// Starts one worker.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError`] if the channel or the process could not be created.
    fn spawn(&mut self, attr: &SweventAttr, batch: usize) -> Result<WorkerHandle, SpawnError>;
}

/// Spawns workers with `fork(2)`, issuing calls through a [`CounterSyscall`].
pub struct ForkSpawner<C: CounterSyscall> {
    counter: C,
}

impl<C: CounterSyscall> ForkSpawner<C> {
    /// Creates a spawner whose workers use `counter`.
    pub fn new(counter: C) -> Self {
        ForkSpawner { counter }
    }

    /// Returns the counter used by the workers.
    pub fn counter(&self) -> &C {
        &self.counter
    }
}

impl<C: CounterSyscall> WorkerSpawner for ForkSpawner<C> {
    fn spawn(&mut self, attr: &SweventAttr, batch: usize) -> Result<WorkerHandle, SpawnError> {
        let (read_end, write_end) = notification_channel()?;
        match unsafe { libc::fork() } {
            -1 => Err(SpawnError::Fork(io::Error::last_os_error())),
            0 => {
                drop(read_end);
                redirect_stdout(write_end);
                run_batch(&self.counter, attr, batch);
                signal_done();
                park()
            }
            pid => {
                drop(write_end);
                debug!("Spawned worker {} for a batch of {}", pid, batch);
                Ok(WorkerHandle::new(pid, File::from(read_end)))
            }
        }
    }
}

fn notification_channel() -> Result<(OwnedFd, OwnedFd), SpawnError> {
    let mut fds = [0; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(SpawnError::Channel(io::Error::last_os_error()));
    }
    // SAFETY: pipe(2) succeeded, both descriptors are fresh and owned by us
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Makes `write_end` the worker's standard output.
fn redirect_stdout(write_end: OwnedFd) {
    let fd = write_end.into_raw_fd();
    unsafe {
        libc::dup2(fd, STDOUT_FILENO);
        // a low descriptor is one of the standard streams and stays where it is
        if fd > STDERR_FILENO {
            libc::close(fd);
        }
    }
}

/// Issues `batch` counting calls. A failed call does not end the batch.
fn run_batch<C: CounterSyscall>(counter: &C, attr: &SweventAttr, batch: usize) -> usize {
    let mut opened = 0;
    for _ in 0..batch {
        match counter.increment(attr) {
            Ok(_) => opened += 1,
            Err(e) => child_diagnostic(format_args!("Counting call failed: {}\n", e)),
        }
    }
    opened
}

fn signal_done() {
    // unbuffered on purpose, the marker has to be in the pipe before the worker parks
    let ret = unsafe {
        libc::write(
            STDOUT_FILENO,
            COMPLETION_MARKER.as_ptr() as *const libc::c_void,
            COMPLETION_MARKER.len(),
        )
    };
    if ret < 0 {
        child_diagnostic(format_args!(
            "Failed to write completion marker: {}\n",
            io::Error::last_os_error()
        ));
    }
}

/// Writes a message from inside a worker straight to its standard error.
///
/// The logger may hold a lock that was taken by another thread of the coordinator
/// at fork time, so workers never go through it. Messages are cut at the buffer size.
fn child_diagnostic(args: fmt::Arguments<'_>) {
    let mut buf = [0u8; 256];
    let len = {
        let mut cursor = &mut buf[..];
        let _ = cursor.write_fmt(args);
        256 - cursor.len()
    };
    unsafe {
        libc::write(STDERR_FILENO, buf.as_ptr() as *const libc::c_void, len);
    }
}

/// Keeps the worker and its handles alive until it is killed.
fn park() -> ! {
    loop {
        unsafe {
            libc::pause();
        }
    }
}

/// Workers spawned by one run, in spawn order.
///
/// Dropping the pool reaps every worker still in it.
#[derive(Debug)]
pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
    grace_period: Duration,
}

impl Default for WorkerPool {
    fn default() -> Self {
        WorkerPool::new(DEFAULT_GRACE_PERIOD)
    }
}

impl WorkerPool {
    /// Creates an empty pool that waits `grace_period` between killing and reaping.
    pub fn new(grace_period: Duration) -> Self {
        WorkerPool {
            workers: vec![],
            grace_period,
        }
    }

    /// Appends a worker.
    pub fn push(&mut self, worker: WorkerHandle) {
        self.workers.push(worker);
    }

    /// Number of tracked workers.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Returns `true` if no worker is tracked.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Process ids of the tracked workers, in spawn order.
    pub fn pids(&self) -> Vec<pid_t> {
        self.workers.iter().map(|w| w.pid()).collect()
    }

    /// Kills and reaps the first `count` workers.
    ///
    /// Each worker gets `SIGKILL`, then the pool waits one grace period and collects
    /// the exit status without blocking. A worker that has not exited by then is
    /// abandoned. Workers beyond `count` are not touched and stay in the pool.
    ///
    /// # Returns
    ///
    /// Number of workers that were reaped.
    pub fn reap(&mut self, count: usize) -> usize {
        if count > self.workers.len() {
            warn!(
                "Asked to reap {} workers, only {} are tracked",
                count,
                self.workers.len()
            );
        }
        let count = count.min(self.workers.len());
        if count == 0 {
            return 0;
        }
        let victims: Vec<WorkerHandle> = self.workers.drain(..count).collect();
        for worker in &victims {
            if unsafe { libc::kill(worker.pid, libc::SIGKILL) } != 0 {
                warn!(
                    "Failed to kill worker {}: {}",
                    worker.pid,
                    io::Error::last_os_error()
                );
            }
        }

        thread::sleep(self.grace_period);

        let mut reaped = 0;
        for worker in &victims {
            let mut status = 0;
            match unsafe { libc::waitpid(worker.pid, &mut status, libc::WNOHANG) } {
                pid if pid == worker.pid => reaped += 1,
                0 => debug!("Worker {} still running, abandoning it", worker.pid),
                _ => debug!(
                    "Failed to reap worker {}: {}",
                    worker.pid,
                    io::Error::last_os_error()
                ),
            }
        }
        debug!("Reaped {}/{} workers", reaped, count);
        reaped
    }

    /// Kills and reaps every tracked worker.
    pub fn reap_all(&mut self) -> usize {
        self.reap(self.workers.len())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.reap_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offset::{EncodedOffset, KernelAddr};
    use std::os::fd::RawFd;

    #[derive(Debug, Error)]
    #[error("refused")]
    struct Refused;

    struct Refusing;

    impl CounterSyscall for Refusing {
        type Error = Refused;
        fn increment(&self, _attr: &SweventAttr) -> Result<RawFd, Self::Error> {
            Err(Refused)
        }
    }

    fn attr() -> SweventAttr {
        let base = KernelAddr::new(0xc0d07a7c);
        SweventAttr::new(EncodedOffset::encode(base, base))
    }

    fn is_alive(pid: pid_t) -> bool {
        unsafe { libc::kill(pid, 0) == 0 }
    }

    #[test]
    fn test_run_batch_tolerates_failures() {
        assert_eq!(run_batch(&Refusing, &attr(), 5), 0);
    }

    #[test]
    fn test_failed_calls_still_signal_done() -> anyhow::Result<()> {
        let mut spawner = ForkSpawner::new(Refusing);
        let mut worker = spawner.spawn(&attr(), 3)?;
        assert!(worker.await_marker()?);
        // the read end is gone once the handshake is over
        assert!(worker.channel.is_none());
        assert!(!worker.await_marker()?);
        let mut pool = WorkerPool::new(Duration::from_millis(200));
        pool.push(worker);
        assert_eq!(pool.reap_all(), 1);
        Ok(())
    }

    #[test]
    fn test_worker_parks_until_reaped() -> anyhow::Result<()> {
        let mut spawner = ForkSpawner::new(Refusing);
        let mut pool = WorkerPool::new(Duration::from_millis(200));
        for _ in 0..3 {
            let mut worker = spawner.spawn(&attr(), 1)?;
            assert!(worker.await_marker()?);
            pool.push(worker);
        }
        let pids = pool.pids();
        assert!(pids.iter().all(|pid| is_alive(*pid)));

        assert_eq!(pool.reap(2), 2);
        assert_eq!(pool.len(), 1);
        assert!(!is_alive(pids[0]));
        assert!(!is_alive(pids[1]));
        assert!(is_alive(pids[2]));

        assert_eq!(pool.reap(5), 1);
        assert!(pool.is_empty());
        assert!(!is_alive(pids[2]));
        Ok(())
    }

    #[test]
    fn test_reap_zero_is_noop() {
        let mut pool = WorkerPool::new(Duration::from_secs(10));
        assert_eq!(pool.reap(0), 0);
        assert_eq!(pool.reap_all(), 0);
    }
}
