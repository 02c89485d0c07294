use std::io;
use std::os::fd::RawFd;
use swevent_core::counter::CounterSyscall;
use swevent_core::offset::SweventAttr;

/// Counter issuing `perf_event_open(2)` for the calling process on any CPU.
///
/// Every successful call leaks its event descriptor on purpose. Closing it would run
/// the destroy path of the event.
#[derive(Clone, Copy, Debug, Default)]
pub struct PerfSwevent;

impl PerfSwevent {
    /// Creates a new perf counter.
    pub fn new() -> Self {
        PerfSwevent
    }
}

impl CounterSyscall for PerfSwevent {
    type Error = io::Error;

    fn increment(&self, attr: &SweventAttr) -> Result<RawFd, Self::Error> {
        let fd = unsafe {
            libc::syscall(
                libc::SYS_perf_event_open,
                attr.as_ptr(),
                0 as libc::pid_t,
                -1 as libc::c_int,
                -1 as libc::c_int,
                0 as libc::c_ulong,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(fd as RawFd)
    }
}
