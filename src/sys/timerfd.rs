use std::io::{self, Read};
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use super::fd::FileDesc;

/// A timerfd on `CLOCK_MONOTONIC`, the single kernel wait point behind a
/// loop's timer queue.
///
/// See <http://man7.org/linux/man-pages/man2/timerfd_create.2.html>.
#[derive(Debug)]
pub struct TimerFd {
    inner: FileDesc,
}

impl TimerFd {
    /// Creates a monotonic timerfd with `TFD_CLOEXEC | TFD_NONBLOCK`.
    pub fn new() -> io::Result<TimerFd> {
        let flags = libc::TFD_CLOEXEC | libc::TFD_NONBLOCK;
        let timerfd = syscall!(timerfd_create(libc::CLOCK_MONOTONIC, flags))?;

        Ok(TimerFd {
            inner: FileDesc::new(timerfd),
        })
    }

    /// Arms the timer to fire once, `delay` from now. A zero delay disarms,
    /// so callers wanting an immediate tick must pass at least a tick of
    /// slack.
    pub fn set_relative(&self, delay: Duration) -> io::Result<()> {
        let new_value = libc::itimerspec {
            it_interval: duration_to_timespec(Duration::ZERO),
            it_value: duration_to_timespec(delay),
        };

        let mut old_value: libc::itimerspec = unsafe { mem::zeroed() };

        syscall!(timerfd_settime(
            self.inner.raw(),
            0,
            &new_value,
            &mut old_value
        ))?;

        Ok(())
    }

    /// Reads the expiration count accumulated since the last read or
    /// settime.
    pub fn read(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        (&self.inner).read_exact(&mut buf)?;
        Ok(u64::from_ne_bytes(buf))
    }
}

fn duration_to_timespec(duration: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: duration.as_secs() as libc::time_t,
        tv_nsec: duration.subsec_nanos() as libc::c_long,
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.raw()
    }
}

#[cfg(test)]
mod test {
    use super::TimerFd;
    use std::time::Duration;

    #[test]
    fn fires_after_delay() {
        let timerfd = TimerFd::new().unwrap();
        timerfd.set_relative(Duration::from_millis(10)).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(timerfd.read().unwrap(), 1);
    }

    #[test]
    fn unarmed_read_would_block() {
        let timerfd = TimerFd::new().unwrap();
        let err = timerfd.read().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }
}
