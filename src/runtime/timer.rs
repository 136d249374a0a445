//! One-shot reply-deadline timers.
//!
//! Each timer is a `timerfd` registered into the owning worker's
//! multiplexer next to the client sockets, so deadlines fire as ordinary
//! readiness events without a sleeping or polling thread.

use mio::event::Source;
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// An armed one-shot timer. Closing the descriptor (on drop) disarms it.
#[derive(Debug)]
pub struct Timer {
    fd: OwnedFd,
}

impl Timer {
    /// Create a timer that becomes readable once, `after` from now.
    pub fn oneshot(after: Duration) -> io::Result<Self> {
        // SAFETY: plain syscall, no pointers involved.
        let raw = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        if raw == -1 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `raw` is a freshly created descriptor that nothing else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // An all-zero it_value would disarm the timer instead of firing it
        let after = after.max(Duration::from_nanos(1));
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: after.as_secs().try_into().unwrap_or(libc::time_t::MAX),
                tv_nsec: after.subsec_nanos() as libc::c_long,
            },
        };

        // SAFETY: `fd` is a valid timerfd and `spec` outlives the call.
        let res = unsafe { libc::timerfd_settime(fd.as_raw_fd(), 0, &spec, std::ptr::null_mut()) };
        if res == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self { fd })
    }
}

impl AsRawFd for Timer {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Source for Timer {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        SourceFd(&self.fd.as_raw_fd()).register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        SourceFd(&self.fd.as_raw_fd()).reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        SourceFd(&self.fd.as_raw_fd()).deregister(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Events, Poll};
    use std::time::Instant;

    #[test]
    fn test_timer_fires_once() {
        let mut poll = Poll::new().unwrap();
        let mut events = Events::with_capacity(4);
        let mut timer = Timer::oneshot(Duration::from_millis(20)).unwrap();

        poll.registry()
            .register(&mut timer, Token(5), Interest::READABLE)
            .unwrap();

        let started = Instant::now();
        poll.poll(&mut events, Some(Duration::from_secs(2))).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(15));

        let tokens: Vec<Token> = events.iter().map(|e| e.token()).collect();
        assert_eq!(tokens, vec![Token(5)]);

        // Edge-triggered: no second event for the same expiry
        poll.poll(&mut events, Some(Duration::from_millis(50))).unwrap();
        assert!(events.is_empty());

        poll.registry().deregister(&mut timer).unwrap();
    }

    #[test]
    fn test_dropped_timer_never_fires() {
        let mut poll = Poll::new().unwrap();
        let mut events = Events::with_capacity(4);
        let mut timer = Timer::oneshot(Duration::from_millis(10)).unwrap();

        poll.registry()
            .register(&mut timer, Token(1), Interest::READABLE)
            .unwrap();
        poll.registry().deregister(&mut timer).unwrap();
        drop(timer);

        poll.poll(&mut events, Some(Duration::from_millis(50))).unwrap();
        assert!(events.is_empty());
    }
}
