/*!
 * I/O Multiplexer
 *
 * Thin readiness-notification layer over `mio` (epoll on Linux, kqueue on
 * the BSDs and macOS). Sockets are watched by raw file descriptor and the
 * descriptor doubles as the event token, so callers map events straight
 * back to their own connection tables.
 */

use mio::unix::SourceFd;
use mio::{Events, Poll, Registry, Token};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Readiness a caller wants to hear about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
    ReadWrite,
}

impl From<Interest> for mio::Interest {
    fn from(i: Interest) -> Self {
        match i {
            Interest::Read => mio::Interest::READABLE,
            Interest::Write => mio::Interest::WRITABLE,
            Interest::ReadWrite => mio::Interest::READABLE | mio::Interest::WRITABLE,
        }
    }
}

/// One ready descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    /// Peer hung up or the socket is in an error state
    pub closed: bool,
}

/// A multiplexer instance. Each event loop owns its own.
pub struct Multiplexer {
    poll: Poll,
    events: Events,
}

impl Multiplexer {
    /// `capacity` bounds how many events one `wait` can return
    pub fn create(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity.max(1)),
        })
    }

    /// A handle other threads can use to add descriptors to this instance
    pub fn registrar(&self) -> io::Result<Registrar> {
        Ok(Registrar {
            registry: self.poll.registry().try_clone()?,
        })
    }

    pub fn monitor(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        monitor(self.poll.registry(), fd, interest)
    }

    /// Replace the interest set of an already watched descriptor
    pub fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), Token(fd as usize), interest.into())
    }

    pub fn unmonitor(&self, fd: RawFd) -> io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }

    /// Block until at least one descriptor is ready or `timeout` passes
    ///
    /// A signal interrupting the wait yields an empty list rather than an error.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Event>> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }
        Ok(self
            .events
            .iter()
            .map(|ev| Event {
                fd: ev.token().0 as RawFd,
                readable: ev.is_readable() || ev.is_read_closed(),
                writable: ev.is_writable(),
                closed: ev.is_error() || (ev.is_read_closed() && ev.is_write_closed()),
            })
            .collect())
    }

    /// Release the underlying epoll/kqueue descriptor
    pub fn close(self) {}
}

/// Cross-thread registration handle for a [`Multiplexer`]
pub struct Registrar {
    registry: Registry,
}

impl Registrar {
    pub fn monitor(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        monitor(&self.registry, fd, interest)
    }

    pub fn unmonitor(&self, fd: RawFd) -> io::Result<()> {
        self.registry.deregister(&mut SourceFd(&fd))
    }
}

fn monitor(registry: &Registry, fd: RawFd, interest: Interest) -> io::Result<()> {
    registry.register(&mut SourceFd(&fd), Token(fd as usize), interest.into())
}

/// Pause between retries of a failing `wait` or `accept`
///
/// Doubles from 1 ms up to 100 ms while failures repeat, so a loop stuck on
/// a persistent error neither spins nor floods the log.
#[derive(Debug)]
pub(crate) struct ErrorBackoff {
    delay: Duration,
}

impl ErrorBackoff {
    const MIN: Duration = Duration::from_millis(1);
    const MAX: Duration = Duration::from_millis(100);

    pub(crate) fn new() -> Self {
        Self { delay: Self::MIN }
    }

    /// Delay to sleep after the current failure
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.delay;
        self.delay = (self.delay * 2).min(Self::MAX);
        delay
    }

    pub(crate) fn sleep(&mut self) {
        std::thread::sleep(self.next_delay());
    }

    pub(crate) fn reset(&mut self) {
        self.delay = Self::MIN;
    }
}
