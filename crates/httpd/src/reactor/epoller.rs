//! Thin wrapper around a Linux `epoll` instance.
//!
//! The [`Epoller`] only owns the interest set. The list of ready events lives in a
//! separate [`Events`] value owned by the thread that waits, so worker threads can
//! share the `Epoller` behind an `Arc` and re-arm descriptors while the reactor
//! thread is blocked in [`Epoller::wait`].

use std::fmt;
use std::io;
use std::ops::{BitOr, BitOrAssign};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::utils::syscall;

/// Default number of events fetched by one `wait` call
const DEFAULT_MAX_EVENTS: usize = 1024;

/// Bit set of `epoll` flags, used both to register interest and to report readiness.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Interest(u32);

impl Interest {
    pub const READABLE: Interest = Interest(libc::EPOLLIN as u32);
    pub const WRITABLE: Interest = Interest(libc::EPOLLOUT as u32);
    /// Peer shut down its writing half
    pub const PEER_CLOSED: Interest = Interest(libc::EPOLLRDHUP as u32);
    pub const HANG_UP: Interest = Interest(libc::EPOLLHUP as u32);
    pub const ERROR: Interest = Interest(libc::EPOLLERR as u32);
    /// Disarm the descriptor after one event until it is modified again
    pub const ONESHOT: Interest = Interest(libc::EPOLLONESHOT as u32);
    /// Edge-triggered notification
    pub const EDGE: Interest = Interest(libc::EPOLLET as u32);

    pub const fn empty() -> Self {
        Interest(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Interest(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Interest) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_readable(self) -> bool {
        self.intersects(Self::READABLE)
    }

    pub const fn is_writable(self) -> bool {
        self.intersects(Self::WRITABLE)
    }

    pub const fn is_edge_triggered(self) -> bool {
        self.intersects(Self::EDGE)
    }

    /// Peer-closed, hang-up or error: the connection has to go.
    pub const fn is_closed(self) -> bool {
        self.intersects(Interest(Self::PEER_CLOSED.0 | Self::HANG_UP.0 | Self::ERROR.0))
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Self) -> Self::Output {
        Interest(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Interest, &str); 7] = [
            (Interest::READABLE, "IN"),
            (Interest::WRITABLE, "OUT"),
            (Interest::PEER_CLOSED, "RDHUP"),
            (Interest::HANG_UP, "HUP"),
            (Interest::ERROR, "ERR"),
            (Interest::ONESHOT, "ONESHOT"),
            (Interest::EDGE, "ET"),
        ];
        let names: Vec<&str> = NAMES.iter().filter(|(flag, _)| self.intersects(*flag)).map(|(_, name)| *name).collect();
        write!(f, "Interest({})", names.join(" | "))
    }
}

/// Ready events filled in by [`Epoller::wait`].
pub struct Events {
    list: Vec<libc::epoll_event>,
    len: usize,
}

impl Events {
    /// Room for `capacity` events per wait, at least one.
    pub fn with_capacity(capacity: usize) -> Self {
        Self { list: vec![libc::epoll_event { events: 0, u64: 0 }; capacity.max(1)], len: 0 }
    }

    /// Number of events stored by the last wait.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Descriptor of the `i`-th ready event of the last wait.
    ///
    /// # Panics
    ///
    /// Panics if `i` is out of the last result set.
    pub fn fd(&self, i: usize) -> RawFd {
        assert!(i < self.len, "event index {i} out of range {}", self.len);
        let data = self.list[i].u64;
        RawFd::try_from(data).unwrap_or(-1)
    }

    /// Flags of the `i`-th ready event of the last wait.
    ///
    /// # Panics
    ///
    /// Panics if `i` is out of the last result set.
    pub fn flags(&self, i: usize) -> Interest {
        assert!(i < self.len, "event index {i} out of range {}", self.len);
        let events = self.list[i].events;
        Interest(events)
    }

    pub fn iter(&self) -> impl Iterator<Item = (RawFd, Interest)> + '_ {
        (0..self.len).map(|i| (self.fd(i), self.flags(i)))
    }
}

impl Default for Events {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_EVENTS)
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Owner of one `epoll` interest set.
#[derive(Debug)]
pub struct Epoller {
    epoll: OwnedFd,
}

impl Epoller {
    /// Creates a close-on-exec `epoll` instance.
    pub fn new() -> io::Result<Self> {
        let fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        // SAFETY: `epoll_create1` just returned this descriptor and nothing else owns it.
        let epoll = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self { epoll })
    }

    /// Registers `fd`; the descriptor itself is the event payload.
    pub fn add(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest)
    }

    /// Replaces the interest of `fd`, which also re-arms a `ONESHOT` descriptor.
    pub fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest)
    }

    /// Unregisters `fd`. Fails with `ENOENT` when it was never added or already removed.
    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, Interest::empty())
    }

    /// Blocks until a registered descriptor is ready or `timeout` elapses.
    ///
    /// `None` waits indefinitely and a zero duration only polls. Returns the number of
    /// ready events stored in `events`; an interrupted wait reports zero events.
    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout_ms = timeout.map_or(-1, |d| i32::try_from(d.as_micros().div_ceil(1000)).unwrap_or(i32::MAX));
        let max_events = i32::try_from(events.list.len()).unwrap_or(i32::MAX);

        let result = syscall!(epoll_wait(self.epoll.as_raw_fd(), events.list.as_mut_ptr(), max_events, timeout_ms));
        match result {
            Ok(n) => {
                events.len = usize::try_from(n).unwrap_or(0);
                Ok(events.len)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                events.len = 0;
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Interest) -> io::Result<()> {
        if fd < 0 {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        let mut event = libc::epoll_event { events: interest.bits(), u64: u64::try_from(fd).unwrap_or_default() };
        syscall!(epoll_ctl(self.epoll.as_raw_fd(), op, fd, &raw mut event))?;
        Ok(())
    }
}

impl AsRawFd for Epoller {
    fn as_raw_fd(&self) -> RawFd {
        self.epoll.as_raw_fd()
    }
}
