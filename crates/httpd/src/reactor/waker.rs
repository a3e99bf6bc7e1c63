use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::utils::syscall;

/// `eventfd` based handle that makes a blocked [`Epoller::wait`](super::Epoller::wait) return.
///
/// Register [`Waker::as_raw_fd`] as readable; once the event shows up, call
/// [`Waker::reset`] before waiting again.
#[derive(Debug)]
pub struct Waker {
    fd: File,
}

impl Waker {
    /// Creates a non-blocking, close-on-exec `eventfd` with a zero counter.
    pub fn new() -> io::Result<Self> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        // SAFETY: `eventfd` just returned this descriptor and nothing else owns it.
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self { fd: File::from(owned) })
    }

    /// Makes the descriptor readable. Safe to call from any thread, any number of times.
    pub fn wake(&self) -> io::Result<()> {
        match (&self.fd).write(&1u64.to_ne_bytes()) {
            Ok(_) => Ok(()),
            // the counter is saturated, drain it and try again
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.reset()?;
                self.wake()
            }
            Err(e) => Err(e),
        }
    }

    /// Drains the counter so the descriptor stops being readable.
    pub fn reset(&self) -> io::Result<()> {
        let mut buf = [0u8; 8];
        match (&self.fd).read(&mut buf) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
