use std::fmt;
use std::io::{self, IoSlice, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Buf;
use http::StatusCode;
use tracing::{debug, error, info, warn};

use crate::buffer::Buffer;
use crate::protocol::{HttpRequest, HttpResponse};
use crate::user::UserPool;

/// Level-triggered writes keep going while more than this many bytes are pending.
const LT_WRITE_THRESHOLD: usize = 10240;

/// State shared by every connection of one server.
#[derive(Debug)]
pub struct ConnContext {
    src_dir: PathBuf,
    edge_triggered: bool,
    users: Option<Arc<UserPool>>,
    user_count: AtomicUsize,
}

impl ConnContext {
    /// `users` is `None` when forms are not checked against a user store.
    pub fn new(src_dir: impl Into<PathBuf>, edge_triggered: bool, users: Option<Arc<UserPool>>) -> Self {
        Self { src_dir: src_dir.into(), edge_triggered, users, user_count: AtomicUsize::new(0) }
    }

    /// Root directory of the served files.
    pub fn src_dir(&self) -> &Path {
        &self.src_dir
    }

    /// Whether reads and writes loop until the socket would block.
    pub fn is_edge_triggered(&self) -> bool {
        self.edge_triggered
    }

    /// Number of connections currently open.
    pub fn user_count(&self) -> usize {
        self.user_count.load(Ordering::Acquire)
    }
}

/// One client socket with its read and write buffers and the request in flight.
///
/// The response goes out as at most two pending byte ranges: the header block in the
/// write buffer, then the unsent tail of the mapped file. [`HttpConn::write`] consumes
/// them left to right as the socket accepts bytes.
pub struct HttpConn {
    ctx: Arc<ConnContext>,
    stream: Option<TcpStream>,
    fd: RawFd,
    addr: Option<SocketAddr>,
    read_buf: Buffer,
    write_buf: Buffer,
    request: HttpRequest,
    response: HttpResponse,
    /// bytes of the mapped file already sent
    file_offset: usize,
    /// bumped by every `init`
    generation: u64,
}

impl HttpConn {
    /// Creates a closed connection; [`HttpConn::init`] hands it a socket.
    pub fn new(ctx: Arc<ConnContext>) -> Self {
        Self {
            ctx,
            stream: None,
            fd: -1,
            addr: None,
            read_buf: Buffer::new(),
            write_buf: Buffer::new(),
            request: HttpRequest::new(),
            response: HttpResponse::new(),
            file_offset: 0,
            generation: 0,
        }
    }

    /// Takes over a freshly accepted socket, resetting everything left from a previous one.
    pub fn init(&mut self, stream: TcpStream, addr: SocketAddr) {
        if self.stream.is_some() {
            self.close();
        }
        let count = self.ctx.user_count.fetch_add(1, Ordering::AcqRel) + 1;

        self.generation = self.generation.wrapping_add(1);
        self.fd = stream.as_raw_fd();
        self.stream = Some(stream);
        self.addr = Some(addr);
        self.read_buf.retrieve_all();
        self.write_buf.retrieve_all();
        self.request.init();
        self.response.unmap_file();
        self.file_offset = 0;
        info!(fd = self.fd, peer = %addr, user_count = count, "client connected");
    }

    /// Descriptor of the current socket, `-1` before the first `init`.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Counts the sockets this connection has taken over.
    ///
    /// Descriptors are reused by the kernel, so a task queued for one socket compares
    /// the generation it saw with this one before touching the connection.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Peer address of the current socket.
    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    /// `true` before the first `init` and after `close`.
    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// Whether the connection stays open once the current response is sent.
    pub fn keep_alive(&self) -> bool {
        self.response.keep_alive()
    }

    /// The request being parsed, or the last one parsed.
    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    /// The response being written.
    pub fn response(&self) -> &HttpResponse {
        &self.response
    }

    /// Bytes of the current response not yet accepted by the socket.
    pub fn to_write_bytes(&self) -> usize {
        self.write_buf.readable_bytes() + self.response.file_len() - self.file_offset
    }

    /// Closes the socket and releases the mapped file. Calling it again does nothing.
    pub fn close(&mut self) {
        let Some(stream) = self.stream.take() else {
            return;
        };
        self.response.unmap_file();
        self.file_offset = 0;
        drop(stream);

        let count = self.ctx.user_count.fetch_sub(1, Ordering::AcqRel) - 1;
        info!(fd = self.fd, peer = ?self.addr, user_count = count, "client quit");
    }

    /// Drains the socket into the read buffer.
    ///
    /// Edge-triggered connections read until the socket would block, level-triggered
    /// ones read once. `Ok(0)` means the peer closed its side; `WouldBlock` is returned
    /// only when nothing at all could be read.
    pub fn read(&mut self) -> io::Result<usize> {
        let edge_triggered = self.ctx.edge_triggered;
        let stream = self.stream.as_mut().ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;

        let mut total = 0;
        loop {
            match self.read_buf.read_from(stream) {
                Ok(0) => return Ok(0),
                Ok(n) => {
                    total += n;
                    if !edge_triggered {
                        return Ok(total);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock && total > 0 => return Ok(total),
                Err(e) => return Err(e),
            }
        }
    }

    /// Parses buffered bytes and, once a request is complete, builds its response.
    ///
    /// Returns `true` when a response is ready to be written and `false` when more
    /// bytes have to be read first.
    pub fn process(&mut self) -> bool {
        if self.request.is_finished() {
            self.request.init();
        }
        if self.read_buf.is_empty() {
            return false;
        }

        let users = self.ctx.users.as_deref();
        match self.request.parse(&mut self.read_buf, users) {
            Ok(false) => return false,
            Ok(true) => {
                debug!(fd = self.fd, path = self.request.path(), "request parsed");
                self.response.init(&self.ctx.src_dir, self.request.path(), self.request.keep_alive(), None);
            }
            Err(e) => {
                warn!(fd = self.fd, cause = %e, "bad request");
                self.read_buf.retrieve_all();
                self.response.init(&self.ctx.src_dir, self.request.path(), false, Some(StatusCode::BAD_REQUEST));
                self.request.init();
            }
        }

        if let Err(e) = self.response.make_response(&mut self.write_buf) {
            error!(fd = self.fd, cause = %e, "failed to build response");
        }
        self.file_offset = 0;
        debug!(fd = self.fd, file_len = self.response.file_len(), to_write = self.to_write_bytes(), "response ready");
        true
    }

    /// Sends the pending header and file ranges with vectored writes.
    ///
    /// Edge-triggered connections write until done or the socket would block;
    /// level-triggered ones stop after a write that leaves at most 10 KiB pending.
    /// Returns the number of bytes written by this call.
    pub fn write(&mut self) -> io::Result<usize> {
        let mut total = 0;
        while self.to_write_bytes() > 0 {
            let n = {
                let Some(stream) = self.stream.as_mut() else {
                    return Err(io::ErrorKind::NotConnected.into());
                };
                let pending = Buf::chain(&mut self.write_buf, &self.response.file()[self.file_offset..]);
                let mut slices = [IoSlice::new(&[]); 2];
                let count = pending.chunks_vectored(&mut slices);

                match stream.write_vectored(&slices[..count]) {
                    Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            };
            total += n;
            self.advance(n);

            if !self.ctx.edge_triggered && self.to_write_bytes() <= LT_WRITE_THRESHOLD {
                break;
            }
        }
        Ok(total)
    }

    /// Marks `n` written bytes as sent, header range first.
    fn advance(&mut self, n: usize) {
        let mut pending = Buf::chain(&mut self.write_buf, &self.response.file()[self.file_offset..]);
        pending.advance(n);
        self.file_offset = self.response.file_len() - pending.last_ref().len();
    }
}

impl Drop for HttpConn {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for HttpConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConn")
            .field("fd", &self.fd)
            .field("addr", &self.addr)
            .field("closed", &self.is_closed())
            .field("to_write", &self.to_write_bytes())
            .finish_non_exhaustive()
    }
}
