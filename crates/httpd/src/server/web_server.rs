use std::collections::HashMap;
use std::io::{self, Write};
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, error, info, trace, warn};

use super::{ServerBuilder, ServerConfig, ServerError};
use crate::connection::{ConnContext, HttpConn};
use crate::pool::ThreadPool;
use crate::reactor::{Epoller, Events, Interest, Waker};
use crate::timer::{HeapTimer, TimeoutCallback};
use crate::user::UserPool;
use crate::utils::{lock, syscall};

type SharedConn = Arc<Mutex<HttpConn>>;

/// Connection registered under one descriptor, with the generation of the socket it holds.
struct ConnSlot {
    conn: SharedConn,
    generation: u64,
}

/// Reactor loop of the server.
///
/// The thread running [`WebServer::start`] owns the listening socket, the timer heap
/// and the connection map. Reads and writes run on the worker pool; a worker gets the
/// connection only while its descriptor is disarmed (`EPOLLONESHOT`), and re-arms it
/// for reading or writing once its task is done.
pub struct WebServer {
    config: ServerConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    listen_event: Interest,
    conn_event: Interest,
    epoller: Arc<Epoller>,
    events: Events,
    waker: Arc<Waker>,
    closed: Arc<AtomicBool>,
    timer: HeapTimer,
    pool: ThreadPool,
    ctx: Arc<ConnContext>,
    conns: HashMap<RawFd, ConnSlot>,
}

impl WebServer {
    /// Starts a [`ServerBuilder`] with the default configuration.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Opens the listening socket and registers it; nothing is accepted before [`WebServer::start`].
    pub fn bind(config: ServerConfig, users: Arc<UserPool>) -> Result<Self, ServerError> {
        config.validate()?;
        let listen_event = config.trigger_mode.listen_event();
        let conn_event = config.trigger_mode.conn_event();

        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.port)).map_err(|e| ServerError::bind(config.port, e))?;
        if config.linger {
            set_linger(&listener).map_err(|e| ServerError::io("set SO_LINGER", e))?;
        }
        listener.set_nonblocking(true).map_err(|e| ServerError::io("set listener non-blocking", e))?;
        let local_addr = listener.local_addr().map_err(|e| ServerError::io("read local address", e))?;

        let epoller = Epoller::new().map_err(|e| ServerError::io("create epoll", e))?;
        epoller
            .add(listener.as_raw_fd(), listen_event | Interest::READABLE)
            .map_err(|e| ServerError::io("register listener", e))?;
        let waker = Waker::new().map_err(|e| ServerError::io("create waker", e))?;
        epoller.add(waker.as_raw_fd(), Interest::READABLE).map_err(|e| ServerError::io("register waker", e))?;

        let pool = ThreadPool::new(config.thread_num)?;
        let ctx = Arc::new(ConnContext::new(config.source_dir.clone(), conn_event.is_edge_triggered(), Some(users)));

        info!("========== Server init ==========");
        info!(port = local_addr.port(), linger = config.linger, "listening");
        info!(
            listen_mode = if listen_event.is_edge_triggered() { "ET" } else { "LT" },
            conn_mode = if conn_event.is_edge_triggered() { "ET" } else { "LT" },
            "trigger mode"
        );
        info!(level = config.log.level, "log level (0: debug, 1: info, 2: warn, 3: error)");
        info!(source_dir = %config.source_dir.display(), "source directory");
        info!(sql_pool_size = config.sql_pool_size, thread_num = config.thread_num, "pools");

        Ok(Self {
            config,
            listener,
            local_addr,
            listen_event,
            conn_event,
            epoller: Arc::new(epoller),
            events: Events::default(),
            waker: Arc::new(waker),
            closed: Arc::new(AtomicBool::new(false)),
            timer: HeapTimer::new(),
            pool,
            ctx,
            conns: HashMap::new(),
        })
    }

    /// Address the listener is bound to, with the actual port when `0` was requested.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The validated configuration the server runs with.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Number of client connections currently open.
    pub fn user_count(&self) -> usize {
        self.ctx.user_count()
    }

    /// Handle that stops [`WebServer::start`] from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle { closed: Arc::clone(&self.closed), waker: Arc::clone(&self.waker) }
    }

    /// Runs the event loop until a [`ShutdownHandle`] fires, then closes every connection.
    pub fn start(&mut self) -> Result<(), ServerError> {
        info!("========== Server start ==========");
        let listen_fd = self.listener.as_raw_fd();
        let waker_fd = self.waker.as_raw_fd();

        while !self.closed.load(Ordering::Acquire) {
            let timeout = if self.config.timeout.is_zero() { None } else { self.timer.next_tick() };
            let count = self.epoller.wait(&mut self.events, timeout).map_err(|e| ServerError::io("wait for events", e))?;

            for i in 0..count {
                let (fd, flags) = (self.events.fd(i), self.events.flags(i));
                if fd == listen_fd {
                    self.deal_listen();
                } else if fd == waker_fd {
                    if let Err(e) = self.waker.reset() {
                        warn!(cause = %e, "failed to reset waker");
                    }
                } else if flags.is_closed() {
                    self.close_conn(fd);
                } else if flags.is_readable() {
                    self.deal_read(fd);
                } else if flags.is_writable() {
                    self.deal_write(fd);
                } else {
                    error!(fd, ?flags, "unexpected event");
                }
            }
        }

        self.close_all();
        info!("========== Server stop ==========");
        Ok(())
    }

    fn deal_listen(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    if self.ctx.user_count() >= self.config.max_connections {
                        send_error(stream, "Server busy!");
                        warn!(max_connections = self.config.max_connections, "clients are full");
                        return;
                    }
                    self.add_client(stream, addr);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(cause = %e, "failed to accept");
                    return;
                }
            }

            if !self.listen_event.is_edge_triggered() {
                return;
            }
        }
    }

    fn add_client(&mut self, stream: TcpStream, addr: SocketAddr) {
        let fd = stream.as_raw_fd();
        if let Err(e) = stream.set_nonblocking(true) {
            warn!(fd, cause = %e, "failed to set client non-blocking");
            return;
        }

        let slot = self.conns.entry(fd).or_insert_with(|| ConnSlot {
            conn: Arc::new(Mutex::new(HttpConn::new(Arc::clone(&self.ctx)))),
            generation: 0,
        });
        slot.generation = {
            let mut conn = lock(&slot.conn);
            conn.init(stream, addr);
            conn.generation()
        };
        let (conn, generation) = (Arc::clone(&slot.conn), slot.generation);

        if !self.config.timeout.is_zero() {
            let callback = self.close_callback(generation, &conn);
            self.timer.add(fd, self.config.timeout, callback);
        }
        if let Err(e) = self.epoller.add(fd, self.conn_event | Interest::READABLE) {
            error!(fd, cause = %e, "failed to register client");
            lock(&conn).close();
            self.timer.remove(fd);
        }
    }

    /// Timer continuation closing the socket of `generation`; holds the connection only weakly.
    fn close_callback(&self, generation: u64, conn: &SharedConn) -> TimeoutCallback {
        let epoller = Arc::clone(&self.epoller);
        let conn = Arc::downgrade(conn);
        Box::new(move || {
            let Some(conn) = conn.upgrade() else {
                return;
            };
            if let Some(mut conn) = lock_current(&conn, generation) {
                debug!(fd = conn.fd(), "idle timeout");
                close_conn(&epoller, &mut conn);
            }
        })
    }

    fn close_conn(&mut self, fd: RawFd) {
        if let Some(slot) = self.conns.get(&fd) {
            close_conn(&self.epoller, &mut lock(&slot.conn));
        }
        self.timer.remove(fd);
    }

    fn extend_time(&mut self, fd: RawFd) {
        if !self.config.timeout.is_zero() {
            self.timer.adjust(fd, self.config.timeout);
        }
    }

    fn deal_read(&mut self, fd: RawFd) {
        let Some((conn, generation)) = self.task_target(fd) else {
            warn!(fd, "read event for unknown connection");
            return;
        };
        self.extend_time(fd);

        let epoller = Arc::clone(&self.epoller);
        let conn_event = self.conn_event;
        if let Err(e) = self.pool.execute(move || on_read(&epoller, conn_event, &conn, generation)) {
            error!(fd, cause = %e, "failed to schedule read");
        }
    }

    fn deal_write(&mut self, fd: RawFd) {
        let Some((conn, generation)) = self.task_target(fd) else {
            warn!(fd, "write event for unknown connection");
            return;
        };
        self.extend_time(fd);

        let epoller = Arc::clone(&self.epoller);
        let conn_event = self.conn_event;
        if let Err(e) = self.pool.execute(move || on_write(&epoller, conn_event, &conn, generation)) {
            error!(fd, cause = %e, "failed to schedule write");
        }
    }

    fn task_target(&self, fd: RawFd) -> Option<(SharedConn, u64)> {
        self.conns.get(&fd).map(|slot| (Arc::clone(&slot.conn), slot.generation))
    }

    fn close_all(&mut self) {
        for slot in mem::take(&mut self.conns).into_values() {
            close_conn(&self.epoller, &mut lock(&slot.conn));
        }
        self.timer.clear();
    }
}

impl std::fmt::Debug for WebServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebServer")
            .field("local_addr", &self.local_addr)
            .field("listen_event", &self.listen_event)
            .field("conn_event", &self.conn_event)
            .field("connections", &self.conns.len())
            .finish_non_exhaustive()
    }
}

/// Stops a running [`WebServer`] from any thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    closed: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Asks the event loop to stop; it closes every connection before [`WebServer::start`] returns.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            error!(cause = %e, "failed to wake server");
        }
    }
}

fn set_linger(listener: &TcpListener) -> io::Result<()> {
    let linger = libc::linger { l_onoff: 1, l_linger: 1 };
    let len = libc::socklen_t::try_from(mem::size_of::<libc::linger>()).unwrap_or(libc::socklen_t::MAX);
    syscall!(setsockopt(
        listener.as_raw_fd(),
        libc::SOL_SOCKET,
        libc::SO_LINGER,
        (&raw const linger).cast::<libc::c_void>(),
        len
    ))?;
    Ok(())
}

fn send_error(mut stream: TcpStream, message: &str) {
    if let Err(e) = stream.write_all(message.as_bytes()) {
        warn!(fd = stream.as_raw_fd(), cause = %e, "failed to send error to client");
    }
}

fn close_conn(epoller: &Epoller, conn: &mut HttpConn) {
    if conn.is_closed() {
        return;
    }
    if let Err(e) = epoller.delete(conn.fd()) {
        trace!(fd = conn.fd(), cause = %e, "descriptor already removed");
    }
    conn.close();
}

/// Locks `conn` if it still holds the open socket of `generation`.
///
/// A task can outlive its socket: the timer closes it, the kernel hands the descriptor
/// to the next accepted client and `init` starts a new generation in the same slot.
fn lock_current(conn: &Mutex<HttpConn>, generation: u64) -> Option<MutexGuard<'_, HttpConn>> {
    let conn = lock(conn);
    if conn.is_closed() || conn.generation() != generation {
        trace!(fd = conn.fd(), generation, current = conn.generation(), "stale connection task");
        return None;
    }
    Some(conn)
}

fn on_read(epoller: &Epoller, conn_event: Interest, conn: &Mutex<HttpConn>, generation: u64) {
    let Some(mut conn) = lock_current(conn, generation) else {
        return;
    };
    match conn.read() {
        Ok(0) => {
            debug!(fd = conn.fd(), "peer closed");
            close_conn(epoller, &mut conn);
        }
        Ok(_) => on_process(epoller, conn_event, &mut conn),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => on_process(epoller, conn_event, &mut conn),
        Err(e) => {
            debug!(fd = conn.fd(), cause = %e, "read failed");
            close_conn(epoller, &mut conn);
        }
    }
}

fn on_process(epoller: &Epoller, conn_event: Interest, conn: &mut HttpConn) {
    let interest = if conn.process() { Interest::WRITABLE } else { Interest::READABLE };
    if let Err(e) = epoller.modify(conn.fd(), conn_event | interest) {
        error!(fd = conn.fd(), cause = %e, "failed to re-arm connection");
        close_conn(epoller, conn);
    }
}

fn on_write(epoller: &Epoller, conn_event: Interest, conn: &Mutex<HttpConn>, generation: u64) {
    let Some(mut conn) = lock_current(conn, generation) else {
        return;
    };
    let result = conn.write();

    if conn.to_write_bytes() == 0 {
        if conn.keep_alive() {
            on_process(epoller, conn_event, &mut conn);
            return;
        }
    } else {
        match result {
            Ok(_) => {
                rearm_write(epoller, conn_event, &mut conn);
                return;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                trace!(fd = conn.fd(), to_write = conn.to_write_bytes(), "write would block");
                rearm_write(epoller, conn_event, &mut conn);
                return;
            }
            Err(e) => debug!(fd = conn.fd(), cause = %e, "write failed"),
        }
    }
    close_conn(epoller, &mut conn);
}

fn rearm_write(epoller: &Epoller, conn_event: Interest, conn: &mut HttpConn) {
    if let Err(e) = epoller.modify(conn.fd(), conn_event | Interest::WRITABLE) {
        error!(fd = conn.fd(), cause = %e, "failed to re-arm connection");
        close_conn(epoller, conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::MemoryUserDb;
    use std::thread;
    use std::time::Duration;

    fn config() -> ServerConfig {
        ServerConfig { port: 0, thread_num: 2, sql_pool_size: 1, ..ServerConfig::default() }
    }

    #[test]
    fn bind_reports_ephemeral_port() {
        let users = Arc::new(MemoryUserDb::new().pool(1).unwrap());
        let server = WebServer::bind(config(), users).unwrap();
        assert_ne!(server.local_addr().port(), 0);
        assert_eq!(server.user_count(), 0);
    }

    #[test]
    fn bind_rejects_privileged_port() {
        let users = Arc::new(MemoryUserDb::new().pool(1).unwrap());
        let err = WebServer::bind(ServerConfig { port: 80, ..config() }, users).unwrap_err();
        assert!(matches!(err, ServerError::InvalidConfig { .. }));
    }

    #[test]
    fn linger_is_set_on_listener() {
        let server = WebServer::builder().config(config()).linger(true).build().unwrap();
        let mut linger = libc::linger { l_onoff: 0, l_linger: 0 };
        let mut len = libc::socklen_t::try_from(mem::size_of::<libc::linger>()).unwrap();
        syscall!(getsockopt(
            server.listener.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            (&raw mut linger).cast::<libc::c_void>(),
            &raw mut len
        ))
        .unwrap();
        assert_eq!((linger.l_onoff, linger.l_linger), (1, 1));
    }

    #[test]
    fn task_of_previous_socket_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(ConnContext::new(dir.path(), true, None));
        let conn = Mutex::new(HttpConn::new(ctx));
        let epoller = Epoller::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let accept = || {
            let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
            let (stream, addr) = listener.accept().unwrap();
            stream.set_nonblocking(true).unwrap();
            (client, stream, addr)
        };

        let (_old_client, stream, addr) = accept();
        lock(&conn).init(stream, addr);
        let stale = lock(&conn).generation();

        let (mut client, stream, addr) = accept();
        epoller.add(stream.as_raw_fd(), Interest::ONESHOT | Interest::READABLE).unwrap();
        lock(&conn).init(stream, addr);
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();

        on_read(&epoller, Interest::ONESHOT, &conn, stale);
        assert!(!lock(&conn).is_closed());
        assert_eq!(lock(&conn).to_write_bytes(), 0);

        let current = lock(&conn).generation();
        on_read(&epoller, Interest::ONESHOT, &conn, current);
        assert!(lock(&conn).to_write_bytes() > 0);

        on_write(&epoller, Interest::ONESHOT, &conn, stale);
        assert!(lock(&conn).to_write_bytes() > 0);
    }

    #[test]
    fn shutdown_stops_event_loop() {
        let mut server = WebServer::builder().config(config()).build().unwrap();
        let handle = server.shutdown_handle();

        let runner = thread::spawn(move || server.start());
        thread::sleep(Duration::from_millis(50));
        handle.shutdown();
        runner.join().unwrap().unwrap();
    }
}
