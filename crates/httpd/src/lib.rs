//! A micro static HTTP server driven by an epoll reactor
//!
//! This crate serves files from a resource directory over HTTP/1.1 and handles the
//! login and register forms against a pluggable user store. One reactor thread waits
//! on epoll, accepts clients and keeps their idle timers; a fixed pool of worker
//! threads does the socket reads, the request parsing and the response writes.
//!
//! # Features
//!
//! - Level- or edge-triggered epoll, chosen separately for the listener and clients
//! - Keep-alive connections with an idle timeout
//! - Files are memory-mapped and sent with vectored writes
//! - `application/x-www-form-urlencoded` login and register forms
//! - Leveled, date-rotated log files, optionally written off-thread
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use micro_httpd::log::{self, LogConfig};
//! use micro_httpd::server::WebServer;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let _guard = log::init(&LogConfig::default())?;
//!
//!     let mut server = WebServer::builder()
//!         .port(1316)
//!         .trigger_mode(3)
//!         .timeout(Duration::from_secs(60))
//!         .source_dir("./resources")
//!         .build()?;
//!     server.start()?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - [`server`]: configuration and the event loop
//! - [`connection`]: per-socket read, process and write
//! - [`protocol`]: request parsing and response building
//! - [`buffer`]: the growable byte buffer both directions go through
//! - [`reactor`]: thin `epoll` and `eventfd` wrappers
//! - [`timer`]: min-heap of idle deadlines
//! - [`pool`]: worker threads and the user-store handle pool
//! - [`user`]: the user store behind the forms
//! - [`log`]: the file-backed `tracing` subscriber
//!
//! # Limitations
//!
//! - Linux only, the reactor is built on `epoll`
//! - No TLS, no HTTP/2, no chunked request bodies
//! - Every request method is answered with the file its path names; only `POST`
//!   bodies are decoded as forms
//!
//! # Safety
//!
//! Unsafe code is limited to the `libc` calls of the reactor and to memory-mapping the
//! served files.

pub mod buffer;
pub mod connection;
pub mod log;
pub mod pool;
pub mod protocol;
pub mod reactor;
pub mod server;
pub mod timer;
pub mod user;

mod utils;
