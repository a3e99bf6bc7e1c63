//! Server configuration and the epoll event loop.
//!
//! ```no_run
//! use micro_httpd::server::WebServer;
//!
//! let mut server = WebServer::builder().port(1316).trigger_mode(3).thread_num(6).build()?;
//! server.start()?;
//! # Ok::<(), micro_httpd::server::ServerError>(())
//! ```

mod config;
mod web_server;

pub use config::MAX_FD;
pub use config::ServerBuilder;
pub use config::ServerConfig;
pub use config::TriggerMode;
pub use web_server::ShutdownHandle;
pub use web_server::WebServer;

use std::io;
use thiserror::Error;

use crate::pool::PoolError;

/// Failures while building or running a [`WebServer`].
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("invalid server config: {reason}")]
    InvalidConfig { reason: String },

    #[error("failed to bind port {port}: {source}")]
    Bind { port: u16, source: io::Error },

    #[error("failed to {stage}: {source}")]
    Io { stage: &'static str, source: io::Error },

    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl ServerError {
    pub fn invalid_config<S: ToString>(str: S) -> Self {
        Self::InvalidConfig { reason: str.to_string() }
    }

    pub fn bind(port: u16, source: io::Error) -> Self {
        Self::Bind { port, source }
    }

    pub fn io(stage: &'static str, source: io::Error) -> Self {
        Self::Io { stage, source }
    }
}
