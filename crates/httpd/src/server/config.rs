use std::env;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::{ServerError, WebServer};
use crate::log::LogConfig;
use crate::pool::ConnPool;
use crate::reactor::Interest;
use crate::user::{MemoryUserDb, UserDb, UserDbHandle};
use crate::utils::ensure;

/// Most connections served at once
pub const MAX_FD: usize = 65536;

/// Which sockets are registered edge-triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerMode {
    /// listen LT, connections LT
    Level,
    /// listen LT, connections ET
    ConnEdge,
    /// listen ET, connections LT
    ListenEdge,
    /// listen ET, connections ET
    #[default]
    Edge,
}

impl TriggerMode {
    /// Interest flags of the listening socket, without the readable bit.
    pub fn listen_event(self) -> Interest {
        match self {
            Self::ListenEdge | Self::Edge => Interest::PEER_CLOSED | Interest::EDGE,
            Self::Level | Self::ConnEdge => Interest::PEER_CLOSED,
        }
    }

    /// Interest flags of client sockets, without the readable or writable bit.
    pub fn conn_event(self) -> Interest {
        match self {
            Self::ConnEdge | Self::Edge => Interest::ONESHOT | Interest::PEER_CLOSED | Interest::EDGE,
            Self::Level | Self::ListenEdge => Interest::ONESHOT | Interest::PEER_CLOSED,
        }
    }
}

/// `0..=2` pick a mode, anything else means both edge-triggered.
impl From<u8> for TriggerMode {
    fn from(mode: u8) -> Self {
        match mode {
            0 => Self::Level,
            1 => Self::ConnEdge,
            2 => Self::ListenEdge,
            _ => Self::Edge,
        }
    }
}

/// Everything a [`WebServer`](super::WebServer) is started with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// 0 binds an ephemeral port
    pub port: u16,
    pub trigger_mode: TriggerMode,
    /// Idle time after which a connection is closed, zero keeps idle connections open
    pub timeout: Duration,
    /// `SO_LINGER` of one second on close
    pub linger: bool,
    pub source_dir: PathBuf,
    pub sql_pool_size: usize,
    pub thread_num: usize,
    pub max_connections: usize,
    pub log: LogConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 1316,
            trigger_mode: TriggerMode::Edge,
            timeout: Duration::from_millis(60_000),
            linger: false,
            source_dir: env::current_dir().unwrap_or_default().join("resources"),
            sql_pool_size: 12,
            thread_num: 6,
            max_connections: MAX_FD,
            log: LogConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Rejects privileged ports, empty pools and unknown log levels.
    pub fn validate(&self) -> Result<(), ServerError> {
        ensure!(
            self.port == 0 || self.port >= 1024,
            ServerError::invalid_config(format!("port {} is out of 1024..=65535", self.port))
        );
        ensure!(self.thread_num > 0, ServerError::invalid_config("thread_num must be greater than 0"));
        ensure!(self.sql_pool_size > 0, ServerError::invalid_config("sql_pool_size must be greater than 0"));
        ensure!(self.max_connections > 0, ServerError::invalid_config("max_connections must be greater than 0"));
        ensure!(self.log.level <= 3, ServerError::invalid_config(format!("log level {} is out of 0..=3", self.log.level)));
        Ok(())
    }
}

type UserDbFactory = Box<dyn FnMut() -> UserDbHandle + Send>;

/// Step-by-step [`ServerConfig`] setup, finished by [`ServerBuilder::build`].
pub struct ServerBuilder {
    config: ServerConfig,
    user_db: Option<UserDbFactory>,
}

impl ServerBuilder {
    pub(crate) fn new() -> Self {
        Self { config: ServerConfig::default(), user_db: None }
    }

    /// Replaces the whole configuration; later setters still apply on top.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Accepts a [`TriggerMode`] or its numeric command-line form.
    pub fn trigger_mode(mut self, trigger_mode: impl Into<TriggerMode>) -> Self {
        self.config.trigger_mode = trigger_mode.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn linger(mut self, linger: bool) -> Self {
        self.config.linger = linger;
        self
    }

    pub fn source_dir(mut self, source_dir: impl Into<PathBuf>) -> Self {
        self.config.source_dir = source_dir.into();
        self
    }

    pub fn sql_pool_size(mut self, sql_pool_size: usize) -> Self {
        self.config.sql_pool_size = sql_pool_size;
        self
    }

    pub fn thread_num(mut self, thread_num: usize) -> Self {
        self.config.thread_num = thread_num;
        self
    }

    pub fn max_connections(mut self, max_connections: usize) -> Self {
        self.config.max_connections = max_connections;
        self
    }

    pub fn log(mut self, log: LogConfig) -> Self {
        self.config.log = log;
        self
    }

    /// User store behind the login and register forms, cloned once per pooled handle.
    ///
    /// Defaults to an empty [`MemoryUserDb`].
    pub fn user_db<D>(mut self, db: D) -> Self
    where
        D: UserDb + Clone + Send + 'static,
    {
        self.user_db = Some(Box::new(move || -> UserDbHandle { Box::new(db.clone()) }));
        self
    }

    /// Validates the configuration, then binds the server.
    pub fn build(self) -> Result<WebServer, ServerError> {
        let ServerBuilder { config, user_db } = self;
        config.validate()?;

        let make = user_db.unwrap_or_else(|| {
            let db = MemoryUserDb::new();
            Box::new(move || -> UserDbHandle { Box::new(db.clone()) }) as UserDbFactory
        });
        let users = ConnPool::with_size(config.sql_pool_size, make)?;
        WebServer::bind(config, Arc::new(users))
    }
}

impl fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("config", &self.config)
            .field("user_db", &self.user_db.as_ref().map(|_| "custom"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_mode_events() {
        assert_eq!(TriggerMode::from(0), TriggerMode::Level);
        assert_eq!(TriggerMode::from(7), TriggerMode::Edge);

        assert!(!TriggerMode::Level.listen_event().is_edge_triggered());
        assert!(!TriggerMode::Level.conn_event().is_edge_triggered());
        assert!(TriggerMode::ConnEdge.conn_event().is_edge_triggered());
        assert!(!TriggerMode::ConnEdge.listen_event().is_edge_triggered());
        assert!(TriggerMode::ListenEdge.listen_event().is_edge_triggered());
        assert!(TriggerMode::Edge.conn_event().contains(Interest::ONESHOT | Interest::PEER_CLOSED | Interest::EDGE));
    }

    #[test]
    fn defaults_match_command_line_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 1316);
        assert_eq!(config.trigger_mode, TriggerMode::Edge);
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.max_connections, MAX_FD);
        assert!(config.source_dir.ends_with("resources"));
        config.validate().unwrap();
    }

    #[test]
    fn validation_rejects_bad_values() {
        let reject = |config: ServerConfig| matches!(config.validate(), Err(ServerError::InvalidConfig { .. }));

        assert!(reject(ServerConfig { port: 80, ..ServerConfig::default() }));
        assert!(reject(ServerConfig { thread_num: 0, ..ServerConfig::default() }));
        assert!(reject(ServerConfig { sql_pool_size: 0, ..ServerConfig::default() }));
        assert!(reject(ServerConfig { log: LogConfig { level: 9, ..LogConfig::default() }, ..ServerConfig::default() }));
        assert!(!reject(ServerConfig { port: 0, ..ServerConfig::default() }));
    }
}
