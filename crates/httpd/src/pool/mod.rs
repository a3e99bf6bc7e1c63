//! Worker threads and reusable handle pools.
//!
//! - [`ThreadPool`]: runs connection read/write tasks off the reactor thread
//! - [`ConnPool`]: hands out a fixed set of user-database handles
//!
//! Both are plain `std::sync` structures: a mutex-guarded queue paired with a
//! condition variable.

mod conn_pool;
mod thread_pool;

pub use conn_pool::ConnPool;
pub use conn_pool::PooledConn;
pub use thread_pool::ThreadPool;

use std::io;
use thiserror::Error;

/// Failures of [`ThreadPool`] and [`ConnPool`].
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("pool is closed")]
    Closed,

    #[error("no free handle in pool")]
    Busy,

    #[error("invalid pool size: {reason}")]
    InvalidSize { reason: String },

    #[error("failed to spawn worker thread: {source}")]
    Spawn { source: io::Error },
}

impl PoolError {
    pub fn invalid_size<S: ToString>(str: S) -> Self {
        Self::InvalidSize { reason: str.to_string() }
    }

    pub fn spawn<E: Into<io::Error>>(e: E) -> Self {
        Self::Spawn { source: e.into() }
    }
}
