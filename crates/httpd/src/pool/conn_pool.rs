use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, PoisonError};

use tracing::warn;

use super::PoolError;
use crate::utils::{ensure, lock};

/// Fixed set of reusable handles, typically database connections.
///
/// The free list doubles as a counting semaphore: its length is the number of
/// handles that can be taken without waiting. A taken handle is wrapped in a
/// [`PooledConn`] and goes back to the free list when the guard drops.
pub struct ConnPool<C> {
    free: Mutex<VecDeque<C>>,
    released: Condvar,
    size: usize,
}

impl<C> ConnPool<C> {
    /// Takes ownership of `handles`; at least one is required.
    pub fn new<I>(handles: I) -> Result<Self, PoolError>
    where
        I: IntoIterator<Item = C>,
    {
        let free: VecDeque<C> = handles.into_iter().collect();
        ensure!(!free.is_empty(), PoolError::invalid_size("connection pool needs at least one handle"));
        let size = free.len();
        Ok(Self { free: Mutex::new(free), released: Condvar::new(), size })
    }

    /// Builds a pool of `size` handles made by `make`.
    pub fn with_size<F>(size: usize, make: F) -> Result<Self, PoolError>
    where
        F: FnMut() -> C,
    {
        Self::new(std::iter::repeat_with(make).take(size))
    }

    /// Total number of handles owned by the pool.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Handles that [`ConnPool::get`] can take right now.
    pub fn free_count(&self) -> usize {
        lock(&self.free).len()
    }

    /// Takes a free handle, failing with [`PoolError::Busy`] when none is left.
    pub fn get(&self) -> Result<PooledConn<'_, C>, PoolError> {
        let mut free = lock(&self.free);
        match free.pop_front() {
            Some(conn) => Ok(PooledConn { pool: self, conn: Some(conn) }),
            None => {
                warn!(size = self.size, "connection pool busy");
                Err(PoolError::Busy)
            }
        }
    }

    /// Takes a free handle, waiting for one to be released if necessary.
    pub fn acquire(&self) -> PooledConn<'_, C> {
        let mut free = lock(&self.free);
        loop {
            if let Some(conn) = free.pop_front() {
                return PooledConn { pool: self, conn: Some(conn) };
            }
            free = self.released.wait(free).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn release(&self, conn: C) {
        lock(&self.free).push_back(conn);
        self.released.notify_one();
    }
}

impl<C> fmt::Debug for ConnPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnPool").field("size", &self.size).field("free", &self.free_count()).finish()
    }
}

/// Handle borrowed from a [`ConnPool`], returned to it on drop.
pub struct PooledConn<'a, C> {
    pool: &'a ConnPool<C>,
    conn: Option<C>,
}

impl<C> Deref for PooledConn<'_, C> {
    type Target = C;

    fn deref(&self) -> &Self::Target {
        // only `drop` takes the handle out
        self.conn.as_ref().unwrap_or_else(|| unreachable!("pooled handle already released"))
    }
}

impl<C> DerefMut for PooledConn<'_, C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().unwrap_or_else(|| unreachable!("pooled handle already released"))
    }
}

impl<C> Drop for PooledConn<'_, C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

impl<C: fmt::Debug> fmt::Debug for PooledConn<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PooledConn").field(&self.conn).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn empty_pool_is_rejected() {
        assert!(ConnPool::<u32>::new(Vec::new()).is_err());
    }

    #[test]
    fn guard_returns_handle_on_drop() {
        let pool = ConnPool::new(vec![1, 2]).unwrap();
        assert_eq!(pool.size(), 2);
        {
            let a = pool.get().unwrap();
            let b = pool.get().unwrap();
            assert_eq!(*a + *b, 3);
            assert_eq!(pool.free_count(), 0);
            assert!(matches!(pool.get(), Err(PoolError::Busy)));
        }
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn handles_are_mutable_through_guard() {
        let pool = ConnPool::with_size(1, Vec::<u8>::new).unwrap();
        pool.get().unwrap().push(7);
        assert_eq!(*pool.get().unwrap(), vec![7]);
    }

    #[test]
    fn acquire_waits_for_release() {
        let pool = Arc::new(ConnPool::new(vec!["db"]).unwrap());
        let held = pool.get().unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                let conn = pool.acquire();
                *conn
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        drop(held);
        assert_eq!(waiter.join().unwrap(), "db");
        assert_eq!(pool.free_count(), 1);
    }
}
