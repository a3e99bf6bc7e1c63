//! User accounts behind the `/login` and `/register` forms.
//!
//! The server never talks to a concrete database. It checks handles implementing
//! [`UserDb`] out of a [`UserPool`] and runs [`verify_user`] against them. The
//! bundled [`MemoryUserDb`] keeps accounts in a shared in-process table.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, error, info};

use crate::pool::ConnPool;
use crate::utils::lock;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("user {name:?} already exists")]
    DuplicateUser { name: String },

    #[error("user database failure: {reason}")]
    Backend { reason: String },
}

impl DbError {
    pub fn duplicate_user<S: ToString>(name: S) -> Self {
        Self::DuplicateUser { name: name.to_string() }
    }

    pub fn backend<S: ToString>(str: S) -> Self {
        Self::Backend { reason: str.to_string() }
    }
}

/// One handle onto the user store, the unit a [`UserPool`] hands out.
pub trait UserDb {
    /// Stored password of `name`, `None` when the user does not exist.
    fn find_password(&mut self, name: &str) -> Result<Option<String>, DbError>;

    /// Fails with [`DbError::DuplicateUser`] when `name` is taken.
    fn insert_user(&mut self, name: &str, password: &str) -> Result<(), DbError>;
}

/// A boxed [`UserDb`] that can move between worker threads.
pub type UserDbHandle = Box<dyn UserDb + Send>;

/// Pool of user database handles shared by all worker threads.
pub type UserPool = ConnPool<UserDbHandle>;

/// In-memory user table. Clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct MemoryUserDb {
    users: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryUserDb {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// A table holding the given `(name, password)` pairs.
    pub fn with_users<I, K, V>(users: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let users = users.into_iter().map(|(name, password)| (name.into(), password.into())).collect();
        Self { users: Arc::new(Mutex::new(users)) }
    }

    /// Number of stored accounts.
    pub fn len(&self) -> usize {
        lock(&self.users).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Builds a pool of `size` handles onto this table.
    pub fn pool(&self, size: usize) -> Result<UserPool, crate::pool::PoolError> {
        ConnPool::with_size(size, || Box::new(self.clone()) as UserDbHandle)
    }
}

impl UserDb for MemoryUserDb {
    fn find_password(&mut self, name: &str) -> Result<Option<String>, DbError> {
        Ok(lock(&self.users).get(name).cloned())
    }

    fn insert_user(&mut self, name: &str, password: &str) -> Result<(), DbError> {
        let mut users = lock(&self.users);
        if users.contains_key(name) {
            return Err(DbError::duplicate_user(name));
        }
        users.insert(name.to_owned(), password.to_owned());
        Ok(())
    }
}

/// Checks a login, or performs a registration when `is_login` is false.
///
/// Login succeeds when the stored password matches. Registration succeeds only for
/// an unused name, which is then inserted. Empty names or passwords always fail.
pub fn verify_user(pool: &UserPool, name: &str, password: &str, is_login: bool) -> bool {
    if name.is_empty() || password.is_empty() {
        return false;
    }
    info!(user = name, is_login, "verify user");

    let mut db = pool.acquire();
    match db.find_password(name) {
        Ok(Some(stored)) if is_login => stored == password,
        Ok(Some(_)) => {
            debug!(user = name, "user name already used");
            false
        }
        Ok(None) if is_login => false,
        Ok(None) => match db.insert_user(name, password) {
            Ok(()) => true,
            Err(e) => {
                error!(user = name, cause = %e, "failed to insert user");
                false
            }
        },
        Err(e) => {
            error!(user = name, cause = %e, "failed to query user");
            false
        }
    }
}
