//! External lock-service abstraction used by the distributed backend
//!
//! The model follows Consul's session + KV locking: a session carries a TTL
//! and a lock delay, a key is locked by at most one live session, and when a
//! session holding a key is invalidated (destroyed or expired) nobody can
//! lock that key again until the lock delay has passed.

use crate::common::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Contents of a key as seen by `get`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub value: Vec<u8>,
    /// Session currently holding the key
    pub session: Option<String>,
    /// Number of times the key has been locked
    pub lock_index: u64,
}

#[async_trait]
pub trait LockService: Send + Sync {
    /// Check the service is reachable
    async fn ping(&self) -> Result<()>;

    async fn create_session(&self, name: &str, ttl: Duration, lock_delay: Duration) -> Result<String>;

    /// Reset the session TTL. `LeaseExpired` if the session no longer exists.
    async fn renew_session(&self, session: &str) -> Result<()>;

    /// Invalidate the session, unlocking any key it holds
    async fn destroy_session(&self, session: &str) -> Result<()>;

    /// Lock `key` for `session` and store `value`. Returns false when another
    /// session holds the key or the key is inside its lock delay.
    async fn acquire(&self, key: &str, session: &str, value: &[u8]) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<KvEntry>>;
}
