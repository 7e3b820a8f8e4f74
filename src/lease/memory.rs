//! In-process lock service with Consul session semantics
//!
//! Used for single-process clusters and tests. Time is read from
//! `tokio::time`, so lease expiry can be driven with a paused clock.

use super::lock_service::{KvEntry, LockService};
use crate::common::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug)]
struct Session {
    ttl: Duration,
    lock_delay: Duration,
    renewed_at: Instant,
}

#[derive(Debug, Default)]
struct Key {
    value: Vec<u8>,
    session: Option<String>,
    lock_index: u64,
    /// Set when the holding session is invalidated
    locked_until: Option<Instant>,
}

#[derive(Debug, Default)]
struct State {
    sessions: HashMap<String, Session>,
    keys: HashMap<String, Key>,
    next_session: u64,
}

impl State {
    /// Drop sessions whose TTL ran out, as of `now`
    fn reap(&mut self, now: Instant) {
        let expired: Vec<(String, Instant)> = self
            .sessions
            .iter()
            .filter(|(_, s)| now >= s.renewed_at + s.ttl)
            .map(|(id, s)| (id.clone(), s.renewed_at + s.ttl))
            .collect();
        for (id, expired_at) in expired {
            tracing::debug!(session = %id, "session expired");
            self.invalidate(&id, expired_at);
        }
    }

    fn invalidate(&mut self, id: &str, at: Instant) {
        let Some(session) = self.sessions.remove(id) else {
            return;
        };
        for key in self.keys.values_mut() {
            if key.session.as_deref() == Some(id) {
                key.session = None;
                key.locked_until = Some(at + session.lock_delay);
            }
        }
    }
}

/// Lock service living in this process
#[derive(Debug)]
pub struct MemoryLockService {
    state: Mutex<State>,
    available: AtomicBool,
    stalled: AtomicBool,
    resumed: Notify,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: AtomicBool::new(true),
            stalled: AtomicBool::new(false),
            resumed: Notify::new(),
        }
    }

    /// Simulate the service becoming unreachable (or reachable again)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Simulate a service that accepts requests but does not answer them
    /// until unstalled
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
        if !stalled {
            self.resumed.notify_waiters();
        }
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        let mut state = self.lock();
        state.reap(Instant::now());
        state.sessions.len()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn check_available(&self) -> Result<()> {
        loop {
            let resumed = self.resumed.notified();
            if !self.stalled.load(Ordering::SeqCst) {
                break;
            }
            resumed.await;
        }
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Connection("memory lock service unavailable".into()))
        }
    }
}

impl Default for MemoryLockService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn ping(&self) -> Result<()> {
        self.check_available().await
    }

    async fn create_session(&self, name: &str, ttl: Duration, lock_delay: Duration) -> Result<String> {
        self.check_available().await?;
        let mut state = self.lock();
        state.next_session += 1;
        let id = format!("{}-{}", name, state.next_session);
        state.sessions.insert(
            id.clone(),
            Session {
                ttl,
                lock_delay,
                renewed_at: Instant::now(),
            },
        );
        Ok(id)
    }

    async fn renew_session(&self, session: &str) -> Result<()> {
        self.check_available().await?;
        let now = Instant::now();
        let mut state = self.lock();
        state.reap(now);
        match state.sessions.get_mut(session) {
            Some(s) => {
                s.renewed_at = now;
                Ok(())
            }
            None => Err(Error::LeaseExpired(format!("session {} not found", session))),
        }
    }

    async fn destroy_session(&self, session: &str) -> Result<()> {
        self.check_available().await?;
        let now = Instant::now();
        let mut state = self.lock();
        state.reap(now);
        state.invalidate(session, now);
        Ok(())
    }

    async fn acquire(&self, key: &str, session: &str, value: &[u8]) -> Result<bool> {
        self.check_available().await?;
        let now = Instant::now();
        let mut state = self.lock();
        state.reap(now);
        if !state.sessions.contains_key(session) {
            return Err(Error::LeaseExpired(format!("session {} not found", session)));
        }

        let entry = state.keys.entry(key.to_string()).or_default();
        match entry.session.as_deref() {
            Some(holder) if holder == session => {
                entry.value = value.to_vec();
                Ok(true)
            }
            Some(_) => Ok(false),
            None if entry.locked_until.is_some_and(|until| now < until) => Ok(false),
            None => {
                entry.session = Some(session.to_string());
                entry.value = value.to_vec();
                entry.lock_index += 1;
                entry.locked_until = None;
                Ok(true)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<KvEntry>> {
        self.check_available().await?;
        let mut state = self.lock();
        state.reap(Instant::now());
        Ok(state.keys.get(key).map(|k| KvEntry {
            value: k.value.clone(),
            session: k.session.clone(),
            lock_index: k.lock_index,
        }))
    }
}
