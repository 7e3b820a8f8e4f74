//! Lease backends
//!
//! A [`Leaser`] arbitrates which node may act as primary. Two backends are
//! provided:
//! - [`StaticLeaser`]: leadership fixed by configuration
//! - [`DistributedLeaser`]: leadership arbitrated by a [`LockService`]
//!   (Consul, or the in-process [`MemoryLockService`]) using TTL'd sessions
//!   with a lock delay

pub mod consul;
pub mod distributed;
pub mod lock_service;
pub mod memory;
pub mod static_leaser;

pub use consul::ConsulClient;
pub use distributed::DistributedLeaser;
pub use lock_service::{KvEntry, LockService};
pub use memory::MemoryLockService;
pub use static_leaser::StaticLeaser;

use crate::common::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Default lease TTL for the distributed backend
pub const DEFAULT_TTL: Duration = Duration::from_secs(10);

/// Default cooldown after release/expiry before the lease can be re-acquired
pub const DEFAULT_LOCK_DELAY: Duration = Duration::from_secs(1);

/// Lease backend kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseType {
    Static,
    Consul,
}

impl std::str::FromStr for LeaseType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "static" => Ok(LeaseType::Static),
            "consul" | "distributed-lock" => Ok(LeaseType::Consul),
            _ => Err(Error::InvalidConfig(format!(
                "invalid lease type, must be either 'consul' or 'static', got: '{}'",
                s
            ))),
        }
    }
}

impl std::fmt::Display for LeaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaseType::Static => write!(f, "static"),
            LeaseType::Consul => write!(f, "consul"),
        }
    }
}

/// Where the current primary can be reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryInfo {
    pub hostname: String,
    /// Node API of the primary (handoff, registration)
    pub advertise_url: String,
    /// Where clients send writes, when the primary runs the proxy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
}

/// Value stored under the lock key by the holder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub hostname: String,
    pub advertise_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
    pub acquired_at: DateTime<Utc>,
    pub ttl_ms: u64,
    pub lock_delay_ms: u64,
}

impl LeaseRecord {
    pub fn primary_info(&self) -> PrimaryInfo {
        PrimaryInfo {
            hostname: self.hostname.clone(),
            advertise_url: self.advertise_url.clone(),
            proxy_url: self.proxy_url.clone(),
        }
    }
}

/// A held lease
#[derive(Debug, Clone)]
pub struct Lease {
    /// Backend session backing the lease
    pub id: String,
    /// Fencing number, increases with every successful acquisition of the key
    pub epoch: u64,
    /// `None` for leases that never expire
    pub ttl: Option<Duration>,
    pub acquired_at: DateTime<Utc>,
    /// When the last successful renewal (or the acquisition) was sent
    pub renewed_at: Instant,
}

impl Lease {
    /// How often the holder should renew
    pub fn renew_interval(&self) -> Option<Duration> {
        self.ttl.map(|ttl| ttl / 3)
    }

    /// When the next renewal is due
    pub fn renew_at(&self) -> Option<Instant> {
        self.renew_interval()
            .and_then(|d| self.renewed_at.checked_add(d))
    }

    /// When the lease lapses unless renewed first
    pub fn expires_at(&self) -> Option<Instant> {
        self.ttl.and_then(|ttl| self.renewed_at.checked_add(ttl))
    }

    /// Has the TTL run out since the last successful renewal?
    pub fn is_expired(&self) -> bool {
        matches!(self.expires_at(), Some(at) if Instant::now() >= at)
    }
}

/// Lease backend contract.
///
/// Acquisition failures caused by another holder are reported as
/// [`Error::AcquisitionConflict`]; an unreachable backend as
/// [`Error::Connection`]. Implementations never retry internally.
#[async_trait]
pub trait Leaser: Send + Sync {
    fn kind(&self) -> LeaseType;

    fn hostname(&self) -> &str;

    fn advertise_url(&self) -> &str;

    /// Proxy URL recorded with the lease
    fn proxy_url(&self) -> Option<&str>;

    /// Connect to the backend
    async fn open(&self) -> Result<()>;

    /// Release backend resources not tied to a lease
    async fn close(&self) -> Result<()>;

    async fn acquire(&self) -> Result<Lease>;

    async fn renew(&self, lease: &Lease) -> Result<Lease>;

    async fn release(&self, lease: &Lease) -> Result<()>;

    /// The current holder, if any
    async fn primary_info(&self) -> Result<Option<PrimaryInfo>>;
}
