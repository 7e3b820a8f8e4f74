//! Distributed-lock lease backend

use super::lock_service::LockService;
use super::{Lease, LeaseRecord, LeaseType, Leaser, PrimaryInfo, DEFAULT_LOCK_DELAY, DEFAULT_TTL};
use crate::common::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Leaser backed by a session-based lock service.
///
/// Each acquisition creates a fresh session carrying `ttl` and `lock_delay`
/// and locks `key` with it. Releasing destroys the session, which frees the
/// key and starts the lock-delay window.
pub struct DistributedLeaser {
    service: Arc<dyn LockService>,
    key: String,
    hostname: String,
    advertise_url: String,
    proxy_url: Option<String>,

    /// Lease lifetime without renewal
    pub ttl: Duration,
    /// Cooldown after release/expiry before the key can be locked again
    pub lock_delay: Duration,
}

impl DistributedLeaser {
    pub fn new(
        service: Arc<dyn LockService>,
        key: impl Into<String>,
        hostname: impl Into<String>,
        advertise_url: impl Into<String>,
    ) -> Self {
        Self {
            service,
            key: key.into(),
            hostname: hostname.into(),
            advertise_url: advertise_url.into(),
            proxy_url: None,
            ttl: DEFAULT_TTL,
            lock_delay: DEFAULT_LOCK_DELAY,
        }
    }

    /// Record `url` with the lease so followers can redirect writes to it
    pub fn with_proxy_url(mut self, url: impl Into<String>) -> Self {
        self.proxy_url = Some(url.into());
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn record(&self) -> LeaseRecord {
        LeaseRecord {
            hostname: self.hostname.clone(),
            advertise_url: self.advertise_url.clone(),
            proxy_url: self.proxy_url.clone(),
            acquired_at: Utc::now(),
            ttl_ms: self.ttl.as_millis() as u64,
            lock_delay_ms: self.lock_delay.as_millis() as u64,
        }
    }

    /// Best-effort cleanup of a session we no longer need
    async fn discard_session(&self, session: &str) {
        if let Err(e) = self.service.destroy_session(session).await {
            tracing::debug!(session, error = %e, "cannot destroy unused session");
        }
    }

    async fn current_holder(&self) -> String {
        match self.primary_info().await {
            Ok(Some(info)) => info.hostname,
            _ => "unknown".to_string(),
        }
    }
}

#[async_trait]
impl Leaser for DistributedLeaser {
    fn kind(&self) -> LeaseType {
        LeaseType::Consul
    }

    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn advertise_url(&self) -> &str {
        &self.advertise_url
    }

    fn proxy_url(&self) -> Option<&str> {
        self.proxy_url.as_deref()
    }

    async fn open(&self) -> Result<()> {
        self.service.ping().await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn acquire(&self) -> Result<Lease> {
        let record = serde_json::to_vec(&self.record())?;
        // The TTL starts counting when the service sees the session.
        let sent = Instant::now();
        let session = self
            .service
            .create_session(&self.hostname, self.ttl, self.lock_delay)
            .await?;

        let acquired = match self.service.acquire(&self.key, &session, &record).await {
            Ok(acquired) => acquired,
            Err(e) => {
                self.discard_session(&session).await;
                return Err(e);
            }
        };
        if !acquired {
            self.discard_session(&session).await;
            return Err(Error::AcquisitionConflict(self.current_holder().await));
        }

        let epoch = match self.service.get(&self.key).await {
            Ok(Some(entry)) if entry.session.as_deref() == Some(session.as_str()) => entry.lock_index,
            Ok(_) => {
                self.discard_session(&session).await;
                return Err(Error::LeaseExpired(
                    "lease lost immediately after acquisition".into(),
                ))
            }
            Err(e) => {
                self.discard_session(&session).await;
                return Err(e);
            }
        };

        tracing::debug!(key = %self.key, session = %session, epoch, "lease acquired");
        Ok(Lease {
            id: session,
            epoch,
            ttl: Some(self.ttl),
            acquired_at: Utc::now(),
            renewed_at: sent,
        })
    }

    async fn renew(&self, lease: &Lease) -> Result<Lease> {
        let sent = Instant::now();
        self.service.renew_session(&lease.id).await?;
        Ok(Lease {
            renewed_at: sent,
            ..lease.clone()
        })
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        self.service.destroy_session(&lease.id).await?;
        tracing::debug!(key = %self.key, session = %lease.id, "lease released");
        Ok(())
    }

    async fn primary_info(&self) -> Result<Option<PrimaryInfo>> {
        let Some(entry) = self.service.get(&self.key).await? else {
            return Ok(None);
        };
        if entry.session.is_none() {
            return Ok(None);
        }
        let record: LeaseRecord = serde_json::from_slice(&entry.value)?;
        Ok(Some(record.primary_info()))
    }
}
