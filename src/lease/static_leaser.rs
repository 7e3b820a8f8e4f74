//! Static lease backend: the primary is fixed by configuration.

use super::{Lease, LeaseType, Leaser, PrimaryInfo};
use crate::common::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;

const STATIC_LEASE_ID: &str = "static";

/// Leaser whose answer never changes.
///
/// A candidate node is always primary. For a non-candidate, `hostname` and
/// `advertise_url` (and `proxy_url`) name the fixed primary it replicates
/// from.
pub struct StaticLeaser {
    is_primary: bool,
    hostname: String,
    advertise_url: String,
    proxy_url: Option<String>,
}

impl StaticLeaser {
    pub fn new(is_primary: bool, hostname: impl Into<String>, advertise_url: impl Into<String>) -> Self {
        Self {
            is_primary,
            hostname: hostname.into(),
            advertise_url: advertise_url.into(),
            proxy_url: None,
        }
    }

    pub fn with_proxy_url(mut self, url: impl Into<String>) -> Self {
        self.proxy_url = Some(url.into());
        self
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary
    }
}

#[async_trait]
impl Leaser for StaticLeaser {
    fn kind(&self) -> LeaseType {
        LeaseType::Static
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
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn acquire(&self) -> Result<Lease> {
        if !self.is_primary {
            return Err(Error::AcquisitionConflict(self.hostname.clone()));
        }
        Ok(Lease {
            id: STATIC_LEASE_ID.to_string(),
            epoch: 1,
            ttl: None,
            acquired_at: Utc::now(),
            renewed_at: Instant::now(),
        })
    }

    async fn renew(&self, lease: &Lease) -> Result<Lease> {
        Ok(Lease {
            renewed_at: Instant::now(),
            ..lease.clone()
        })
    }

    async fn release(&self, _lease: &Lease) -> Result<()> {
        Ok(())
    }

    async fn primary_info(&self) -> Result<Option<PrimaryInfo>> {
        if self.is_primary {
            return Ok(None);
        }
        Ok(Some(PrimaryInfo {
            hostname: self.hostname.clone(),
            advertise_url: self.advertise_url.clone(),
            proxy_url: self.proxy_url.clone(),
        }))
    }
}
