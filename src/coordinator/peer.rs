//! Calls a node makes to the primary: replica registration and handoff

use super::state::NodeIdentity;
use crate::common::{Error, Result};
use crate::lease::PrimaryInfo;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Body of `POST /handoff`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffRequest {
    pub requester_id: String,
}

/// Body of `POST /replicas`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaRegistration {
    pub id: String,
    pub advertise_url: String,
    pub candidate: bool,
}

/// Error body returned by the node API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default)]
    pub primary: Option<String>,
}

#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Register with the primary at `primary_url`. This is the replica's
    /// sync channel; it succeeds only if that node is still primary.
    async fn register(
        &self,
        primary_url: &str,
        identity: &NodeIdentity,
        candidate: bool,
    ) -> Result<PrimaryInfo>;

    /// Ask the primary at `primary_url` to release its lease.
    /// `HandoffUnreachable` on network failure, `HandoffRejected` otherwise.
    async fn handoff(&self, primary_url: &str, identity: &NodeIdentity) -> Result<()>;
}

/// [`PeerClient`] over the node HTTP API
pub struct HttpPeerClient {
    client: reqwest::Client,
}

impl HttpPeerClient {
    /// `timeout` bounds both connecting and the whole request
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("cannot build peer client: {}", e)))?;
        Ok(Self { client })
    }
}

async fn read_error(resp: reqwest::Response) -> (StatusCode, ErrorBody) {
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    let body = serde_json::from_str(&text).unwrap_or(ErrorBody {
        error: text,
        primary: None,
    });
    (status, body)
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn register(
        &self,
        primary_url: &str,
        identity: &NodeIdentity,
        candidate: bool,
    ) -> Result<PrimaryInfo> {
        let body = ReplicaRegistration {
            id: identity.id.clone(),
            advertise_url: identity.advertise_url.clone(),
            candidate,
        };
        let resp = self
            .client
            .post(format!("{}/replicas", primary_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Connection(format!("primary {}: {}", primary_url, e)))?;

        if resp.status().is_success() {
            return resp
                .json()
                .await
                .map_err(|e| Error::Http(format!("invalid registration response: {}", e)));
        }
        match read_error(resp).await {
            (StatusCode::CONFLICT, body) => Err(Error::NotPrimary(body.primary)),
            (status, body) => Err(Error::Http(format!("{}: {}", status, body.error))),
        }
    }

    async fn handoff(&self, primary_url: &str, identity: &NodeIdentity) -> Result<()> {
        let body = HandoffRequest {
            requester_id: identity.id.clone(),
        };
        let resp = self
            .client
            .post(format!("{}/handoff", primary_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::HandoffUnreachable(format!("{}: {}", primary_url, e)))?;

        if resp.status().is_success() {
            return Ok(());
        }
        let (status, body) = read_error(resp).await;
        Err(Error::HandoffRejected(format!("{}: {}", status, body.error)))
    }
}
