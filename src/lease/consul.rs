//! Consul lock service over its HTTP API
//!
//! Endpoints used:
//! - `PUT /v1/session/create`, `/v1/session/renew/:id`, `/v1/session/destroy/:id`
//! - `PUT /v1/kv/:key?acquire=:session`
//! - `GET /v1/kv/:key`
//! - `GET /v1/status/leader` (ping)

use super::lock_service::{KvEntry, LockService};
use crate::common::utils::{encode_key, format_duration};
use crate::common::{Error, Result};
use async_trait::async_trait;
use base64::Engine;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const TOKEN_HEADER: &str = "X-Consul-Token";

/// Bound on every call so `open` and renewals never hang
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct SessionCreate<'a> {
    name: &'a str,
    #[serde(rename = "TTL")]
    ttl: String,
    lock_delay: String,
    behavior: &'static str,
}

#[derive(Deserialize)]
struct SessionCreated {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KvPair {
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    session: Option<String>,
    #[serde(default)]
    lock_index: u64,
}

pub struct ConsulClient {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl ConsulClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Internal(format!("cannot build consul client: {}", e)))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn with_token(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.header(TOKEN_HEADER, token),
            None => req,
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        self.with_token(req)
            .send()
            .await
            .map_err(|e| Error::Connection(format!("consul {}: {}", self.base_url, e)))
    }
}

async fn error_body(resp: reqwest::Response) -> Error {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    Error::Http(format!("consul returned {}: {}", status, body.trim()))
}

#[async_trait]
impl LockService for ConsulClient {
    async fn ping(&self) -> Result<()> {
        let resp = self.send(self.client.get(self.url("/v1/status/leader"))).await?;
        if !resp.status().is_success() {
            return Err(error_body(resp).await);
        }
        Ok(())
    }

    async fn create_session(&self, name: &str, ttl: Duration, lock_delay: Duration) -> Result<String> {
        let body = SessionCreate {
            name,
            ttl: format_duration(ttl),
            lock_delay: format_duration(lock_delay),
            behavior: "release",
        };
        let resp = self
            .send(self.client.put(self.url("/v1/session/create")).json(&body))
            .await?;
        if !resp.status().is_success() {
            return Err(error_body(resp).await);
        }
        let created: SessionCreated = resp
            .json()
            .await
            .map_err(|e| Error::Http(format!("invalid session response: {}", e)))?;
        Ok(created.id)
    }

    async fn renew_session(&self, session: &str) -> Result<()> {
        let url = self.url(&format!("/v1/session/renew/{}", session));
        let resp = self.send(self.client.put(url)).await?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(Error::LeaseExpired(format!(
                "session {} not found",
                session
            ))),
            _ => Err(error_body(resp).await),
        }
    }

    async fn destroy_session(&self, session: &str) -> Result<()> {
        let url = self.url(&format!("/v1/session/destroy/{}", session));
        let resp = self.send(self.client.put(url)).await?;
        if !resp.status().is_success() {
            return Err(error_body(resp).await);
        }
        Ok(())
    }

    async fn acquire(&self, key: &str, session: &str, value: &[u8]) -> Result<bool> {
        let url = self.url(&format!("/v1/kv/{}", encode_key(key)));
        let resp = self
            .send(
                self.client
                    .put(url)
                    .query(&[("acquire", session)])
                    .body(value.to_vec()),
            )
            .await?;
        if !resp.status().is_success() {
            return Err(error_body(resp).await);
        }
        let text = resp
            .text()
            .await
            .map_err(|e| Error::Http(format!("invalid acquire response: {}", e)))?;
        Ok(text.trim() == "true")
    }

    async fn get(&self, key: &str) -> Result<Option<KvEntry>> {
        let url = self.url(&format!("/v1/kv/{}", encode_key(key)));
        let resp = self.send(self.client.get(url)).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => return Ok(None),
            s if !s.is_success() => return Err(error_body(resp).await),
            _ => {}
        }

        let pairs: Vec<KvPair> = resp
            .json()
            .await
            .map_err(|e| Error::Http(format!("invalid kv response: {}", e)))?;
        let Some(pair) = pairs.into_iter().next() else {
            return Ok(None);
        };

        let value = match pair.value {
            Some(encoded) => base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| Error::Http(format!("invalid kv value encoding: {}", e)))?,
            None => Vec::new(),
        };
        Ok(Some(KvEntry {
            value,
            session: pair.session.filter(|s| !s.is_empty()),
            lock_index: pair.lock_index,
        }))
    }
}
