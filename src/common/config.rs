//! Configuration for minilease nodes
//!
//! Values come from a TOML file (with `${VAR}` expansion) layered under
//! `MINILEASE__*` environment variables.

use crate::common::{Error, Result};
use crate::lease::LeaseType;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name searched for when no explicit config path is given
pub const CONFIG_FILE_NAME: &str = "minilease.toml";

/// Environment prefix for overrides, e.g. `MINILEASE__LEASE__CANDIDATE=true`
pub const ENV_PREFIX: &str = "MINILEASE";

/// Upper bound for every configured delay and timeout
pub const MAX_DURATION_MS: u64 = 24 * 60 * 60 * 1000;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node ID (generated when absent)
    #[serde(default)]
    pub node_id: Option<String>,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Start serving without waiting to become primary or reach the primary
    #[serde(default)]
    pub skip_sync: bool,

    #[serde(default)]
    pub http: HttpConfig,

    pub lease: LeaseConfig,

    /// Write-holding proxy in front of the application
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Node API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Bind address for the node API (handoff, registration, info)
    #[serde(default = "default_http_addr")]
    pub bind_addr: SocketAddr,
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 20202))
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_http_addr(),
        }
    }
}

/// Lease and leadership configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Lease backend: "static" or "consul" (alias "distributed-lock")
    #[serde(rename = "type")]
    pub kind: String,

    /// May this node ever become primary?
    #[serde(default)]
    pub candidate: bool,

    /// Hostname advertised to peers (OS hostname when absent).
    /// For a static non-candidate this names the fixed primary.
    #[serde(default)]
    pub hostname: Option<String>,

    /// URL peers use to reach this node's API
    #[serde(default)]
    pub advertise_url: Option<String>,

    /// Promote this node once it is ready
    #[serde(default)]
    pub promote: bool,

    /// Delay between lease observations while not primary
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,

    /// Cooldown after handing off before this node competes again
    #[serde(default = "default_demote_delay")]
    pub demote_delay_ms: u64,

    /// How long a promotion waits to observe itself primary
    #[serde(default = "default_promotion_timeout")]
    pub promotion_timeout_ms: u64,

    /// Connect + request timeout for peer calls
    #[serde(default = "default_network_timeout")]
    pub network_timeout_ms: u64,

    /// Attempts to open the lease backend at startup
    #[serde(default = "default_open_retries")]
    pub open_retries: u32,

    #[serde(default)]
    pub consul: Option<ConsulConfig>,
}

fn default_reconnect_delay() -> u64 {
    1_000
}
fn default_demote_delay() -> u64 {
    10_000
}
fn default_promotion_timeout() -> u64 {
    10_000
}
fn default_network_timeout() -> u64 {
    2_000
}
fn default_open_retries() -> u32 {
    3
}

impl LeaseConfig {
    pub fn lease_type(&self) -> Result<LeaseType> {
        self.kind.parse()
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn demote_delay(&self) -> Duration {
        Duration::from_millis(self.demote_delay_ms)
    }

    pub fn promotion_timeout(&self) -> Duration {
        Duration::from_millis(self.promotion_timeout_ms)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            kind: LeaseType::Static.to_string(),
            candidate: false,
            hostname: None,
            advertise_url: None,
            promote: false,
            reconnect_delay_ms: default_reconnect_delay(),
            demote_delay_ms: default_demote_delay(),
            promotion_timeout_ms: default_promotion_timeout(),
            network_timeout_ms: default_network_timeout(),
            open_retries: default_open_retries(),
            consul: None,
        }
    }
}

/// Consul lock-service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsulConfig {
    pub url: String,

    #[serde(default = "default_consul_key")]
    pub key: String,

    #[serde(default = "default_ttl")]
    pub ttl_ms: u64,

    #[serde(default = "default_lock_delay")]
    pub lock_delay_ms: u64,

    /// ACL token sent as `X-Consul-Token`
    #[serde(default)]
    pub token: Option<String>,
}

fn default_consul_key() -> String {
    "minilease/primary".to_string()
}
fn default_ttl() -> u64 {
    10_000
}
fn default_lock_delay() -> u64 {
    1_000
}

impl ConsulConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn lock_delay(&self) -> Duration {
        Duration::from_millis(self.lock_delay_ms)
    }
}

/// Request-holding proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub bind_addr: SocketAddr,

    /// Application URL requests are forwarded to
    pub target: String,

    /// URL clients use to reach this node's proxy; replicas redirect writes
    /// here. For a static non-candidate this names the fixed primary's proxy.
    #[serde(default)]
    pub advertise_url: Option<String>,

    /// Longest a request is held waiting for leadership to settle
    #[serde(default = "default_max_hold")]
    pub max_hold_ms: u64,

    #[serde(default = "default_max_body")]
    pub max_body_bytes: usize,
}

fn default_max_hold() -> u64 {
    5_000
}
fn default_max_body() -> usize {
    8 * 1024 * 1024
}

impl ProxyConfig {
    pub fn max_hold(&self) -> Duration {
        Duration::from_millis(self.max_hold_ms)
    }
}

impl Config {
    /// Load configuration from `path`, or from the first file found in the
    /// search path. Environment overrides are applied on top.
    pub fn load(path: Option<&Path>, expand_env: bool) -> Result<Self> {
        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => search_paths().into_iter().find(|p| p.exists()),
        };

        let mut builder = config::Config::builder();
        match &path {
            Some(p) => {
                let mut text = std::fs::read_to_string(p).map_err(|e| {
                    Error::InvalidConfig(format!("cannot read {}: {}", p.display(), e))
                })?;
                if expand_env {
                    text = crate::common::utils::expand_env(&text);
                }
                tracing::info!("config file read from {}", p.display());
                builder = builder.add_source(config::File::from_str(&text, config::FileFormat::Toml));
            }
            None => tracing::info!("no config file found, using environment only"),
        }

        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Reject configurations the node cannot start with.
    pub fn validate(&self) -> Result<()> {
        let lease_type = self.lease.lease_type()?;

        match lease_type {
            LeaseType::Consul => {
                let consul = self.lease.consul.as_ref().ok_or_else(|| {
                    Error::InvalidConfig("consul lease requires a [lease.consul] section".into())
                })?;
                if consul.url.trim().is_empty() {
                    return Err(Error::InvalidConfig("consul url required".into()));
                }
                if consul.key.trim().is_empty() {
                    return Err(Error::InvalidConfig("consul key required".into()));
                }
                if consul.ttl_ms == 0 {
                    return Err(Error::InvalidConfig("consul ttl must be positive".into()));
                }
            }
            LeaseType::Static => {
                if !self.lease.candidate && self.lease.advertise_url.is_none() {
                    return Err(Error::InvalidConfig(
                        "static non-candidate requires the primary's advertise-url".into(),
                    ));
                }
            }
        }

        if self.lease.promotion_timeout_ms == 0 {
            return Err(Error::InvalidConfig("promotion timeout must be positive".into()));
        }

        let mut durations = vec![
            ("reconnect_delay_ms", self.lease.reconnect_delay_ms),
            ("demote_delay_ms", self.lease.demote_delay_ms),
            ("promotion_timeout_ms", self.lease.promotion_timeout_ms),
            ("network_timeout_ms", self.lease.network_timeout_ms),
        ];
        if let Some(consul) = &self.lease.consul {
            durations.push(("ttl_ms", consul.ttl_ms));
            durations.push(("lock_delay_ms", consul.lock_delay_ms));
        }
        if let Some(proxy) = &self.proxy {
            durations.push(("max_hold_ms", proxy.max_hold_ms));
        }
        for (name, ms) in durations {
            if ms > MAX_DURATION_MS {
                return Err(Error::InvalidConfig(format!(
                    "{} must be at most {} (got {})",
                    name, MAX_DURATION_MS, ms
                )));
            }
        }

        if let Some(proxy) = &self.proxy {
            if proxy.target.trim().is_empty() {
                return Err(Error::InvalidConfig("proxy target required".into()));
            }
            if proxy.bind_addr == self.http.bind_addr && proxy.bind_addr.port() != 0 {
                return Err(Error::InvalidConfig(
                    "proxy and http server cannot share an address".into(),
                ));
            }
        }

        Ok(())
    }

    /// Hostname and advertise URL for this node, given the port the API
    /// actually bound to.
    pub fn resolve_identity(&self, http_port: u16) -> Result<(String, String)> {
        let hostname = match &self.lease.hostname {
            Some(h) if !h.is_empty() => h.clone(),
            _ => gethostname::gethostname().to_string_lossy().into_owned(),
        };

        let advertise_url = match &self.lease.advertise_url {
            Some(url) if !url.is_empty() => url.trim_end_matches('/').to_string(),
            _ if !hostname.is_empty() => format!("http://{}:{}", hostname, http_port),
            _ => {
                return Err(Error::InvalidConfig(
                    "advertise-url required when hostname is unknown".into(),
                ))
            }
        };

        Ok((hostname, advertise_url))
    }

    /// Proxy URL recorded with this node's lease, given the port the proxy
    /// actually bound to. `None` without a `[proxy]` section.
    pub fn resolve_proxy_url(&self, hostname: &str, proxy_port: u16) -> Option<String> {
        let proxy = self.proxy.as_ref()?;
        match &proxy.advertise_url {
            Some(url) if !url.is_empty() => Some(url.trim_end_matches('/').to_string()),
            _ if !hostname.is_empty() => Some(format!("http://{}:{}", hostname, proxy_port)),
            _ => None,
        }
    }
}

fn search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(CONFIG_FILE_NAME)];
    if let Ok(home) = std::env::var("HOME") {
        paths.push(Path::new(&home).join(CONFIG_FILE_NAME));
    }
    paths.push(Path::new("/etc").join(CONFIG_FILE_NAME));
    paths
}
