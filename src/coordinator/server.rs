//! Node server: wires the lease backend, coordinator, node API and proxy

use super::gate::RequestGate;
use super::http::{create_router, NodeState};
use super::leadership::{Coordinator, CoordinatorOptions};
use super::peer::HttpPeerClient;
use super::proxy::create_proxy_router;
use super::state::NodeIdentity;
use crate::common::diagnostics::{self, Diagnostics};
use crate::common::utils::generate_node_id;
use crate::common::{Config, Error, Result};
use crate::lease::{
    ConsulClient, DistributedLeaser, LeaseType, Leaser, LockService, StaticLeaser,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct NodeServer {
    config: Config,
    lock_service: Option<Arc<dyn LockService>>,
}

/// A started node. Dropping it does not stop the node; call [`shutdown`].
///
/// [`shutdown`]: RunningNode::shutdown
pub struct RunningNode {
    pub coordinator: Arc<Coordinator>,
    pub http_addr: SocketAddr,
    pub proxy_addr: Option<SocketAddr>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningNode {
    /// Release the lease (if held) and stop serving
    pub async fn shutdown(self) {
        self.coordinator.close().await;
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "server task failed");
            }
        }
        tracing::info!("node stopped");
    }
}

impl NodeServer {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            lock_service: None,
        }
    }

    /// Use `service` for the distributed backend instead of connecting to
    /// the configured Consul agent.
    pub fn with_lock_service(mut self, service: Arc<dyn LockService>) -> Self {
        self.lock_service = Some(service);
        self
    }

    fn build_leaser(
        &self,
        hostname: &str,
        advertise_url: &str,
        proxy_url: Option<String>,
    ) -> Result<Arc<dyn Leaser>> {
        let lease = &self.config.lease;
        match lease.lease_type()? {
            LeaseType::Static => {
                let mut leaser = StaticLeaser::new(lease.candidate, hostname, advertise_url);
                if let Some(url) = proxy_url {
                    leaser = leaser.with_proxy_url(url);
                }
                Ok(Arc::new(leaser))
            }
            LeaseType::Consul => {
                let consul = lease.consul.as_ref().ok_or_else(|| {
                    Error::InvalidConfig("consul lease requires a [lease.consul] section".into())
                })?;
                let service: Arc<dyn LockService> = match &self.lock_service {
                    Some(service) => service.clone(),
                    None => Arc::new(ConsulClient::new(&consul.url, consul.token.clone())?),
                };
                let mut leaser =
                    DistributedLeaser::new(service, &consul.key, hostname, advertise_url);
                leaser.ttl = consul.ttl();
                leaser.lock_delay = consul.lock_delay();
                if let Some(url) = proxy_url {
                    leaser = leaser.with_proxy_url(url);
                }
                Ok(Arc::new(leaser))
            }
        }
    }

    /// Bind listeners, open the lease backend and start the coordinator.
    /// Returns once everything is serving; readiness is not awaited.
    pub async fn start(self) -> Result<RunningNode> {
        let config = &self.config;
        config.validate()?;
        let lease_type = config.lease.lease_type()?;

        let listener = TcpListener::bind(config.http.bind_addr).await?;
        let http_addr = listener.local_addr()?;
        let (hostname, advertise_url) = config.resolve_identity(http_addr.port())?;

        let proxy_listener = match &config.proxy {
            Some(proxy) => Some(TcpListener::bind(proxy.bind_addr).await?),
            None => None,
        };
        let proxy_url = match &proxy_listener {
            Some(listener) => config.resolve_proxy_url(&hostname, listener.local_addr()?.port()),
            None => None,
        };

        // A static non-candidate is configured with the primary's hostname
        // and address; its own address comes from the OS hostname.
        let self_url = if lease_type == LeaseType::Static && !config.lease.candidate {
            let local = gethostname::gethostname().to_string_lossy().into_owned();
            format!("http://{}:{}", local, http_addr.port())
        } else {
            advertise_url.clone()
        };
        let identity = NodeIdentity {
            id: config.node_id.clone().unwrap_or_else(generate_node_id),
            advertise_url: self_url,
        };

        tracing::info!("Starting node: {}", identity.id);
        tracing::info!("  HTTP API: {}", http_addr);
        tracing::info!("  Advertise URL: {}", identity.advertise_url);
        tracing::info!("  Lease: {} (candidate: {})", lease_type, config.lease.candidate);
        if let Some(url) = &proxy_url {
            tracing::info!("  Proxy URL: {}", url);
        }

        let leaser = self.build_leaser(&hostname, &advertise_url, proxy_url)?;
        open_with_retries(
            leaser.as_ref(),
            config.lease.open_retries,
            config.lease.reconnect_delay(),
        )
        .await?;

        let peer = Arc::new(HttpPeerClient::new(config.lease.network_timeout())?);
        let coordinator = Coordinator::new(
            identity,
            config.lease.candidate,
            leaser,
            peer,
            CoordinatorOptions::from_config(&config.lease),
        );
        let diag: Arc<dyn Diagnostics> = coordinator.clone();
        diagnostics::publish(&diag);

        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        let router = create_router(NodeState {
            coordinator: coordinator.clone(),
            shutdown: shutdown.clone(),
        });
        tasks.push(spawn_server("node API", listener, router, shutdown.clone()));

        coordinator.open()?;

        let mut proxy_addr = None;
        if let (Some(proxy), Some(listener)) = (&config.proxy, proxy_listener) {
            let gate = Arc::new(RequestGate::new(coordinator.clone(), proxy.max_hold()));
            let router = create_proxy_router(
                gate,
                &proxy.target,
                proxy.max_body_bytes,
                proxy.max_hold().saturating_add(Duration::from_secs(30)),
            )?;
            let addr = listener.local_addr()?;
            tracing::info!("  Proxy: {} -> {}", addr, proxy.target);
            tasks.push(spawn_server("proxy", listener, router, shutdown.clone()));
            proxy_addr = Some(addr);
        }

        Ok(RunningNode {
            coordinator,
            http_addr,
            proxy_addr,
            shutdown,
            tasks,
        })
    }

    /// Run the node until Ctrl-C
    pub async fn serve(self) -> Result<()> {
        let skip_sync = self.config.skip_sync;
        let auto_promote = self.config.lease.promote && self.config.lease.candidate;
        let node = self.start().await?;
        let coordinator = node.coordinator.clone();

        let stop = CancellationToken::new();
        let signal = {
            let stop = stop.clone();
            tokio::spawn(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("cannot listen for shutdown signal: {}", e);
                }
                tracing::info!("shutdown signal received");
                stop.cancel();
            })
        };

        sync_on_startup(&coordinator, skip_sync, auto_promote, &stop).await;

        stop.cancelled().await;
        signal.abort();
        node.shutdown().await;
        Ok(())
    }
}

/// Wait until the node is primary or connected to one, then promote it if
/// asked to. With `skip_sync` neither happens.
async fn sync_on_startup(
    coordinator: &Coordinator,
    skip_sync: bool,
    auto_promote: bool,
    stop: &CancellationToken,
) {
    if skip_sync {
        if auto_promote {
            tracing::warn!("sync skipped, ignoring promote");
        }
        return;
    }

    tracing::info!("waiting to become primary or connect to primary");
    if !coordinator.ready().wait_cancellable(stop).await {
        return;
    }
    let (is_primary, primary) = coordinator.primary_info();
    tracing::info!(
        is_primary,
        primary = primary.as_ref().map(|p| p.advertise_url.as_str()).unwrap_or("none"),
        "node ready"
    );

    if auto_promote {
        if let Err(e) = coordinator.promote(stop).await {
            tracing::warn!("auto-promotion failed: {}", e);
        }
    }
}

async fn open_with_retries(leaser: &dyn Leaser, retries: u32, delay: Duration) -> Result<()> {
    let mut attempt = 0;
    loop {
        match leaser.open().await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() && attempt < retries => {
                attempt += 1;
                tracing::warn!(attempt, error = %e, "cannot open lease backend, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn spawn_server(
    name: &'static str,
    listener: TcpListener,
    router: axum::Router,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let res = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await;
        if let Err(e) = res {
            tracing::error!("{} server error: {}", name, e);
        }
    })
}
