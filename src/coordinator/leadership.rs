//! Leadership coordinator
//!
//! Owns the node's [`LeaseState`] and drives it from a background monitor
//! task:
//!
//! ```text
//! Initializing ──acquire──▶ Primary ◀──acquire── Replica
//!      │                      │  renewal failure,   ▲
//!      └──foreign holder──────┼──handoff────────────┘
//!                             ▼
//!         (any) ──close──▶ Unleased
//! ```
//!
//! The coordinator is the only writer of the state. Observers read copies
//! of the [`Snapshot`] or subscribe to changes.

use super::peer::{HandoffRequest, PeerClient, ReplicaRegistration};
use super::ready::ReadyGate;
use super::state::{LeaseState, NodeIdentity, Snapshot};
use crate::common::config::LeaseConfig;
use crate::common::diagnostics::Diagnostics;
use crate::common::metrics::METRICS;
use crate::common::utils::{deadline_after, jitter};
use crate::common::{Error, Result};
use crate::lease::{Lease, LeaseType, Leaser, PrimaryInfo};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify, OwnedRwLockReadGuard, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tunables for the coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Delay between lease observations while not primary
    pub reconnect_delay: Duration,
    /// After handing off, how long this node stays out of the election
    pub demote_delay: Duration,
    /// How long `promote` waits to observe this node primary
    pub promotion_timeout: Duration,
    /// Registrations older than this are not eligible for handoff
    pub replica_timeout: Duration,
}

impl CoordinatorOptions {
    pub fn from_config(lease: &LeaseConfig) -> Self {
        Self {
            reconnect_delay: lease.reconnect_delay(),
            demote_delay: lease.demote_delay(),
            promotion_timeout: lease.promotion_timeout(),
            replica_timeout: lease.reconnect_delay().saturating_mul(5),
        }
    }
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(1),
            demote_delay: Duration::from_secs(10),
            promotion_timeout: Duration::from_secs(10),
            replica_timeout: Duration::from_secs(5),
        }
    }
}

/// Permission to write while primary. Demotion waits for outstanding
/// guards before the lease is released.
pub struct WriteGuard {
    epoch: u64,
    _guard: OwnedRwLockReadGuard<()>,
}

impl WriteGuard {
    /// Fencing epoch the write was admitted under
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

/// A replica known to the primary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaStatus {
    pub id: String,
    pub advertise_url: String,
    pub candidate: bool,
    pub last_seen_ms: u64,
}

struct ReplicaEntry {
    advertise_url: String,
    candidate: bool,
    last_seen: Instant,
}

/// Why the primary stopped holding its lease
#[derive(Debug)]
enum Exit {
    Shutdown,
    Handoff,
    Lost(String),
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct PromotingFlag<'a>(&'a AtomicBool);

impl<'a> PromotingFlag<'a> {
    fn set(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for PromotingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Coordinator {
    identity: NodeIdentity,
    candidate: bool,
    leaser: Arc<dyn Leaser>,
    peer: Arc<dyn PeerClient>,
    options: CoordinatorOptions,

    state: watch::Sender<Snapshot>,
    ready: ReadyGate,
    writes: Arc<RwLock<()>>,

    replicas: Mutex<HashMap<String, ReplicaEntry>>,
    /// Epoch a pending handoff applies to
    handoff_epoch: Mutex<Option<u64>>,
    handoff_requested: Notify,
    last_handoff: Mutex<Option<(String, Instant)>>,
    demoted_until: Mutex<Option<Instant>>,

    wake: Notify,
    promoting: AtomicBool,
    shutdown: CancellationToken,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(
        identity: NodeIdentity,
        candidate: bool,
        leaser: Arc<dyn Leaser>,
        peer: Arc<dyn PeerClient>,
        options: CoordinatorOptions,
    ) -> Arc<Self> {
        let (state, _rx) = watch::channel(Snapshot::initializing());
        Arc::new(Self {
            identity,
            candidate,
            leaser,
            peer,
            options,
            state,
            ready: ReadyGate::new(),
            writes: Arc::new(RwLock::new(())),
            replicas: Mutex::new(HashMap::new()),
            handoff_epoch: Mutex::new(None),
            handoff_requested: Notify::new(),
            last_handoff: Mutex::new(None),
            demoted_until: Mutex::new(None),
            wake: Notify::new(),
            promoting: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            monitor: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.identity.id
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Is this node allowed to become primary?
    pub fn candidate(&self) -> bool {
        self.candidate
    }

    pub fn lease_type(&self) -> LeaseType {
        self.leaser.kind()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.state.borrow().clone()
    }

    pub fn state(&self) -> LeaseState {
        self.state.borrow().state
    }

    pub fn is_primary(&self) -> bool {
        self.candidate && self.state.borrow().is_primary()
    }

    /// Whether this node is primary, and where the primary is
    pub fn primary_info(&self) -> (bool, Option<PrimaryInfo>) {
        let snap = self.state.borrow();
        (self.candidate && snap.is_primary(), snap.primary.clone())
    }

    pub fn epoch(&self) -> Option<u64> {
        self.state.borrow().epoch
    }

    pub fn ready(&self) -> &ReadyGate {
        &self.ready
    }

    /// Receive every state change
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.state.subscribe()
    }

    /// True while leadership is unsettled: starting up, promoting, or no
    /// primary known.
    pub fn is_transitioning(&self) -> bool {
        if self.promoting.load(Ordering::SeqCst) {
            return true;
        }
        let snap = self.state.borrow();
        match snap.state {
            LeaseState::Initializing => true,
            LeaseState::Replica => snap.primary.is_none(),
            LeaseState::Primary | LeaseState::Unleased => false,
        }
    }

    /// Admit a write. Fails with `NotPrimary` (carrying the primary's URL
    /// when known) unless this node holds the lease.
    pub async fn begin_write(&self) -> Result<WriteGuard> {
        let guard = self.writes.clone().read_owned().await;
        let snap = self.snapshot();
        match snap.epoch {
            Some(epoch) if self.candidate && snap.is_primary() => Ok(WriteGuard {
                epoch,
                _guard: guard,
            }),
            _ => Err(Error::NotPrimary(snap.primary.map(|p| p.advertise_url))),
        }
    }

    /// Reject writes carrying an epoch other than the current lease's
    pub fn check_epoch(&self, epoch: u64) -> Result<()> {
        let snap = self.state.borrow();
        match snap.epoch {
            Some(current) if snap.is_primary() && current == epoch => Ok(()),
            current => Err(Error::StaleEpoch {
                presented: epoch,
                current,
            }),
        }
    }

    pub fn replicas(&self) -> Vec<ReplicaStatus> {
        lock(&self.replicas)
            .iter()
            .map(|(id, r)| ReplicaStatus {
                id: id.clone(),
                advertise_url: r.advertise_url.clone(),
                candidate: r.candidate,
                last_seen_ms: r.last_seen.elapsed().as_millis() as u64,
            })
            .collect()
    }

    /// Start the lease monitor. The leaser must already be open.
    pub fn open(self: &Arc<Self>) -> Result<()> {
        let mut monitor = lock(&self.monitor);
        if monitor.is_some() {
            return Err(Error::Internal("coordinator already open".into()));
        }
        info!(
            id = %self.identity.id,
            candidate = self.candidate,
            lease = %self.leaser.kind(),
            advertise_url = %self.identity.advertise_url,
            "starting lease monitor"
        );
        *monitor = Some(tokio::spawn(self.clone().run()));
        Ok(())
    }

    /// Stop the monitor, releasing any held lease.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let handle = lock(&self.monitor).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "lease monitor task failed");
            }
        }
        if let Err(e) = self.leaser.close().await {
            warn!(error = %e, "cannot close leaser");
        }
        self.state.send_modify(|s| {
            s.state = LeaseState::Unleased;
            s.primary = None;
            s.epoch = None;
            s.synced = false;
        });
    }

    /// Make this node primary by asking the current primary to hand off.
    ///
    /// Returns immediately if already primary. Otherwise waits up to the
    /// promotion timeout to observe this node primary.
    pub async fn promote(&self, cancel: &CancellationToken) -> Result<()> {
        if self.is_primary() {
            info!("node is already primary, skipping promotion");
            return Ok(());
        }
        if !self.candidate {
            return Err(Error::NotCandidate);
        }

        let started = Instant::now();
        let res = self.promote_inner(cancel).await;
        METRICS.record_promotion(started.elapsed(), res.is_ok());
        match &res {
            Ok(()) => info!(elapsed_ms = started.elapsed().as_millis() as u64, "promoted to primary"),
            Err(e) => warn!(error = %e, "promotion failed"),
        }
        res
    }

    async fn promote_inner(&self, cancel: &CancellationToken) -> Result<()> {
        let _promoting = PromotingFlag::set(&self.promoting);
        let mut rx = self.state.subscribe();
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        match self.primary_info().1 {
            Some(info) => {
                info!(primary = %info.advertise_url, "requesting lease handoff");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    res = self.peer.handoff(&info.advertise_url, &self.identity) => res?,
                }
            }
            None => debug!("no primary known, waiting for lease acquisition"),
        }
        self.wake.notify_one();

        let timeout = self.options.promotion_timeout;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            res = tokio::time::timeout(timeout, rx.wait_for(Snapshot::is_primary)) => match res {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(_)) => Err(Error::Internal("coordinator closed".into())),
                Err(_) => Err(Error::PromotionTimeout(timeout)),
            },
        }
    }

    /// Handle a peer's request for this node to give up the lease.
    pub fn handle_handoff(&self, req: &HandoffRequest) -> Result<()> {
        if self.leaser.kind() == LeaseType::Static {
            return Err(self.reject_handoff(req, "static lease cannot be handed off".into()));
        }

        if let Some((id, at)) = lock(&self.last_handoff).as_ref() {
            if *id == req.requester_id && at.elapsed() < self.options.demote_delay {
                debug!(requester = %req.requester_id, "handoff already in progress");
                return Ok(());
            }
        }

        let snap = self.snapshot();
        if !snap.is_primary() {
            METRICS.handoffs_rejected.inc();
            return Err(Error::NotPrimary(snap.primary.map(|p| p.advertise_url)));
        }

        let eligible = {
            let mut replicas = lock(&self.replicas);
            self.prune_replicas(&mut replicas);
            replicas.get(&req.requester_id).map(|r| r.candidate)
        };
        match eligible {
            None => {
                return Err(self.reject_handoff(
                    req,
                    format!("unknown node {}", req.requester_id),
                ))
            }
            Some(false) => {
                return Err(self.reject_handoff(
                    req,
                    format!("node {} is not a candidate", req.requester_id),
                ))
            }
            Some(true) => {}
        }

        *lock(&self.last_handoff) = Some((req.requester_id.clone(), Instant::now()));
        *lock(&self.handoff_epoch) = snap.epoch;
        self.handoff_requested.notify_one();
        METRICS.handoffs_served.inc();
        info!(requester = %req.requester_id, "handoff requested, releasing lease");
        Ok(())
    }

    fn reject_handoff(&self, req: &HandoffRequest, reason: String) -> Error {
        METRICS.handoffs_rejected.inc();
        warn!(requester = %req.requester_id, %reason, "handoff rejected");
        Error::HandoffRejected(reason)
    }

    /// Record a replica's registration. Only the primary accepts these.
    pub fn register_replica(&self, reg: &ReplicaRegistration) -> Result<PrimaryInfo> {
        let snap = self.snapshot();
        if !snap.is_primary() {
            return Err(Error::NotPrimary(snap.primary.map(|p| p.advertise_url)));
        }

        let previous = lock(&self.replicas).insert(
            reg.id.clone(),
            ReplicaEntry {
                advertise_url: reg.advertise_url.clone(),
                candidate: reg.candidate,
                last_seen: Instant::now(),
            },
        );
        if previous.is_none() {
            info!(replica = %reg.id, url = %reg.advertise_url, candidate = reg.candidate, "replica connected");
        }
        Ok(self.self_info())
    }

    fn prune_replicas(&self, replicas: &mut HashMap<String, ReplicaEntry>) {
        let timeout = self.options.replica_timeout;
        replicas.retain(|id, r| {
            let live = r.last_seen.elapsed() < timeout;
            if !live {
                debug!(replica = %id, "replica registration expired");
            }
            live
        });
    }

    fn self_info(&self) -> PrimaryInfo {
        PrimaryInfo {
            hostname: self.leaser.hostname().to_string(),
            advertise_url: self.identity.advertise_url.clone(),
            proxy_url: self.leaser.proxy_url().map(str::to_string),
        }
    }

    fn in_demote_cooldown(&self) -> bool {
        matches!(*lock(&self.demoted_until), Some(until) if Instant::now() < until)
    }

    async fn run(self: Arc<Self>) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self.acquire_or_follow().await {
                Ok(Some(lease)) => self.hold(lease).await,
                Ok(None) => {}
                Err(Error::NotPrimary(_)) => debug!("lease holder is no longer primary"),
                Err(e) => warn!(error = %e, "lease monitor error"),
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(jitter(self.options.reconnect_delay)) => {}
            }
        }
        self.state.send_modify(|s| {
            s.state = LeaseState::Unleased;
            s.primary = None;
            s.epoch = None;
            s.synced = false;
        });
        info!("lease monitor stopped");
    }

    /// Follow a foreign holder, or try to take the lease when nobody holds it.
    async fn acquire_or_follow(&self) -> Result<Option<Lease>> {
        match self.leaser.primary_info().await? {
            Some(info) if info.advertise_url != self.identity.advertise_url => {
                self.follow(info).await?;
                return Ok(None);
            }
            // Our own record from an earlier lease; it must expire first.
            Some(_) => {}
            None => self.forget_primary(),
        }

        if !self.candidate {
            return Ok(None);
        }
        if self.in_demote_cooldown() {
            debug!("recently handed off, not competing for the lease");
            return Ok(None);
        }

        match self.leaser.acquire().await {
            Ok(lease) => Ok(Some(lease)),
            Err(Error::AcquisitionConflict(holder)) => {
                METRICS.acquisition_conflicts.inc();
                debug!(%holder, "lease held elsewhere");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn forget_primary(&self) {
        self.state.send_if_modified(|s| {
            if s.state == LeaseState::Replica && s.primary.is_some() {
                s.primary = None;
                s.synced = false;
                true
            } else {
                false
            }
        });
    }

    /// Become (or stay) a replica of `info` and register with it. The
    /// ready gate fires once registration succeeds.
    async fn follow(&self, info: PrimaryInfo) -> Result<()> {
        let previous = self.snapshot();
        if previous.state != LeaseState::Replica || previous.primary.as_ref() != Some(&info) {
            info!(primary = %info.advertise_url, hostname = %info.hostname, "following primary");
            self.state.send_modify(|s| {
                s.state = LeaseState::Replica;
                s.primary = Some(info.clone());
                s.epoch = None;
                s.synced = false;
            });
        }

        match self
            .peer
            .register(&info.advertise_url, &self.identity, self.candidate)
            .await
        {
            Ok(_) => {
                self.state.send_if_modified(|s| {
                    let changed = s.primary.as_ref() == Some(&info) && !s.synced;
                    if changed {
                        s.synced = true;
                    }
                    changed
                });
                if self.ready.fire() {
                    info!(primary = %info.advertise_url, "connected to primary, ready");
                }
                Ok(())
            }
            Err(e) => {
                self.state.send_if_modified(|s| std::mem::replace(&mut s.synced, false));
                Err(e)
            }
        }
    }

    /// Act as primary until the lease is lost, handed off, or shut down.
    async fn hold(&self, mut lease: Lease) {
        let epoch = lease.epoch;
        METRICS.acquisitions.inc();
        *lock(&self.handoff_epoch) = None;
        self.state.send_modify(|s| {
            s.state = LeaseState::Primary;
            s.primary = Some(self.self_info());
            s.epoch = Some(epoch);
            s.synced = false;
        });
        info!(epoch, "lease acquired, node is primary");
        if self.ready.fire() {
            info!("node is primary, ready");
        }

        let exit = loop {
            let renew_at = lease.renew_at();
            let tick = async {
                match renew_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = self.shutdown.cancelled() => break Exit::Shutdown,
                _ = self.handoff_requested.notified() => {
                    if *lock(&self.handoff_epoch) == Some(epoch) {
                        break Exit::Handoff;
                    }
                    continue;
                }
                _ = tick => {}
            }

            // Past its TTL the lease may already belong to someone else.
            let renewed = match lease.expires_at() {
                Some(expiry) => {
                    match tokio::time::timeout_at(expiry, self.leaser.renew(&lease)).await {
                        Ok(res) => res,
                        Err(_) => break Exit::Lost("lease expired while renewing".into()),
                    }
                }
                None => self.leaser.renew(&lease).await,
            };
            match renewed {
                Ok(renewed) => {
                    METRICS.renewals.inc();
                    lease = renewed;
                }
                Err(e) => break Exit::Lost(e.to_string()),
            }
        };

        self.demote(&exit).await;

        if let Exit::Handoff = exit {
            *lock(&self.demoted_until) = Some(deadline_after(self.options.demote_delay));
        }
        if let Err(e) = self.leaser.release(&lease).await {
            warn!(error = %e, epoch, "cannot release lease");
        }
    }

    /// Stop admitting writes, then wait for the ones in flight.
    async fn demote(&self, exit: &Exit) {
        METRICS.demotions.inc();
        let next = match exit {
            Exit::Shutdown => LeaseState::Unleased,
            Exit::Handoff | Exit::Lost(_) => LeaseState::Replica,
        };
        self.state.send_modify(|s| {
            s.state = next;
            s.primary = None;
            s.epoch = None;
            s.synced = false;
        });

        match exit {
            Exit::Shutdown => info!("shutting down, releasing lease"),
            Exit::Handoff => info!("lease handed off, node is now a replica"),
            Exit::Lost(reason) => {
                METRICS.renewal_failures.inc();
                warn!(%reason, "lease lost, demoted to replica");
            }
        }

        let _drained = self.writes.write().await;
    }
}

impl Diagnostics for Coordinator {
    fn vars(&self) -> serde_json::Value {
        let snap = self.snapshot();
        json!({
            "id": self.identity.id,
            "candidate": self.candidate,
            "lease_type": self.leaser.kind(),
            "state": snap.state,
            "is_primary": self.is_primary(),
            "primary": snap.primary,
            "epoch": snap.epoch,
            "ready": self.ready.is_ready(),
            "replicas": lock(&self.replicas).len(),
        })
    }
}
