//! Leadership coordination
//!
//! The coordinator decides whether this node is primary:
//! - Lease monitoring and renewal against a [`Leaser`](crate::lease::Leaser)
//! - Handoff of the lease to a candidate on request
//! - A readiness barrier released once the node is primary or synced
//! - A request gate (and proxy) holding clients during transitions

pub mod gate;
pub mod http;
pub mod leadership;
pub mod peer;
pub mod proxy;
pub mod ready;
pub mod server;
pub mod state;

pub use gate::{Admission, RequestGate};
pub use leadership::{Coordinator, CoordinatorOptions, WriteGuard};
pub use peer::{HandoffRequest, HttpPeerClient, PeerClient, ReplicaRegistration};
pub use ready::ReadyGate;
pub use server::{NodeServer, RunningNode};
pub use state::{LeaseState, NodeIdentity, Snapshot};
