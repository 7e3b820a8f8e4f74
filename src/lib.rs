//! # minilease
//!
//! Lease-based primary election for replicated databases:
//! - Static leases (fixed primary) and distributed-lock leases (Consul
//!   sessions with TTL and lock delay)
//! - A coordinator state machine tracking whether this node is primary
//! - Leadership handoff from the current primary to a candidate
//! - A readiness barrier and a request gate holding clients during
//!   transitions
//! - Fencing epochs so storage can reject writes from a deposed primary

#![allow(clippy::result_large_err)]
//!
//! ## Architecture
//!
//! ```text
//!              ┌──────────────────────────┐
//!              │  Lock service (Consul)   │
//!              │  key: minilease/primary  │
//!              └───▲──────────────────▲───┘
//!    acquire/renew │                  │ observe
//!   ┌──────────────┴─────┐  register ┌┴───────────────────┐
//!   │ Node A (primary)   │◀──────────│ Node B (replica)   │
//!   │  node API :20202   │  handoff  │  node API :20202   │
//!   │  proxy    :8080    │           │  proxy    :8080    │
//!   └────────────────────┘           └────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Run a node
//! minilease serve --config ./minilease.toml
//!
//! # Inspect leadership
//! minilease info --node http://node1:20202
//!
//! # Move the primary to node2
//! minilease promote --node http://node2:20202
//! ```

pub mod common;
pub mod coordinator;
pub mod lease;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use coordinator::{Coordinator, NodeServer};
pub use lease::{Leaser, PrimaryInfo};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
