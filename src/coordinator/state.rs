//! Leadership state shared between the coordinator and its observers

use crate::lease::PrimaryInfo;
use serde::{Deserialize, Serialize};

/// Where a node stands with respect to the lease
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseState {
    Initializing,
    Primary,
    Replica,
    Unleased,
}

impl std::fmt::Display for LeaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaseState::Initializing => write!(f, "initializing"),
            LeaseState::Primary => write!(f, "primary"),
            LeaseState::Replica => write!(f, "replica"),
            LeaseState::Unleased => write!(f, "unleased"),
        }
    }
}

/// Identity a node presents to its peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub id: String,
    pub advertise_url: String,
}

/// Point-in-time view of the coordinator's state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub state: LeaseState,
    /// Current primary, this node included when it holds the lease
    pub primary: Option<PrimaryInfo>,
    /// Fencing epoch of the held lease
    pub epoch: Option<u64>,
    /// Registered with the current primary (replicas only)
    pub synced: bool,
}

impl Snapshot {
    pub fn initializing() -> Self {
        Self {
            state: LeaseState::Initializing,
            primary: None,
            epoch: None,
            synced: false,
        }
    }

    pub fn is_primary(&self) -> bool {
        self.state == LeaseState::Primary
    }
}
