//! Consensus engine integration
//!
//! The control plane talks to consensus only through [`Consensus`]. The
//! engine behind it ([`runtime::RaftHandle`]) wraps tikv's raft-rs: a single
//! worker task owns the `RawNode`, drives ticks, ships messages to peers over
//! [`transport`], and feeds committed entries to the state machine in log
//! order.

pub mod node;
pub mod runtime;
pub mod transport;

pub use runtime::{spawn_raft, RaftHandle, RaftOptions};

use crate::common::Result;
use crate::fsm::ApplyResponse;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

/// Role of the local node as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftState {
    Follower,
    Candidate,
    Leader,
    Shutdown,
}

impl std::fmt::Display for RaftState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftState::Follower => write!(f, "Follower"),
            RaftState::Candidate => write!(f, "Candidate"),
            RaftState::Leader => write!(f, "Leader"),
            RaftState::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl From<raft::StateRole> for RaftState {
    fn from(role: raft::StateRole) -> Self {
        match role {
            raft::StateRole::Leader => RaftState::Leader,
            raft::StateRole::Candidate | raft::StateRole::PreCandidate => RaftState::Candidate,
            raft::StateRole::Follower => RaftState::Follower,
        }
    }
}

/// A cluster member
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    pub address: String,
}

/// Voting members as of the latest applied configuration entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfiguration {
    pub servers: Vec<Server>,
}

impl ClusterConfiguration {
    pub fn contains(&self, id: &str) -> bool {
        self.servers.iter().any(|s| s.id == id)
    }
}

impl std::fmt::Display for ClusterConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, server) in self.servers.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{{ID:{} Address:{}}}", server.id, server.address)?;
        }
        write!(f, "]")
    }
}

/// The consensus engine as consumed by the control plane.
///
/// `apply` resolves once the entry is committed and applied locally, to the
/// state machine's response for that entry (`None` when the state machine
/// produced no usable response). A timeout means "commit status unknown":
/// the entry may still commit later.
pub trait Consensus: Send + Sync + 'static {
    fn state(&self) -> RaftState;

    fn apply(
        &self,
        command: Vec<u8>,
        timeout: Duration,
    ) -> impl Future<Output = Result<Option<ApplyResponse>>> + Send;

    fn configuration(&self) -> impl Future<Output = Result<ClusterConfiguration>> + Send;

    /// Add a voter. Appended unconditionally, with no prior-index check.
    fn add_voter(
        &self,
        id: String,
        address: String,
        timeout: Duration,
    ) -> impl Future<Output = Result<()>> + Send;

    fn remove_server(
        &self,
        id: String,
        timeout: Duration,
    ) -> impl Future<Output = Result<()>> + Send;

    fn stats(&self) -> BTreeMap<String, String>;
}
