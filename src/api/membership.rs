//! Membership manager: join and remove voters
//!
//! Configuration changes are log entries, so they are ordered with data
//! writes. Concurrent joins and removes are serialized by the engine.

use crate::common::{Error, Result};
use crate::raft::{Consensus, RaftState};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub struct MembershipManager<C> {
    consensus: Arc<C>,
    timeout: Duration,
}

impl<C> Clone for MembershipManager<C> {
    fn clone(&self) -> Self {
        Self {
            consensus: self.consensus.clone(),
            timeout: self.timeout,
        }
    }
}

impl<C: Consensus> MembershipManager<C> {
    pub fn new(consensus: Arc<C>, timeout: Duration) -> Self {
        Self { consensus, timeout }
    }

    /// Add `node_id` at `address` as a voter. Returns the engine stats.
    pub async fn join(&self, node_id: &str, address: &str) -> Result<BTreeMap<String, String>> {
        let node_id = require("node_id", node_id)?;
        let address = require("raft_address", address)?;
        self.ensure_leader()?;
        self.current_configuration().await?;

        self.consensus
            .add_voter(node_id.to_string(), address.to_string(), self.timeout)
            .await
            .map_err(|e| match e {
                Error::NotLeader | Error::ApplyTimeout => e,
                e => Error::Membership(format!("error add voter: {}", e)),
            })?;

        tracing::info!(node_id, address, "Node joined");
        Ok(self.stats())
    }

    /// Remove `node_id` from the voters. Returns the engine stats.
    pub async fn remove(&self, node_id: &str) -> Result<BTreeMap<String, String>> {
        let node_id = require("node_id", node_id)?;
        self.ensure_leader()?;
        self.current_configuration().await?;

        self.consensus
            .remove_server(node_id.to_string(), self.timeout)
            .await
            .map_err(|e| match e {
                Error::NotLeader | Error::ApplyTimeout => e,
                e => Error::Membership(format!(
                    "error removing existing node {}: {}",
                    node_id, e
                )),
            })?;

        tracing::info!(node_id, "Node removed");
        Ok(self.stats())
    }

    /// Engine statistics; available on any replica.
    pub fn stats(&self) -> BTreeMap<String, String> {
        self.consensus.stats()
    }

    fn ensure_leader(&self) -> Result<()> {
        if self.consensus.state() != RaftState::Leader {
            return Err(Error::NotLeader);
        }
        Ok(())
    }

    async fn current_configuration(&self) -> Result<()> {
        let configuration = self
            .consensus
            .configuration()
            .await
            .map_err(|e| Error::ConfigurationUnavailable(e.to_string()))?;
        tracing::debug!(%configuration, "Current cluster configuration");
        Ok(())
    }
}

fn require<'a>(field: &str, value: &'a str) -> Result<&'a str> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Error::InvalidRequest(format!("{} is empty", field)));
    }
    Ok(value)
}
