//! Control plane: writes, reads and deletes
//!
//! Writes and deletes go through consensus and only succeed on the leader.
//! Reads are served straight from the local store and may be stale.

use crate::common::{normalize_key, Error, Result};
use crate::fsm::{CommandPayload, Storage};
use crate::raft::{Consensus, RaftState};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// A key with its value, as echoed back to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: Value,
}

pub struct ControlPlane<C> {
    consensus: Arc<C>,
    storage: Storage,
    apply_timeout: Duration,
}

impl<C> Clone for ControlPlane<C> {
    fn clone(&self) -> Self {
        Self {
            consensus: self.consensus.clone(),
            storage: self.storage.clone(),
            apply_timeout: self.apply_timeout,
        }
    }
}

impl<C: Consensus> ControlPlane<C> {
    pub fn new(consensus: Arc<C>, storage: Storage, apply_timeout: Duration) -> Self {
        Self {
            consensus,
            storage,
            apply_timeout,
        }
    }

    pub fn consensus(&self) -> &Arc<C> {
        &self.consensus
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Replicate `key = value`. Returns the normalized key and the value.
    pub async fn write(&self, key: &str, value: Value) -> Result<KeyValue> {
        let key = normalize_key(key)?;
        self.ensure_leader()?;

        let cmd = CommandPayload::set(key.clone(), value.clone());
        self.submit(cmd).await?;
        tracing::debug!(key = %key, "Write committed");
        Ok(KeyValue { key, value })
    }

    /// Read from the local replica, bypassing consensus.
    pub fn read(&self, key: &str) -> Result<KeyValue> {
        let key = normalize_key(key)?;
        let value = self.storage.get(&key)?;
        Ok(KeyValue { key, value })
    }

    /// Replicate the removal of `key`.
    pub async fn delete(&self, key: &str) -> Result<KeyValue> {
        let key = normalize_key(key)?;
        self.ensure_leader()?;

        self.submit(CommandPayload::delete(key.clone())).await?;
        tracing::debug!(key = %key, "Delete committed");
        Ok(KeyValue {
            key,
            value: Value::Null,
        })
    }

    /// Cheap pre-check; the engine rejects proposals on non-leaders anyway.
    fn ensure_leader(&self) -> Result<()> {
        if self.consensus.state() != RaftState::Leader {
            return Err(Error::NotLeader);
        }
        Ok(())
    }

    async fn submit(&self, cmd: CommandPayload) -> Result<Value> {
        let data = cmd.encode()?;
        let response = self
            .consensus
            .apply(data, self.apply_timeout)
            .await?
            .ok_or(Error::UnexpectedResponseType)?;
        response.into_result()
    }
}
