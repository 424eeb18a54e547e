//! Replicated finite-state machine
//!
//! The state machine is the only writer of the local store. The consensus
//! engine feeds it committed entries one at a time, in log order, so a
//! replica's store is a pure function of the commands it has applied.
//!
//! Per entry: `Received -> Decoded -> Dispatched{SET|GET|DELETE|Unknown}
//! -> Applied|Rejected`. Rejected entries are logged and skipped; they never
//! halt the apply stream.

pub mod command;
pub mod snapshot;
pub mod storage;

pub use command::{ApplyResponse, CommandPayload, LogEntry, LogType, Operation};
pub use snapshot::{FsmSnapshot, NoopSnapshot, StagedImage};
pub use storage::Storage;

use crate::common::{Error, Result};
use serde_json::Value;
use std::io::{Read, Write};

/// Callbacks the consensus engine drives.
pub trait StateMachine: Send + Sync + 'static {
    /// Apply one committed entry. `None` means "no usable response".
    fn apply(&self, entry: &LogEntry) -> Option<ApplyResponse>;

    /// Produce a snapshot for log compaction.
    fn snapshot(&self) -> Result<Box<dyn FsmSnapshot>>;

    /// Load a snapshot image on top of local state, setting every record.
    /// Keys absent from the image are left alone. The source is dropped
    /// (closed) before returning, whatever the outcome.
    fn restore(&self, source: Box<dyn Read + Send>) -> Result<usize>;

    /// Replace local state with a snapshot image: afterwards the store holds
    /// exactly the image's records. Used when catching up from a leader.
    fn install(&self, source: Box<dyn Read + Send>) -> Result<usize>;

    /// Write the whole key space as a snapshot image.
    fn export(&self, sink: &mut dyn Write) -> Result<usize>;
}

/// State machine backed by the sled [`Storage`].
#[derive(Clone)]
pub struct Fsm {
    storage: Storage,
}

impl Fsm {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    fn dispatch(&self, cmd: CommandPayload) -> Option<ApplyResponse> {
        if cmd.key.trim().is_empty() {
            tracing::warn!(operation = %cmd.operation, "Command with empty key");
            return Some(ApplyResponse::new(Err(Error::EmptyKey), Value::Null));
        }
        match cmd.operation {
            Operation::Set => {
                let result = self
                    .storage
                    .set(&cmd.key, cmd.value.as_ref())
                    .map(|_| ());
                Some(ApplyResponse::new(
                    result,
                    cmd.value.unwrap_or(Value::Null),
                ))
            }
            Operation::Get => match self.storage.get(&cmd.key) {
                Ok(data) => Some(ApplyResponse::new(Ok(()), data)),
                Err(err) => Some(ApplyResponse::new(
                    Err(err),
                    Value::Object(Default::default()),
                )),
            },
            Operation::Delete => Some(ApplyResponse::new(
                self.storage.delete(&cmd.key),
                Value::Null,
            )),
            Operation::Unknown(op) => {
                tracing::warn!(operation = %op, key = %cmd.key, "Unsupported operation in log entry");
                None
            }
        }
    }

    /// Decode the whole image, turn it into one batch and apply it. Nothing
    /// is written unless every record decodes.
    fn load<F>(&self, source: Box<dyn Read + Send>, into_batch: F) -> Result<usize>
    where
        F: FnOnce(StagedImage) -> Result<sled::Batch>,
    {
        snapshot::read_image(source)
            .and_then(|staged| {
                let count = staged.records();
                self.storage.apply_batch(into_batch(staged)?)?;
                self.storage.flush()?;
                Ok(count)
            })
            .map_err(|e| {
                tracing::error!("Restore aborted: {}", e);
                Error::RestoreAborted(e.to_string())
            })
    }
}

impl StateMachine for Fsm {
    fn apply(&self, entry: &LogEntry) -> Option<ApplyResponse> {
        if entry.log_type != LogType::Command {
            tracing::warn!(index = entry.index, "Not a raft log command type");
            return None;
        }

        let cmd = match CommandPayload::decode(&entry.data) {
            Ok(cmd) => cmd,
            Err(e) => {
                tracing::warn!(index = entry.index, "Error decoding store payload: {}", e);
                return None;
            }
        };

        tracing::debug!(
            index = entry.index,
            term = entry.term,
            operation = %cmd.operation,
            key = %cmd.key,
            "Applying command"
        );
        self.dispatch(cmd)
    }

    fn snapshot(&self) -> Result<Box<dyn FsmSnapshot>> {
        Ok(Box::new(NoopSnapshot))
    }

    fn restore(&self, source: Box<dyn Read + Send>) -> Result<usize> {
        tracing::info!("Restore started: reading records from snapshot");
        let restored = self.load(source, |staged| Ok(staged.merging()))?;
        tracing::info!("Restore finished: {} records restored", restored);
        Ok(restored)
    }

    fn install(&self, source: Box<dyn Read + Send>) -> Result<usize> {
        let storage = &self.storage;
        let installed = self.load(source, |staged| staged.replacing(storage))?;
        tracing::info!("Snapshot installed: store replaced with {} records", installed);
        Ok(installed)
    }

    fn export(&self, sink: &mut dyn Write) -> Result<usize> {
        snapshot::write_image(&self.storage, sink)
    }
}
