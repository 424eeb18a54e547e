//! Storage adapter over the embedded sled database
//!
//! Every mutation runs inside a sled transaction: the closure commits when
//! it returns `Ok` and is discarded when it returns an error. Values are
//! stored as JSON bytes and decoded lazily on read.

use crate::common::{Error, Result};
use serde_json::Value;
use sled::transaction::{ConflictableTransactionResult, TransactionalTree};
use std::path::Path;

/// Handle to the local replica's key space.
///
/// Cheap to clone; clones share the same underlying database. The state
/// machine is the only writer, the control plane's read path only reads.
#[derive(Clone)]
pub struct Storage {
    db: sled::Db,
}

impl Storage {
    /// Open or create the store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// In-memory store that is removed on drop (tests, tooling)
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    /// Run `f` in a write transaction.
    pub fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: Fn(&TransactionalTree) -> ConflictableTransactionResult<T, Error>,
    {
        Ok(self.db.transaction(f)?)
    }

    /// Read and decode the value stored at `key`.
    pub fn get(&self, key: &str) -> Result<Value> {
        let bytes = self
            .db
            .get(key.as_bytes())?
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        decode_value(&bytes)
    }

    /// Store `value` at `key`.
    ///
    /// Returns `false` without touching storage when the value encodes to
    /// nothing meaningful (see [`encode_value`]).
    pub fn set(&self, key: &str, value: Option<&Value>) -> Result<bool> {
        let Some(bytes) = encode_value(value)? else {
            return Ok(false);
        };
        self.update(|tx| {
            tx.insert(key.as_bytes(), bytes.as_slice())?;
            Ok(())
        })?;
        Ok(true)
    }

    /// Remove `key`. Removing a missing key is not an error.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.update(|tx| {
            tx.remove(key.as_bytes())?;
            Ok(())
        })
    }

    /// Apply a staged batch atomically.
    pub fn apply_batch(&self, batch: sled::Batch) -> Result<()> {
        self.db.apply_batch(batch)?;
        Ok(())
    }

    /// Iterate over every stored record in key order.
    pub fn scan(&self) -> impl Iterator<Item = Result<(String, Value)>> + '_ {
        self.db.iter().map(|item| {
            let (key, value) = item?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| Error::Decode(format!("invalid UTF-8 key: {}", e)))?;
            Ok((key, decode_value(&value)?))
        })
    }

    /// Iterate over every stored key without decoding values.
    pub fn keys(&self) -> impl Iterator<Item = Result<String>> + '_ {
        self.db.iter().keys().map(|key| {
            String::from_utf8(key?.to_vec())
                .map_err(|e| Error::Decode(format!("invalid UTF-8 key: {}", e)))
        })
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

/// Whether a value is an empty write (absent, `null` or `""`).
pub fn is_empty_value(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    }
}

/// Encode a value for storage, or `None` for an empty write.
pub fn encode_value(value: Option<&Value>) -> Result<Option<Vec<u8>>> {
    if is_empty_value(value) {
        return Ok(None);
    }
    let bytes = serde_json::to_vec(&value)?;
    Ok(Some(bytes))
}

/// Decode stored bytes. An empty byte string decodes as `null`.
pub fn decode_value(bytes: &[u8]) -> Result<Value> {
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(bytes)
        .map_err(|e| Error::Decode(format!("error unmarshal data: {}", e)))
}
