//! Commands that flow through the Raft replicated log.

use crate::common::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Operation carried by a [`CommandPayload`].
///
/// Parsing is case-insensitive and ignores surrounding whitespace. Anything
/// unrecognized is kept as `Unknown` so the state machine can reject it
/// without mutating storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operation {
    Set,
    Get,
    Delete,
    Unknown(String),
}

impl From<String> for Operation {
    fn from(raw: String) -> Self {
        match raw.trim().to_uppercase().as_str() {
            "SET" => Operation::Set,
            "GET" => Operation::Get,
            "DELETE" => Operation::Delete,
            _ => Operation::Unknown(raw),
        }
    }
}

impl From<Operation> for String {
    fn from(op: Operation) -> Self {
        match op {
            Operation::Set => "SET".to_string(),
            Operation::Get => "GET".to_string(),
            Operation::Delete => "DELETE".to_string(),
            Operation::Unknown(raw) => raw,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Set => write!(f, "SET"),
            Operation::Get => write!(f, "GET"),
            Operation::Delete => write!(f, "DELETE"),
            Operation::Unknown(raw) => write!(f, "{}", raw),
        }
    }
}

/// The unit of work serialized into the replicated log.
///
/// Field names are accepted in either case so records written by older
/// tooling (`Operation`/`Key`/`Value`) can still be restored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    #[serde(alias = "Operation")]
    pub operation: Operation,
    #[serde(alias = "Key")]
    pub key: String,
    #[serde(alias = "Value", default)]
    pub value: Option<Value>,
}

impl CommandPayload {
    pub fn set(key: impl Into<String>, value: Value) -> Self {
        Self {
            operation: Operation::Set,
            key: key.into(),
            value: Some(value),
        }
    }

    pub fn get(key: impl Into<String>) -> Self {
        Self {
            operation: Operation::Get,
            key: key.into(),
            value: None,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            operation: Operation::Delete,
            key: key.into(),
            value: None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Result of applying one committed command.
///
/// Produced exactly once per applied entry and handed back to the node that
/// proposed it. Never persisted.
#[derive(Debug)]
pub struct ApplyResponse {
    pub error: Option<crate::Error>,
    pub data: Value,
}

impl ApplyResponse {
    pub fn new(result: Result<()>, data: Value) -> Self {
        Self {
            error: result.err(),
            data,
        }
    }

    /// Convert into a `Result`, surfacing the store error if there was one.
    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.data),
        }
    }
}

/// Kind of a committed log entry delivered to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogType {
    Command,
    Configuration,
    Noop,
}

/// A committed log entry as seen by the state machine.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub log_type: LogType,
    pub data: Vec<u8>,
}

impl LogEntry {
    pub fn command(index: u64, term: u64, data: Vec<u8>) -> Self {
        Self {
            index,
            term,
            log_type: LogType::Command,
            data,
        }
    }
}
