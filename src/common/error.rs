//! Error types for dpasswd

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Request Errors ===
    #[error("key is empty")]
    EmptyKey,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("error binding: {0}")]
    Binding(String),

    // === Storage Errors ===
    #[error("error getting key {0} from storage: Key not found")]
    NotFound(String),

    #[error("storage error: {0}")]
    Store(#[from] sled::Error),

    #[error("decode error: {0}")]
    Decode(String),

    // === Raft Errors ===
    #[error("not the leader")]
    NotLeader,

    #[error("Raft error: {0}")]
    Raft(#[from] raft::Error),

    #[error("error applying data to raft cluster: timed out waiting for commit")]
    ApplyTimeout,

    #[error("error applying data to raft cluster: {0}")]
    Apply(String),

    #[error("error response is not match apply response")]
    UnexpectedResponseType,

    #[error("failed to get raft configuration: {0}")]
    ConfigurationUnavailable(String),

    #[error("{0}")]
    Membership(String),

    #[error("restore aborted: {0}")]
    RestoreAborted(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Client Errors ===
    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a retryable error?
    ///
    /// A timed-out apply is retryable but not known to have failed: the entry
    /// may still commit after the caller gave up.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NotLeader | Error::ApplyTimeout | Error::Apply(_)
        )
    }

    /// Convert to HTTP status code
    ///
    /// Every expected control-plane failure is a 422; callers inspect the
    /// `error` body rather than the status taxonomy.
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::Io(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }
}

impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let status = self.to_http_status();
        let body = serde_json::json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Decode(e.to_string())
    }
}

impl From<sled::transaction::TransactionError<Error>> for Error {
    fn from(e: sled::transaction::TransactionError<Error>) -> Self {
        match e {
            sled::transaction::TransactionError::Abort(inner) => inner,
            sled::transaction::TransactionError::Storage(err) => Error::Store(err),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.to_string())
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Internal(e.to_string())
    }
}
