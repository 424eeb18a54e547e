//! Common utilities and types shared across dpasswd

pub mod config;
pub mod error;
pub mod tracing_middleware;
pub mod utils;

pub use self::config::Config;
pub use error::{Error, Result};
pub use utils::{normalize_key, raft_id};
