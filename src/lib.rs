//! # dpasswd
//!
//! A replicated key-value store for client-encrypted secrets:
//! - Raft consensus orders every write before it touches storage
//! - A deterministic state machine applies committed commands to sled
//! - Reads are served from the local replica (fast, possibly stale)
//! - Values are opaque JSON; the client seals secrets before sending them
//!
//! ## Architecture
//!
//! ```text
//!            HTTP (POST /db, GET /db/:key, /raft/*)
//!                          │
//!              ┌───────────▼────────────┐
//!              │     Control plane      │  leader-only writes
//!              └───────────┬────────────┘
//!                          │ apply(command)
//!              ┌───────────▼────────────┐      TCP      ┌─────────────┐
//!              │   Raft worker (leader) │ ────────────► │  Followers  │
//!              └───────────┬────────────┘               └──────┬──────┘
//!                          │ committed entries, in order         │
//!              ┌───────────▼────────────┐               ┌──────▼──────┐
//!              │   FSM  ──►  sled       │               │ FSM ► sled  │
//!              └────────────────────────┘               └─────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a cluster
//! ```bash
//! dpasswd-node --id node1 --http-addr 127.0.0.1:3100 --raft-addr 127.0.0.1:4200 --bootstrap
//! dpasswd-node --id node2 --http-addr 127.0.0.1:3101 --raft-addr 127.0.0.1:4201
//! dpasswd --addr 127.0.0.1:3100 join node2 127.0.0.1:4201
//! ```
//!
//! ### Store and fetch a secret
//! ```bash
//! dpasswd --addr 127.0.0.1:3100 add github
//! dpasswd --addr 127.0.0.1:3101 get github
//! ```

#![allow(clippy::result_large_err)]

pub mod api;
pub mod client;
pub mod common;
pub mod fsm;
pub mod raft;

// Re-export commonly used types
pub use api::{Node, RunningNode};
pub use common::{Config, Error, Result};
pub use fsm::{Fsm, StateMachine, Storage};
pub use crate::raft::{Consensus, RaftState};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
