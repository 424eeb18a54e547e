//! Control plane: key operations, membership and the HTTP surface

pub mod control;
pub mod http;
pub mod membership;
pub mod server;

pub use control::{ControlPlane, KeyValue};
pub use http::{create_router, AppState};
pub use membership::MembershipManager;
pub use server::{Node, RunningNode};
