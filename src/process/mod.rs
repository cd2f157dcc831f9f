//! Language server processes owned by the bridge
//!
//! When the bridge is configured to start the server itself, the child is
//! launched once per activation and terminated on deactivation: SIGTERM
//! first, then a forceful kill once the grace period runs out.

mod managed;

pub use managed::{ManagedProcess, SpawnSpec};
