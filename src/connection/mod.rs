//! Connection management for the socket side of the bridge
//!
//! This module handles:
//! - Launching the language server before the first dial
//! - Dialing with capped exponential backoff and stale-attempt immunity
//! - Handing the connected stream to a protocol client
//! - Ordered teardown on deactivation

mod backoff;
mod duplex;
mod manager;

pub use backoff::RetryPolicy;
pub use duplex::DuplexHandle;
pub use manager::{ClientStartFailurePolicy, ConnectionConfig, ConnectionManager, SessionEvent};
