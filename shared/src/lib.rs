//! lsp-bridge Shared Types
//!
//! This crate provides the connection lifecycle state machine and the stream
//! codecs used by the bridge between an editor and a socket-based language
//! server.

pub mod codec;
pub mod state_machine;

pub use state_machine::{
    Generation, LifecycleEvent, LifecycleMachine, LifecycleState, NotificationState,
    TransitionResult,
};

/// Deployment defaults for the bridge
pub mod defaults {
    /// Host the language server listens on
    pub const HOST: &str = "127.0.0.1";

    /// Port the language server listens on
    pub const PORT: u16 = 9170;

    /// Delay before the first retry after a failed dial
    pub const INITIAL_BACKOFF_MS: u64 = 200;

    /// Upper bound for the delay between dial attempts
    pub const MAX_BACKOFF_MS: u64 = 5_000;

    /// Dial attempts per activation before giving up (about an hour at the cap)
    pub const MAX_DIAL_ATTEMPTS: u32 = 720;

    /// Time allowed for a single dial to complete
    pub const CONNECT_TIMEOUT_MS: u64 = 3_000;

    /// Time a managed process gets to exit after SIGTERM before it is killed
    pub const SHUTDOWN_GRACE_MS: u64 = 2_000;

    /// File-watch glob handed to the protocol client
    pub const WATCH_PATTERN: &str = "**/*.*";

    /// Document scheme handed to the protocol client
    pub const SELECTOR_SCHEME: &str = "file";

    /// Document language handed to the protocol client
    pub const SELECTOR_LANGUAGE: &str = "lua";

    /// Shown once when the server cannot be reached
    pub const NOT_REACHABLE_MESSAGE: &str =
        "[Language Server] Failed to establish socket to server. Make sure it's running!";
}
