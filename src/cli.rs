//! Command-line interface for the `lsp-bridge` binary

use crate::connection::{ClientStartFailurePolicy, ConnectionConfig, RetryPolicy};
use crate::process::SpawnSpec;
use crate::protocol::{ClientOptions, DocumentSelector};
use clap::Parser;
use lsp_bridge_shared::defaults;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "lsp-bridge",
    version,
    about = "Bridge an editor's stdio to a language server listening on a socket",
    long_about = "Connects to a language server over TCP, optionally launching it first, \
        and forwards stdin/stdout over the connection.\n\n\
        Examples:\n  \
        lsp-bridge --port 9170\n  \
        lsp-bridge --spawn ./pluto-lsp --arg=--port --arg 9170 --startup-delay-ms 500"
)]
pub struct Cli {
    /// Server host
    #[arg(long, default_value = defaults::HOST)]
    pub host: String,

    /// Server port
    #[arg(long, default_value_t = defaults::PORT)]
    pub port: u16,

    /// Dial once and give up on failure
    #[arg(long)]
    pub no_retry: bool,

    /// Stop after this many dial attempts
    #[arg(long, default_value_t = defaults::MAX_DIAL_ATTEMPTS)]
    pub max_attempts: u32,

    #[arg(long, default_value_t = defaults::INITIAL_BACKOFF_MS)]
    pub initial_backoff_ms: u64,

    #[arg(long, default_value_t = defaults::MAX_BACKOFF_MS)]
    pub max_backoff_ms: u64,

    /// Use exact backoff delays
    #[arg(long)]
    pub no_jitter: bool,

    /// Time allowed for a single dial
    #[arg(long, default_value_t = defaults::CONNECT_TIMEOUT_MS)]
    pub connect_timeout_ms: u64,

    /// Language server executable to launch before dialing
    #[arg(long, value_name = "PATH")]
    pub spawn: Option<PathBuf>,

    /// Argument for the launched server (repeatable, passed verbatim)
    #[arg(long = "arg", value_name = "ARG", allow_hyphen_values = true, requires = "spawn")]
    pub args: Vec<String>,

    /// Wait this long after launching the server before the first dial
    #[arg(long, default_value_t = 0)]
    pub startup_delay_ms: u64,

    /// Time the server and client get to stop before being killed
    #[arg(long, default_value_t = defaults::SHUTDOWN_GRACE_MS)]
    pub shutdown_grace_ms: u64,

    /// Document selector as scheme:language (repeatable)
    #[arg(long = "selector", value_name = "SCHEME:LANGUAGE")]
    pub selectors: Vec<DocumentSelector>,

    /// File-watch glob handed to the protocol client
    #[arg(long, default_value = defaults::WATCH_PATTERN)]
    pub watch_pattern: String,

    /// Dial again when the protocol client fails to start
    #[arg(long)]
    pub redial_on_client_failure: bool,

    /// Translate line endings for interactive console use
    #[arg(long)]
    pub translate_newlines: bool,
}

impl Cli {
    pub fn connection_config(&self) -> ConnectionConfig {
        let retry = RetryPolicy {
            enabled: !self.no_retry,
            initial_delay: Duration::from_millis(self.initial_backoff_ms),
            max_delay: Duration::from_millis(self.max_backoff_ms),
            jitter: !self.no_jitter,
            max_attempts: Some(self.max_attempts),
        };

        let spawn = self.spawn.as_ref().map(|program| {
            self.args
                .iter()
                .fold(SpawnSpec::new(program.clone()), |spec, arg| spec.arg(arg.clone()))
        });

        let mut client_options = ClientOptions {
            watch_pattern: self.watch_pattern.clone(),
            ..ClientOptions::default()
        };
        if !self.selectors.is_empty() {
            client_options.selectors = self.selectors.clone();
        }

        let client_start_failure = if self.redial_on_client_failure {
            ClientStartFailurePolicy::Redial
        } else {
            ClientStartFailurePolicy::Fatal
        };

        ConnectionConfig {
            host: self.host.clone(),
            port: self.port,
            retry,
            spawn,
            startup_delay: Duration::from_millis(self.startup_delay_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            client_options,
            client_start_failure,
            ..ConnectionConfig::default()
        }
    }
}
