mod cli;
mod connection;
mod notify;
mod process;
mod protocol;
mod transport;

use clap::Parser;
use cli::Cli;
use connection::{ConnectionManager, SessionEvent};
use lsp_bridge_shared::LifecycleState;
use notify::LogNotifier;
use protocol::StdioBridgeFactory;
use std::process::ExitCode;
use std::time::Duration;
use transport::TcpConnector;

use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> ExitCode {
    let cli = Cli::parse();

    // stdout carries protocol bytes, so logs go to stderr
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let code = runtime.block_on(run(cli));

    // A pending stdin read would otherwise keep the runtime alive
    runtime.shutdown_timeout(Duration::from_millis(100));
    code
}

async fn run(cli: Cli) -> ExitCode {
    let config = cli.connection_config();

    info!("lsp-bridge starting");
    info!("  Server: {}:{}", config.host, config.port);
    if let Some(spawn) = &config.spawn {
        info!("  Launching: {}", spawn);
    }

    let connector = TcpConnector::new(config.host.clone(), config.port);
    let factory = StdioBridgeFactory::new(cli.translate_newlines);
    let bridge_closed = factory.closed();

    let mut manager = ConnectionManager::activate(config, connector, factory, LogNotifier);
    let mut code = ExitCode::SUCCESS;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            _ = bridge_closed.notified() => {
                info!("Bridge closed, shutting down");
                break;
            }
            event = manager.recv() => {
                let Some(event) = event else {
                    break;
                };
                if !handle_session_event(event) || manager.state() == LifecycleState::Failed {
                    code = ExitCode::FAILURE;
                    break;
                }
            }
        }
    }

    manager.deactivate().await;
    info!("lsp-bridge stopped (state: {})", manager.state());
    code
}

/// Log a session event; returns false once the session cannot make progress
fn handle_session_event(event: SessionEvent) -> bool {
    match event {
        SessionEvent::Spawned { pid } => {
            info!("Language server launched (pid {:?})", pid);
        }
        SessionEvent::SpawnFailed { reason } => {
            warn!("Language server not launched: {}", reason);
        }
        SessionEvent::Dialing {
            generation,
            attempt,
        } => {
            debug!("Dial attempt {} ({})", attempt, generation);
        }
        SessionEvent::DialFailed { generation, reason } => {
            debug!("Dial {} failed: {}", generation, reason);
        }
        SessionEvent::Connected { peer, .. } => {
            info!("Connected to {}", peer);
        }
        SessionEvent::ClientStarted { .. } => {
            info!("Bridge running");
        }
        SessionEvent::ClientStartFailed { reason, .. } => {
            warn!("Bridge failed to start: {}", reason);
        }
        SessionEvent::RetriesExhausted { attempts } => {
            error!("Server unreachable after {} attempt(s)", attempts);
            return false;
        }
        SessionEvent::Closed => return false,
    }
    true
}
