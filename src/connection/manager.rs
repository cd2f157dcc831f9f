//! Connection manager: dial-retry loop, managed server process, one-shot
//! notification and teardown

use crate::connection::backoff::RetryPolicy;
use crate::connection::duplex::DuplexHandle;
use crate::notify::Notifier;
use crate::process::{ManagedProcess, SpawnSpec};
use crate::protocol::{ClientOptions, ProtocolClient, ProtocolClientFactory};
use crate::transport::{TransportConnector, TransportStream};
use anyhow::{anyhow, Result};
use lsp_bridge_shared::{
    defaults, Generation, LifecycleEvent, LifecycleMachine, LifecycleState, TransitionResult,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

/// What to do when the protocol client cannot start on a connected socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientStartFailurePolicy {
    /// Give up; the activation stays failed until deactivated
    #[default]
    Fatal,
    /// Drop the socket and dial again
    Redial,
}

/// Configuration for one activation
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Retry behaviour after a failed dial
    pub retry: RetryPolicy,
    /// Server to launch before dialing
    pub spawn: Option<SpawnSpec>,
    /// Settle time between launching the server and the first dial
    pub startup_delay: Duration,
    /// Time allowed for one dial
    pub connect_timeout: Duration,
    /// Time the server and client get to stop before being forced
    pub shutdown_grace: Duration,
    /// Passed through to the protocol client
    pub client_options: ClientOptions,
    /// Reaction to a protocol client that fails to start
    pub client_start_failure: ClientStartFailurePolicy,
    /// Shown once if the server cannot be reached
    pub notify_message: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: defaults::HOST.into(),
            port: defaults::PORT,
            retry: RetryPolicy::default(),
            spawn: None,
            startup_delay: Duration::ZERO,
            connect_timeout: Duration::from_millis(defaults::CONNECT_TIMEOUT_MS),
            shutdown_grace: Duration::from_millis(defaults::SHUTDOWN_GRACE_MS),
            client_options: ClientOptions::default(),
            client_start_failure: ClientStartFailurePolicy::default(),
            notify_message: defaults::NOT_REACHABLE_MESSAGE.into(),
        }
    }
}

/// Events emitted by the connection manager
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Managed server process launched
    Spawned { pid: Option<u32> },
    /// Managed server process could not be launched; dialing continues
    SpawnFailed { reason: String },
    /// Dial attempt started
    Dialing { generation: Generation, attempt: u32 },
    /// Dial attempt failed
    DialFailed { generation: Generation, reason: String },
    /// Socket connected
    Connected { generation: Generation, peer: String },
    /// Protocol client running on the connected socket
    ClientStarted { generation: Generation },
    /// Protocol client could not be started
    ClientStartFailed { generation: Generation, reason: String },
    /// No further dial attempts will be made
    RetriesExhausted { attempts: u32 },
    /// Everything torn down
    Closed,
}

/// Handle to one activation of the bridge
///
/// Created by [`ConnectionManager::activate`]; all work happens on a
/// background task owned by the handle. Dropping the handle tears the
/// session down just like [`ConnectionManager::deactivate`], without waiting.
pub struct ConnectionManager {
    shutdown_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<LifecycleState>,
    event_rx: mpsc::UnboundedReceiver<SessionEvent>,
    driver: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    /// Start a session: launch the server if configured, then dial until a
    /// protocol client is running or retries run out
    pub fn activate<C, F, N>(
        config: ConnectionConfig,
        connector: C,
        client_factory: F,
        notifier: N,
    ) -> Self
    where
        C: TransportConnector,
        F: ProtocolClientFactory,
        N: Notifier,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(LifecycleState::Idle);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        info!(
            "[CONN] Activating: {} server at {}",
            connector.name(),
            connector.target()
        );

        let (driver, dial_rx) =
            SessionDriver::new(config, connector, client_factory, notifier, event_tx, state_tx);

        Self {
            shutdown_tx,
            state_rx,
            event_rx,
            driver: Some(tokio::spawn(driver.run(shutdown_rx, dial_rx))),
        }
    }

    /// Tear the session down and wait until that is finished
    ///
    /// Safe to call any number of times and from any phase; never fails.
    pub async fn deactivate(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.await {
                error!("[CONN] Session task ended abnormally: {}", e);
            }
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> LifecycleState {
        *self.state_rx.borrow()
    }

    /// Receive the next session event
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.event_rx.recv().await
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    StartupDelay,
    Backoff,
}

struct PendingTimer {
    deadline: Instant,
    kind: TimerKind,
}

/// The current dial attempt
struct SocketHandle {
    generation: Generation,
    task: JoinHandle<()>,
}

impl SocketHandle {
    fn abandon(self) {
        self.task.abort();
    }
}

struct DialOutcome<S> {
    generation: Generation,
    result: Result<S>,
}

/// Owns every resource of one activation; runs on its own task
struct SessionDriver<C: TransportConnector, F, N> {
    config: ConnectionConfig,
    connector: Arc<C>,
    client_factory: F,
    notifier: N,
    machine: LifecycleMachine,
    process: Option<ManagedProcess>,
    timer: Option<PendingTimer>,
    socket: Option<SocketHandle>,
    client: Option<Box<dyn ProtocolClient>>,
    dial_tx: mpsc::UnboundedSender<DialOutcome<C::Stream>>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    state_tx: watch::Sender<LifecycleState>,
}

impl<C, F, N> SessionDriver<C, F, N>
where
    C: TransportConnector,
    F: ProtocolClientFactory,
    N: Notifier,
{
    fn new(
        config: ConnectionConfig,
        connector: C,
        client_factory: F,
        notifier: N,
        event_tx: mpsc::UnboundedSender<SessionEvent>,
        state_tx: watch::Sender<LifecycleState>,
    ) -> (Self, mpsc::UnboundedReceiver<DialOutcome<C::Stream>>) {
        let (dial_tx, dial_rx) = mpsc::unbounded_channel();
        let driver = Self {
            config,
            connector: Arc::new(connector),
            client_factory,
            notifier,
            machine: LifecycleMachine::new(),
            process: None,
            timer: None,
            socket: None,
            client: None,
            dial_tx,
            event_tx,
            state_tx,
        };
        (driver, dial_rx)
    }

    async fn run(
        mut self,
        mut shutdown_rx: watch::Receiver<bool>,
        mut dial_rx: mpsc::UnboundedReceiver<DialOutcome<C::Stream>>,
    ) {
        self.launch();

        // The handle sends `true` before it goes away
        while !*shutdown_rx.borrow() {
            let deadline = self.timer.as_ref().map(|timer| timer.deadline);
            tokio::select! {
                biased;

                // A closed channel means the handle was dropped
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }

                _ = wait_for(deadline) => self.on_timer(),

                Some(outcome) = dial_rx.recv() => {
                    self.on_dial_outcome(outcome, &mut shutdown_rx).await;
                }
            }
        }

        self.teardown().await;
    }

    /// Launch the server if configured, then either arm the startup timer or
    /// dial right away
    fn launch(&mut self) {
        if let Some(spec) = self.config.spawn.clone() {
            match ManagedProcess::spawn(&spec) {
                Ok(process) => {
                    let pid = process.id();
                    self.process = Some(process);
                    self.transition(LifecycleEvent::ProcessSpawned);
                    self.emit(SessionEvent::Spawned { pid });

                    if !self.config.startup_delay.is_zero() {
                        debug!(
                            "[CONN] Waiting {:?} for the server to start",
                            self.config.startup_delay
                        );
                        self.timer = Some(PendingTimer {
                            deadline: Instant::now() + self.config.startup_delay,
                            kind: TimerKind::StartupDelay,
                        });
                        return;
                    }
                }
                Err(e) => {
                    let reason = format!("{:#}", e);
                    error!("[CONN] Could not launch server: {}", reason);
                    self.emit(SessionEvent::SpawnFailed { reason });
                }
            }
        }

        self.start_dial();
    }

    fn on_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            debug!("[CONN] {:?} timer fired", timer.kind);
            self.start_dial();
        }
    }

    fn start_dial(&mut self) {
        let generation = match self.transition(LifecycleEvent::DialStarted) {
            TransitionResult::Dialing(generation) => generation,
            other => {
                debug!("[CONN] Not dialing: {:?}", other);
                return;
            }
        };
        let attempt = self.machine.attempts();
        debug!(
            "[CONN] Dialing {} (attempt {}, generation {})",
            self.connector.target(),
            attempt,
            generation
        );
        self.emit(SessionEvent::Dialing {
            generation,
            attempt,
        });

        let connector = self.connector.clone();
        let dial_tx = self.dial_tx.clone();
        let connect_timeout = self.config.connect_timeout;
        let task = tokio::spawn(async move {
            let result = match timeout(connect_timeout, connector.connect()).await {
                Ok(result) => result,
                Err(_) => Err(anyhow!("timed out after {:?}", connect_timeout)),
            };
            let _ = dial_tx.send(DialOutcome { generation, result });
        });

        if let Some(previous) = self.socket.replace(SocketHandle { generation, task }) {
            debug!("[CONN] Abandoning dial {}", previous.generation);
            previous.abandon();
        }
    }

    async fn on_dial_outcome(
        &mut self,
        outcome: DialOutcome<C::Stream>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) {
        let DialOutcome { generation, result } = outcome;

        match result {
            Ok(stream) => match self.transition(LifecycleEvent::DialSucceeded(generation)) {
                TransitionResult::Connected(generation) => {
                    self.bind_client(stream, generation, shutdown_rx).await;
                }
                TransitionResult::Stale { .. } => {
                    debug!("[CONN] Closing socket from stale dial {}", generation);
                }
                other => warn!("[CONN] Unexpected connect result: {:?}", other),
            },
            Err(e) => match self.transition(LifecycleEvent::DialFailed(generation)) {
                TransitionResult::Retry { notify } => {
                    let reason = format!("{:#}", e);
                    debug!("[CONN] Dial {} failed: {}", generation, reason);
                    self.emit(SessionEvent::DialFailed { generation, reason });
                    if notify {
                        self.notifier.notify(&self.config.notify_message);
                    }
                    self.schedule_retry();
                }
                TransitionResult::Stale { .. } => {
                    debug!("[CONN] Ignoring failure of stale dial {}", generation);
                }
                other => warn!("[CONN] Unexpected dial failure result: {:?}", other),
            },
        }
    }

    fn schedule_retry(&mut self) {
        let attempts = self.machine.attempts();
        match self.config.retry.next_delay(attempts) {
            Some(delay) => {
                debug!("[CONN] Retrying in {:?}", delay);
                self.timer = Some(PendingTimer {
                    deadline: Instant::now() + delay,
                    kind: TimerKind::Backoff,
                });
            }
            None => {
                self.socket = None;
                self.transition(LifecycleEvent::RetriesExhausted);
                error!(
                    "[CONN] Giving up on {} after {} attempt(s)",
                    self.connector.target(),
                    attempts
                );
                self.emit(SessionEvent::RetriesExhausted { attempts });
            }
        }
    }

    /// Start a protocol client on the connected stream; gives up on the
    /// client if shutdown is requested while it is still starting
    async fn bind_client(
        &mut self,
        stream: C::Stream,
        generation: Generation,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) {
        let peer = stream.peer();
        info!(
            "[CONN] Connected to {} via {} (generation {})",
            peer,
            self.connector.name(),
            generation
        );
        self.emit(SessionEvent::Connected { generation, peer });

        let duplex = DuplexHandle::new(stream, generation);
        let start = async {
            let mut client = self
                .client_factory
                .create(duplex, &self.config.client_options)?;
            client.start().await?;
            Ok::<_, anyhow::Error>(client)
        };

        let started = tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                info!("[CONN] Shutdown requested while the protocol client was starting");
                return;
            }

            started = start => started,
        };

        match started {
            Ok(client) => {
                info!("[CONN] Protocol client started");
                self.client = Some(client);
                self.emit(SessionEvent::ClientStarted { generation });
            }
            Err(e) => {
                let reason = format!("{:#}", e);
                error!("[CONN] Protocol client failed to start: {}", reason);

                // The failed client took the socket with it
                self.socket = None;
                let redial = self.config.client_start_failure == ClientStartFailurePolicy::Redial;
                self.transition(LifecycleEvent::ClientStartFailed { generation, redial });
                self.emit(SessionEvent::ClientStartFailed { generation, reason });
                if redial {
                    self.schedule_retry();
                }
            }
        }
    }

    /// Release everything in reverse order of acquisition; no step can stop
    /// the ones after it
    async fn teardown(&mut self) {
        info!("[CONN] Deactivating from state {}", self.machine.state());

        if let Some(timer) = self.timer.take() {
            debug!("[CONN] Cancelled {:?} timer", timer.kind);
        }

        if let Some(mut client) = self.client.take() {
            match timeout(self.config.shutdown_grace, client.stop()).await {
                Ok(Ok(())) => debug!("[CONN] Protocol client stopped"),
                Ok(Err(e)) => warn!("[CONN] Protocol client stop failed: {:#}", e),
                Err(_) => warn!("[CONN] Protocol client did not stop in time"),
            }
        }

        if let Some(socket) = self.socket.take() {
            socket.abandon();
        }

        if let Some(process) = self.process.take() {
            if let Err(e) = process.terminate(self.config.shutdown_grace).await {
                warn!("[CONN] Failed to terminate server: {:#}", e);
            }
        }

        self.transition(LifecycleEvent::Deactivated);
        self.emit(SessionEvent::Closed);
    }

    fn transition(&mut self, event: LifecycleEvent) -> TransitionResult {
        let result = self.machine.process_event(event);
        self.state_tx.send_replace(self.machine.state());
        result
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// Sleep until `deadline`, or forever without one
fn wait_for(deadline: Option<Instant>) -> impl Future<Output = ()> {
    async move {
        match deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{Dial, ScriptedConnector};
    use anyhow::bail;
    use async_trait::async_trait;
    use crate::transport::memory::first_generation;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct ClientLog {
        bound: Mutex<Vec<Generation>>,
        start_calls: AtomicU32,
        started: AtomicU32,
        stopped: AtomicU32,
        /// Number of leading start calls that fail
        failing_starts: AtomicU32,
        /// `start` never completes
        hanging_start: AtomicBool,
    }

    #[derive(Clone, Default)]
    struct RecordingFactory {
        log: Arc<ClientLog>,
    }

    impl RecordingFactory {
        fn failing_first(starts: u32) -> Self {
            let factory = Self::default();
            factory.log.failing_starts.store(starts, Ordering::SeqCst);
            factory
        }

        fn hanging() -> Self {
            let factory = Self::default();
            factory.log.hanging_start.store(true, Ordering::SeqCst);
            factory
        }

        fn bound(&self) -> Vec<Generation> {
            self.log.bound.lock().unwrap().clone()
        }

        fn started(&self) -> u32 {
            self.log.started.load(Ordering::SeqCst)
        }

        fn stopped(&self) -> u32 {
            self.log.stopped.load(Ordering::SeqCst)
        }
    }

    impl ProtocolClientFactory for RecordingFactory {
        fn create(
            &self,
            stream: DuplexHandle,
            options: &ClientOptions,
        ) -> Result<Box<dyn ProtocolClient>> {
            assert_eq!(options, &ClientOptions::default());
            self.log.bound.lock().unwrap().push(stream.generation());
            Ok(Box::new(RecordingClient {
                log: self.log.clone(),
                _stream: stream,
            }))
        }
    }

    struct RecordingClient {
        log: Arc<ClientLog>,
        _stream: DuplexHandle,
    }

    #[async_trait]
    impl ProtocolClient for RecordingClient {
        async fn start(&mut self) -> Result<()> {
            let call = self.log.start_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.log.hanging_start.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if call <= self.log.failing_starts.load(Ordering::SeqCst) {
                bail!("client refused to start");
            }
            self.log.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&mut self) -> Result<()> {
            self.log.stopped.fetch_add(1, Ordering::SeqCst);
            bail!("stop errors must not escape teardown")
        }
    }

    #[derive(Clone, Default)]
    struct Notifications(Arc<Mutex<Vec<String>>>);

    impl Notifications {
        fn sink(&self) -> impl Fn(&str) + Send + Sync + 'static {
            let seen = self.0.clone();
            move |message: &str| seen.lock().unwrap().push(message.to_string())
        }

        fn count(&self) -> usize {
            self.0.lock().unwrap().len()
        }
    }

    fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            retry: RetryPolicy {
                jitter: false,
                ..RetryPolicy::default()
            },
            ..ConnectionConfig::default()
        }
    }

    /// Collect events up to and including the first one matching `done`
    async fn events_until(
        manager: &mut ConnectionManager,
        done: impl Fn(&SessionEvent) -> bool,
    ) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        loop {
            let event = timeout(Duration::from_secs(3600), manager.recv())
                .await
                .expect("timed out waiting for session event")
                .expect("event channel closed");
            let finished = done(&event);
            events.push(event);
            if finished {
                return events;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_failures_then_success() {
        let connector = ScriptedConnector::new([Dial::Fail, Dial::Fail, Dial::Fail, Dial::Succeed]);
        let factory = RecordingFactory::default();
        let notifications = Notifications::default();

        let mut manager = ConnectionManager::activate(
            test_config(),
            connector.clone(),
            factory.clone(),
            notifications.sink(),
        );

        // The notification is already out by the time the second dial starts
        events_until(&mut manager, |e| {
            matches!(e, SessionEvent::Dialing { attempt: 2, .. })
        })
        .await;
        assert_eq!(notifications.count(), 1);

        let events = events_until(&mut manager, |e| {
            matches!(e, SessionEvent::ClientStarted { .. })
        })
        .await;
        let SessionEvent::ClientStarted { generation } = events.last().unwrap().clone() else {
            unreachable!()
        };

        assert_eq!(generation.value(), 4);
        assert_eq!(connector.attempts(), 4);
        assert_eq!(notifications.count(), 1);
        assert_eq!(factory.bound(), vec![generation]);
        assert_eq!(factory.started(), 1);
        assert_eq!(manager.state(), LifecycleState::Connected);

        manager.deactivate().await;
        assert_eq!(factory.stopped(), 1);
        assert_eq!(manager.state(), LifecycleState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_notification_when_first_dial_succeeds() {
        let connector = ScriptedConnector::new([Dial::Succeed]);
        let factory = RecordingFactory::default();
        let notifications = Notifications::default();

        let mut manager = ConnectionManager::activate(
            test_config(),
            connector.clone(),
            factory.clone(),
            notifications.sink(),
        );
        events_until(&mut manager, |e| {
            matches!(e, SessionEvent::ClientStarted { .. })
        })
        .await;

        // No further dials happen once connected
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts(), 1);
        assert_eq!(notifications.count(), 0);

        manager.deactivate().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_spacing() {
        let connector = ScriptedConnector::default();
        let mut config = test_config();
        config.retry.initial_delay = Duration::from_millis(100);
        config.retry.max_delay = Duration::from_millis(250);
        config.retry.max_attempts = Some(4);

        let mut manager = ConnectionManager::activate(
            config,
            connector.clone(),
            RecordingFactory::default(),
            Notifications::default().sink(),
        );
        let events = events_until(&mut manager, |e| {
            matches!(e, SessionEvent::RetriesExhausted { .. })
        })
        .await;
        assert_eq!(
            events.last(),
            Some(&SessionEvent::RetriesExhausted { attempts: 4 })
        );

        let times = connector.dial_times();
        let gaps: Vec<u64> = times
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).as_millis() as u64)
            .collect();
        assert_eq!(gaps, vec![100, 200, 250]);
        assert_eq!(manager.state(), LifecycleState::Exhausted);

        manager.deactivate().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_disabled_dials_once() {
        let connector = ScriptedConnector::default();
        let notifications = Notifications::default();
        let config = ConnectionConfig {
            retry: RetryPolicy::once(),
            ..test_config()
        };

        let mut manager = ConnectionManager::activate(
            config,
            connector.clone(),
            RecordingFactory::default(),
            notifications.sink(),
        );
        events_until(&mut manager, |e| {
            matches!(e, SessionEvent::RetriesExhausted { attempts: 1 })
        })
        .await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts(), 1);
        assert_eq!(notifications.count(), 1);
        assert_eq!(manager.state(), LifecycleState::Exhausted);

        manager.deactivate().await;
        assert_eq!(manager.state(), LifecycleState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deactivate_before_dial_completes() {
        let connector = ScriptedConnector::new([Dial::Hang]);
        let factory = RecordingFactory::default();
        let notifications = Notifications::default();

        let mut manager = ConnectionManager::activate(
            test_config(),
            connector.clone(),
            factory.clone(),
            notifications.sink(),
        );
        events_until(&mut manager, |e| matches!(e, SessionEvent::Dialing { .. })).await;

        manager.deactivate().await;
        manager.deactivate().await;

        let events = events_until(&mut manager, |e| *e == SessionEvent::Closed).await;
        assert_eq!(events, vec![SessionEvent::Closed]);
        assert_eq!(manager.state(), LifecycleState::Closed);
        assert!(factory.bound().is_empty());
        assert_eq!(notifications.count(), 0);

        // Nothing else is ever emitted
        assert_eq!(manager.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deactivate_halts_retries() {
        let connector = ScriptedConnector::default();
        let notifications = Notifications::default();

        let mut manager = ConnectionManager::activate(
            test_config(),
            connector.clone(),
            RecordingFactory::default(),
            notifications.sink(),
        );
        events_until(&mut manager, |e| {
            matches!(e, SessionEvent::DialFailed { .. })
        })
        .await;

        manager.deactivate().await;
        let attempts = connector.attempts();

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(connector.attempts(), attempts);
        assert_eq!(notifications.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_start_failure_is_fatal_by_default() {
        let connector = ScriptedConnector::new([Dial::Succeed]).then(Dial::Succeed);
        let factory = RecordingFactory::failing_first(1);

        let mut manager = ConnectionManager::activate(
            test_config(),
            connector.clone(),
            factory.clone(),
            Notifications::default().sink(),
        );
        let events = events_until(&mut manager, |e| {
            matches!(e, SessionEvent::ClientStartFailed { .. })
        })
        .await;
        assert!(matches!(
            events.last(),
            Some(SessionEvent::ClientStartFailed { reason, .. }) if reason.contains("refused")
        ));
        assert_eq!(manager.state(), LifecycleState::Failed);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts(), 1);
        assert_eq!(factory.started(), 0);

        manager.deactivate().await;
        assert_eq!(factory.stopped(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_start_failure_redial() {
        let connector = ScriptedConnector::new([Dial::Succeed, Dial::Succeed]);
        let factory = RecordingFactory::failing_first(1);
        let notifications = Notifications::default();
        let config = ConnectionConfig {
            client_start_failure: ClientStartFailurePolicy::Redial,
            ..test_config()
        };

        let mut manager = ConnectionManager::activate(
            config,
            connector.clone(),
            factory.clone(),
            notifications.sink(),
        );
        events_until(&mut manager, |e| {
            matches!(e, SessionEvent::ClientStarted { .. })
        })
        .await;

        let bound = factory.bound();
        assert_eq!(bound.len(), 2);
        assert!(bound[1] > bound[0]);
        assert_eq!(factory.started(), 1);
        assert_eq!(connector.attempts(), 2);
        assert_eq!(notifications.count(), 0);

        manager.deactivate().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_failure_still_dials() {
        let connector = ScriptedConnector::new([Dial::Succeed]);
        let config = ConnectionConfig {
            spawn: Some(SpawnSpec::new("/nonexistent/lsp-bridge-test-server")),
            startup_delay: Duration::from_secs(5),
            ..test_config()
        };
        let started_at = Instant::now();

        let mut manager = ConnectionManager::activate(
            config,
            connector.clone(),
            RecordingFactory::default(),
            Notifications::default().sink(),
        );
        let events = events_until(&mut manager, |e| {
            matches!(e, SessionEvent::ClientStarted { .. })
        })
        .await;
        assert!(matches!(events[0], SessionEvent::SpawnFailed { .. }));

        // No process, so no startup delay
        assert_eq!(connector.dial_times()[0], started_at);

        manager.deactivate().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_tears_down() {
        let connector = ScriptedConnector::new([Dial::Succeed]);
        let factory = RecordingFactory::default();

        let mut manager = ConnectionManager::activate(
            test_config(),
            connector,
            factory.clone(),
            Notifications::default().sink(),
        );
        events_until(&mut manager, |e| {
            matches!(e, SessionEvent::ClientStarted { .. })
        })
        .await;
        drop(manager);

        for _ in 0..100 {
            if factory.stopped() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(factory.stopped(), 1);
    }

    #[cfg(unix)]
    #[tokio::test(start_paused = true)]
    async fn test_startup_delay_orders_first_dial() {
        let connector = ScriptedConnector::new([Dial::Succeed]);
        let delay = Duration::from_secs(2);
        let config = ConnectionConfig {
            spawn: Some(SpawnSpec::new("sleep").arg("30")),
            startup_delay: delay,
            ..test_config()
        };
        let started_at = Instant::now();

        let mut manager = ConnectionManager::activate(
            config,
            connector.clone(),
            RecordingFactory::default(),
            Notifications::default().sink(),
        );
        let events = events_until(&mut manager, |e| matches!(e, SessionEvent::Spawned { .. })).await;
        assert!(matches!(events[0], SessionEvent::Spawned { pid: Some(_) }));
        assert_eq!(manager.state(), LifecycleState::Spawned);
        assert_eq!(connector.attempts(), 0);

        events_until(&mut manager, |e| {
            matches!(e, SessionEvent::ClientStarted { .. })
        })
        .await;
        assert!(connector.dial_times()[0] - started_at >= delay);

        manager.deactivate().await;
        assert_eq!(manager.state(), LifecycleState::Closed);
    }

    #[cfg(unix)]
    #[tokio::test(start_paused = true)]
    async fn test_deactivate_cancels_startup_timer() {
        let connector = ScriptedConnector::new([Dial::Succeed]);
        let config = ConnectionConfig {
            spawn: Some(SpawnSpec::new("sleep").arg("30")),
            startup_delay: Duration::from_secs(10),
            ..test_config()
        };

        let mut manager = ConnectionManager::activate(
            config,
            connector.clone(),
            RecordingFactory::default(),
            Notifications::default().sink(),
        );
        events_until(&mut manager, |e| matches!(e, SessionEvent::Spawned { .. })).await;

        manager.deactivate().await;
        manager.deactivate().await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts(), 0);
        assert_eq!(manager.state(), LifecycleState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deactivate_while_client_is_starting() {
        let connector = ScriptedConnector::new([Dial::Succeed]);
        let factory = RecordingFactory::hanging();

        let mut manager = ConnectionManager::activate(
            test_config(),
            connector.clone(),
            factory.clone(),
            Notifications::default().sink(),
        );
        events_until(&mut manager, |e| matches!(e, SessionEvent::Connected { .. })).await;

        timeout(Duration::from_secs(3600), manager.deactivate())
            .await
            .expect("deactivate must not wait for a stuck client start");
        assert_eq!(manager.state(), LifecycleState::Closed);
        assert_eq!(factory.started(), 0);

        let events = events_until(&mut manager, |e| *e == SessionEvent::Closed).await;
        assert_eq!(events, vec![SessionEvent::Closed]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_while_client_is_starting() {
        let connector = ScriptedConnector::new([Dial::Succeed]);
        let factory = RecordingFactory::hanging();
        let (state_tx, mut state_rx) = watch::channel(LifecycleState::Idle);
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (driver, dial_rx) = SessionDriver::new(
            test_config(),
            connector,
            factory.clone(),
            Notifications::default().sink(),
            event_tx,
            state_tx,
        );
        let task = tokio::spawn(driver.run(shutdown_rx, dial_rx));

        state_rx
            .wait_for(|state| *state == LifecycleState::Connected)
            .await
            .unwrap();
        // Same signal the handle sends from Drop
        shutdown_tx.send(true).unwrap();
        drop(shutdown_tx);

        timeout(Duration::from_secs(3600), task)
            .await
            .expect("driver must stop while a client is starting")
            .unwrap();
        assert_eq!(*state_rx.borrow(), LifecycleState::Closed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_state_visible_with_start_failure_event() {
        for _ in 0..20 {
            let connector = ScriptedConnector::new([Dial::Succeed]);
            let mut manager = ConnectionManager::activate(
                test_config(),
                connector,
                RecordingFactory::failing_first(1),
                Notifications::default().sink(),
            );
            events_until(&mut manager, |e| {
                matches!(e, SessionEvent::ClientStartFailed { .. })
            })
            .await;
            assert_eq!(manager.state(), LifecycleState::Failed);
            manager.deactivate().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_dial_outcomes_are_ignored() {
        let factory = RecordingFactory::default();
        let notifications = Notifications::default();
        let (state_tx, state_rx) = watch::channel(LifecycleState::Idle);
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let (mut driver, _dial_rx) = SessionDriver::new(
            test_config(),
            ScriptedConnector::new([Dial::Hang, Dial::Hang]),
            factory.clone(),
            notifications.sink(),
            event_tx,
            state_tx,
        );

        // Second dial supersedes the first
        driver.start_dial();
        driver.start_dial();
        let stale = first_generation();
        assert_ne!(driver.machine.current_generation(), Some(stale));
        while event_rx.try_recv().is_ok() {}

        let (stream, _server) = tokio::io::duplex(64);
        let outcome = DialOutcome {
            generation: stale,
            result: Ok(stream),
        };
        driver.on_dial_outcome(outcome, &mut shutdown_rx).await;

        let outcome = DialOutcome {
            generation: stale,
            result: Err(anyhow!("connection refused")),
        };
        driver.on_dial_outcome(outcome, &mut shutdown_rx).await;

        assert!(factory.bound().is_empty());
        assert_eq!(notifications.count(), 0);
        assert!(driver.timer.is_none());
        assert_eq!(*state_rx.borrow(), LifecycleState::Dialing);
        assert!(event_rx.try_recv().is_err());

        driver.teardown().await;
        assert_eq!(*state_rx.borrow(), LifecycleState::Closed);
    }
}
