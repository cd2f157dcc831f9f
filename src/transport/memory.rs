//! In-memory transport for tests

use crate::transport::traits::{TransportConnector, TransportStream};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use lsp_bridge_shared::{Generation, LifecycleEvent, LifecycleMachine, TransitionResult};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::DuplexStream;
use tokio::time::Instant;

impl TransportStream for DuplexStream {
    fn peer(&self) -> String {
        "memory".into()
    }
}

/// What a single scripted dial does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dial {
    Fail,
    Succeed,
    /// Never completes
    Hang,
}

#[derive(Default)]
struct Script {
    steps: Mutex<VecDeque<Dial>>,
    fallback: Mutex<Option<Dial>>,
    attempts: AtomicU32,
    dial_times: Mutex<Vec<Instant>>,
    /// Server ends of successful dials, kept open for the test's duration
    servers: Mutex<Vec<DuplexStream>>,
}

/// Connector that plays back a fixed sequence of dial outcomes
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    script: Arc<Script>,
}

impl ScriptedConnector {
    pub fn new(steps: impl IntoIterator<Item = Dial>) -> Self {
        let connector = Self::default();
        connector
            .script
            .steps
            .lock()
            .unwrap()
            .extend(steps);
        connector
    }

    /// Outcome for every dial once the script runs out (default: Fail)
    pub fn then(self, dial: Dial) -> Self {
        *self.script.fallback.lock().unwrap() = Some(dial);
        self
    }

    pub fn attempts(&self) -> u32 {
        self.script.attempts.load(Ordering::SeqCst)
    }

    pub fn dial_times(&self) -> Vec<Instant> {
        self.script.dial_times.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransportConnector for ScriptedConnector {
    type Stream = DuplexStream;

    async fn connect(&self) -> Result<Self::Stream> {
        let attempt = self.script.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        self.script.dial_times.lock().unwrap().push(Instant::now());

        let step = self.script.steps.lock().unwrap().pop_front();
        let step = step
            .or(*self.script.fallback.lock().unwrap())
            .unwrap_or(Dial::Fail);

        match step {
            Dial::Fail => Err(anyhow!("connection refused (attempt {})", attempt)),
            Dial::Succeed => {
                let (client, server) = tokio::io::duplex(4096);
                self.script.servers.lock().unwrap().push(server);
                Ok(client)
            }
            Dial::Hang => std::future::pending().await,
        }
    }

    fn name(&self) -> &'static str {
        "memory"
    }

    fn target(&self) -> String {
        "memory:0".into()
    }
}

/// A generation as the lifecycle machine hands out for its first dial
pub fn first_generation() -> Generation {
    match LifecycleMachine::new().process_event(LifecycleEvent::DialStarted) {
        TransitionResult::Dialing(generation) => generation,
        other => panic!("expected Dialing, got {:?}", other),
    }
}
