//! Connection Lifecycle State Machine
//!
//! Tracks one activation of the bridge: the lifecycle phase, the one-shot
//! "server not reachable" guard, and the generation token of the dial attempt
//! that is currently allowed to change state.

use std::fmt;

/// Tag identifying a single dial attempt
///
/// Generations increase monotonically within an activation. Outcomes carrying
/// any generation other than the current one are stale and change nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(u64);

impl Generation {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle phase of an activation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Activated, nothing spawned or dialed yet
    Idle,
    /// Managed process launched, waiting for the startup delay
    Spawned,
    /// A dial attempt is in flight or scheduled
    Dialing,
    /// Socket connected and bound to a protocol client
    Connected,
    /// Gave up dialing (retry disabled or attempt ceiling reached)
    Exhausted,
    /// Protocol client failed to start and the failure is fatal
    Failed,
    /// Torn down
    Closed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Spawned => "spawned",
            LifecycleState::Dialing => "dialing",
            LifecycleState::Connected => "connected",
            LifecycleState::Exhausted => "exhausted",
            LifecycleState::Failed => "failed",
            LifecycleState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Guard for the one-shot "server not reachable" notification
///
/// Only ever moves away from `NotYetNotified`; both other states suppress any
/// further notification for the rest of the activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationState {
    NotYetNotified,
    Notified,
    Connected,
}

/// Events that drive the lifecycle
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// Managed process launched
    ProcessSpawned,
    /// A new dial attempt is starting (first dial, timer fired, or retry)
    DialStarted,
    /// The dial attempt with this generation connected
    DialSucceeded(Generation),
    /// The dial attempt with this generation failed or closed before connecting
    DialFailed(Generation),
    /// The protocol client bound to this generation failed to start
    ClientStartFailed { generation: Generation, redial: bool },
    /// No further dial attempts will be made
    RetriesExhausted,
    /// Teardown requested
    Deactivated,
}

/// Result of feeding an event to the machine
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionResult {
    /// Transition applied; machine is now in this state
    Success(LifecycleState),
    /// A dial attempt may start with this generation
    Dialing(Generation),
    /// The current attempt connected; bind a protocol client to it
    Connected(Generation),
    /// The current attempt failed; `notify` is true exactly once per activation
    Retry { notify: bool },
    /// Event belongs to a superseded or abandoned attempt
    Stale { generation: Generation },
    /// Event not valid from the current state
    Invalid {
        from: LifecycleState,
        event: LifecycleEvent,
    },
}

/// The lifecycle state machine for one activation
#[derive(Debug)]
pub struct LifecycleMachine {
    state: LifecycleState,
    notification: NotificationState,
    current: Option<Generation>,
    last_generation: u64,
    attempts: u32,
}

impl Default for LifecycleMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleMachine {
    /// Create a new machine in the Idle state
    pub fn new() -> Self {
        Self {
            state: LifecycleState::Idle,
            notification: NotificationState::NotYetNotified,
            current: None,
            last_generation: 0,
            attempts: 0,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn notification(&self) -> NotificationState {
        self.notification
    }

    /// Generation of the attempt whose outcome is still awaited, or of the
    /// connected socket
    pub fn current_generation(&self) -> Option<Generation> {
        self.current
    }

    /// Number of dial attempts started so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: LifecycleEvent) -> TransitionResult {
        // Teardown is accepted from every state, including Closed
        if event == LifecycleEvent::Deactivated {
            self.state = LifecycleState::Closed;
            self.current = None;
            return TransitionResult::Success(LifecycleState::Closed);
        }

        // Outcomes are checked against the current generation before anything else
        match &event {
            LifecycleEvent::DialSucceeded(generation)
            | LifecycleEvent::DialFailed(generation)
            | LifecycleEvent::ClientStartFailed { generation, .. }
                if self.current != Some(*generation) =>
            {
                return TransitionResult::Stale {
                    generation: *generation,
                };
            }
            _ => {}
        }

        use LifecycleEvent::*;
        use LifecycleState::*;

        match (self.state, &event) {
            (Idle, ProcessSpawned) => {
                self.state = Spawned;
                TransitionResult::Success(Spawned)
            }

            (Idle | Spawned | Dialing, DialStarted) => {
                self.last_generation += 1;
                let generation = Generation(self.last_generation);
                self.current = Some(generation);
                self.attempts += 1;
                self.state = Dialing;
                TransitionResult::Dialing(generation)
            }

            (Dialing, DialSucceeded(generation)) => {
                self.state = Connected;
                self.notification = NotificationState::Connected;
                TransitionResult::Connected(*generation)
            }

            (Dialing, DialFailed(_)) => {
                self.current = None;
                let notify = self.notification == NotificationState::NotYetNotified;
                if notify {
                    self.notification = NotificationState::Notified;
                }
                TransitionResult::Retry { notify }
            }

            (Connected, ClientStartFailed { redial, .. }) => {
                self.current = None;
                self.state = if *redial { Dialing } else { Failed };
                TransitionResult::Success(self.state)
            }

            (Dialing, RetriesExhausted) => {
                self.current = None;
                self.state = Exhausted;
                TransitionResult::Success(Exhausted)
            }

            _ => TransitionResult::Invalid {
                from: self.state,
                event,
            },
        }
    }
}
