//! VM lifecycle state machine.
//!
//! ```text
//! Uninitialized ──create──▶ Creating ──ok──▶ Created ──start──▶ Starting ──ok──▶ Running
//!       ▲                      │                                   │               │
//!       └────────fail──────────┘                                  fail            stop
//!                                                                  ▼               ▼
//!                                          Stopped ◀──ok── Stopping ──fail──▶ Error
//! ```
//!
//! `Stopped` and `Error` are terminal: only destroy is legal there.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};

/// Lifecycle state of a VM instance.
///
/// The discriminants are the state codes exposed over the C interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum LifecycleState {
    /// Sentinel for unknown or destroyed handles.
    Invalid = -1,
    /// Handle allocated, no engine object yet.
    Uninitialized = 0,
    /// Engine allocation in flight.
    Creating = 1,
    /// Engine object allocated, not yet running.
    Created = 2,
    Starting = 3,
    Running = 4,
    Stopping = 5,
    /// Terminal.
    Stopped = 6,
    /// Terminal; reached when a start or stop fails.
    Error = 7,
}

/// Something that moves an instance between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    CreateRequested,
    CreateSucceeded,
    CreateFailed,
    StartRequested,
    StartSucceeded,
    StartFailed,
    StopRequested,
    StopSucceeded,
    StopFailed,
}

impl LifecycleState {
    /// Decode a state code. Unknown codes map to `Invalid`.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Uninitialized,
            1 => Self::Creating,
            2 => Self::Created,
            3 => Self::Starting,
            4 => Self::Running,
            5 => Self::Stopping,
            6 => Self::Stopped,
            7 => Self::Error,
            _ => Self::Invalid,
        }
    }

    /// State code exposed over the C interface.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Lowercase name, also used in error messages.
    pub fn name(self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::Uninitialized => "uninitialized",
            Self::Creating => "creating",
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    /// Whether a start request is currently legal.
    pub fn can_start(self) -> bool {
        self == Self::Created
    }

    /// Whether a stop request is currently legal.
    pub fn can_stop(self) -> bool {
        self == Self::Running
    }

    /// Whether no further start/stop transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }

    /// Whether an engine object exists in this state.
    pub fn has_engine_object(self) -> bool {
        !matches!(self, Self::Invalid | Self::Uninitialized | Self::Creating)
    }

    /// The state `event` leads to, or `None` if the transition is illegal.
    pub fn next(self, event: Event) -> Option<Self> {
        use Event::*;
        use LifecycleState::*;

        match (self, event) {
            (Uninitialized, CreateRequested) => Some(Creating),
            (Creating, CreateSucceeded) => Some(Created),
            (Creating, CreateFailed) => Some(Uninitialized),
            (Created, StartRequested) => Some(Starting),
            (Starting, StartSucceeded) => Some(Running),
            (Starting, StartFailed) => Some(Error),
            (Running, StopRequested) => Some(Stopping),
            (Stopping, StopSucceeded) => Some(Stopped),
            (Stopping, StopFailed) => Some(Error),
            _ => None,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Last committed state of one instance.
///
/// Reads are lock-free. Writers must hold the owning instance's lock so
/// that check-then-apply sequences are not interleaved.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicI32);

impl StateCell {
    pub(crate) fn new(state: LifecycleState) -> Self {
        Self(AtomicI32::new(state.code()))
    }

    pub(crate) fn get(&self) -> LifecycleState {
        LifecycleState::from_code(self.0.load(Ordering::Acquire))
    }

    /// Apply `event`, returning the new state, or the current one if the
    /// transition is illegal.
    pub(crate) fn apply(&self, event: Event) -> Result<LifecycleState, LifecycleState> {
        let current = self.get();
        let next = current.next(event).ok_or(current)?;
        self.0.store(next.code(), Ordering::Release);
        Ok(next)
    }
}
