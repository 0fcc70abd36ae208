//! Lifecycle event stream.
//!
//! Every applied state transition is broadcast as a [`StateChange`].
//! Destroying a handle ends its stream with a change to
//! [`LifecycleState::Invalid`].

use crate::handle::Handle;
use crate::state::LifecycleState;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

/// Default number of changes buffered per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// One state transition of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub handle: Handle,
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub at: DateTime<Utc>,
}

/// Sending side, shared by the bridge and its instances.
#[derive(Debug, Clone)]
pub(crate) struct Events {
    sender: broadcast::Sender<StateChange>,
}

impl Events {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub(crate) fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    pub(crate) fn emit(&self, handle: Handle, from: LifecycleState, to: LifecycleState) {
        tracing::trace!(%handle, %from, %to, "State change");
        // No subscribers is not an error.
        let _ = self.sender.send(StateChange {
            handle,
            from,
            to,
            at: Utc::now(),
        });
    }
}

impl Default for Events {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// Receiving side returned by [`Bridge::subscribe`](crate::Bridge::subscribe).
///
/// A subscriber that falls behind skips the oldest changes and keeps going.
#[derive(Debug)]
pub struct EventReceiver {
    receiver: broadcast::Receiver<StateChange>,
}

impl EventReceiver {
    /// Next change, or `None` once the bridge is gone.
    pub async fn recv(&mut self) -> Option<StateChange> {
        loop {
            match self.receiver.recv().await {
                Ok(change) => return Some(change),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next buffered change without waiting.
    pub fn try_recv(&mut self) -> Option<StateChange> {
        loop {
            match self.receiver.try_recv() {
                Ok(change) => return Some(change),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
