//! Outstanding asynchronous operations.
//!
//! Every asynchronous request is split into a [`Completion`] that the worker
//! fills exactly once and a [`Pending`] the caller awaits or attaches a
//! callback to. The oneshot channel between them guarantees a single result;
//! a worker that disappears without reporting surfaces as
//! [`BridgeError::Abandoned`].

use crate::error::{BridgeError, Result};
use crate::handle::Handle;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// The kind of an asynchronous operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Create,
    Start,
    Stop,
    VsockConnect,
    ListInterfaces,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Create => "create",
            OperationKind::Start => "start",
            OperationKind::Stop => "stop",
            OperationKind::VsockConnect => "vsock connect",
            OperationKind::ListInterfaces => "list interfaces",
        };
        f.write_str(name)
    }
}

/// Worker side of an operation.
pub(crate) struct Completion<T> {
    kind: OperationKind,
    handle: Option<Handle>,
    tx: oneshot::Sender<Result<T>>,
}

impl<T> Completion<T> {
    /// Deliver the result. Consumes the completion, so it happens once.
    pub(crate) fn complete(self, result: Result<T>) {
        if self.tx.send(result).is_err() {
            tracing::debug!(
                operation = %self.kind,
                handle = ?self.handle,
                "Result dropped, nobody is waiting"
            );
        }
    }
}

/// Caller side of an operation.
///
/// Resolves to the operation's result. Dropping it does not cancel the
/// operation; the result is then discarded.
#[must_use = "the operation's result is only observable through Pending"]
pub struct Pending<T> {
    kind: OperationKind,
    handle: Option<Handle>,
    rx: oneshot::Receiver<Result<T>>,
}

/// Create a linked completion/pending pair.
pub(crate) fn pending<T>(
    kind: OperationKind,
    handle: Option<Handle>,
) -> (Completion<T>, Pending<T>) {
    let (tx, rx) = oneshot::channel();
    (
        Completion { kind, handle, tx },
        Pending { kind, handle, rx },
    )
}

impl<T> Pending<T> {
    /// What this operation is.
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// The instance the operation targets, if any.
    pub fn handle(&self) -> Option<Handle> {
        self.handle
    }
}

impl<T: Send + 'static> Pending<T> {
    /// Invoke `callback` with the result on a runtime worker thread.
    ///
    /// The callback runs exactly once, never on the calling thread.
    pub fn notify<F>(self, runtime: &tokio::runtime::Handle, callback: F)
    where
        F: FnOnce(Result<T>) + Send + 'static,
    {
        runtime.spawn(async move {
            callback(self.await);
        });
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let kind = self.kind;
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(BridgeError::Abandoned(kind))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending")
            .field("kind", &self.kind)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}
